//! Fragment reassembly
//!
//! In-flight reassembly state is keyed by packet ID. Each entry remembers
//! which path it arrived on so a single path cannot monopolize reassembly
//! memory, and entries past their TTL are evicted on the next insert.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::constants::{MAX_FRAGMENTS, MAX_PACKET_LENGTH};

/// Upper bound on concurrent reassemblies across all paths
const MAX_ENTRIES: usize = 1024;

/// Outcome of submitting one fragment
#[derive(Debug)]
pub enum AssembleResult {
    /// All fragments present; the assembled packet is returned
    Complete(Vec<u8>),
    /// Fragment accepted, more are needed
    Accepted,
    /// This fragment slot was already filled
    DuplicateFragment,
    /// Fragment number or total out of range, or totals disagree
    InvalidFragment,
    /// The source path has too many reassemblies in flight
    TooManyFragmentsForPath,
    /// Global reassembly memory exhausted
    OutOfMemory,
}

struct Entry {
    path_key: u64,
    arrived_at: i64,
    total: u8,
    have: u8,
    slices: Vec<Option<Vec<u8>>>,
}

/// Reassembler for multi-fragment packets
pub struct Defragmenter {
    ttl_ms: i64,
    max_per_path: usize,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl Defragmenter {
    /// Create a defragmenter with the given entry TTL and per-path bound
    pub fn new(ttl_ms: i64, max_per_path: usize) -> Self {
        Self {
            ttl_ms,
            max_per_path,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Submit one fragment (or the head, as fragment zero)
    ///
    /// `total_fragments` is zero when unknown; heads pass zero because the
    /// total is carried only in trailing fragments. `slice` is the part of
    /// the datagram that belongs in the assembled packet: the whole head, or
    /// a fragment's payload.
    pub fn assemble(
        &self,
        packet_id: u64,
        path_key: u64,
        slice: &[u8],
        fragment_no: u8,
        total_fragments: u8,
        now: i64,
    ) -> AssembleResult {
        if fragment_no as usize >= MAX_FRAGMENTS
            || total_fragments as usize > MAX_FRAGMENTS
            || (total_fragments != 0 && fragment_no >= total_fragments)
        {
            return AssembleResult::InvalidFragment;
        }

        let mut entries = self.entries.lock();

        // Expire stale reassemblies before admitting new state.
        let ttl = self.ttl_ms;
        entries.retain(|_, e| (now - e.arrived_at) < ttl);

        if !entries.contains_key(&packet_id) {
            if entries.len() >= MAX_ENTRIES {
                return AssembleResult::OutOfMemory;
            }
            let in_flight = entries.values().filter(|e| e.path_key == path_key).count();
            if in_flight >= self.max_per_path {
                return AssembleResult::TooManyFragmentsForPath;
            }
            entries.insert(
                packet_id,
                Entry {
                    path_key,
                    arrived_at: now,
                    total: 0,
                    have: 0,
                    slices: (0..MAX_FRAGMENTS).map(|_| None).collect(),
                },
            );
        }
        let entry = entries.get_mut(&packet_id).expect("entry just ensured");

        if total_fragments != 0 {
            if entry.total == 0 {
                entry.total = total_fragments;
            } else if entry.total != total_fragments {
                return AssembleResult::InvalidFragment;
            }
        }
        if entry.total != 0 && fragment_no >= entry.total {
            return AssembleResult::InvalidFragment;
        }

        let slot = &mut entry.slices[fragment_no as usize];
        if slot.is_some() {
            return AssembleResult::DuplicateFragment;
        }
        *slot = Some(slice.to_vec());
        entry.have += 1;

        if entry.total != 0 && entry.have >= entry.total {
            let entry = entries.remove(&packet_id).expect("complete entry present");
            let mut assembled = Vec::new();
            for slot in entry.slices.into_iter().take(entry.total as usize) {
                match slot {
                    Some(s) => assembled.extend_from_slice(&s),
                    // A missing slot with have == total means totals lied.
                    None => return AssembleResult::InvalidFragment,
                }
            }
            if assembled.len() > MAX_PACKET_LENGTH {
                return AssembleResult::InvalidFragment;
            }
            return AssembleResult::Complete(assembled);
        }

        AssembleResult::Accepted
    }

    /// Number of reassemblies currently in flight
    pub fn in_flight(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defrag() -> Defragmenter {
        Defragmenter::new(1_000, 4)
    }

    #[test]
    fn test_in_order_reassembly() {
        let d = defrag();
        assert!(matches!(d.assemble(1, 9, b"head", 0, 0, 0), AssembleResult::Accepted));
        assert!(matches!(d.assemble(1, 9, b"-mid", 1, 3, 0), AssembleResult::Accepted));
        match d.assemble(1, 9, b"-end", 2, 3, 0) {
            AssembleResult::Complete(p) => assert_eq!(p, b"head-mid-end"),
            other => panic!("expected Complete, got {:?}", other),
        }
        assert_eq!(d.in_flight(), 0);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let d = defrag();
        assert!(matches!(d.assemble(2, 9, b"-end", 2, 3, 0), AssembleResult::Accepted));
        assert!(matches!(d.assemble(2, 9, b"head", 0, 0, 0), AssembleResult::Accepted));
        match d.assemble(2, 9, b"-mid", 1, 3, 0) {
            AssembleResult::Complete(p) => assert_eq!(p, b"head-mid-end"),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_fragment() {
        let d = defrag();
        assert!(matches!(d.assemble(3, 9, b"a", 1, 3, 0), AssembleResult::Accepted));
        assert!(matches!(
            d.assemble(3, 9, b"a", 1, 3, 0),
            AssembleResult::DuplicateFragment
        ));
    }

    #[test]
    fn test_invalid_fragment_numbers() {
        let d = defrag();
        assert!(matches!(
            d.assemble(4, 9, b"x", MAX_FRAGMENTS as u8, 0, 0),
            AssembleResult::InvalidFragment
        ));
        assert!(matches!(
            d.assemble(4, 9, b"x", 3, 2, 0),
            AssembleResult::InvalidFragment
        ));
        // Disagreeing totals for the same packet.
        assert!(matches!(d.assemble(5, 9, b"x", 0, 3, 0), AssembleResult::Accepted));
        assert!(matches!(
            d.assemble(5, 9, b"x", 1, 4, 0),
            AssembleResult::InvalidFragment
        ));
    }

    #[test]
    fn test_per_path_bound() {
        let d = defrag();
        for id in 0..4u64 {
            assert!(matches!(d.assemble(id, 7, b"x", 0, 0, 0), AssembleResult::Accepted));
        }
        assert!(matches!(
            d.assemble(99, 7, b"x", 0, 0, 0),
            AssembleResult::TooManyFragmentsForPath
        ));
        // A different path is unaffected.
        assert!(matches!(d.assemble(100, 8, b"x", 0, 0, 0), AssembleResult::Accepted));
    }

    #[test]
    fn test_ttl_eviction() {
        let d = defrag();
        assert!(matches!(d.assemble(6, 9, b"x", 0, 0, 0), AssembleResult::Accepted));
        assert_eq!(d.in_flight(), 1);
        // A much later insert sweeps the stale entry away.
        assert!(matches!(d.assemble(7, 9, b"y", 0, 0, 5_000), AssembleResult::Accepted));
        assert_eq!(d.in_flight(), 1);
    }
}
