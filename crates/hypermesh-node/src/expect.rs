//! Sent-packet expectation table
//!
//! OK and ERROR verbs are only honored when they answer a packet this node
//! actually sent recently. The table is a fixed array of time buckets
//! indexed by a mix of the packet ID; collisions can only cause a stray
//! reply to be accepted, never a legitimate one to be dropped, and entries
//! expire by time rather than by sweeping.

use std::sync::atomic::{AtomicI64, Ordering};

const BUCKETS: usize = 16384;

/// Tracks packet IDs for which a reply is legitimate
pub struct ExpectTable {
    ttl_ms: i64,
    buckets: Vec<AtomicI64>,
}

impl ExpectTable {
    /// Create a table whose entries stay valid for `ttl_ms`
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            buckets: (0..BUCKETS).map(|_| AtomicI64::new(0)).collect(),
        }
    }

    fn bucket(&self, packet_id: u64) -> &AtomicI64 {
        let mixed = packet_id ^ (packet_id >> 32) ^ (packet_id >> 13);
        &self.buckets[(mixed as usize) & (BUCKETS - 1)]
    }

    /// Record that a packet with this ID was just sent
    pub fn sending(&self, packet_id: u64, now: i64) {
        self.bucket(packet_id).store(now, Ordering::Relaxed);
    }

    /// True if a reply to this packet ID is currently legitimate
    pub fn expecting(&self, packet_id: u64, now: i64) -> bool {
        let sent_at = self.bucket(packet_id).load(Ordering::Relaxed);
        sent_at > 0 && (now - sent_at) <= self.ttl_ms
    }
}
