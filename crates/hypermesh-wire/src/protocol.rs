//! Outer wire format
//!
//! Whole packets and fragment heads share the first 13 bytes. Byte 13 is the
//! discriminator: `0xff` there marks a fragment, which is why no node address
//! may begin with `0xff`.
//!
//! Packet head:
//! ```text
//!  0  [8]  64-bit packet ID / crypto IV (big-endian)
//!  8  [5]  destination node address
//! 13  [5]  source node address
//! 18  [1]  flags (bits 7-6) | cipher (bits 5-3) | hops (bits 2-0)
//! 19  [8]  64-bit MAC, or trusted-path ID when the trusted-path flag is set
//! 27  ...  encrypted section: [1] inner flags + verb, then verb payload
//! ```
//!
//! Fragment:
//! ```text
//!  0  [8]  packet ID of the packet being fragmented
//!  8  [5]  destination node address
//! 13  [1]  0xff fragment indicator
//! 14  [1]  total fragment count (bits 7-4) | fragment number (bits 3-0)
//! 15  [1]  hops (bits 2-0)
//! 16  ...  fragment payload
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use hypermesh_crypto::identity::Address;
use hypermesh_crypto::symmetric::CipherSuite;
use rand::RngCore;

use crate::constants::{
    FLAGS_HOPS_MASK, FLAGS_INDEX, FLAG_FRAGMENTED, FLAG_TRUSTED_PATH, FRAGMENT_HOPS_INDEX,
    FRAGMENT_INDICATOR, FRAGMENT_INDICATOR_INDEX, HEADER_SIZE, MIN_FRAGMENT_LENGTH,
    MIN_PACKET_LENGTH, VERB_MASK,
};
use crate::error::{WireError, WireResult};

/// Protocol verbs (low 5 bits of the inner verb byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    /// No-op; doubles as a path probe
    Nop = 0,
    /// Self-authenticating peer introduction
    Hello = 1,
    /// Negative reply to an earlier packet
    Error = 2,
    /// Positive reply to an earlier packet
    Ok = 3,
    /// Identity lookup by address
    Whois = 4,
    /// Root-relayed invitation to contact a third party
    Rendezvous = 5,
    /// Virtual layer 2 frame
    Frame = 6,
    /// Virtual layer 2 extended frame
    ExtFrame = 7,
    /// Echo request, answered verbatim in an OK
    Echo = 8,
    /// VL2 multicast subscription
    MulticastLike = 9,
    /// VL2 credential push
    NetworkCredentials = 10,
    /// VL2 configuration request
    NetworkConfigRequest = 11,
    /// VL2 configuration push
    NetworkConfig = 12,
    /// VL2 multicast gather
    MulticastGather = 13,
    /// Learned endpoints the sender suggests we try
    PushDirectPaths = 16,
    /// Opaque application-level message
    UserMessage = 20,
    /// VL2 multicast
    Multicast = 22,
    /// Encapsulated tunnel payload
    Encap = 23,
}

impl Verb {
    /// All VL2 verbs are forwarded to the layer-2 collaborator
    pub fn is_layer2(self) -> bool {
        matches!(
            self,
            Verb::Frame
                | Verb::ExtFrame
                | Verb::MulticastLike
                | Verb::NetworkCredentials
                | Verb::NetworkConfigRequest
                | Verb::NetworkConfig
                | Verb::MulticastGather
                | Verb::Multicast
        )
    }
}

impl TryFrom<u8> for Verb {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value & VERB_MASK {
            0 => Ok(Self::Nop),
            1 => Ok(Self::Hello),
            2 => Ok(Self::Error),
            3 => Ok(Self::Ok),
            4 => Ok(Self::Whois),
            5 => Ok(Self::Rendezvous),
            6 => Ok(Self::Frame),
            7 => Ok(Self::ExtFrame),
            8 => Ok(Self::Echo),
            9 => Ok(Self::MulticastLike),
            10 => Ok(Self::NetworkCredentials),
            11 => Ok(Self::NetworkConfigRequest),
            12 => Ok(Self::NetworkConfig),
            13 => Ok(Self::MulticastGather),
            16 => Ok(Self::PushDirectPaths),
            20 => Ok(Self::UserMessage),
            22 => Ok(Self::Multicast),
            23 => Ok(Self::Encap),
            v => Err(WireError::UnrecognizedVerb(v)),
        }
    }
}

/// Parsed outer packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_id: u64,
    pub destination: Address,
    pub source: Address,
    pub flags: u8,
    pub mac: u64,
}

impl PacketHeader {
    /// Parse the first 27 bytes of a packet head
    pub fn parse(data: &[u8]) -> WireResult<Self> {
        if data.len() < MIN_PACKET_LENGTH {
            return Err(WireError::Truncated {
                need: MIN_PACKET_LENGTH,
                have: data.len(),
            });
        }
        Ok(Self {
            packet_id: u64::from_be_bytes(data[0..8].try_into().expect("8-byte slice")),
            destination: Address::from_bytes(&data[8..13])?,
            source: Address::from_bytes(&data[13..18])?,
            flags: data[FLAGS_INDEX],
            mac: u64::from_be_bytes(data[19..27].try_into().expect("8-byte slice")),
        })
    }

    /// Write this header into the first 27 bytes of `out`
    pub fn write_to(&self, out: &mut [u8]) -> WireResult<()> {
        if out.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                need: HEADER_SIZE,
                have: out.len(),
            });
        }
        out[0..8].copy_from_slice(&self.packet_id.to_be_bytes());
        out[8..13].copy_from_slice(&self.destination.to_bytes());
        out[13..18].copy_from_slice(&self.source.to_bytes());
        out[FLAGS_INDEX] = self.flags;
        out[19..27].copy_from_slice(&self.mac.to_be_bytes());
        Ok(())
    }

    /// Hop count (bits 2-0 of the flags byte)
    pub fn hops(&self) -> u8 {
        self.flags & FLAGS_HOPS_MASK
    }

    /// Cipher selector (bits 5-3 of the flags byte)
    pub fn cipher(&self) -> WireResult<CipherSuite> {
        Ok(CipherSuite::from_wire((self.flags >> 3) & 0x07)?)
    }

    /// True if fragments follow this head
    pub fn is_fragmented(&self) -> bool {
        (self.flags & FLAG_FRAGMENTED) != 0
    }

    /// True if the MAC field carries a trusted-path ID instead of a MAC
    pub fn is_trusted_path(&self) -> bool {
        (self.flags & FLAG_TRUSTED_PATH) != 0
    }

    /// Compose the flags byte from its parts
    pub fn make_flags(cipher: CipherSuite, hops: u8, fragmented: bool) -> u8 {
        let mut f = ((cipher as u8) << 3) | (hops & FLAGS_HOPS_MASK);
        if fragmented {
            f |= FLAG_FRAGMENTED;
        }
        f
    }
}

/// Increment the hop count in a raw packet head, if below `limit`
///
/// Returns the new hop count, or `None` when the packet has already used up
/// its hops and must not be relayed.
pub fn increment_hops(data: &mut [u8], limit: u8) -> Option<u8> {
    increment_hops_at(data, FLAGS_INDEX, limit)
}

/// Increment the hop count in a raw fragment, if below `limit`
///
/// Fragments carry their hops byte at a different offset than packet heads;
/// the limit semantics are identical.
pub fn increment_fragment_hops(data: &mut [u8], limit: u8) -> Option<u8> {
    increment_hops_at(data, FRAGMENT_HOPS_INDEX, limit)
}

fn increment_hops_at(data: &mut [u8], index: usize, limit: u8) -> Option<u8> {
    if data.len() <= index {
        return None;
    }
    let hops = data[index] & FLAGS_HOPS_MASK;
    if hops >= limit {
        return None;
    }
    let hops = hops + 1;
    data[index] = (data[index] & !FLAGS_HOPS_MASK) | hops;
    Some(hops)
}

/// Zero the hop bits (done before any MAC over the full header)
pub fn mask_hops(data: &mut [u8]) {
    if data.len() > FLAGS_INDEX {
        data[FLAGS_INDEX] &= !FLAGS_HOPS_MASK;
    }
}

/// Parsed fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub packet_id: u64,
    pub destination: Address,
    pub fragment_no: u8,
    pub total_fragments: u8,
    pub hops: u8,
}

impl FragmentHeader {
    /// Parse the 16-byte fragment header
    pub fn parse(data: &[u8]) -> WireResult<Self> {
        if data.len() < MIN_FRAGMENT_LENGTH {
            return Err(WireError::Truncated {
                need: MIN_FRAGMENT_LENGTH,
                have: data.len(),
            });
        }
        if data[FRAGMENT_INDICATOR_INDEX] != FRAGMENT_INDICATOR {
            return Err(WireError::InvalidField("fragment indicator"));
        }
        Ok(Self {
            packet_id: u64::from_be_bytes(data[0..8].try_into().expect("8-byte slice")),
            destination: Address::from_bytes(&data[8..13])?,
            fragment_no: data[14] & 0x0f,
            total_fragments: data[14] >> 4,
            hops: data[FRAGMENT_HOPS_INDEX] & FLAGS_HOPS_MASK,
        })
    }

    /// Write the 16-byte fragment header into `out`
    pub fn write_to(&self, out: &mut [u8]) -> WireResult<()> {
        if out.len() < MIN_FRAGMENT_LENGTH {
            return Err(WireError::Truncated {
                need: MIN_FRAGMENT_LENGTH,
                have: out.len(),
            });
        }
        out[0..8].copy_from_slice(&self.packet_id.to_be_bytes());
        out[8..13].copy_from_slice(&self.destination.to_bytes());
        out[FRAGMENT_INDICATOR_INDEX] = FRAGMENT_INDICATOR;
        out[14] = (self.total_fragments << 4) | (self.fragment_no & 0x0f);
        out[FRAGMENT_HOPS_INDEX] = self.hops & FLAGS_HOPS_MASK;
        Ok(())
    }
}

/// True if a datagram is a fragment rather than a packet head
pub fn is_fragment(data: &[u8]) -> bool {
    data.len() > FRAGMENT_INDICATOR_INDEX && data[FRAGMENT_INDICATOR_INDEX] == FRAGMENT_INDICATOR
}

/// Generator of unique 64-bit packet IDs
///
/// Packet IDs double as crypto IVs, so they must never repeat for the same
/// key. A random base plus an atomic counter keeps them unique within a node
/// session and unpredictable across sessions.
pub struct PacketIdSource {
    next: AtomicU64,
}

impl PacketIdSource {
    /// Create a source seeded from the OS RNG
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(rand::rngs::OsRng.next_u64()),
        }
    }

    /// Take the next packet ID
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for PacketIdSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: u64) -> Address {
        Address::from_u64(v)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            packet_id: 0xdead_beef_cafe_f00d,
            destination: addr(0x01_0203_0405),
            source: addr(0x06_0708_090a),
            flags: PacketHeader::make_flags(CipherSuite::Poly1305Salsa2012, 3, true),
            mac: 0x1122_3344_5566_7788,
        };
        let mut buf = vec![0u8; MIN_PACKET_LENGTH];
        header.write_to(&mut buf).unwrap();
        let parsed = PacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.hops(), 3);
        assert_eq!(parsed.cipher().unwrap(), CipherSuite::Poly1305Salsa2012);
        assert!(parsed.is_fragmented());
        assert!(!parsed.is_trusted_path());
    }

    #[test]
    fn test_fragment_header_roundtrip() {
        let fh = FragmentHeader {
            packet_id: 42,
            destination: addr(0x01_0203_0405),
            fragment_no: 2,
            total_fragments: 3,
            hops: 1,
        };
        let mut buf = vec![0u8; MIN_FRAGMENT_LENGTH];
        fh.write_to(&mut buf).unwrap();
        assert!(is_fragment(&buf));
        assert_eq!(FragmentHeader::parse(&buf).unwrap(), fh);
    }

    #[test]
    fn test_head_is_not_fragment() {
        let header = PacketHeader {
            packet_id: 1,
            destination: addr(0x01_0203_0405),
            // A source address can never begin with 0xff.
            source: addr(0x06_0708_090a),
            flags: 0,
            mac: 0,
        };
        let mut buf = vec![0u8; MIN_PACKET_LENGTH];
        header.write_to(&mut buf).unwrap();
        assert!(!is_fragment(&buf));
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(PacketHeader::parse(&[0u8; 27]).is_err());
        assert!(FragmentHeader::parse(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_hop_increment_and_limit() {
        let mut buf = vec![0u8; MIN_PACKET_LENGTH];
        buf[FLAGS_INDEX] = PacketHeader::make_flags(CipherSuite::Poly1305Salsa2012, 5, false);
        assert_eq!(increment_hops(&mut buf, 7), Some(6));
        // A packet at six hops may take its final hop.
        assert_eq!(increment_hops(&mut buf, 7), Some(7));
        // One already at the limit may not be relayed again.
        assert_eq!(increment_hops(&mut buf, 7), None);
        let parsed = PacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed.hops(), 7);
        assert_eq!(parsed.cipher().unwrap(), CipherSuite::Poly1305Salsa2012);
    }

    #[test]
    fn test_fragment_hop_increment_and_limit() {
        let mut buf = vec![0u8; MIN_FRAGMENT_LENGTH];
        FragmentHeader {
            packet_id: 9,
            destination: addr(0x01_0203_0405),
            fragment_no: 1,
            total_fragments: 2,
            hops: 6,
        }
        .write_to(&mut buf)
        .unwrap();
        assert_eq!(increment_fragment_hops(&mut buf, 7), Some(7));
        assert_eq!(increment_fragment_hops(&mut buf, 7), None);
        assert_eq!(FragmentHeader::parse(&buf).unwrap().hops, 7);
    }

    #[test]
    fn test_verb_codes() {
        for v in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 16, 20, 22, 23] {
            assert_eq!(Verb::try_from(v).unwrap() as u8, v);
        }
        assert!(Verb::try_from(30).is_err());
        assert!(Verb::try_from(Verb::ExtFrame as u8).unwrap().is_layer2());
        assert!(!Verb::try_from(Verb::Hello as u8).unwrap().is_layer2());
    }

    #[test]
    fn test_packet_ids_unique() {
        let src = PacketIdSource::new();
        let a = src.next_id();
        let b = src.next_id();
        assert_ne!(a, b);
    }
}
