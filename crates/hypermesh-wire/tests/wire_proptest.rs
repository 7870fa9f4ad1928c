//! Property tests for the wire codecs and the reassembler.

use proptest::prelude::*;

use hypermesh_crypto::identity::Address;
use hypermesh_crypto::symmetric::CipherSuite;
use hypermesh_wire::constants::{MIN_FRAGMENT_LENGTH, MIN_PACKET_LENGTH};
use hypermesh_wire::fragment::{AssembleResult, Defragmenter};
use hypermesh_wire::protocol::{FragmentHeader, PacketHeader};
use hypermesh_wire::{Dictionary, Endpoint};

fn arb_address() -> impl Strategy<Value = Address> {
    any::<u64>().prop_map(Address::from_u64)
}

fn arb_endpoint() -> impl Strategy<Value = Endpoint> {
    prop_oneof![
        Just(Endpoint::Nil),
        any::<[u8; 6]>().prop_map(Endpoint::Ethernet),
        (any::<[u8; 4]>(), any::<u16>())
            .prop_map(|(ip, port)| Endpoint::InetV4(ip.into(), port)),
        (any::<[u8; 16]>(), any::<u16>())
            .prop_map(|(ip, port)| Endpoint::InetV6(ip.into(), port)),
    ]
}

proptest! {
    /// Every valid packet header survives an encode/decode cycle.
    #[test]
    fn packet_header_roundtrip(
        packet_id in any::<u64>(),
        destination in arb_address(),
        source in arb_address(),
        cipher in 0u8..4,
        hops in 0u8..8,
        fragmented in any::<bool>(),
        mac in any::<u64>(),
    ) {
        let header = PacketHeader {
            packet_id,
            destination,
            source,
            flags: PacketHeader::make_flags(
                CipherSuite::from_wire(cipher).unwrap(),
                hops,
                fragmented,
            ),
            mac,
        };
        let mut buf = vec![0u8; MIN_PACKET_LENGTH];
        header.write_to(&mut buf).unwrap();
        let parsed = PacketHeader::parse(&buf).unwrap();
        prop_assert_eq!(parsed, header);
        prop_assert_eq!(parsed.hops(), hops);
        prop_assert_eq!(parsed.is_fragmented(), fragmented);
    }

    /// Fragment headers roundtrip for every legal counter combination.
    #[test]
    fn fragment_header_roundtrip(
        packet_id in any::<u64>(),
        destination in arb_address(),
        total in 1u8..9,
        hops in 0u8..8,
    ) {
        for fragment_no in 0..total {
            let fh = FragmentHeader {
                packet_id,
                destination,
                fragment_no,
                total_fragments: total,
                hops,
            };
            let mut buf = vec![0u8; MIN_FRAGMENT_LENGTH];
            fh.write_to(&mut buf).unwrap();
            prop_assert_eq!(FragmentHeader::parse(&buf).unwrap(), fh);
        }
    }

    /// Endpoints of every type roundtrip byte for byte.
    #[test]
    fn endpoint_roundtrip(ep in arb_endpoint()) {
        let bytes = ep.to_bytes();
        let (back, consumed) = Endpoint::unmarshal(&bytes).unwrap();
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(back, ep);
    }

    /// Dictionaries roundtrip regardless of what bytes the values hold.
    #[test]
    fn dictionary_roundtrip(
        entries in proptest::collection::btree_map(
            "[a-z]{1,8}",
            proptest::collection::vec(any::<u8>(), 0..64),
            0..8,
        )
    ) {
        let mut dict = Dictionary::new();
        for (k, v) in &entries {
            dict.add_bytes(k, v).unwrap();
        }
        let decoded = Dictionary::decode(&dict.encode()).unwrap();
        prop_assert_eq!(decoded.len(), entries.len());
        for (k, v) in &entries {
            prop_assert_eq!(decoded.get_bytes(k), Some(v.as_slice()));
        }
    }

    /// All fragments delivered in any order reassemble to the original
    /// payload exactly once.
    #[test]
    fn reassembly_is_permutation_invariant(
        payload in proptest::collection::vec(any::<u8>(), 8..512),
        total in 2usize..8,
        seed in any::<u64>(),
    ) {
        let defrag = Defragmenter::new(1_000, 16);
        let chunk = payload.len().div_ceil(total);
        let chunks: Vec<&[u8]> = payload.chunks(chunk).collect();
        let n = chunks.len() as u8;

        // A deterministic shuffle of the delivery order.
        let mut order: Vec<usize> = (0..chunks.len()).collect();
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            order.swap(i, (state as usize) % (i + 1));
        }

        let mut completions = 0;
        for (delivered, &idx) in order.iter().enumerate() {
            match defrag.assemble(42, 7, chunks[idx], idx as u8, n, 0) {
                AssembleResult::Complete(assembled) => {
                    completions += 1;
                    prop_assert_eq!(delivered, order.len() - 1);
                    prop_assert_eq!(&assembled, &payload);
                }
                AssembleResult::Accepted => {}
                other => prop_assert!(false, "unexpected result: {:?}", other),
            }
        }
        prop_assert_eq!(completions, 1);
    }
}
