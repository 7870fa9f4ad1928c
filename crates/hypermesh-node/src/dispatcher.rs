//! The VL1 packet dispatcher
//!
//! One datagram enters, and either exactly one verb handler fires or the
//! packet dies with a trace. The pipeline: path bookkeeping, probe fast
//! path, relay, fragment reassembly, peer resolution (deferring behind a
//! WHOIS when the source is unknown), authentication and decryption,
//! optional decompression, then verb dispatch. Nothing in here blocks on
//! I/O, and no failure is allowed to escape into the host: the outermost
//! scope converts panics into an `UnexpectedError` trace.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use hypermesh_crypto::identity::{Address, Identity};
use hypermesh_crypto::keys::SymmetricSecret;
use hypermesh_crypto::symmetric::{self, CipherSuite};
use hypermesh_wire::buf::{Buf, BufPool};
use hypermesh_wire::constants::{
    BUF_SIZE, FRAGMENT_PAYLOAD_START, HOP_LIMIT, MAX_PACKET_LENGTH, MIN_FRAGMENT_LENGTH,
    MIN_PACKET_LENGTH, PROBE_LENGTH, VERB_FLAG_COMPRESSED, VERB_MASK,
};
use hypermesh_wire::dictionary::{keys as dict_keys, Dictionary};
use hypermesh_wire::endpoint::Endpoint;
use hypermesh_wire::fragment::{AssembleResult, Defragmenter};
use hypermesh_wire::locator::Locator;
use hypermesh_wire::protocol::{self, mask_hops, FragmentHeader, PacketHeader, Verb};
use parking_lot::Mutex;

use crate::events::{Event, PacketDropReason, TraceEvent, TryPathReason};
use crate::host::VirtualLayer2;
use crate::path::Path;
use crate::peer::{begin_packet, Peer};
use crate::runtime::{Runtime, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION};
use crate::topology::Topology;

/// Error codes carried in ERROR verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolErrorCode {
    ObjNotFound = 1,
    UnsupportedOperation = 2,
    NeedMembershipCertificate = 3,
    NetworkAccessDenied = 4,
}

struct WhoisQueueItem {
    /// Deferred raw datagrams: (local socket, origin, bytes)
    packets: VecDeque<(i64, SocketAddr, Vec<u8>)>,
    retries: u32,
    last_retry: i64,
}

/// The layer-1 receive pipeline and verb handlers
pub struct Dispatcher {
    rt: Arc<Runtime>,
    topology: Arc<Topology>,
    vl2: Arc<dyn VirtualLayer2>,
    defrag: Defragmenter,
    pool: BufPool,
    whois: Mutex<HashMap<Address, WhoisQueueItem>>,
    relay_window_start: AtomicI64,
    relay_window_count: AtomicU32,
}

impl Dispatcher {
    pub fn new(rt: Arc<Runtime>, topology: Arc<Topology>, vl2: Arc<dyn VirtualLayer2>) -> Self {
        let defrag = Defragmenter::new(
            rt.config.fragment_ttl,
            rt.config.max_fragments_in_flight_per_path,
        );
        Self {
            rt,
            topology,
            vl2,
            defrag,
            pool: BufPool::new(),
            whois: Mutex::new(HashMap::new()),
            relay_window_start: AtomicI64::new(0),
            relay_window_count: AtomicU32::new(0),
        }
    }

    /// The buffer pool backing this dispatcher
    pub fn pool(&self) -> &BufPool {
        &self.pool
    }

    /// Entry point: handle one received datagram
    ///
    /// Called once per datagram, from any thread. The data is owned by the
    /// dispatcher until this returns.
    pub fn on_remote_packet(&self, local_socket: i64, from: SocketAddr, data: &[u8]) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.process(local_socket, from, data, false)
        }));
        if outcome.is_err() {
            self.rt.trace(TraceEvent::UnexpectedError {
                code: 0xea1b6dea,
                message: format!("unexpected failure parsing packet from {}", from),
            });
        }
    }

    fn process(&self, local_socket: i64, from: SocketAddr, data: &[u8], replayed: bool) {
        let now = self.rt.now();
        let path = self.topology.path(local_socket, from);
        // Anything received keeps the path alive, even runts and keepalives.
        path.received(now, data.len());

        // A bare probe token is a request for a full HELLO.
        if data.len() == PROBE_LENGTH {
            let token = u32::from_be_bytes(data.try_into().expect("4-byte slice"));
            if let Some(peer) = self.topology.peer_by_probe(token) {
                if peer.rate_gate_probe(&self.rt, now) {
                    let sent = peer.hello(&self.rt, local_socket, from, now);
                    if sent > 0 {
                        path.sent(now, sent);
                    }
                }
            }
            return;
        }

        // Runts below the fragment floor are keepalives; drop silently.
        if data.len() < MIN_FRAGMENT_LENGTH {
            return;
        }

        let local_address = self.rt.identity.address();

        // Reassemble, relaying anything not addressed to this node.
        let mut pkt: Buf;
        if protocol::is_fragment(data) {
            let Ok(fh) = FragmentHeader::parse(data) else {
                return;
            };
            if fh.destination != local_address {
                self.relay(fh.destination, data, true, now);
                return;
            }
            match self.defrag.assemble(
                fh.packet_id,
                path.key(),
                &data[FRAGMENT_PAYLOAD_START..],
                fh.fragment_no,
                fh.total_fragments,
                now,
            ) {
                AssembleResult::Complete(assembled) => {
                    let Some(buf) = self.pool.get_filled(&assembled) else {
                        return;
                    };
                    pkt = buf;
                }
                _ => return,
            }
        } else {
            if data.len() < MIN_PACKET_LENGTH {
                return;
            }
            let Ok(header) = PacketHeader::parse(data) else {
                return;
            };
            if header.destination != local_address {
                self.relay(header.destination, data, false, now);
                return;
            }
            if header.is_fragmented() && !replayed {
                match self
                    .defrag
                    .assemble(header.packet_id, path.key(), data, 0, 0, now)
                {
                    AssembleResult::Complete(assembled) => {
                        let Some(buf) = self.pool.get_filled(&assembled) else {
                            return;
                        };
                        pkt = buf;
                    }
                    _ => return,
                }
            } else {
                let Some(buf) = self.pool.get_filled(data) else {
                    return;
                };
                pkt = buf;
            }
        }

        if pkt.len() < MIN_PACKET_LENGTH || pkt.len() > MAX_PACKET_LENGTH {
            self.drop_trace(
                0x010348da,
                0,
                Some(from),
                None,
                0,
                None,
                PacketDropReason::MalformedPacket,
            );
            return;
        }

        let Ok(header) = PacketHeader::parse(pkt.as_slice()) else {
            return;
        };
        let source = header.source;
        if source == local_address || source.is_reserved() {
            return;
        }
        let hops = header.hops();
        let Ok(cipher) = header.cipher() else {
            self.drop_trace(
                0x5b001099,
                header.packet_id,
                Some(from),
                Some(source),
                hops,
                None,
                PacketDropReason::InvalidObject,
            );
            return;
        };

        let mut peer = self.topology.peer(source, true);

        // HELLO is self-authenticating over the cleartext suites; everything
        // else from an unknown source waits behind a WHOIS.
        let cleartext_hello = matches!(cipher, CipherSuite::Poly1305None | CipherSuite::None)
            && (pkt.as_slice()[27] & VERB_MASK) == Verb::Hello as u8;
        if peer.is_none() && !cleartext_hello {
            if !replayed {
                // Defer the fully assembled packet; it is replayed through
                // this pipeline once the identity arrives.
                self.enqueue_whois(source, local_socket, from, pkt.as_slice(), now);
                self.send_pending_whois(now);
            }
            return;
        }

        let mut authenticated = false;
        match cipher {
            CipherSuite::Poly1305None => {
                if let Some(p) = peer.as_ref() {
                    if symmetric::dearmor(p.identity_key(), pkt.as_mut_slice(), cipher).is_err() {
                        self.drop_trace(
                            0xcc89c812,
                            header.packet_id,
                            Some(from),
                            Some(source),
                            hops,
                            None,
                            PacketDropReason::MacFailed,
                        );
                        return;
                    }
                    authenticated = true;
                }
            }
            CipherSuite::Poly1305Salsa2012 => {
                match peer.as_ref() {
                    Some(p) => {
                        if symmetric::dearmor(p.identity_key(), pkt.as_mut_slice(), cipher).is_err()
                        {
                            self.drop_trace(
                                0xbc881231,
                                header.packet_id,
                                Some(from),
                                Some(source),
                                hops,
                                None,
                                PacketDropReason::MacFailed,
                            );
                            return;
                        }
                        authenticated = true;
                    }
                    None => return,
                }
            }
            CipherSuite::None => {
                // Only configured trusted paths may skip crypto; the MAC
                // field carries the claimed trusted path ID.
                if self
                    .topology
                    .should_inbound_path_be_trusted(&from, header.mac)
                {
                    authenticated = true;
                } else {
                    self.drop_trace(
                        0x2dfa910b,
                        header.packet_id,
                        Some(from),
                        Some(source),
                        hops,
                        None,
                        PacketDropReason::NotTrustedPath,
                    );
                    return;
                }
            }
            CipherSuite::AesGmacSiv => {
                // Negotiated but not yet accepted inbound; nonce layout is
                // unresolved.
                self.drop_trace(
                    0x5b001099,
                    header.packet_id,
                    Some(from),
                    Some(source),
                    hops,
                    None,
                    PacketDropReason::InvalidObject,
                );
                return;
            }
        }

        let verb_byte = pkt.as_slice()[27];
        let Ok(verb) = Verb::try_from(verb_byte) else {
            self.drop_trace(
                0xeeeeeff0,
                header.packet_id,
                Some(from),
                Some(source),
                hops,
                None,
                PacketDropReason::UnrecognizedVerb,
            );
            return;
        };

        if (!authenticated || peer.is_none()) && verb != Verb::Hello {
            self.drop_trace(
                0x5b001099,
                header.packet_id,
                Some(from),
                Some(source),
                hops,
                Some(verb),
                PacketDropReason::MacFailed,
            );
            return;
        }

        // Decompress, only after the MAC has vouched for the payload.
        if (verb_byte & VERB_FLAG_COMPRESSED) != 0 {
            if !authenticated {
                self.drop_trace(
                    0x390bcd0a,
                    header.packet_id,
                    Some(from),
                    Some(source),
                    hops,
                    Some(verb),
                    PacketDropReason::MalformedPacket,
                );
                return;
            }
            match self.decompress(&pkt) {
                Some(expanded) => pkt = expanded,
                None => {
                    self.drop_trace(
                        0xee9e4392,
                        header.packet_id,
                        Some(from),
                        Some(source),
                        hops,
                        Some(verb),
                        PacketDropReason::InvalidCompressedData,
                    );
                    return;
                }
            }
        }

        let mut in_re_verb = Verb::Nop;
        let ok = match verb {
            Verb::Nop => true,
            Verb::Hello => self.handle_hello(&path, &mut peer, &mut pkt, authenticated, now),
            Verb::Error => match peer.as_ref() {
                Some(p) => self.handle_error(p, pkt.as_slice(), &mut in_re_verb, now),
                None => false,
            },
            Verb::Ok => match peer.as_ref() {
                Some(p) => self.handle_ok(&path, p, pkt.as_slice(), hops, &mut in_re_verb, now),
                None => false,
            },
            Verb::Whois => match peer.as_ref() {
                Some(p) => self.handle_whois(&path, p, pkt.as_slice(), header.packet_id, now),
                None => false,
            },
            Verb::Rendezvous => match peer.as_ref() {
                Some(p) => self.handle_rendezvous(p, pkt.as_slice(), now),
                None => false,
            },
            Verb::Echo => match peer.as_ref() {
                Some(p) => self.handle_echo(&path, p, pkt.as_slice(), header.packet_id, now),
                None => false,
            },
            Verb::PushDirectPaths => match peer.as_ref() {
                Some(p) => self.handle_push_direct_paths(p, pkt.as_slice(), now),
                None => false,
            },
            Verb::UserMessage => match peer.as_ref() {
                Some(p) => self.handle_user_message(p, pkt.as_slice()),
                None => false,
            },
            Verb::Encap => true,
            Verb::Frame
            | Verb::ExtFrame
            | Verb::MulticastLike
            | Verb::NetworkCredentials
            | Verb::NetworkConfigRequest
            | Verb::NetworkConfig
            | Verb::MulticastGather
            | Verb::Multicast => match peer.as_ref() {
                Some(p) => self.vl2.handle(p, &path, verb, &pkt.as_slice()[28..]),
                None => false,
            },
        };

        if ok {
            if let Some(p) = peer.as_ref() {
                p.received(
                    &self.rt,
                    &path,
                    hops,
                    header.packet_id,
                    pkt.len().saturating_sub(28),
                    verb,
                    in_re_verb,
                    now,
                );
            }
        }
    }

    fn decompress(&self, pkt: &Buf) -> Option<Buf> {
        let payload = &pkt.as_slice()[28..];
        if payload.len() < 4 {
            return None;
        }
        let claimed = u32::from_le_bytes(payload[..4].try_into().expect("4-byte slice")) as usize;
        if claimed > BUF_SIZE - 28 {
            return None;
        }
        let expanded = lz4_flex::block::decompress_size_prepended(payload).ok()?;
        let mut out = self.pool.get();
        out.cell_mut()[..28].copy_from_slice(&pkt.as_slice()[..28]);
        out.cell_mut()[28..28 + expanded.len()].copy_from_slice(&expanded);
        // The payload is plaintext now.
        out.cell_mut()[27] &= !VERB_FLAG_COMPRESSED;
        out.set_len(28 + expanded.len());
        Some(out)
    }

    /// Compress an outbound payload in the wire's size-prepended framing
    pub fn compress_payload(payload: &[u8]) -> Vec<u8> {
        lz4_flex::block::compress_prepend_size(payload)
    }

    // HELLO is self-authenticating: the identity rides in the packet and the
    // packet is verified against the key agreed with that identity.
    fn handle_hello(
        &self,
        path: &Arc<Path>,
        peer_slot: &mut Option<Arc<Peer>>,
        pkt: &mut Buf,
        authenticated: bool,
        now: i64,
    ) -> bool {
        let from = path.remote();
        let Ok(header) = PacketHeader::parse(pkt.as_slice()) else {
            return false;
        };
        let hops = header.hops();
        let packet_id = header.packet_id;

        if pkt.len() < 28 + 13 {
            self.drop_trace(
                0x2bdb0001,
                packet_id,
                Some(from),
                Some(header.source),
                hops,
                Some(Verb::Hello),
                PacketDropReason::MalformedPacket,
            );
            return false;
        }

        let body = pkt.as_slice();
        let proto = body[28];
        let ver_major = body[29];
        let ver_minor = body[30];
        let ver_rev = u16::from_be_bytes([body[31], body[32]]);
        let timestamp = i64::from_be_bytes(body[33..41].try_into().expect("8-byte slice"));

        if proto < MIN_PROTOCOL_VERSION {
            self.drop_trace(
                0xe8d12bad,
                packet_id,
                Some(from),
                Some(header.source),
                hops,
                Some(Verb::Hello),
                PacketDropReason::PeerTooOld,
            );
            return false;
        }

        let mut p = 41usize;
        let Ok((id, consumed)) = Identity::unmarshal(&body[p..]) else {
            self.drop_trace(
                0x707a9810,
                packet_id,
                Some(from),
                Some(header.source),
                hops,
                Some(Verb::Hello),
                PacketDropReason::InvalidObject,
            );
            return false;
        };
        p += consumed;

        if id.address() != header.source {
            self.drop_trace(
                0x06aa9ff1,
                packet_id,
                Some(from),
                None,
                hops,
                Some(Verb::Hello),
                PacketDropReason::MacFailed,
            );
            return false;
        }

        // Same address, different identity: an address-collision attempt.
        if let Some(existing) = peer_slot.as_ref() {
            if *existing.identity() != id {
                self.drop_trace(
                    0x46db8010,
                    packet_id,
                    Some(from),
                    Some(header.source),
                    hops,
                    Some(Verb::Hello),
                    PacketDropReason::InvalidObject,
                );
                return false;
            }
        }

        let key: SymmetricSecret = match peer_slot.as_ref() {
            Some(existing) => existing.identity_key().clone(),
            None => match self.rt.identity.agree(&id) {
                Ok(k) => k,
                Err(_) => {
                    self.drop_trace(
                        0x46db8010,
                        packet_id,
                        Some(from),
                        Some(header.source),
                        hops,
                        Some(Verb::Hello),
                        PacketDropReason::MacFailed,
                    );
                    return false;
                }
            },
        };

        if !authenticated
            && symmetric::dearmor(&key, pkt.as_mut_slice(), CipherSuite::Poly1305None).is_err()
        {
            self.drop_trace(
                0x11bfff81,
                packet_id,
                Some(from),
                Some(header.source),
                hops,
                Some(Verb::Hello),
                PacketDropReason::MacFailed,
            );
            return false;
        }

        // Protocol 11 adds an HMAC-SHA384 transcript tag over the whole
        // packet with the hops bits zeroed.
        let mut packet_size = pkt.len();
        if proto >= 11 {
            if packet_size <= p + 48 {
                self.drop_trace(
                    0x1000662a,
                    packet_id,
                    Some(from),
                    Some(header.source),
                    hops,
                    Some(Verb::Hello),
                    PacketDropReason::MacFailed,
                );
                return false;
            }
            packet_size -= 48;
            let hmac_key = symmetric::hello_hmac_key(&key, 0);
            let mut masked = pkt.as_slice()[..packet_size].to_vec();
            mask_hops(&mut masked);
            let expected = symmetric::hmac_sha384(&hmac_key, &masked);
            if !symmetric::secure_eq(&expected, &pkt.as_slice()[packet_size..packet_size + 48]) {
                self.drop_trace(
                    0x1000662a,
                    packet_id,
                    Some(from),
                    Some(header.source),
                    hops,
                    Some(Verb::Hello),
                    PacketDropReason::MacFailed,
                );
                return false;
            }
        }

        // Sent-to endpoint, then a legacy length field that is always zero.
        let mut sent_to = Endpoint::Nil;
        if p < packet_size {
            match Endpoint::unmarshal(&pkt.as_slice()[p..packet_size]) {
                Ok((ep, n)) => {
                    sent_to = ep;
                    p += n;
                }
                Err(_) => {
                    self.drop_trace(
                        0x10001003,
                        packet_id,
                        Some(from),
                        Some(header.source),
                        hops,
                        Some(Verb::Hello),
                        PacketDropReason::InvalidObject,
                    );
                    return false;
                }
            }
        }
        if p + 2 <= packet_size {
            let legacy = u16::from_be_bytes([pkt.as_slice()[p], pkt.as_slice()[p + 1]]) as usize;
            p += 2 + legacy;
        }

        // Encrypted metadata dictionary.
        let mut metadata = Dictionary::new();
        if proto >= 11 && p < packet_size {
            {
                let slice = pkt.as_mut_slice();
                let (head, tail) = slice.split_at_mut(p);
                let meta_len = packet_size - p;
                if symmetric::crypt_hello_metadata(&key, head, &mut tail[..meta_len]).is_err() {
                    return false;
                }
            }
            let body = pkt.as_slice();
            if p + 2 > packet_size {
                self.drop_trace(
                    0x0d0f0112,
                    packet_id,
                    Some(from),
                    Some(header.source),
                    hops,
                    Some(Verb::Hello),
                    PacketDropReason::MalformedPacket,
                );
                return false;
            }
            let dict_len = u16::from_be_bytes([body[p], body[p + 1]]) as usize;
            p += 2;
            if p + dict_len > packet_size {
                self.drop_trace(
                    0x0d0f0112,
                    packet_id,
                    Some(from),
                    Some(header.source),
                    hops,
                    Some(Verb::Hello),
                    PacketDropReason::MalformedPacket,
                );
                return false;
            }
            if dict_len > 0 {
                match Dictionary::decode(&body[p..p + dict_len]) {
                    Ok(d) => metadata = d,
                    Err(_) => {
                        self.drop_trace(
                            0x67192344,
                            packet_id,
                            Some(from),
                            Some(header.source),
                            hops,
                            Some(Verb::Hello),
                            PacketDropReason::InvalidObject,
                        );
                        return false;
                    }
                }
            }
        }

        // Everything checks out; admit the peer if it is new.
        let peer = match peer_slot.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                if !id.locally_validate() {
                    self.drop_trace(
                        0x2ff7a909,
                        packet_id,
                        Some(from),
                        Some(header.source),
                        hops,
                        Some(Verb::Hello),
                        PacketDropReason::InvalidObject,
                    );
                    return false;
                }
                let Ok(fresh) = Peer::new(&self.rt, id.clone()) else {
                    return false;
                };
                let admitted = self.topology.add(fresh);
                if *admitted.identity() != id {
                    // Lost the race to a different identity: collision.
                    self.drop_trace(
                        0x46db8010,
                        packet_id,
                        Some(from),
                        Some(header.source),
                        hops,
                        Some(Verb::Hello),
                        PacketDropReason::InvalidObject,
                    );
                    return false;
                }
                *peer_slot = Some(Arc::clone(&admitted));
                admitted
            }
        };

        // Recognized metadata: probe token, packed software version, and the
        // sent-to endpoint. The dictionary copies are authenticated, so they
        // win over the cleartext fields when present.
        if let Some(token) = metadata.get_u64(dict_keys::PROBE_TOKEN) {
            peer.set_probe_token_remote(token as u32);
        }
        let (mut r_major, mut r_minor, mut r_rev) = (ver_major as u16, ver_minor as u16, ver_rev);
        if let Some(packed) = metadata.get_u64(dict_keys::VERSION) {
            r_major = (packed >> 32) as u16;
            r_minor = (packed >> 16) as u16;
            r_rev = packed as u16;
        }
        peer.set_remote_version(proto as u16, r_major, r_minor, r_rev);
        if let Some(raw) = metadata.get_bytes(dict_keys::SENT_TO) {
            if let Ok((ep, _)) = Endpoint::unmarshal(raw) {
                sent_to = ep;
            }
        }

        // A direct sender's sent-to field is this node's external surface
        // address as that sender sees it.
        if hops == 0 && sent_to.is_set() {
            self.rt.host.event(Event::ExternalSurfaceAddress {
                reporter: peer.address(),
                local_socket: path.local_socket(),
                surface: sent_to,
            });
        }

        // Reply with OK(HELLO), echoing the timestamp for latency.
        let reply_id = self.rt.packet_ids.next_id();
        let mut reply = begin_packet(
            reply_id,
            peer.address(),
            self.rt.identity.address(),
            peer.cipher(),
            Verb::Ok,
        );
        reply.push(Verb::Hello as u8);
        reply.extend_from_slice(&packet_id.to_be_bytes());
        reply.extend_from_slice(&timestamp.to_be_bytes());
        reply.push(PROTOCOL_VERSION);
        reply.push(VERSION_MAJOR);
        reply.push(VERSION_MINOR);
        reply.extend_from_slice(&VERSION_REVISION.to_be_bytes());
        Endpoint::from(from).marshal(&mut reply);
        reply.extend_from_slice(&0u16.to_be_bytes());

        if proto >= 11 {
            let mut dict = Dictionary::new();
            let _ = dict.add_u64(dict_keys::PROBE_TOKEN, peer.probe_token_local() as u64);
            let _ = dict.add_u64(
                dict_keys::VERSION,
                ((VERSION_MAJOR as u64) << 32)
                    | ((VERSION_MINOR as u64) << 16)
                    | VERSION_REVISION as u64,
            );
            let _ = dict.add_bytes(dict_keys::SENT_TO, &Endpoint::from(from).to_bytes());
            let dict_bytes = dict.encode();
            let meta_start = reply.len();
            reply.extend_from_slice(&(dict_bytes.len() as u16).to_be_bytes());
            reply.extend_from_slice(&dict_bytes);
            reply.extend_from_slice(&0u16.to_be_bytes());
            {
                let (head, meta) = reply.split_at_mut(meta_start);
                if symmetric::crypt_hello_metadata(&key, head, meta).is_err() {
                    return false;
                }
            }
            let hmac_key = symmetric::hello_hmac_key(&key, 1);
            let mut masked = reply.clone();
            mask_hops(&mut masked);
            let hmac = symmetric::hmac_sha384(&hmac_key, &masked);
            reply.extend_from_slice(&hmac);
        }

        if symmetric::armor(&key, &mut reply, peer.cipher()).is_err() {
            return false;
        }
        self.rt.expect.sending(reply_id, now);
        path.send(self.rt.host.as_ref(), &reply, now);

        true
    }

    fn handle_error(&self, peer: &Arc<Peer>, pkt: &[u8], in_re_verb: &mut Verb, now: i64) -> bool {
        if pkt.len() < 38 {
            self.drop_trace(
                0x3beb1947,
                0,
                None,
                Some(peer.address()),
                0,
                Some(Verb::Error),
                PacketDropReason::MalformedPacket,
            );
            return false;
        }
        let in_re = Verb::try_from(pkt[28]).unwrap_or(Verb::Nop);
        let in_re_id = u64::from_be_bytes(pkt[29..37].try_into().expect("8-byte slice"));
        if !self.rt.expect.expecting(in_re_id, now) {
            self.drop_trace(
                0x4c1f1ff7,
                in_re_id,
                None,
                Some(peer.address()),
                0,
                Some(Verb::Error),
                PacketDropReason::ReplyNotExpected,
            );
            return false;
        }
        *in_re_verb = in_re;
        // Error codes are informational at layer 1; layer 2 reacts to the
        // ones about network membership.
        tracing::debug!(peer = %peer.address(), code = pkt[37], in_re = ?in_re, "ERROR received");
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_ok(
        &self,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        pkt: &[u8],
        hops: u8,
        in_re_verb: &mut Verb,
        now: i64,
    ) -> bool {
        if pkt.len() < 37 {
            self.drop_trace(
                0x4c1f1ff7,
                0,
                None,
                Some(peer.address()),
                0,
                Some(Verb::Ok),
                PacketDropReason::MalformedPacket,
            );
            return false;
        }
        let in_re = Verb::try_from(pkt[28]).unwrap_or(Verb::Nop);
        let in_re_id = u64::from_be_bytes(pkt[29..37].try_into().expect("8-byte slice"));
        if !self.rt.expect.expecting(in_re_id, now) {
            self.drop_trace(
                0x4c1f1ff7,
                in_re_id,
                None,
                Some(peer.address()),
                0,
                Some(Verb::Ok),
                PacketDropReason::ReplyNotExpected,
            );
            return false;
        }
        *in_re_verb = in_re;

        match in_re {
            Verb::Hello => {
                if pkt.len() < 50 {
                    return false;
                }
                let mut packet_size = pkt.len();
                let echoed = i64::from_be_bytes(pkt[37..45].try_into().expect("8-byte slice"));
                let proto = pkt[45];
                let major = pkt[46];
                let minor = pkt[47];
                let rev = u16::from_be_bytes([pkt[48], pkt[49]]);

                if proto >= 11 {
                    if packet_size <= 50 + 48 {
                        return false;
                    }
                    packet_size -= 48;
                    let hmac_key = symmetric::hello_hmac_key(peer.identity_key(), 1);
                    let mut masked = pkt[..packet_size].to_vec();
                    mask_hops(&mut masked);
                    let expected = symmetric::hmac_sha384(&hmac_key, &masked);
                    if !symmetric::secure_eq(&expected, &pkt[packet_size..packet_size + 48]) {
                        self.drop_trace(
                            0x1000662b,
                            in_re_id,
                            None,
                            Some(peer.address()),
                            0,
                            Some(Verb::Ok),
                            PacketDropReason::MacFailed,
                        );
                        return false;
                    }
                }

                peer.set_remote_version(proto as u16, major as u16, minor as u16, rev);
                if echoed > 0 && echoed <= now {
                    let sample = now - echoed;
                    path.update_latency(sample);
                    peer.update_latency(sample);
                }

                // The replying peer echoes where it addressed us, which is
                // our surface address from its vantage point.
                if hops == 0 {
                    if let Ok((sent_to, _)) = Endpoint::unmarshal(&pkt[50..packet_size]) {
                        if sent_to.is_set() {
                            self.rt.host.event(Event::ExternalSurfaceAddress {
                                reporter: peer.address(),
                                local_socket: path.local_socket(),
                                surface: sent_to,
                            });
                        }
                    }
                }
                true
            }
            Verb::Whois => {
                self.handle_ok_whois(&pkt[37..], now);
                true
            }
            _ => true,
        }
    }

    fn handle_ok_whois(&self, mut data: &[u8], now: i64) {
        while !data.is_empty() {
            let Ok((id, n)) = Identity::unmarshal(data) else {
                break;
            };
            data = &data[n..];
            let locator = match Locator::unmarshal(data) {
                Ok((loc, n)) => {
                    data = &data[n..];
                    loc
                }
                Err(_) => break,
            };

            if !id.locally_validate() {
                self.drop_trace(
                    0x2ff7a90a,
                    0,
                    None,
                    Some(id.address()),
                    0,
                    Some(Verb::Ok),
                    PacketDropReason::InvalidObject,
                );
                continue;
            }
            let Ok(fresh) = Peer::new(&self.rt, id.clone()) else {
                continue;
            };
            let peer = self.topology.add(fresh);
            if *peer.identity() != id {
                continue;
            }
            if !locator.is_nil() && locator.verify(&id) {
                peer.set_locator(locator);
            }

            // Replay everything that was waiting on this identity.
            let queued = self.whois.lock().remove(&id.address());
            if let Some(item) = queued {
                for (local_socket, from, bytes) in item.packets {
                    self.process(local_socket, from, &bytes, true);
                }
            }
        }
    }

    fn handle_whois(
        &self,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        pkt: &[u8],
        packet_id: u64,
        now: i64,
    ) -> bool {
        if !peer.rate_gate_whois(&self.rt, now) {
            self.drop_trace(
                0x19f7194a,
                packet_id,
                Some(path.remote()),
                Some(peer.address()),
                0,
                Some(Verb::Whois),
                PacketDropReason::RateLimitExceeded,
            );
            return true;
        }

        let reply_id = self.rt.packet_ids.next_id();
        let mut reply = begin_packet(
            reply_id,
            peer.address(),
            self.rt.identity.address(),
            peer.cipher(),
            Verb::Ok,
        );
        reply.push(Verb::Whois as u8);
        reply.extend_from_slice(&packet_id.to_be_bytes());
        let empty_len = reply.len();

        let mut p = 28usize;
        while p + 5 <= pkt.len() {
            let Ok(address) = Address::from_bytes(&pkt[p..p + 5]) else {
                break;
            };
            p += 5;
            match self.topology.peer(address, true) {
                Some(found) => {
                    let id_bytes = found.identity().marshal(false);
                    let mut loc_bytes = Vec::new();
                    found.locator().marshal(&mut loc_bytes);
                    if reply.len() + id_bytes.len() + loc_bytes.len() + 48 > MAX_PACKET_LENGTH {
                        break;
                    }
                    reply.extend_from_slice(&id_bytes);
                    reply.extend_from_slice(&loc_bytes);
                }
                None => {
                    self.send_error(
                        path,
                        peer,
                        Verb::Whois,
                        packet_id,
                        ProtocolErrorCode::ObjNotFound,
                        now,
                    );
                }
            }
        }

        if reply.len() > empty_len {
            if symmetric::armor(peer.identity_key(), &mut reply, peer.cipher()).is_err() {
                return false;
            }
            path.send(self.rt.host.as_ref(), &reply, now);
        }
        true
    }

    // Only roots may introduce us to third parties.
    fn handle_rendezvous(&self, peer: &Arc<Peer>, pkt: &[u8], now: i64) -> bool {
        if !self.topology.is_root(peer.identity()) {
            return true;
        }
        if pkt.len() < 28 + 1 + 5 + 2 + 1 {
            self.drop_trace(
                0x43e90ab3,
                0,
                None,
                Some(peer.address()),
                0,
                Some(Verb::Rendezvous),
                PacketDropReason::MalformedPacket,
            );
            return false;
        }
        let mut p = 28usize;
        p += 1; // flags, unused
        let Ok(with_address) = Address::from_bytes(&pkt[p..p + 5]) else {
            return false;
        };
        p += 5;
        let port = u16::from_be_bytes([pkt[p], pkt[p + 1]]);
        p += 2;
        let addr_len = pkt[p] as usize;
        p += 1;
        if port == 0 || pkt.len() < p + addr_len {
            return false;
        }

        let ip = match addr_len {
            4 => {
                let o: [u8; 4] = pkt[p..p + 4].try_into().expect("4-byte slice");
                std::net::IpAddr::from(o)
            }
            16 => {
                let o: [u8; 16] = pkt[p..p + 16].try_into().expect("16-byte slice");
                std::net::IpAddr::from(o)
            }
            _ => return true, // unknown family; ignore
        };
        let at = SocketAddr::new(ip, port);

        if let Some(with) = self.topology.peer(with_address, true) {
            with.try_direct_path(&self.rt, now, Endpoint::from(at), false);
            self.rt.trace(TraceEvent::TryingNewPath {
                code: 0x55a19aaa,
                peer: with_address,
                remote: at,
                reason: TryPathReason::Rendezvous,
            });
        }
        true
    }

    fn handle_echo(
        &self,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        pkt: &[u8],
        packet_id: u64,
        now: i64,
    ) -> bool {
        if !peer.rate_gate_echo(&self.rt, now) {
            self.drop_trace(
                0x27878bc1,
                packet_id,
                Some(path.remote()),
                Some(peer.address()),
                0,
                Some(Verb::Echo),
                PacketDropReason::RateLimitExceeded,
            );
            return true;
        }

        let payload = &pkt[28..];
        let reply_id = self.rt.packet_ids.next_id();
        let mut reply = begin_packet(
            reply_id,
            peer.address(),
            self.rt.identity.address(),
            peer.cipher(),
            Verb::Ok,
        );
        reply.push(Verb::Echo as u8);
        reply.extend_from_slice(&packet_id.to_be_bytes());
        if reply.len() + payload.len() > MAX_PACKET_LENGTH {
            self.drop_trace(
                0x14d70bb0,
                packet_id,
                Some(path.remote()),
                Some(peer.address()),
                0,
                Some(Verb::Echo),
                PacketDropReason::MalformedPacket,
            );
            return false;
        }
        reply.extend_from_slice(payload);
        if symmetric::armor(peer.identity_key(), &mut reply, peer.cipher()).is_err() {
            return false;
        }
        path.send(self.rt.host.as_ref(), &reply, now);
        true
    }

    fn handle_push_direct_paths(&self, peer: &Arc<Peer>, pkt: &[u8], now: i64) -> bool {
        if pkt.len() < 30 {
            return false;
        }
        let count = u16::from_be_bytes([pkt[28], pkt[29]]).min(16);
        let mut p = 30usize;
        for _ in 0..count {
            // Per record: flags, extended attributes, address type and the
            // address record itself.
            if pkt.len() < p + 5 {
                return self.malformed_pdp(peer);
            }
            p += 1; // flags, unused
            let ext_len = u16::from_be_bytes([pkt[p], pkt[p + 1]]) as usize;
            p += 2 + ext_len;
            if pkt.len() < p + 2 {
                return self.malformed_pdp(peer);
            }
            let addr_type = pkt[p];
            let record_len = pkt[p + 1] as usize;
            p += 2;
            if record_len == 0 || pkt.len() < p + record_len {
                return self.malformed_pdp(peer);
            }
            let record = &pkt[p..p + record_len];
            p += record_len;

            let endpoint = match addr_type {
                0 => Endpoint::unmarshal(record).map(|(ep, _)| ep).ok(),
                4 if record_len >= 6 => {
                    let o: [u8; 4] = record[..4].try_into().expect("4-byte slice");
                    let port = u16::from_be_bytes([record[4], record[5]]);
                    Some(Endpoint::InetV4(o.into(), port))
                }
                6 if record_len >= 18 => {
                    let o: [u8; 16] = record[..16].try_into().expect("16-byte slice");
                    let port = u16::from_be_bytes([record[16], record[17]]);
                    Some(Endpoint::InetV6(o.into(), port))
                }
                _ => None,
            };

            if let Some(ep) = endpoint {
                if let Some(sa) = ep.inet_addr() {
                    peer.try_direct_path(&self.rt, now, ep, false);
                    self.rt.trace(TraceEvent::TryingNewPath {
                        code: 0xa5ab1a43,
                        peer: peer.address(),
                        remote: sa,
                        reason: TryPathReason::PushDirectPaths,
                    });
                }
            }
        }
        true
    }

    fn malformed_pdp(&self, peer: &Arc<Peer>) -> bool {
        self.drop_trace(
            0xb450e10f,
            0,
            None,
            Some(peer.address()),
            0,
            Some(Verb::PushDirectPaths),
            PacketDropReason::MalformedPacket,
        );
        false
    }

    fn handle_user_message(&self, peer: &Arc<Peer>, pkt: &[u8]) -> bool {
        if pkt.len() < 36 {
            return false;
        }
        let type_id = u64::from_be_bytes(pkt[28..36].try_into().expect("8-byte slice"));
        self.rt.host.event(Event::UserMessage {
            source: peer.address(),
            type_id,
            data: bytes::Bytes::copy_from_slice(&pkt[36..]),
        });
        true
    }

    /// Send a rate-limited ERROR reply to a peer
    pub fn send_error(
        &self,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        in_re_verb: Verb,
        in_re_packet_id: u64,
        code: ProtocolErrorCode,
        now: i64,
    ) {
        if !peer.rate_gate_error_reply(&self.rt, now) {
            return;
        }
        let mut reply = begin_packet(
            self.rt.packet_ids.next_id(),
            peer.address(),
            self.rt.identity.address(),
            peer.cipher(),
            Verb::Error,
        );
        reply.push(in_re_verb as u8);
        reply.extend_from_slice(&in_re_packet_id.to_be_bytes());
        reply.push(code as u8);
        if symmetric::armor(peer.identity_key(), &mut reply, peer.cipher()).is_ok() {
            path.send(self.rt.host.as_ref(), &reply, now);
        }
    }

    // Forward a packet not addressed to us: bump the hop count, find the
    // destination's best path and re-emit. No known path means a silent drop;
    // this node does not issue WHOIS on behalf of third parties.
    fn relay(&self, destination: Address, data: &[u8], is_fragment: bool, now: i64) {
        if !self.relay_rate_gate(now) {
            return;
        }

        let mut copy = data.to_vec();
        let advanced = if is_fragment {
            protocol::increment_fragment_hops(&mut copy, HOP_LIMIT)
        } else {
            protocol::increment_hops(&mut copy, HOP_LIMIT)
        };
        if advanced.is_none() {
            return;
        }

        let Some(to_peer) = self.topology.peer(destination, true) else {
            return;
        };
        let Some(to_path) = to_peer.path(&self.rt, now) else {
            return;
        };
        to_path.send(self.rt.host.as_ref(), &copy, now);
    }

    fn relay_rate_gate(&self, now: i64) -> bool {
        let window = self.relay_window_start.load(Ordering::Relaxed);
        if now - window >= 1_000 {
            self.relay_window_start.store(now, Ordering::Relaxed);
            self.relay_window_count.store(1, Ordering::Relaxed);
            return true;
        }
        self.relay_window_count.fetch_add(1, Ordering::Relaxed)
            < self.rt.config.relay_rate_limit
    }

    fn enqueue_whois(
        &self,
        source: Address,
        local_socket: i64,
        from: SocketAddr,
        data: &[u8],
        now: i64,
    ) {
        let mut whois = self.whois.lock();
        if !whois.contains_key(&source) && whois.len() >= self.rt.config.whois_max_targets {
            return;
        }
        let item = whois.entry(source).or_insert_with(|| WhoisQueueItem {
            packets: VecDeque::new(),
            retries: 0,
            last_retry: now - self.rt.config.whois_retry_interval,
        });
        // Bounded ring: the eldest deferred packet gives way.
        if item.packets.len() >= self.rt.config.whois_queue_ring {
            item.packets.pop_front();
        }
        item.packets.push_back((local_socket, from, data.to_vec()));
    }

    /// Issue WHOIS requests for addresses whose retry timer has elapsed
    pub fn send_pending_whois(&self, now: i64) {
        let Some((root, root_path)) = self.topology.best_root_path(now) else {
            return;
        };

        let due: Vec<Address> = {
            let mut whois = self.whois.lock();
            whois
                .iter_mut()
                .filter(|(_, item)| (now - item.last_retry) >= self.rt.config.whois_retry_interval)
                .map(|(addr, item)| {
                    item.last_retry = now;
                    item.retries += 1;
                    *addr
                })
                .collect()
        };
        if due.is_empty() {
            return;
        }

        for chunk in due.chunks((MAX_PACKET_LENGTH - 28) / 5) {
            let packet_id = self.rt.packet_ids.next_id();
            let mut packet = begin_packet(
                packet_id,
                root.address(),
                self.rt.identity.address(),
                root.cipher(),
                Verb::Whois,
            );
            for address in chunk {
                packet.extend_from_slice(&address.to_bytes());
            }
            if symmetric::armor(root.identity_key(), &mut packet, root.cipher()).is_err() {
                return;
            }
            self.rt.expect.sending(packet_id, now);
            root_path.send(self.rt.host.as_ref(), &packet, now);
        }
    }

    /// Expire WHOIS queue entries that have retried too long
    pub fn sweep_whois(&self, now: i64) {
        let give_up = self.rt.config.whois_retry_interval * 20;
        self.whois
            .lock()
            .retain(|_, item| item.retries < 16 && (now - item.last_retry) <= give_up);
    }

    /// Number of addresses with deferred packets
    pub fn whois_pending(&self) -> usize {
        self.whois.lock().len()
    }

    #[allow(clippy::too_many_arguments)]
    fn drop_trace(
        &self,
        code: u32,
        packet_id: u64,
        from: Option<SocketAddr>,
        source: Option<Address>,
        hops: u8,
        verb: Option<Verb>,
        reason: PacketDropReason,
    ) {
        self.rt.trace(TraceEvent::IncomingPacketDropped {
            code,
            packet_id,
            from,
            source,
            hops,
            verb,
            reason,
        });
    }
}
