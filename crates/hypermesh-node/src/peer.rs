//! Peer state
//!
//! One `Peer` per remote node: its identity, the permanent key agreed with
//! it, learned direct paths in preference order, the queue of candidate
//! endpoints to try, rate gates for inbound control verbs, and the marshal
//! format used to cache all of this in the external state store.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use hypermesh_crypto::identity::{Address, Identity};
use hypermesh_crypto::keys::{EphemeralKey, SymmetricSecret};
use hypermesh_crypto::symmetric::{self, CipherSuite};
use hypermesh_wire::constants::{HEADER_SIZE, MAX_PACKET_LENGTH};
use hypermesh_wire::dictionary::{keys as dict_keys, Dictionary};
use hypermesh_wire::endpoint::{Endpoint, EndpointType};
use hypermesh_wire::locator::Locator;
use hypermesh_wire::protocol::{mask_hops, PacketHeader, Verb};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use rand::RngCore;

use crate::error::{NodeError, NodeResult};
use crate::events::{TraceEvent, TryPathReason};
use crate::path::{ip_scope, IpScope, Path};
use crate::runtime::{Runtime, PROTOCOL_VERSION, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION};

/// Serialized peer record version
const PEER_MARSHAL_VERSION: u8 = 0;

/// Size of the encrypted identity-key envelope in a peer record
const KEY_ENVELOPE_SIZE: usize = 8 + 4 + 48;

/// One queued candidate endpoint
#[derive(Debug, Clone)]
struct TryQueueItem {
    target: Endpoint,
    ts: i64,
    bfg1024: bool,
    bfg_offset: u32,
}

struct PeerInner {
    /// Direct paths; slots `[0, alive_path_count)` are alive, best first
    paths: Vec<Arc<Path>>,
    alive_path_count: usize,
    locator: Locator,
    bootstrap: BTreeMap<EndpointType, Endpoint>,
    try_queue: Vec<TryQueueItem>,
    /// Current and previous session key slots
    ephemeral: [Option<Arc<EphemeralKey>>; 2],
    version: (u16, u16, u16, u16),
}

/// State for one remote node
pub struct Peer {
    identity: Identity,
    address: Address,
    identity_key: SymmetricSecret,
    inner: RwLock<PeerInner>,

    last_receive: AtomicI64,
    last_send: AtomicI64,
    last_hello_sent: AtomicI64,
    last_whois_received: AtomicI64,
    last_echo_received: AtomicI64,
    last_probe_received: AtomicI64,
    last_error_sent: AtomicI64,
    last_prioritized_paths: AtomicI64,

    /// Smoothed peer latency in ms, -1 while unknown
    latency: AtomicI64,

    /// The token we answer probes with, minted per peer relationship
    probe_token_local: u32,
    /// The token the remote answers probes with, learned from its HELLO
    probe_token_remote: AtomicU32,
}

impl Peer {
    /// Initialize a peer from its identity, deriving the permanent key
    pub fn new(rt: &Runtime, identity: Identity) -> NodeResult<Arc<Peer>> {
        let identity_key = rt.identity.agree(&identity)?;
        Ok(Self::with_key(rt, identity, identity_key))
    }

    fn with_key(_rt: &Runtime, identity: Identity, identity_key: SymmetricSecret) -> Arc<Peer> {
        let mut token = rand::rngs::OsRng.next_u32();
        if token == 0 {
            token = 1;
        }
        Arc::new(Peer {
            address: identity.address(),
            identity,
            identity_key,
            inner: RwLock::new(PeerInner {
                paths: Vec::new(),
                alive_path_count: 0,
                locator: Locator::nil(),
                bootstrap: BTreeMap::new(),
                try_queue: Vec::new(),
                ephemeral: [None, None],
                version: (0, 0, 0, 0),
            }),
            last_receive: AtomicI64::new(0),
            last_send: AtomicI64::new(0),
            last_hello_sent: AtomicI64::new(0),
            last_whois_received: AtomicI64::new(0),
            last_echo_received: AtomicI64::new(0),
            last_probe_received: AtomicI64::new(0),
            last_error_sent: AtomicI64::new(0),
            last_prioritized_paths: AtomicI64::new(0),
            latency: AtomicI64::new(-1),
            probe_token_local: token,
            probe_token_remote: AtomicU32::new(0),
        })
    }

    /// This peer's address
    pub fn address(&self) -> Address {
        self.address
    }

    /// This peer's identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The permanent key agreed between the local identity and this peer
    pub fn identity_key(&self) -> &SymmetricSecret {
        &self.identity_key
    }

    /// Preferred cipher for normal traffic to this peer
    pub fn cipher(&self) -> CipherSuite {
        CipherSuite::Poly1305Salsa2012
    }

    /// The probe token this node answers to for this peer
    pub fn probe_token_local(&self) -> u32 {
        self.probe_token_local
    }

    /// The probe token the remote answers to, or 0 if unknown
    pub fn probe_token_remote(&self) -> u32 {
        self.probe_token_remote.load(Ordering::Relaxed)
    }

    /// Learn the remote's probe token from its HELLO metadata
    pub fn set_probe_token_remote(&self, token: u32) {
        self.probe_token_remote.store(token, Ordering::Relaxed);
    }

    /// Most recent locator, which may be nil
    pub fn locator(&self) -> Locator {
        self.inner.read().locator.clone()
    }

    /// Replace the locator if the new one is newer; caller must have verified
    pub fn set_locator(&self, locator: Locator) {
        let mut inner = self.inner.write();
        if locator.timestamp() > inner.locator.timestamp() {
            inner.locator = locator;
        }
    }

    /// Remote software version as (protocol, major, minor, revision)
    pub fn remote_version(&self) -> (u16, u16, u16, u16) {
        self.inner.read().version
    }

    /// Remote protocol version, 0 if unknown
    pub fn remote_protocol_version(&self) -> u16 {
        self.inner.read().version.0
    }

    /// Record the remote software version from a HELLO or OK(HELLO)
    pub fn set_remote_version(&self, proto: u16, major: u16, minor: u16, rev: u16) {
        self.inner.write().version = (proto, major, minor, rev);
    }

    /// Time anything was last received from this peer
    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    /// Record bytes sent toward this peer
    pub fn sent(&self, now: i64, _bytes: usize) {
        self.last_send.store(now, Ordering::Relaxed);
    }

    /// Smoothed latency in ms, or -1 while unknown
    pub fn latency(&self) -> i64 {
        self.latency.load(Ordering::Relaxed)
    }

    /// Fold a round-trip sample into the peer latency estimate
    pub fn update_latency(&self, sample_ms: i64) {
        let prev = self.latency.load(Ordering::Relaxed);
        let next = if prev < 0 {
            sample_ms
        } else {
            (prev * 3 + sample_ms) / 4
        };
        self.latency.store(next.max(0), Ordering::Relaxed);
    }

    /// Rate gate for answering inbound WHOIS requests
    pub fn rate_gate_whois(&self, rt: &Runtime, now: i64) -> bool {
        rate_gate(&self.last_whois_received, now, rt.config.whois_rate_limit)
    }

    /// Rate gate for answering inbound ECHO requests
    pub fn rate_gate_echo(&self, rt: &Runtime, now: i64) -> bool {
        rate_gate(&self.last_echo_received, now, rt.config.echo_rate_limit)
    }

    /// Rate gate for answering inbound probes
    pub fn rate_gate_probe(&self, rt: &Runtime, now: i64) -> bool {
        rate_gate(&self.last_probe_received, now, rt.config.probe_rate_limit)
    }

    /// Rate gate for sending ERROR replies to this peer
    pub fn rate_gate_error_reply(&self, rt: &Runtime, now: i64) -> bool {
        rate_gate(&self.last_error_sent, now, rt.config.echo_rate_limit)
    }

    /// All currently remembered bootstrap endpoints
    pub fn bootstrap(&self) -> Vec<Endpoint> {
        self.inner.read().bootstrap.values().copied().collect()
    }

    /// Remember a bootstrap endpoint (one per endpoint type)
    pub fn set_bootstrap(&self, ep: Endpoint) {
        self.inner.write().bootstrap.insert(ep.endpoint_type(), ep);
    }

    /// Log receipt of an authenticated packet and learn paths
    ///
    /// Path learning only happens for direct packets (zero hops). A novel
    /// origin is adopted as a path when it carries an expected OK reply;
    /// anything else merely triggers a HELLO toward the origin so the
    /// legitimate owner can prove itself.
    #[allow(clippy::too_many_arguments)]
    pub fn received(
        self: &Arc<Self>,
        rt: &Runtime,
        path: &Arc<Path>,
        hops: u8,
        packet_id: u64,
        _payload_len: usize,
        verb: Verb,
        _in_re_verb: Verb,
        now: i64,
    ) {
        self.last_receive.store(now, Ordering::Relaxed);

        if hops != 0 {
            return;
        }

        let inner = self.inner.upgradable_read();
        for known in inner.paths.iter().take(inner.alive_path_count) {
            if Arc::ptr_eq(known, path) {
                return;
            }
        }

        if !rt.host.path_check(
            self.address,
            &self.identity,
            path.local_socket(),
            path.remote(),
        ) {
            return;
        }

        if verb == Verb::Ok {
            // Replay protection: OK replies were vetted against the
            // expectation table before this point.
            let mut inner = RwLockUpgradableReadGuard::upgrade(inner);

            let mut old_remote = None;
            let max_paths = rt.config.max_paths_per_peer;
            let mut replaced = false;
            for known in inner.paths.iter_mut() {
                let same_socket = known.local_socket() == path.local_socket();
                let same_ip = known.remote().ip() == path.remote().ip();
                if same_socket && same_ip {
                    // Same host, new port: NAT rebind, replace in place.
                    old_remote = Some(known.remote());
                    *known = Arc::clone(path);
                    replaced = true;
                    break;
                }
            }
            if !replaced {
                if inner.paths.len() >= max_paths {
                    // Evict the least recently active path.
                    if let Some((idx, _)) = inner
                        .paths
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, p)| p.last_receive())
                    {
                        old_remote = Some(inner.paths[idx].remote());
                        inner.paths[idx] = Arc::clone(path);
                    }
                } else {
                    inner.paths.push(Arc::clone(path));
                }
            }

            self.prioritize_paths_locked(rt, &mut inner, now);
            let ep = Endpoint::from(path.remote());
            inner.bootstrap.insert(ep.endpoint_type(), ep);
            drop(inner);

            rt.trace(TraceEvent::LearnedNewPath {
                code: 0x582fabdd,
                packet_id,
                peer: self.address,
                new_remote: path.remote(),
                old_remote,
            });
        } else {
            drop(inner);
            let sent = self.hello(rt, path.local_socket(), path.remote(), now);
            if sent > 0 {
                path.sent(now, sent);
            }
            rt.trace(TraceEvent::TryingNewPath {
                code: 0xb7747ddd,
                peer: self.address,
                remote: path.remote(),
                reason: TryPathReason::PacketReceivedFromUnknownPath,
            });
        }
    }

    /// The current best alive path, if any
    pub fn path(&self, rt: &Runtime, now: i64) -> Option<Arc<Path>> {
        let due = (now - self.last_prioritized_paths.load(Ordering::Relaxed))
            > rt.config.prioritize_paths_interval;
        if due {
            let mut inner = self.inner.write();
            self.prioritize_paths_locked(rt, &mut inner, now);
            inner.paths.first().cloned()
        } else {
            let inner = self.inner.read();
            if inner.alive_path_count > 0 {
                inner.paths.first().cloned()
            } else {
                None
            }
        }
    }

    /// True if at least one alive direct path exists
    pub fn directly_connected(&self, rt: &Runtime, now: i64) -> bool {
        self.path(rt, now).is_some()
    }

    /// Snapshot of all alive paths, best first
    pub fn all_paths(&self) -> Vec<Arc<Path>> {
        let inner = self.inner.read();
        inner.paths[..inner.alive_path_count].to_vec()
    }

    /// Send a datagram over a specific path, bypassing selection
    pub fn send_via(&self, rt: &Runtime, path: &Path, data: &[u8], now: i64) -> bool {
        let ok = path.send(rt.host.as_ref(), data, now);
        if ok {
            self.sent(now, data.len());
        }
        ok
    }

    /// Send a datagram via the best alive path, or via the best root
    pub fn send(
        &self,
        rt: &Runtime,
        root: Option<(Arc<Peer>, Arc<Path>)>,
        data: &[u8],
        now: i64,
    ) -> bool {
        if let Some(via) = self.path(rt, now) {
            return self.send_via(rt, &via, data, now);
        }
        match root {
            Some((root_peer, root_path)) if root_peer.address != self.address => {
                let ok = root_path.send(rt.host.as_ref(), data, now);
                if ok {
                    self.sent(now, data.len());
                }
                ok
            }
            _ => false,
        }
    }

    /// Send a full HELLO to this peer at a specific physical address
    ///
    /// Returns the number of bytes sent, zero on failure.
    pub fn hello(&self, rt: &Runtime, local_socket: i64, remote: SocketAddr, now: i64) -> usize {
        let packet_id = rt.packet_ids.next_id();
        let mut packet = begin_packet(
            packet_id,
            self.address,
            rt.identity.address(),
            CipherSuite::Poly1305None,
            Verb::Hello,
        );

        packet.push(PROTOCOL_VERSION);
        packet.push(VERSION_MAJOR);
        packet.push(VERSION_MINOR);
        packet.extend_from_slice(&VERSION_REVISION.to_be_bytes());
        packet.extend_from_slice(&now.to_be_bytes());
        packet.extend_from_slice(&rt.identity.marshal(false));
        Endpoint::from(remote).marshal(&mut packet);
        // Legacy field, always zero.
        packet.extend_from_slice(&0u16.to_be_bytes());

        // Encrypted metadata section plus transcript HMAC. The sent-to
        // endpoint rides here as well: this copy is authenticated, unlike
        // the cleartext field.
        let mut dict = Dictionary::new();
        let _ = dict.add_u64(dict_keys::PROBE_TOKEN, self.probe_token_local as u64);
        let _ = dict.add_u64(
            dict_keys::VERSION,
            ((VERSION_MAJOR as u64) << 32) | ((VERSION_MINOR as u64) << 16) | VERSION_REVISION as u64,
        );
        let _ = dict.add_bytes(dict_keys::SENT_TO, &Endpoint::from(remote).to_bytes());
        let dict_bytes = dict.encode();

        let meta_start = packet.len();
        packet.extend_from_slice(&(dict_bytes.len() as u16).to_be_bytes());
        packet.extend_from_slice(&dict_bytes);
        packet.extend_from_slice(&0u16.to_be_bytes());
        {
            // The header is fully formed; its first 12 bytes are the IV.
            let (head, meta) = packet.split_at_mut(meta_start);
            if symmetric::crypt_hello_metadata(&self.identity_key, head, meta).is_err() {
                return 0;
            }
        }

        let hmac_key = symmetric::hello_hmac_key(&self.identity_key, 0);
        let mut masked = packet.clone();
        mask_hops(&mut masked);
        let hmac = symmetric::hmac_sha384(&hmac_key, &masked);
        packet.extend_from_slice(&hmac);

        if symmetric::armor(&self.identity_key, &mut packet, CipherSuite::Poly1305None).is_err() {
            return 0;
        }

        rt.expect.sending(packet_id, now);
        if rt.host.wire_send(local_socket, remote, &packet, 0) {
            self.sent(now, packet.len());
            packet.len()
        } else {
            0
        }
    }

    /// Send a minimal reachability probe to an address
    ///
    /// Uses the remote's advertised probe token when known (4 bytes on the
    /// wire); otherwise falls back to an armored NOP.
    pub fn probe(&self, rt: &Runtime, local_socket: i64, remote: SocketAddr, now: i64) -> usize {
        let token = self.probe_token_remote();
        if token != 0 {
            if rt.host.wire_send(local_socket, remote, &token.to_be_bytes(), 0) {
                self.sent(now, 4);
                return 4;
            }
            return 0;
        }

        let mut packet = begin_packet(
            rt.packet_ids.next_id(),
            self.address,
            rt.identity.address(),
            CipherSuite::Poly1305Salsa2012,
            Verb::Nop,
        );
        if symmetric::armor(&self.identity_key, &mut packet, CipherSuite::Poly1305Salsa2012).is_err()
        {
            return 0;
        }
        if rt.host.wire_send(local_socket, remote, &packet, 0) {
            self.sent(now, packet.len());
            packet.len()
        } else {
            0
        }
    }

    /// Enqueue a candidate direct path to attempt
    ///
    /// With `bfg1024` set and an IPv4 target, the pulse loop fans the
    /// attempt out across a deterministic schedule of ports to defeat
    /// symmetric NATs.
    pub fn try_direct_path(&self, rt: &Runtime, now: i64, target: Endpoint, bfg1024: bool) {
        if !target.is_inet() {
            return;
        }
        let mut inner = self.inner.write();
        for item in inner.try_queue.iter_mut() {
            if item.target == target {
                item.ts = now;
                item.bfg1024 = bfg1024;
                return;
            }
        }
        if inner.try_queue.len() < rt.config.try_queue_cap {
            inner.try_queue.push(TryQueueItem {
                target,
                ts: now,
                bfg1024,
                bfg_offset: 0,
            });
        }
    }

    /// Number of queued direct-path candidates
    pub fn try_queue_len(&self) -> usize {
        self.inner.read().try_queue.len()
    }

    /// Periodic per-peer work
    ///
    /// Sends HELLO when stale, keeps alive paths warm, drains the try-queue
    /// when no path is alive, and retires expired session keys. `root` is
    /// the current best root relay, used when no direct path can carry a
    /// needed HELLO.
    pub fn pulse(
        self: &Arc<Self>,
        rt: &Runtime,
        root: Option<(Arc<Peer>, Arc<Path>)>,
        now: i64,
        _is_root: bool,
    ) {
        let mut need_hello = false;
        if (now - self.last_hello_sent.load(Ordering::Relaxed)) >= rt.config.hello_interval {
            self.last_hello_sent.store(now, Ordering::Relaxed);
            need_hello = true;
        }

        // Plan under the lock, send after releasing it.
        enum Attempt {
            Probe(SocketAddr),
            Bfg(SocketAddr, u32, usize),
        }
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut keepalive_paths: Vec<Arc<Path>> = Vec::new();
        let mut hello_path: Option<Arc<Path>> = None;
        let alive_count;
        {
            let mut inner = self.inner.write();
            self.prioritize_paths_locked(rt, &mut inner, now);
            alive_count = inner.alive_path_count;

            if alive_count == 0 {
                let alive_timeout = rt.config.path_alive_timeout;
                let budget = rt.config.bfg_port_budget as u32;
                let per_pulse = rt.config.bfg_ports_per_pulse;
                let max_attempts = rt.config.try_attempts_per_pulse;
                let mut taken = 0;
                inner.try_queue.retain_mut(|item| {
                    if (now - item.ts) > alive_timeout {
                        return false;
                    }
                    if taken >= max_attempts {
                        return true;
                    }
                    if let Some(sa) = item.target.inet_addr() {
                        taken += 1;
                        if item.bfg1024 && sa.is_ipv4() {
                            attempts.push(Attempt::Bfg(sa, item.bfg_offset, per_pulse));
                            item.bfg_offset += per_pulse as u32;
                            return item.bfg_offset < budget;
                        }
                        attempts.push(Attempt::Probe(sa));
                    }
                    true
                });

                if attempts.is_empty() {
                    // Nothing queued: consult the host, then bootstrap memory.
                    if let Some(sa) = rt.host.path_lookup(self.address, &self.identity, None) {
                        if rt.host.path_check(self.address, &self.identity, -1, sa) {
                            attempts.push(Attempt::Probe(sa));
                        }
                    }
                    if let Some(ep) = pick_random_bootstrap(&inner.bootstrap) {
                        if let Some(sa) = ep.inet_addr() {
                            attempts.push(Attempt::Probe(sa));
                        }
                    }
                }
            } else {
                for path in inner.paths[..alive_count].iter() {
                    if need_hello && hello_path.is_none() {
                        hello_path = Some(Arc::clone(path));
                    } else if (now - path.last_send()) >= rt.config.path_keepalive_interval {
                        keepalive_paths.push(Arc::clone(path));
                    }
                }
            }

            // Retire fully expired session keys; the previous slot keeps
            // decrypting in-flight traffic until its own TTLs lapse.
            for slot in inner.ephemeral.iter_mut() {
                if slot.as_ref().map(|k| k.expired(now)).unwrap_or(false) {
                    *slot = None;
                }
            }
        }

        for attempt in attempts {
            match attempt {
                Attempt::Probe(sa) => {
                    self.probe(rt, -1, sa, now);
                }
                Attempt::Bfg(sa, offset, count) => {
                    let seed = rt.node_nonce ^ self.address.to_u64();
                    for i in 0..count as u32 {
                        let mut target = sa;
                        target.set_port(bfg_port(seed, offset + i));
                        self.probe(rt, -1, target, now);
                    }
                }
            }
        }

        if let Some(path) = hello_path {
            let bytes = self.hello(rt, path.local_socket(), path.remote(), now);
            if bytes > 0 {
                path.sent(now, bytes);
                need_hello = false;
            }
        }
        for path in keepalive_paths {
            // A single byte is enough to hold NAT mappings open.
            path.send(rt.host.as_ref(), &[0u8], now);
            self.sent(now, 1);
        }

        if need_hello && alive_count == 0 {
            if let Some((root_peer, root_path)) = root {
                if root_peer.address != self.address {
                    let bytes = self.hello(rt, root_path.local_socket(), root_path.remote(), now);
                    if bytes > 0 {
                        root_path.sent(now, bytes);
                    }
                }
            }
        }
    }

    /// Probe and deactivate paths within an address scope
    ///
    /// Used when the local external address may have changed: each matching
    /// path is sent a probe and goes dead until something is received on it
    /// again.
    pub fn reset_within_scope(&self, rt: &Runtime, scope: IpScope, v4: bool, now: i64) {
        let matching: Vec<Arc<Path>> = {
            let inner = self.inner.read();
            inner.paths[..inner.alive_path_count]
                .iter()
                .filter(|p| {
                    p.remote().is_ipv4() == v4 && ip_scope(&p.remote().ip()) == scope
                })
                .cloned()
                .collect()
        };
        for path in matching {
            self.probe(rt, path.local_socket(), path.remote(), now);
            path.deactivate();
        }
    }

    /// Install a freshly agreed session key, demoting the current one
    pub fn install_ephemeral(&self, key: EphemeralKey) {
        let mut inner = self.inner.write();
        inner.ephemeral.swap(0, 1);
        inner.ephemeral[0] = Some(Arc::new(key));
    }

    /// Session keys valid for decryption at `now`, newest first
    ///
    /// A packet keyed under the previous key still decrypts until that
    /// slot's own TTLs elapse.
    pub fn ephemeral_keys(&self, now: i64) -> Vec<Arc<EphemeralKey>> {
        let inner = self.inner.read();
        inner
            .ephemeral
            .iter()
            .flatten()
            .filter(|k| !k.expired(now))
            .cloned()
            .collect()
    }

    /// True once the current session key should be renegotiated
    pub fn ephemeral_expiring(&self, now: i64) -> bool {
        let inner = self.inner.read();
        match inner.ephemeral[0].as_ref() {
            Some(k) => k.expiring_soon(now),
            None => true,
        }
    }

    fn prioritize_paths_locked(&self, rt: &Runtime, inner: &mut PeerInner, now: i64) {
        self.last_prioritized_paths.store(now, Ordering::Relaxed);
        let timeout = rt.config.path_alive_timeout;
        inner.paths.sort_by(|a, b| {
            let aa = a.alive(now, timeout);
            let ba = b.alive(now, timeout);
            ba.cmp(&aa)
                .then_with(|| {
                    let al = if a.latency() < 0 { i64::MAX } else { a.latency() };
                    let bl = if b.latency() < 0 { i64::MAX } else { b.latency() };
                    al.cmp(&bl)
                })
                .then_with(|| b.last_receive().cmp(&a.last_receive()))
        });
        let alive = inner
            .paths
            .iter()
            .take_while(|p| p.alive(now, timeout))
            .count();
        // Dead paths are dropped entirely; they are re-learned on receive.
        inner.paths.truncate(alive);
        inner.alive_path_count = alive;
    }

    /// Serialize this peer for the external state store
    ///
    /// `[1 version][key envelope][identity][locator][bootstrap][versions]`;
    /// the permanent key is encrypted at rest under the node's cache key.
    pub fn marshal(&self, rt: &Runtime) -> Vec<u8> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(256);
        out.push(PEER_MARSHAL_VERSION);

        // Key envelope: timestamp, checksum, then the key encrypted with
        // the at-rest cache key using the first twelve bytes as IV.
        let ts = self.last_receive();
        let checksum = fnv1a32(self.identity_key.as_bytes());
        let mut envelope = Vec::with_capacity(KEY_ENVELOPE_SIZE);
        envelope.extend_from_slice(&ts.to_be_bytes());
        envelope.extend_from_slice(&checksum.to_be_bytes());
        let mut key_bytes = self.identity_key.as_bytes().to_vec();
        let iv = envelope.clone();
        if symmetric::crypt_hello_metadata(&rt.cache_key, &iv, &mut key_bytes).is_err() {
            key_bytes = vec![0u8; 48];
        }
        envelope.extend_from_slice(&key_bytes);
        out.extend_from_slice(&envelope);

        out.extend_from_slice(&self.identity.marshal(false));
        inner.locator.marshal(&mut out);

        out.push(inner.bootstrap.len() as u8);
        for ep in inner.bootstrap.values() {
            ep.marshal(&mut out);
        }

        let (proto, major, minor, rev) = inner.version;
        out.extend_from_slice(&proto.to_be_bytes());
        out.extend_from_slice(&major.to_be_bytes());
        out.extend_from_slice(&minor.to_be_bytes());
        out.extend_from_slice(&rev.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }

    /// Restore a peer from a state-store record
    ///
    /// If the key envelope fails its checksum (for instance because the
    /// local identity changed), the permanent key is re-derived by fresh
    /// agreement instead of failing.
    pub fn unmarshal(rt: &Runtime, data: &[u8]) -> NodeResult<Arc<Peer>> {
        if data.len() < 1 + KEY_ENVELOPE_SIZE || data[0] != PEER_MARSHAL_VERSION {
            return Err(NodeError::CorruptStateObject("peer version"));
        }
        let mut p = 1;
        let envelope = &data[p..p + KEY_ENVELOPE_SIZE];
        p += KEY_ENVELOPE_SIZE;

        let checksum = u32::from_be_bytes(envelope[8..12].try_into().expect("4-byte slice"));
        let mut key_bytes = envelope[12..].to_vec();
        let iv = envelope[..12].to_vec();
        let key = if symmetric::crypt_hello_metadata(&rt.cache_key, &iv, &mut key_bytes).is_ok()
            && fnv1a32(&key_bytes) == checksum
        {
            Some(SymmetricSecret::try_from_slice(&key_bytes)?)
        } else {
            None
        };

        let (identity, n) = Identity::unmarshal(&data[p..])?;
        p += n;
        if !identity.locally_validate() {
            return Err(NodeError::InvalidObject("cached peer identity"));
        }

        let (locator, n) = Locator::unmarshal(&data[p..])?;
        p += n;

        if p >= data.len() {
            return Err(NodeError::CorruptStateObject("peer bootstrap"));
        }
        let bootstrap_count = data[p] as usize;
        p += 1;
        if bootstrap_count > 16 {
            return Err(NodeError::CorruptStateObject("peer bootstrap count"));
        }
        let mut bootstrap = BTreeMap::new();
        for _ in 0..bootstrap_count {
            let (ep, n) = Endpoint::unmarshal(&data[p..])?;
            p += n;
            bootstrap.insert(ep.endpoint_type(), ep);
        }

        if data.len() < p + 10 {
            return Err(NodeError::CorruptStateObject("peer version fields"));
        }
        let rd = |i: usize| u16::from_be_bytes([data[p + i], data[p + i + 1]]);
        let version = (rd(0), rd(2), rd(4), rd(6));

        let peer = match key {
            Some(key) => Self::with_key(rt, identity, key),
            None => Self::new(rt, identity)?,
        };
        {
            let mut inner = peer.inner.write();
            if !locator.is_nil() && locator.verify(&peer.identity) {
                inner.locator = locator;
            }
            inner.bootstrap = bootstrap;
            inner.version = version;
        }
        Ok(peer)
    }

    /// Persist this peer to the external state store
    pub fn save(&self, rt: &Runtime, now: i64) {
        let mut record = Vec::with_capacity(8 + 256);
        record.extend_from_slice(&now.to_be_bytes());
        record.extend_from_slice(&self.marshal(rt));
        rt.host.state_put(
            crate::host::StateObjectKind::Peer,
            &self.address.to_string(),
            &record,
        );
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("last_receive", &self.last_receive())
            .finish()
    }
}

fn rate_gate(last: &AtomicI64, now: i64, interval: i64) -> bool {
    let prev = last.load(Ordering::Relaxed);
    if (now - prev) >= interval
        && last
            .compare_exchange(prev, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        return true;
    }
    false
}

fn pick_random_bootstrap(bootstrap: &BTreeMap<EndpointType, Endpoint>) -> Option<Endpoint> {
    let inet: Vec<&Endpoint> = bootstrap.values().filter(|e| e.is_inet()).collect();
    if inet.is_empty() {
        return None;
    }
    let idx = (rand::rngs::OsRng.next_u32() as usize) % inet.len();
    Some(*inet[idx])
}

/// One port from the deterministic brute-force NAT traversal schedule
fn bfg_port(seed: u64, index: u32) -> u16 {
    let mut x = seed ^ ((index as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let port = (x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 48) as u16;
    if port == 0 {
        1
    } else {
        port
    }
}

/// Start a packet: 27-byte header (MAC zeroed, hops zero) plus the verb byte
pub(crate) fn begin_packet(
    packet_id: u64,
    destination: Address,
    source: Address,
    cipher: CipherSuite,
    verb: Verb,
) -> Vec<u8> {
    let header = PacketHeader {
        packet_id,
        destination,
        source,
        flags: PacketHeader::make_flags(cipher, 0, false),
        mac: 0,
    };
    let mut packet = vec![0u8; HEADER_SIZE];
    header
        .write_to(&mut packet)
        .expect("buffer sized for header");
    packet.push(verb as u8);
    debug_assert!(packet.len() <= MAX_PACKET_LENGTH);
    packet
}

fn fnv1a32(data: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::{HostInterface, StateObjectKind};
    use crate::runtime::Runtime;
    use hypermesh_crypto::identity::IdentityKind;
    use parking_lot::Mutex;

    struct RecordingHost {
        sends: Mutex<Vec<(i64, SocketAddr, Vec<u8>)>>,
    }

    impl RecordingHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sends: Mutex::new(Vec::new()),
            })
        }
        fn sent(&self) -> Vec<(i64, SocketAddr, Vec<u8>)> {
            self.sends.lock().clone()
        }
    }

    impl HostInterface for RecordingHost {
        fn wire_send(&self, ls: i64, remote: SocketAddr, data: &[u8], _ttl: u8) -> bool {
            self.sends.lock().push((ls, remote, data.to_vec()));
            true
        }
        fn state_put(&self, _k: StateObjectKind, _id: &str, _d: &[u8]) {}
        fn state_get(&self, _k: StateObjectKind, _id: &str) -> Option<Vec<u8>> {
            None
        }
        fn event(&self, _e: crate::events::Event) {}
    }

    fn runtime(host: Arc<RecordingHost>) -> Runtime {
        Runtime::new(
            Config::default(),
            Identity::generate(IdentityKind::Curve25519),
            host,
            SymmetricSecret::from_bytes([9u8; 48]),
            0x1234_5678_9abc_def0,
            1_000,
        )
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_init_derives_matching_keys() {
        let host = RecordingHost::new();
        let rt = runtime(host.clone());
        let remote_identity = Identity::generate(IdentityKind::Curve25519);
        let peer = Peer::new(&rt, remote_identity.clone()).unwrap();
        assert_eq!(peer.address(), remote_identity.address());

        // Both sides derive the same permanent key.
        let other_side = remote_identity.agree(&rt.identity).unwrap();
        assert_eq!(peer.identity_key().as_bytes(), other_side.as_bytes());
    }

    #[test]
    fn test_rate_gates() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        assert!(peer.rate_gate_whois(&rt, 10_000));
        assert!(!peer.rate_gate_whois(&rt, 10_500));
        assert!(peer.rate_gate_whois(&rt, 11_000));

        // Gates are independent of each other.
        assert!(peer.rate_gate_echo(&rt, 10_500));
        assert!(peer.rate_gate_probe(&rt, 10_500));
    }

    #[test]
    fn test_path_learning_requires_expected_ok() {
        let host = RecordingHost::new();
        let rt = runtime(host.clone());
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        let path = Arc::new(Path::new(1, addr("198.51.100.1:793")));
        path.received(1_000, 64);

        // A non-OK verb from an unknown origin triggers a HELLO, not adoption.
        peer.received(&rt, &path, 0, 7, 10, Verb::Frame, Verb::Nop, 1_000);
        assert!(peer.path(&rt, 1_001).is_none());
        assert!(!host.sent().is_empty());

        // An expected OK adopts the path.
        peer.received(&rt, &path, 0, 8, 10, Verb::Ok, Verb::Hello, 1_002);
        let best = peer.path(&rt, 1_003).unwrap();
        assert_eq!(best.remote(), addr("198.51.100.1:793"));
        // The origin is remembered for future bootstrap attempts.
        assert!(!peer.bootstrap().is_empty());
    }

    #[test]
    fn test_relayed_packets_do_not_learn_paths() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();
        let path = Arc::new(Path::new(1, addr("198.51.100.1:793")));
        path.received(1_000, 64);

        peer.received(&rt, &path, 2, 7, 10, Verb::Ok, Verb::Hello, 1_000);
        assert!(peer.path(&rt, 1_001).is_none());
    }

    #[test]
    fn test_nat_rebind_replaces_same_ip_path() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        let p1 = Arc::new(Path::new(1, addr("198.51.100.1:1000")));
        p1.received(1_000, 64);
        peer.received(&rt, &p1, 0, 1, 10, Verb::Ok, Verb::Hello, 1_000);

        let p2 = Arc::new(Path::new(1, addr("198.51.100.1:2000")));
        p2.received(1_100, 64);
        peer.received(&rt, &p2, 0, 2, 10, Verb::Ok, Verb::Hello, 1_100);

        let paths = peer.all_paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].remote(), addr("198.51.100.1:2000"));
    }

    #[test]
    fn test_path_sort_prefers_low_latency() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        let slow = Arc::new(Path::new(1, addr("198.51.100.1:1000")));
        slow.received(1_000, 64);
        slow.update_latency(200);
        let fast = Arc::new(Path::new(2, addr("198.51.100.2:1000")));
        fast.received(1_000, 64);
        fast.update_latency(15);

        peer.received(&rt, &slow, 0, 1, 10, Verb::Ok, Verb::Hello, 1_000);
        peer.received(&rt, &fast, 0, 2, 10, Verb::Ok, Verb::Hello, 1_001);

        let best = peer.path(&rt, 20_000).unwrap();
        assert_eq!(best.remote(), addr("198.51.100.2:1000"));
    }

    #[test]
    fn test_dead_paths_dropped_on_prioritize() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        let path = Arc::new(Path::new(1, addr("198.51.100.1:1000")));
        path.received(1_000, 64);
        peer.received(&rt, &path, 0, 1, 10, Verb::Ok, Verb::Hello, 1_000);
        assert!(peer.directly_connected(&rt, 1_001));

        // Far beyond the alive window, the path is gone.
        assert!(peer.path(&rt, 1_000_000).is_none());
        assert!(!peer.directly_connected(&rt, 1_000_001));
    }

    #[test]
    fn test_try_direct_path_dedup_and_cap() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        let ep = Endpoint::from(addr("203.0.113.5:9000"));
        peer.try_direct_path(&rt, 1_000, ep, false);
        peer.try_direct_path(&rt, 2_000, ep, true);
        assert_eq!(peer.try_queue_len(), 1);

        for i in 0..100u16 {
            peer.try_direct_path(
                &rt,
                1_000,
                Endpoint::from(addr(&format!("203.0.113.6:{}", 1000 + i))),
                false,
            );
        }
        assert!(peer.try_queue_len() <= rt.config.try_queue_cap);
    }

    #[test]
    fn test_bfg_schedule_is_deterministic() {
        let a: Vec<u16> = (0..64).map(|i| bfg_port(42, i)).collect();
        let b: Vec<u16> = (0..64).map(|i| bfg_port(42, i)).collect();
        assert_eq!(a, b);
        let c: Vec<u16> = (0..64).map(|i| bfg_port(43, i)).collect();
        assert_ne!(a, c);
        assert!(a.iter().all(|p| *p != 0));
    }

    #[test]
    fn test_pulse_bfg_fans_out_ports() {
        let host = RecordingHost::new();
        let rt = runtime(host.clone());
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        peer.try_direct_path(&rt, 1_000, Endpoint::from(addr("203.0.113.5:9000")), true);
        peer.pulse(&rt, None, 1_000, false);

        let sends = host.sent();
        assert_eq!(sends.len(), rt.config.bfg_ports_per_pulse);
        let mut ports: Vec<u16> = sends.iter().map(|(_, sa, _)| sa.port()).collect();
        ports.dedup();
        assert!(ports.len() > 1);
    }

    #[test]
    fn test_pulse_sends_hello_via_alive_path() {
        let host = RecordingHost::new();
        let rt = runtime(host.clone());
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        let path = Arc::new(Path::new(1, addr("198.51.100.1:793")));
        path.received(1_000, 64);
        peer.received(&rt, &path, 0, 1, 10, Verb::Ok, Verb::Hello, 1_000);
        host.sends.lock().clear();

        // Keep the path alive past the HELLO interval, then pulse.
        path.received(190_000, 64);
        peer.pulse(&rt, None, 200_000, false);
        let sends = host.sent();
        assert_eq!(sends.len(), 1);
        // A HELLO is a full packet, not a keepalive byte.
        assert!(sends[0].2.len() > 64);
    }

    #[test]
    fn test_probe_prefers_token() {
        let host = RecordingHost::new();
        let rt = runtime(host.clone());
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        // Without a known remote token, probe is an armored NOP.
        assert_eq!(peer.probe(&rt, 1, addr("203.0.113.5:9000"), 1_000), 28);

        peer.set_probe_token_remote(0xdead_beef);
        assert_eq!(peer.probe(&rt, 1, addr("203.0.113.5:9000"), 1_000), 4);
        let sends = host.sent();
        assert_eq!(sends.last().unwrap().2, 0xdead_beefu32.to_be_bytes());
    }

    #[test]
    fn test_reset_within_scope_deactivates() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();

        let global = Arc::new(Path::new(1, addr("203.0.113.1:793")));
        global.received(1_000, 64);
        peer.received(&rt, &global, 0, 1, 10, Verb::Ok, Verb::Hello, 1_000);

        peer.reset_within_scope(&rt, IpScope::Global, true, 1_100);
        assert!(peer.path(&rt, 20_000).is_none());
    }

    #[test]
    fn test_ephemeral_rotation_keeps_previous_until_expiry() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();
        assert!(peer.ephemeral_expiring(1_000));

        let k1 = EphemeralKey::new(1_000, SymmetricSecret::from_bytes([1; 48]), 60_000, 1 << 20);
        peer.install_ephemeral(k1);
        assert_eq!(peer.ephemeral_keys(1_500).len(), 1);

        let k2 = EphemeralKey::new(30_000, SymmetricSecret::from_bytes([2; 48]), 60_000, 1 << 20);
        peer.install_ephemeral(k2);
        // Both decrypt while the previous key is inside its TTL.
        assert_eq!(peer.ephemeral_keys(40_000).len(), 2);
        // Previous slot TTL (created 1_000 + 60_000) lapses; only current remains.
        assert_eq!(peer.ephemeral_keys(61_001).len(), 1);
    }

    #[test]
    fn test_marshal_roundtrip() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let remote = Identity::generate(IdentityKind::Curve25519);
        let peer = Peer::new(&rt, remote.clone()).unwrap();
        peer.set_remote_version(11, 2, 0, 4);
        peer.set_bootstrap(Endpoint::from(addr("203.0.113.5:9000")));
        let locator = Locator::create(&remote, 5_000, &[Endpoint::from(addr("203.0.113.5:9000"))])
            .unwrap();
        peer.set_locator(locator.clone());

        let data = peer.marshal(&rt);
        let back = Peer::unmarshal(&rt, &data).unwrap();
        assert_eq!(back.address(), peer.address());
        assert_eq!(back.identity(), peer.identity());
        assert_eq!(back.identity_key().as_bytes(), peer.identity_key().as_bytes());
        assert_eq!(back.remote_version(), (11, 2, 0, 4));
        assert_eq!(back.bootstrap(), peer.bootstrap());
        assert_eq!(back.locator(), locator);
    }

    #[test]
    fn test_unmarshal_with_wrong_cache_key_re_agrees() {
        let host = RecordingHost::new();
        let rt = runtime(host.clone());
        let remote = Identity::generate(IdentityKind::Curve25519);
        let peer = Peer::new(&rt, remote).unwrap();
        let data = peer.marshal(&rt);

        // A different node (different cache key, same identity) can still
        // load the record; the key envelope fails and agreement re-runs.
        let rt2 = Runtime::new(
            Config::default(),
            rt.identity.clone(),
            host,
            SymmetricSecret::from_bytes([77u8; 48]),
            1,
            1_000,
        );
        let back = Peer::unmarshal(&rt2, &data).unwrap();
        assert_eq!(back.identity_key().as_bytes(), peer.identity_key().as_bytes());
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let host = RecordingHost::new();
        let rt = runtime(host);
        let peer = Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap();
        let mut data = peer.marshal(&rt);
        data[0] = 9;
        assert!(Peer::unmarshal(&rt, &data).is_err());
        assert!(Peer::unmarshal(&rt, &[0u8; 4]).is_err());
    }
}
