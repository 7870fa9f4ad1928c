//! Topology database
//!
//! The concurrent maps from node address to peer and from (socket, remote
//! address) to path, plus the administrator-designated root set. Both maps
//! canonicalize: concurrent lookups for the same key always converge on one
//! shared object. Admission is an optimistic read-lock lookup followed by a
//! re-checked insert under the write lock.
//!
//! Lock order is topology, then peer, then the dispatcher's whois queue;
//! callbacks passed to `each_peer` must not re-enter the topology.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hypermesh_crypto::identity::{Address, Identity};
use hypermesh_wire::fingerprint::Fingerprint;
use hypermesh_wire::locator::Locator;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{NodeError, NodeResult};
use crate::host::StateObjectKind;
use crate::path::{path_key, Path};
use crate::peer::Peer;
use crate::runtime::Runtime;

/// One trusted physical path declaration
///
/// Packets arriving from inside `network/prefix` with this ID in their MAC
/// field are accepted without encryption or authentication.
#[derive(Debug, Clone)]
pub struct TrustedPathSpec {
    pub id: u64,
    pub network: IpAddr,
    pub prefix: u8,
}

impl TrustedPathSpec {
    fn matches(&self, ip: &IpAddr) -> bool {
        fn prefix_eq(a: &[u8], b: &[u8], bits: u8) -> bool {
            let full = (bits / 8) as usize;
            if a[..full] != b[..full] {
                return false;
            }
            let rem = bits % 8;
            if rem == 0 {
                return true;
            }
            let mask = 0xffu8 << (8 - rem);
            (a[full] & mask) == (b[full] & mask)
        }
        match (self.network, ip) {
            (IpAddr::V4(n), IpAddr::V4(i)) => prefix_eq(&n.octets(), &i.octets(), self.prefix.min(32)),
            (IpAddr::V6(n), IpAddr::V6(i)) => prefix_eq(&n.octets(), &i.octets(), self.prefix.min(128)),
            _ => false,
        }
    }
}

struct PeersInner {
    peers: HashMap<Address, Arc<Peer>>,
    roots: HashMap<Identity, Locator>,
    /// Materialized resolution of `roots`, sorted ascending by latency
    root_peers: Vec<Arc<Peer>>,
}

struct PathsInner {
    paths: HashMap<u64, Arc<Path>>,
    trusted: Vec<TrustedPathSpec>,
}

/// Database of peers, paths and roots
pub struct Topology {
    rt: Arc<Runtime>,
    peers: RwLock<PeersInner>,
    paths: RwLock<PathsInner>,
    /// Local probe token to peer address, for the 4-byte probe fast path
    probes: Mutex<HashMap<u32, Address>>,
}

impl Topology {
    /// Create a topology, loading the persisted root list
    pub fn new(rt: Arc<Runtime>) -> Self {
        let topo = Self {
            rt: Arc::clone(&rt),
            peers: RwLock::new(PeersInner {
                peers: HashMap::new(),
                roots: HashMap::new(),
                root_peers: Vec::new(),
            }),
            paths: RwLock::new(PathsInner {
                paths: HashMap::new(),
                trusted: Vec::new(),
            }),
            probes: Mutex::new(HashMap::new()),
        };

        if let Some(data) = rt.host.state_get(StateObjectKind::Roots, "roots") {
            let mut inner = topo.peers.write();
            let mut p = 0usize;
            while p < data.len() {
                let Ok((id, n)) = Identity::unmarshal(&data[p..]) else {
                    warn!("discarding malformed tail of persisted root list");
                    break;
                };
                p += n;
                let Ok((loc, n)) = Locator::unmarshal(&data[p..]) else {
                    break;
                };
                p += n;
                if id.locally_validate() && id != rt.identity {
                    debug!(root = %id.address(), "loaded persisted root");
                    inner.roots.insert(id, loc);
                }
            }
            topo.update_root_peers_locked(&mut inner);
        }
        topo
    }

    /// Add a peer, or return the existing peer for that address
    ///
    /// This find-or-insert is the only way peers enter the set, and it is
    /// atomic: callers must discard their argument in favor of the return
    /// value.
    pub fn add(&self, peer: Arc<Peer>) -> Arc<Peer> {
        let mut inner = self.peers.write();
        if let Some(existing) = inner.peers.get(&peer.address()) {
            return Arc::clone(existing);
        }
        if let Some(cached) = self.load_cached(peer.address()) {
            inner.peers.insert(cached.address(), Arc::clone(&cached));
            self.register_probe(&cached);
            return cached;
        }
        inner.peers.insert(peer.address(), Arc::clone(&peer));
        self.register_probe(&peer);
        peer
    }

    /// Look up a peer by address
    ///
    /// On a miss with `load_from_cached`, the external state store is
    /// consulted and the result inserted with double-checked locking, so two
    /// racing callers still observe a single peer object.
    pub fn peer(&self, address: Address, load_from_cached: bool) -> Option<Arc<Peer>> {
        {
            let inner = self.peers.read();
            if let Some(p) = inner.peers.get(&address) {
                return Some(Arc::clone(p));
            }
        }
        if !load_from_cached {
            return None;
        }
        let loaded = self.load_cached(address)?;
        let mut inner = self.peers.write();
        if let Some(p) = inner.peers.get(&address) {
            return Some(Arc::clone(p));
        }
        inner.peers.insert(address, Arc::clone(&loaded));
        self.register_probe(&loaded);
        Some(loaded)
    }

    /// Look up a peer by the local probe token it was assigned
    pub fn peer_by_probe(&self, token: u32) -> Option<Arc<Peer>> {
        let address = *self.probes.lock().get(&token)?;
        self.peer(address, false)
    }

    /// Get the canonical path for a (local socket, remote address) pair
    pub fn path(&self, local_socket: i64, remote: SocketAddr) -> Arc<Path> {
        let key = path_key(local_socket, &remote);
        {
            let inner = self.paths.read();
            if let Some(p) = inner.paths.get(&key) {
                return Arc::clone(p);
            }
        }
        let mut inner = self.paths.write();
        Arc::clone(
            inner
                .paths
                .entry(key)
                .or_insert_with(|| Arc::new(Path::new(local_socket, remote))),
        )
    }

    /// The current best root, if any
    pub fn root(&self) -> Option<Arc<Peer>> {
        self.peers.read().root_peers.first().cloned()
    }

    /// The best root together with a live path to it
    pub fn best_root_path(&self, now: i64) -> Option<(Arc<Peer>, Arc<Path>)> {
        let roots: Vec<Arc<Peer>> = self.peers.read().root_peers.clone();
        for root in roots {
            if let Some(path) = root.path(&self.rt, now) {
                return Some((root, path));
            }
        }
        None
    }

    /// True if this identity is a designated root
    pub fn is_root(&self, identity: &Identity) -> bool {
        self.peers.read().roots.contains_key(identity)
    }

    /// Designate a root and (re)build the root peer list
    ///
    /// The identity is validated and the locator's signature checked before
    /// anything is admitted. Re-adding an existing root is a no-op.
    pub fn add_root(&self, identity: Identity, locator: Locator) -> NodeResult<()> {
        if identity == self.rt.identity {
            return Err(NodeError::InvalidObject("cannot designate self as root"));
        }
        if !identity.locally_validate() {
            return Err(NodeError::InvalidObject("root identity"));
        }
        if !locator.is_nil() && !locator.verify(&identity) {
            return Err(NodeError::InvalidObject("root locator signature"));
        }
        let mut inner = self.peers.write();
        inner.roots.insert(identity, locator);
        self.update_root_peers_locked(&mut inner);
        self.write_root_list_locked(&inner);
        Ok(())
    }

    /// Remove a root designation; the peer itself is retained
    pub fn remove_root(&self, fingerprint: &Fingerprint) -> bool {
        let mut inner = self.peers.write();
        let target = inner
            .roots
            .keys()
            .find(|id| fingerprint.matches(id))
            .cloned();
        match target {
            Some(id) => {
                inner.roots.remove(&id);
                self.update_root_peers_locked(&mut inner);
                self.write_root_list_locked(&inner);
                true
            }
            None => false,
        }
    }

    /// Re-sort roots ascending by measured latency
    pub fn rank_roots(&self) {
        let mut inner = self.peers.write();
        sort_roots(&mut inner.root_peers);
    }

    /// Apply `f` to every peer
    ///
    /// The peer map is read-locked for the duration; `f` must not call back
    /// into the topology.
    pub fn each_peer<F: FnMut(&Arc<Peer>)>(&self, mut f: F) {
        let inner = self.peers.read();
        for peer in inner.peers.values() {
            f(peer);
        }
    }

    /// Apply `f` to every peer along with whether it is a root
    pub fn each_peer_with_root<F: FnMut(&Arc<Peer>, bool)>(&self, mut f: F) {
        let inner = self.peers.read();
        for peer in inner.peers.values() {
            let is_root = inner.roots.contains_key(peer.identity());
            f(peer, is_root);
        }
    }

    /// Number of peers currently in memory
    pub fn peer_count(&self) -> usize {
        self.peers.read().peers.len()
    }

    /// Number of live canonical paths
    pub fn path_count(&self) -> usize {
        self.paths.read().paths.len()
    }

    /// Declare the set of trusted physical paths
    pub fn set_trusted_paths(&self, specs: Vec<TrustedPathSpec>) {
        self.paths.write().trusted = specs;
    }

    /// Check an unencrypted packet's claimed trusted-path ID against config
    pub fn should_inbound_path_be_trusted(&self, remote: &SocketAddr, claimed_id: u64) -> bool {
        if claimed_id == 0 {
            return false;
        }
        let inner = self.paths.read();
        inner
            .trusted
            .iter()
            .any(|t| t.id == claimed_id && t.matches(&remote.ip()))
    }

    /// Periodic maintenance: pulse peers, evict the dead, collect paths
    pub fn do_periodic_tasks(&self, now: i64) {
        // Pulse outside the lock; pulses send packets and take peer locks.
        let root = self.best_root_path(now);
        let mut pulse_list: Vec<(Arc<Peer>, bool)> = Vec::new();
        self.each_peer_with_root(|p, is_root| pulse_list.push((Arc::clone(p), is_root)));
        for (peer, is_root) in pulse_list {
            peer.pulse(&self.rt, root.clone(), now, is_root);
        }

        // Evict peers quiet beyond retention, saving them first. Roots stay.
        let timeout = self.rt.config.peer_eviction_timeout;
        let mut evicted: Vec<Arc<Peer>> = Vec::new();
        {
            let mut inner = self.peers.write();
            let roots = std::mem::take(&mut inner.roots);
            inner.peers.retain(|_, peer| {
                let keep = (now - peer.last_receive()) <= timeout
                    || roots.contains_key(peer.identity());
                if !keep {
                    evicted.push(Arc::clone(peer));
                }
                keep
            });
            inner.roots = roots;
        }
        if !evicted.is_empty() {
            let mut probes = self.probes.lock();
            for peer in &evicted {
                probes.remove(&peer.probe_token_local());
            }
        }
        for peer in &evicted {
            peer.save(&self.rt, now);
        }

        // Paths are held by strong references; drop map entries nobody else
        // holds.
        self.paths
            .write()
            .paths
            .retain(|_, path| Arc::strong_count(path) > 1);
    }

    /// Persist every in-memory peer to the state store
    pub fn save_all(&self, now: i64) {
        let mut all: Vec<Arc<Peer>> = Vec::new();
        self.each_peer(|p| all.push(Arc::clone(p)));
        for peer in all {
            peer.save(&self.rt, now);
        }
    }

    fn load_cached(&self, address: Address) -> Option<Arc<Peer>> {
        let data = self
            .rt
            .host
            .state_get(StateObjectKind::Peer, &address.to_string())?;
        if data.len() <= 8 {
            return None;
        }
        let ts = i64::from_be_bytes(data[..8].try_into().expect("8-byte slice"));
        if (self.rt.now() - ts) >= self.rt.config.peer_cache_ttl {
            return None;
        }
        match Peer::unmarshal(&self.rt, &data[8..]) {
            Ok(peer) if peer.address() == address => Some(peer),
            _ => None,
        }
    }

    fn register_probe(&self, peer: &Arc<Peer>) {
        self.probes
            .lock()
            .insert(peer.probe_token_local(), peer.address());
    }

    fn update_root_peers_locked(&self, inner: &mut PeersInner) {
        let mut root_peers = Vec::with_capacity(inner.roots.len());
        let root_ids: Vec<Identity> = inner.roots.keys().cloned().collect();
        for id in root_ids {
            let existing = inner
                .peers
                .get(&id.address())
                .filter(|p| *p.identity() == id)
                .cloned();
            match existing {
                Some(p) => root_peers.push(p),
                None => match Peer::new(&self.rt, id.clone()) {
                    Ok(p) => {
                        inner.peers.insert(id.address(), Arc::clone(&p));
                        self.register_probe(&p);
                        root_peers.push(p);
                    }
                    Err(e) => warn!(root = %id.address(), error = %e, "cannot key root peer"),
                },
            }
        }
        sort_roots(&mut root_peers);
        inner.root_peers = root_peers;
    }

    fn write_root_list_locked(&self, inner: &PeersInner) {
        let mut out = Vec::new();
        for (id, loc) in &inner.roots {
            out.extend_from_slice(&id.marshal(false));
            loc.marshal(&mut out);
        }
        self.rt
            .host
            .state_put(StateObjectKind::Roots, "roots", &out);
    }
}

fn sort_roots(roots: &mut [Arc<Peer>]) {
    // Ascending by latency, unknown (-1) last.
    roots.sort_by_key(|p| {
        let l = p.latency();
        if l < 0 {
            i64::MAX
        } else {
            l
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::HostInterface;
    use hypermesh_crypto::identity::IdentityKind;
    use hypermesh_crypto::keys::SymmetricSecret;
    use hypermesh_wire::endpoint::Endpoint;
    use hypermesh_wire::protocol::Verb;
    use std::collections::HashMap as StdHashMap;

    struct MemHost {
        store: Mutex<StdHashMap<(StateObjectKind, String), Vec<u8>>>,
    }

    impl MemHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                store: Mutex::new(StdHashMap::new()),
            })
        }
    }

    impl HostInterface for MemHost {
        fn wire_send(&self, _ls: i64, _remote: SocketAddr, _data: &[u8], _ttl: u8) -> bool {
            true
        }
        fn state_put(&self, kind: StateObjectKind, id: &str, data: &[u8]) {
            self.store.lock().insert((kind, id.to_string()), data.to_vec());
        }
        fn state_get(&self, kind: StateObjectKind, id: &str) -> Option<Vec<u8>> {
            self.store.lock().get(&(kind, id.to_string())).cloned()
        }
        fn event(&self, _e: crate::events::Event) {}
    }

    fn runtime(host: Arc<MemHost>) -> Arc<Runtime> {
        Arc::new(Runtime::new(
            Config::default(),
            Identity::generate(IdentityKind::Curve25519),
            host,
            SymmetricSecret::from_bytes([3u8; 48]),
            7,
            1_000,
        ))
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_is_find_or_insert() {
        let rt = runtime(MemHost::new());
        let topo = Topology::new(Arc::clone(&rt));
        let id = Identity::generate(IdentityKind::Curve25519);

        let a = topo.add(Peer::new(&rt, id.clone()).unwrap());
        let b = topo.add(Peer::new(&rt, id.clone()).unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(topo.peer_count(), 1);
    }

    #[test]
    fn test_concurrent_peer_admission_converges() {
        let rt = runtime(MemHost::new());
        let topo = Arc::new(Topology::new(Arc::clone(&rt)));
        let id = Identity::generate(IdentityKind::Curve25519);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let topo = Arc::clone(&topo);
            let rt = Arc::clone(&rt);
            let id = id.clone();
            handles.push(std::thread::spawn(move || {
                topo.add(Peer::new(&rt, id).unwrap())
            }));
        }
        let peers: Vec<Arc<Peer>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for p in &peers[1..] {
            assert!(Arc::ptr_eq(&peers[0], p));
        }
        assert_eq!(topo.peer_count(), 1);
    }

    #[test]
    fn test_path_canonicalization() {
        let rt = runtime(MemHost::new());
        let topo = Arc::new(Topology::new(rt));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let topo = Arc::clone(&topo);
            handles.push(std::thread::spawn(move || {
                topo.path(1, addr("198.51.100.1:793"))
            }));
        }
        let paths: Vec<Arc<Path>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for p in &paths[1..] {
            assert!(Arc::ptr_eq(&paths[0], p));
        }

        // Distinct keys get distinct paths.
        let other = topo.path(2, addr("198.51.100.1:793"));
        assert!(!Arc::ptr_eq(&paths[0], &other));
    }

    #[test]
    fn test_add_root_validates_and_persists() {
        let host = MemHost::new();
        let rt = runtime(host.clone());
        let topo = Topology::new(Arc::clone(&rt));

        let root_id = Identity::generate(IdentityKind::Curve25519);
        let loc = Locator::create(
            &root_id,
            5_000,
            &[Endpoint::from(addr("203.0.113.1:793"))],
        )
        .unwrap();

        topo.add_root(root_id.public_only(), loc.clone()).unwrap();
        assert!(topo.is_root(&root_id));
        assert!(topo.root().is_some());

        // Adding the same root twice is a no-op.
        topo.add_root(root_id.public_only(), loc.clone()).unwrap();
        assert_eq!(topo.peer_count(), 1);

        // A locator signed by someone else is rejected.
        let other = Identity::generate(IdentityKind::Curve25519);
        let bad_loc = Locator::create(
            &other,
            5_000,
            &[Endpoint::from(addr("203.0.113.2:793"))],
        )
        .unwrap();
        assert!(topo
            .add_root(Identity::generate(IdentityKind::Curve25519), bad_loc)
            .is_err());

        // Designating ourselves is rejected.
        assert!(topo.add_root(rt.identity.clone(), Locator::nil()).is_err());

        // A fresh topology over the same store reloads the root.
        let topo2 = Topology::new(Arc::clone(&rt));
        assert!(topo2.is_root(&root_id));
    }

    #[test]
    fn test_remove_root_keeps_peer() {
        let rt = runtime(MemHost::new());
        let topo = Topology::new(Arc::clone(&rt));
        let root_id = Identity::generate(IdentityKind::Curve25519);
        topo.add_root(root_id.public_only(), Locator::nil()).unwrap();
        assert!(topo.is_root(&root_id));

        let fp = Fingerprint::from_identity(&root_id);
        assert!(topo.remove_root(&fp));
        assert!(!topo.is_root(&root_id));
        assert!(!topo.remove_root(&fp));
        // Root designations are not ownerships.
        assert!(topo.peer(root_id.address(), false).is_some());
    }

    #[test]
    fn test_root_ranking() {
        let rt = runtime(MemHost::new());
        let topo = Topology::new(Arc::clone(&rt));

        let id_a = Identity::generate(IdentityKind::Curve25519);
        let id_b = Identity::generate(IdentityKind::Curve25519);
        topo.add_root(id_a.public_only(), Locator::nil()).unwrap();
        topo.add_root(id_b.public_only(), Locator::nil()).unwrap();

        let peer_a = topo.peer(id_a.address(), false).unwrap();
        let peer_b = topo.peer(id_b.address(), false).unwrap();
        peer_a.update_latency(50);
        peer_b.update_latency(20);
        topo.rank_roots();
        assert_eq!(topo.root().unwrap().address(), id_b.address());

        // Once the faster root degrades past the other, ranking flips.
        peer_b.update_latency(400);
        peer_b.update_latency(400);
        peer_b.update_latency(400);
        topo.rank_roots();
        assert_eq!(topo.root().unwrap().address(), id_a.address());
    }

    #[test]
    fn test_peer_cache_roundtrip_via_state_store() {
        let host = MemHost::new();
        let rt = runtime(host.clone());
        let topo = Topology::new(Arc::clone(&rt));

        let id = Identity::generate(IdentityKind::Curve25519);
        let peer = topo.add(Peer::new(&rt, id.clone()).unwrap());
        peer.set_remote_version(11, 2, 0, 4);
        peer.save(&rt, 1_000);

        // A second topology instance demand-loads the cached record.
        let topo2 = Topology::new(Arc::clone(&rt));
        assert_eq!(topo2.peer_count(), 0);
        let loaded = topo2.peer(id.address(), true).unwrap();
        assert_eq!(loaded.remote_version(), (11, 2, 0, 4));
        assert_eq!(topo2.peer_count(), 1);

        // Without load_from_cached a miss stays a miss.
        let topo3 = Topology::new(Arc::clone(&rt));
        assert!(topo3.peer(id.address(), false).is_none());
    }

    #[test]
    fn test_eviction_spares_roots_and_live_peers() {
        let rt = runtime(MemHost::new());
        let topo = Topology::new(Arc::clone(&rt));

        let root_id = Identity::generate(IdentityKind::Curve25519);
        topo.add_root(root_id.public_only(), Locator::nil()).unwrap();

        let quiet = topo.add(
            Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap(),
        );
        let active = topo.add(
            Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap(),
        );
        let path = topo.path(1, addr("198.51.100.9:793"));
        path.received(900_000, 64);
        active.received(
            &rt,
            &path,
            0,
            1,
            10,
            Verb::Ok,
            Verb::Hello,
            900_000,
        );

        topo.do_periodic_tasks(900_001);
        assert!(topo.peer(root_id.address(), false).is_some());
        assert!(topo.peer(active.address(), false).is_some());
        assert!(topo.peer(quiet.address(), false).is_none());
    }

    #[test]
    fn test_dead_paths_collected() {
        let rt = runtime(MemHost::new());
        let topo = Topology::new(Arc::clone(&rt));
        {
            let _p = topo.path(1, addr("198.51.100.1:793"));
        }
        assert_eq!(topo.path_count(), 1);
        topo.do_periodic_tasks(2_000);
        assert_eq!(topo.path_count(), 0);

        // A path still referenced survives collection.
        let held = topo.path(1, addr("198.51.100.2:793"));
        topo.do_periodic_tasks(3_000);
        assert_eq!(topo.path_count(), 1);
        drop(held);
    }

    #[test]
    fn test_probe_index() {
        let rt = runtime(MemHost::new());
        let topo = Topology::new(Arc::clone(&rt));
        let peer = topo.add(
            Peer::new(&rt, Identity::generate(IdentityKind::Curve25519)).unwrap(),
        );
        let found = topo.peer_by_probe(peer.probe_token_local()).unwrap();
        assert!(Arc::ptr_eq(&peer, &found));
        assert!(topo.peer_by_probe(peer.probe_token_local().wrapping_add(1)).is_none());
    }

    #[test]
    fn test_trusted_path_matching() {
        let rt = runtime(MemHost::new());
        let topo = Topology::new(rt);
        topo.set_trusted_paths(vec![TrustedPathSpec {
            id: 42,
            network: "10.10.0.0".parse().unwrap(),
            prefix: 16,
        }]);

        assert!(topo.should_inbound_path_be_trusted(&addr("10.10.3.4:793"), 42));
        assert!(!topo.should_inbound_path_be_trusted(&addr("10.11.3.4:793"), 42));
        assert!(!topo.should_inbound_path_be_trusted(&addr("10.10.3.4:793"), 41));
        assert!(!topo.should_inbound_path_be_trusted(&addr("10.10.3.4:793"), 0));
    }
}
