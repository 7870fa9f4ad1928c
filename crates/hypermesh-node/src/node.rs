//! The node aggregate
//!
//! Ties identity, topology and the dispatcher into one instance. All mutable
//! state lives here or below; any number of nodes coexist in one process.
//! The host drives a node with exactly two kinds of calls: datagrams into
//! [`Node::on_remote_packet`] (from as many threads as it likes) and clock
//! ticks into [`Node::process_background_tasks`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use hypermesh_crypto::identity::{Address, Identity, IdentityKind};
use hypermesh_wire::fingerprint::Fingerprint;
use hypermesh_wire::locator::Locator;
use rand::RngCore;
use tracing::info;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{NodeError, NodeResult};
use crate::events::Event;
use crate::host::{HostInterface, StateObjectKind, VirtualLayer2};
use crate::peer::Peer;
use crate::runtime::Runtime;
use crate::topology::Topology;

/// Cadence for persisting all peers
const SAVE_INTERVAL: i64 = 60_000;

/// A point-in-time snapshot of node state
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub address: Address,
    pub online: bool,
    pub peers: usize,
    pub paths: usize,
    pub clock: i64,
}

/// One virtual layer 1 node instance
pub struct Node {
    rt: Arc<Runtime>,
    topology: Arc<Topology>,
    dispatcher: Dispatcher,
    online: AtomicBool,
    last_save: AtomicI64,
}

impl Node {
    /// Construct a node, loading or generating its identity
    ///
    /// The identity is fetched from the state store; if absent (first run),
    /// a new one is generated and persisted before anything else happens.
    pub fn new(
        host: Arc<dyn HostInterface>,
        vl2: Arc<dyn VirtualLayer2>,
        config: Config,
        now: i64,
    ) -> NodeResult<Arc<Node>> {
        config.validate().map_err(NodeError::InvalidConfig)?;

        let identity = match host.state_get(StateObjectKind::IdentitySecret, "identity.secret") {
            Some(data) => {
                let text = std::str::from_utf8(&data)
                    .map_err(|_| NodeError::CorruptStateObject("identity.secret utf8"))?;
                let id = Identity::from_state_string(text)?;
                if !id.has_secret() || !id.locally_validate() {
                    return Err(NodeError::CorruptStateObject("identity.secret"));
                }
                id
            }
            None => {
                let id = Identity::generate(IdentityKind::Curve25519);
                info!(address = %id.address(), "generated new node identity");
                host.state_put(
                    StateObjectKind::IdentitySecret,
                    "identity.secret",
                    id.to_state_string(true).as_bytes(),
                );
                host.state_put(
                    StateObjectKind::IdentityPublic,
                    "identity.public",
                    id.to_state_string(false).as_bytes(),
                );
                id
            }
        };

        // The at-rest cache key must be stable across restarts and secret:
        // self-agreement of the node identity gives exactly that.
        let cache_key = identity.agree(&identity)?;
        let node_nonce = rand::rngs::OsRng.next_u64();

        let rt = Arc::new(Runtime::new(
            config, identity, host, cache_key, node_nonce, now,
        ));
        let topology = Arc::new(Topology::new(Arc::clone(&rt)));
        let dispatcher = Dispatcher::new(Arc::clone(&rt), Arc::clone(&topology), vl2);

        rt.host.event(Event::Up);
        Ok(Arc::new(Node {
            rt,
            topology,
            dispatcher,
            online: AtomicBool::new(false),
            last_save: AtomicI64::new(now),
        }))
    }

    /// The local identity
    pub fn identity(&self) -> &Identity {
        &self.rt.identity
    }

    /// The local address
    pub fn address(&self) -> Address {
        self.rt.identity.address()
    }

    /// The topology database
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Handle one received datagram; safe to call from any thread
    pub fn on_remote_packet(&self, local_socket: i64, from: SocketAddr, data: &[u8]) {
        self.dispatcher.on_remote_packet(local_socket, from, data);
    }

    /// Begin contact with a peer whose identity is known out of band
    ///
    /// Admits the peer and sends a HELLO to the given physical address. The
    /// connection completes when the OK(HELLO) comes back.
    pub fn contact(
        &self,
        identity: Identity,
        remote: SocketAddr,
        now: i64,
    ) -> NodeResult<Arc<Peer>> {
        if !identity.locally_validate() {
            return Err(NodeError::InvalidObject("peer identity"));
        }
        let peer = self.topology.add(Peer::new(&self.rt, identity)?);
        peer.hello(&self.rt, -1, remote, now);
        Ok(peer)
    }

    /// Publish a new locator for this node
    ///
    /// Signs the endpoint set with the local identity, persists it, and
    /// returns it for the host to distribute.
    pub fn update_locator(
        &self,
        endpoints: &[hypermesh_wire::endpoint::Endpoint],
        now: i64,
    ) -> NodeResult<Locator> {
        let locator = Locator::create(&self.rt.identity, now, endpoints)?;
        self.rt.host.state_put(
            StateObjectKind::Locator,
            "locator",
            &locator.to_bytes(),
        );
        Ok(locator)
    }

    /// True if an alive direct path to the given peer exists right now
    pub fn is_directly_connected(&self, address: Address, now: i64) -> bool {
        self.topology
            .peer(address, false)
            .map(|p| p.directly_connected(&self.rt, now))
            .unwrap_or(false)
    }

    /// Designate a root
    pub fn add_root(&self, identity: Identity, locator: Locator) -> NodeResult<()> {
        self.topology.add_root(identity, locator)
    }

    /// Remove a root designation
    pub fn remove_root(&self, fingerprint: &Fingerprint) -> bool {
        self.topology.remove_root(fingerprint)
    }

    /// Periodic task driver; call every few seconds with the current time
    pub fn process_background_tasks(&self, now: i64) {
        self.rt.set_now(now);

        self.topology.do_periodic_tasks(now);
        self.topology.rank_roots();
        self.dispatcher.send_pending_whois(now);
        self.dispatcher.sweep_whois(now);

        // Online means a root is reachable right now.
        let online = self.topology.best_root_path(now).is_some();
        if online != self.online.swap(online, Ordering::Relaxed) {
            self.rt
                .host
                .event(if online { Event::Online } else { Event::Offline });
        }

        let last = self.last_save.load(Ordering::Relaxed);
        if (now - last) >= SAVE_INTERVAL
            && self
                .last_save
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.topology.save_all(now);
        }
    }

    /// Current snapshot for the host's status surface
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.address(),
            online: self.online.load(Ordering::Relaxed),
            peers: self.topology.peer_count(),
            paths: self.topology.path_count(),
            clock: self.rt.now(),
        }
    }

    /// Persist everything and announce shutdown
    pub fn shutdown(&self, now: i64) {
        self.topology.save_all(now);
        self.rt.host.event(Event::Down);
    }
}
