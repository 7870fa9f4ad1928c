//! End-to-end scenarios with whole nodes wired over an in-process network.
//!
//! Datagrams are queued rather than delivered inline so each test can pump
//! the network deterministically, inspect frames in flight, or corrupt them.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use hypermesh_node::{
    Config, Event, HostInterface, Node, NullVirtualLayer2, PacketDropReason, StateObjectKind,
};
use hypermesh_wire::locator::Locator;
use parking_lot::Mutex;

struct TestNet {
    nodes: Mutex<HashMap<SocketAddr, Arc<Node>>>,
    queue: Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>,
}

impl TestNet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Deliver queued datagrams until the network is quiet.
    fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Some((to, from, data)) = self.queue.lock().pop_front() else {
                return delivered;
            };
            let node = self.nodes.lock().get(&to).cloned();
            if let Some(node) = node {
                node.on_remote_packet(1, from, &data);
            }
            delivered += 1;
        }
    }

    fn take_one(&self) -> Option<(SocketAddr, SocketAddr, Vec<u8>)> {
        self.queue.lock().pop_front()
    }

    fn deliver(&self, to: SocketAddr, from: SocketAddr, data: &[u8]) {
        let node = self.nodes.lock().get(&to).cloned();
        if let Some(node) = node {
            node.on_remote_packet(1, from, data);
        }
    }
}

struct NetHost {
    net: Arc<TestNet>,
    bind: SocketAddr,
    store: Mutex<HashMap<(StateObjectKind, String), Vec<u8>>>,
    events: Mutex<Vec<Event>>,
}

impl NetHost {
    fn mac_failures(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::Trace(t) if t.drop_reason() == Some(PacketDropReason::MacFailed)
                )
            })
            .count()
    }

    fn saw_online(&self) -> bool {
        self.events.lock().iter().any(|e| matches!(e, Event::Online))
    }
}

impl HostInterface for NetHost {
    fn wire_send(&self, _local_socket: i64, remote: SocketAddr, data: &[u8], _ttl: u8) -> bool {
        self.net
            .queue
            .lock()
            .push_back((remote, self.bind, data.to_vec()));
        true
    }
    fn state_put(&self, kind: StateObjectKind, id: &str, data: &[u8]) {
        self.store
            .lock()
            .insert((kind, id.to_string()), data.to_vec());
    }
    fn state_get(&self, kind: StateObjectKind, id: &str) -> Option<Vec<u8>> {
        self.store.lock().get(&(kind, id.to_string())).cloned()
    }
    fn event(&self, e: Event) {
        self.events.lock().push(e);
    }
}

fn spawn(net: &Arc<TestNet>, bind: &str, now: i64) -> (Arc<Node>, Arc<NetHost>) {
    let bind: SocketAddr = bind.parse().unwrap();
    let host = Arc::new(NetHost {
        net: Arc::clone(net),
        bind,
        store: Mutex::new(HashMap::new()),
        events: Mutex::new(Vec::new()),
    });
    let node = Node::new(
        host.clone(),
        Arc::new(NullVirtualLayer2),
        Config::default(),
        now,
    )
    .unwrap();
    net.nodes.lock().insert(bind, Arc::clone(&node));
    (node, host)
}

#[test]
fn two_node_handshake_establishes_direct_paths() {
    let net = TestNet::new();
    let (a, _a_host) = spawn(&net, "10.0.0.1:793", 1_000);
    let (b, _b_host) = spawn(&net, "10.0.0.2:793", 1_000);

    a.contact(b.identity().public_only(), "10.0.0.2:793".parse().unwrap(), 1_000)
        .unwrap();
    let delivered = net.pump();
    assert!(delivered >= 2, "HELLO and OK(HELLO) must flow");

    // Both sides now know each other and hold an alive direct path.
    assert!(b.topology().peer(a.address(), false).is_some());
    assert!(a.topology().peer(b.address(), false).is_some());
    assert!(a.is_directly_connected(b.address(), 1_001));
    assert!(b.is_directly_connected(a.address(), 1_001));
}

#[test]
fn flipped_hello_byte_yields_one_mac_trace_and_no_peer() {
    let net = TestNet::new();
    let (a, _a_host) = spawn(&net, "10.0.1.1:793", 1_000);
    let (b, b_host) = spawn(&net, "10.0.1.2:793", 1_000);

    a.contact(b.identity().public_only(), "10.0.1.2:793".parse().unwrap(), 1_000)
        .unwrap();
    let (to, from, mut hello) = net.take_one().expect("the HELLO frame");
    assert_eq!(to, "10.0.1.2:793".parse().unwrap());

    let last = hello.len() - 1;
    hello[last] ^= 0x01;
    net.deliver(to, from, &hello);

    assert_eq!(b_host.mac_failures(), 1);
    assert!(b.topology().peer(a.address(), false).is_none());
    // The intact original still goes through afterwards.
    a.contact(b.identity().public_only(), "10.0.1.2:793".parse().unwrap(), 1_002)
        .unwrap();
    net.pump();
    assert!(b.topology().peer(a.address(), false).is_some());
    assert_eq!(b_host.mac_failures(), 1);
}

#[test]
fn node_goes_online_once_a_root_responds() {
    let net = TestNet::new();
    let (a, a_host) = spawn(&net, "10.0.2.1:793", 1_000);
    let (root, _root_host) = spawn(&net, "10.0.2.9:793", 1_000);

    a.add_root(root.identity().public_only(), Locator::nil())
        .unwrap();
    a.process_background_tasks(1_500);
    assert!(!a.status().online);

    a.contact(
        root.identity().public_only(),
        "10.0.2.9:793".parse().unwrap(),
        2_000,
    )
    .unwrap();
    net.pump();

    a.process_background_tasks(3_000);
    assert!(a.status().online);
    assert!(a_host.saw_online());

    // Long silence kills the path and the node reports offline again.
    a.process_background_tasks(500_000);
    assert!(!a.status().online);
    assert!(a_host.events.lock().iter().any(|e| matches!(e, Event::Offline)));
}

#[test]
fn restarted_node_keeps_identity_and_reconnects() {
    let net = TestNet::new();
    let (a, a_host) = spawn(&net, "10.0.3.1:793", 1_000);
    let (b, _b_host) = spawn(&net, "10.0.3.2:793", 1_000);

    a.contact(b.identity().public_only(), "10.0.3.2:793".parse().unwrap(), 1_000)
        .unwrap();
    net.pump();
    a.shutdown(1_500);
    let a_address = a.address();
    net.nodes.lock().remove(&"10.0.3.1:793".parse().unwrap());
    drop(a);

    // Same host state, fresh process: identity and cached peers survive.
    let a2 = Node::new(
        a_host.clone(),
        Arc::new(NullVirtualLayer2),
        Config::default(),
        2_000,
    )
    .unwrap();
    net.nodes
        .lock()
        .insert("10.0.3.1:793".parse().unwrap(), Arc::clone(&a2));
    assert_eq!(a2.address(), a_address);
    let restored = a2.topology().peer(b.address(), true).expect("cached peer");
    assert_eq!(restored.identity(), &b.identity().public_only());
}
