//! Host integration seams
//!
//! The core never touches sockets, disks or wall clocks directly. Everything
//! it needs from the outside world arrives through [`HostInterface`], and
//! everything above layer 1 leaves through [`VirtualLayer2`]. Hosts carry
//! whatever per-call context they need inside their trait implementations.

use std::net::SocketAddr;
use std::sync::Arc;

use hypermesh_crypto::identity::{Address, Identity};
use hypermesh_wire::Verb;

use crate::events::Event;
use crate::path::Path;
use crate::peer::Peer;

/// Kinds of objects in the external state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateObjectKind {
    /// The node's own public identity
    IdentityPublic,
    /// The node's own identity including the secret half
    IdentitySecret,
    /// The node's own locator
    Locator,
    /// A cached peer record, keyed by address
    Peer,
    /// The administrator's root designation list
    Roots,
    /// Layer-2 network configuration (owned by the VL2 collaborator)
    NetworkConfig,
}

/// IP address family selector for path lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Callbacks the host must provide to a node
///
/// Implementations must be thread-safe: the node invokes these from
/// whichever thread handed it a packet or a background-task tick. Send and
/// state callbacks are expected to return promptly; a slow callback stalls
/// only the calling thread.
pub trait HostInterface: Send + Sync {
    /// Transmit one datagram. Returns false if the send definitely failed.
    fn wire_send(&self, local_socket: i64, remote: SocketAddr, data: &[u8], ttl_hint: u8) -> bool;

    /// Persist a state object
    fn state_put(&self, kind: StateObjectKind, id: &str, data: &[u8]);

    /// Delete a state object
    fn state_delete(&self, _kind: StateObjectKind, _id: &str) {}

    /// Retrieve a state object, or None if absent
    fn state_get(&self, kind: StateObjectKind, id: &str) -> Option<Vec<u8>>;

    /// Receive a node event or structured trace
    fn event(&self, event: Event);

    /// Veto a candidate physical path (used to prevent routing loops)
    fn path_check(
        &self,
        _address: Address,
        _id: &Identity,
        _local_socket: i64,
        _remote: SocketAddr,
    ) -> bool {
        true
    }

    /// Suggest a physical address for first contact with a peer
    fn path_lookup(
        &self,
        _address: Address,
        _id: &Identity,
        _family: Option<IpFamily>,
    ) -> Option<SocketAddr> {
        None
    }
}

/// The virtual layer 2 collaborator
///
/// Receives data verbs that have already been authenticated and attributed
/// to a peer and a path. Returning false marks the packet invalid, which
/// suppresses the peer's receive accounting for it.
pub trait VirtualLayer2: Send + Sync {
    /// Handle one layer-2 verb payload (payload excludes the verb byte)
    fn handle(&self, peer: &Arc<Peer>, path: &Arc<Path>, verb: Verb, payload: &[u8]) -> bool;
}

/// A layer-2 collaborator that accepts and discards everything
///
/// Useful for relay-only nodes and for tests that exercise layer 1 alone.
pub struct NullVirtualLayer2;

impl VirtualLayer2 for NullVirtualLayer2 {
    fn handle(&self, _peer: &Arc<Peer>, _path: &Arc<Path>, _verb: Verb, _payload: &[u8]) -> bool {
        true
    }
}
