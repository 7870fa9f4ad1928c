//! Hypermesh Virtual Layer 1
//!
//! The core of the peer-to-peer network hypervisor: authenticated encrypted
//! datagram channels between cryptographically addressed nodes, a concurrent
//! topology of peers and physical paths, and the wire protocol dispatcher
//! that drives it all over UDP.
//!
//! The host integrates through two narrow seams: [`HostInterface`] for
//! sockets, state storage and events, and [`VirtualLayer2`] for everything
//! above layer 1. A [`Node`] is fully self-contained; run as many per
//! process as you like.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod expect;
pub mod host;
pub mod node;
pub mod path;
pub mod peer;
pub mod runtime;
pub mod topology;

pub use config::Config;
pub use dispatcher::{Dispatcher, ProtocolErrorCode};
pub use error::{NodeError, NodeResult};
pub use events::{Event, PacketDropReason, TraceEvent};
pub use host::{HostInterface, IpFamily, NullVirtualLayer2, StateObjectKind, VirtualLayer2};
pub use node::{Node, NodeStatus};
pub use path::{IpScope, Path};
pub use peer::Peer;
pub use runtime::{Runtime, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use topology::{Topology, TrustedPathSpec};
