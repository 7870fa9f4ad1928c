//! Structured events
//!
//! Everything observable about the core flows through these types and out
//! the host's `event` callback. Traces never influence control flow; they
//! exist so operators can see why packets vanish.

use std::net::SocketAddr;

use bytes::Bytes;
use hypermesh_crypto::identity::Address;
use hypermesh_wire::{Endpoint, Verb};
use serde::{Deserialize, Serialize};

/// Why an incoming packet was silently dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketDropReason {
    Unspecified,
    PeerTooOld,
    MalformedPacket,
    MacFailed,
    NotTrustedPath,
    RateLimitExceeded,
    InvalidObject,
    InvalidCompressedData,
    UnrecognizedVerb,
    ReplyNotExpected,
}

/// Why a new candidate path is being attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TryPathReason {
    Rendezvous,
    PushDirectPaths,
    PacketReceivedFromUnknownPath,
    ExplicitlySuggestedAddress,
    BootstrapAddress,
}

/// A structured protocol trace
#[derive(Debug, Clone)]
pub enum TraceEvent {
    /// An inbound packet was dropped; `code` is a stable code-location token
    IncomingPacketDropped {
        code: u32,
        packet_id: u64,
        from: Option<SocketAddr>,
        source: Option<Address>,
        hops: u8,
        verb: Option<Verb>,
        reason: PacketDropReason,
    },
    /// A new working path to a peer was learned
    LearnedNewPath {
        code: u32,
        packet_id: u64,
        peer: Address,
        new_remote: SocketAddr,
        old_remote: Option<SocketAddr>,
    },
    /// A candidate path is being attempted
    TryingNewPath {
        code: u32,
        peer: Address,
        remote: SocketAddr,
        reason: TryPathReason,
    },
    /// An internal failure was contained and converted into a drop
    UnexpectedError { code: u32, message: String },
}

impl TraceEvent {
    /// The drop reason, for traces that carry one
    pub fn drop_reason(&self) -> Option<PacketDropReason> {
        match self {
            TraceEvent::IncomingPacketDropped { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Node lifecycle and protocol notifications
#[derive(Debug, Clone)]
pub enum Event {
    /// The node instance is constructed and ready
    Up,
    /// At least one root is reachable
    Online,
    /// No roots are reachable
    Offline,
    /// The node instance is shutting down
    Down,
    /// A structured protocol trace
    Trace(TraceEvent),
    /// A direct peer reported the physical destination it addressed us at
    ///
    /// This is how a node behind NAT learns its external surface address;
    /// what to do about a changed surface (for instance resetting paths in
    /// that scope) is the host's decision.
    ExternalSurfaceAddress {
        reporter: Address,
        local_socket: i64,
        surface: Endpoint,
    },
    /// A VERB_USER_MESSAGE arrived from an authenticated peer
    UserMessage {
        source: Address,
        type_id: u64,
        data: Bytes,
    },
}
