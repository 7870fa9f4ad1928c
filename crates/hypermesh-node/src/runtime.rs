//! Shared per-node runtime state
//!
//! One `Runtime` exists per node instance and is threaded through every
//! component, so multiple nodes coexist in one process without any global
//! state. It bundles the things nearly everything needs: the local identity,
//! the host callbacks, the clock, the packet-ID source and the reply
//! expectation table.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use hypermesh_crypto::identity::Identity;
use hypermesh_crypto::keys::SymmetricSecret;
use hypermesh_wire::PacketIdSource;
use tracing::debug;

use crate::config::Config;
use crate::events::{Event, TraceEvent};
use crate::expect::ExpectTable;
use crate::host::HostInterface;

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u8 = 11;

/// Oldest protocol version we will talk to
pub const MIN_PROTOCOL_VERSION: u8 = 6;

/// Software version advertised in HELLO
pub const VERSION_MAJOR: u8 = 2;
pub const VERSION_MINOR: u8 = 0;
pub const VERSION_REVISION: u16 = 4;

/// Per-node shared services
pub struct Runtime {
    pub config: Config,
    /// The local identity, including its secret half
    pub identity: Identity,
    pub host: Arc<dyn HostInterface>,
    pub packet_ids: PacketIdSource,
    pub expect: ExpectTable,
    /// Key encrypting peer records at rest in the external state store
    pub cache_key: SymmetricSecret,
    /// Per-node random nonce seeding deterministic schedules
    pub node_nonce: u64,
    clock: AtomicI64,
}

impl Runtime {
    pub fn new(
        config: Config,
        identity: Identity,
        host: Arc<dyn HostInterface>,
        cache_key: SymmetricSecret,
        node_nonce: u64,
        now: i64,
    ) -> Self {
        let expect = ExpectTable::new(config.expect_ttl);
        Self {
            config,
            identity,
            host,
            packet_ids: PacketIdSource::new(),
            expect,
            cache_key,
            node_nonce,
            clock: AtomicI64::new(now),
        }
    }

    /// Current node clock in milliseconds
    pub fn now(&self) -> i64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Advance the node clock (monotonic; stale values are ignored)
    pub fn set_now(&self, now: i64) {
        self.clock.fetch_max(now, Ordering::Relaxed);
    }

    /// Emit a structured trace through the host and the tracing mirror
    pub fn trace(&self, event: TraceEvent) {
        debug!(?event, "vl1 trace");
        self.host.event(Event::Trace(event));
    }
}
