//! Node configuration

use serde::{Deserialize, Serialize};

/// Tunable intervals and bounds for the virtual layer 1 core
///
/// All durations are in milliseconds, matching the clock the host feeds into
/// the node. Defaults are what production deployments run with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// How often a full HELLO is sent to each active peer
    pub hello_interval: i64,

    /// Keepalive cadence for otherwise idle paths
    pub path_keepalive_interval: i64,

    /// A path is alive while something was received within this window
    pub path_alive_timeout: i64,

    /// Minimum spacing between path re-prioritization passes
    pub prioritize_paths_interval: i64,

    /// Spacing between WHOIS retries for an unresolved address
    pub whois_retry_interval: i64,

    /// Minimum spacing between answered inbound WHOIS requests per peer
    pub whois_rate_limit: i64,

    /// Minimum spacing between answered inbound ECHO requests per peer
    pub echo_rate_limit: i64,

    /// Minimum spacing between answered inbound probes per peer
    pub probe_rate_limit: i64,

    /// Peers quiet for longer than this are evicted from memory
    pub peer_eviction_timeout: i64,

    /// Cached peer records older than this are ignored on load
    pub peer_cache_ttl: i64,

    /// Reassembly state older than this is evicted
    pub fragment_ttl: i64,

    /// How long an OK/ERROR reply to a sent packet remains legitimate
    pub expect_ttl: i64,

    /// Ephemeral key wall-clock TTL
    pub ephemeral_key_ttl: i64,

    /// Ephemeral key message-count TTL
    pub ephemeral_key_ttl_messages: u64,

    /// Direct paths remembered per peer
    pub max_paths_per_peer: usize,

    /// Concurrent reassemblies allowed per path
    pub max_fragments_in_flight_per_path: usize,

    /// Addresses with deferred packets awaiting WHOIS resolution
    pub whois_max_targets: usize,

    /// Deferred packets retained per unresolved address
    pub whois_queue_ring: usize,

    /// Queued direct-path candidates per peer
    pub try_queue_cap: usize,

    /// Contact attempts drained from the try-queue per pulse
    pub try_attempts_per_pulse: usize,

    /// Brute-force NAT traversal probes sent per pulse per target
    pub bfg_ports_per_pulse: usize,

    /// Total ports covered by one brute-force NAT traversal schedule
    pub bfg_port_budget: usize,

    /// Relayed packets allowed per second, node-wide
    pub relay_rate_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hello_interval: 120_000,
            path_keepalive_interval: 20_000,
            path_alive_timeout: 45_000,
            prioritize_paths_interval: 5_000,
            whois_retry_interval: 500,
            whois_rate_limit: 1_000,
            echo_rate_limit: 1_000,
            probe_rate_limit: 1_000,
            peer_eviction_timeout: 300_000,
            peer_cache_ttl: 30 * 24 * 3_600_000,
            fragment_ttl: 1_000,
            expect_ttl: 10_000,
            ephemeral_key_ttl: 1_800_000,
            ephemeral_key_ttl_messages: 1 << 28,
            max_paths_per_peer: 16,
            max_fragments_in_flight_per_path: 16,
            whois_max_targets: 64,
            whois_queue_ring: 8,
            try_queue_cap: 32,
            try_attempts_per_pulse: 4,
            bfg_ports_per_pulse: 64,
            bfg_port_budget: 1024,
            relay_rate_limit: 1_000,
        }
    }
}

impl Config {
    /// Check invariants between related settings
    pub fn validate(&self) -> Result<(), String> {
        if self.max_paths_per_peer == 0 || self.max_paths_per_peer > 16 {
            return Err("max_paths_per_peer must be between 1 and 16".into());
        }
        if self.path_alive_timeout <= self.path_keepalive_interval {
            return Err("path_alive_timeout must exceed path_keepalive_interval".into());
        }
        if self.whois_queue_ring == 0 {
            return Err("whois_queue_ring must be at least 1".into());
        }
        if self.bfg_port_budget > 1024 {
            return Err("bfg_port_budget must not exceed 1024".into());
        }
        if self.expect_ttl <= 0 || self.fragment_ttl <= 0 {
            return Err("expect_ttl and fragment_ttl must be positive".into());
        }
        Ok(())
    }
}
