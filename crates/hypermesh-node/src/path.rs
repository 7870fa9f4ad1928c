//! Physical paths
//!
//! A path is one (local socket, remote address) pair. It is pure data plus
//! metering: all hot fields are atomics so receive accounting never takes a
//! lock. Paths are canonicalized by the topology; a given (socket, address)
//! pair maps to exactly one live `Path` object.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::host::HostInterface;

/// Coarse routability scope of an IP address
///
/// Used when the host detects an external address change and wants to reset
/// only the paths whose scope was affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpScope {
    Loopback,
    LinkLocal,
    Private,
    Multicast,
    Global,
}

/// Classify an IP address into its routability scope
pub fn ip_scope(ip: &IpAddr) -> IpScope {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                IpScope::Loopback
            } else if v4.is_link_local() {
                IpScope::LinkLocal
            } else if v4.is_private() {
                IpScope::Private
            } else if v4.is_multicast() {
                IpScope::Multicast
            } else {
                IpScope::Global
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                IpScope::Loopback
            } else if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                IpScope::LinkLocal
            } else if (v6.segments()[0] & 0xfe00) == 0xfc00 {
                IpScope::Private
            } else if v6.is_multicast() {
                IpScope::Multicast
            } else {
                IpScope::Global
            }
        }
    }
}

/// Derive the stable 64-bit key for a (local socket, remote address) pair
pub fn path_key(local_socket: i64, remote: &SocketAddr) -> u64 {
    match remote {
        SocketAddr::V4(v4) => {
            (u64::from(u32::from(*v4.ip())) << 32)
                ^ ((v4.port() as u64) << 16)
                ^ (local_socket as u64)
        }
        SocketAddr::V6(v6) => {
            let o = v6.ip().octets();
            let hi = u64::from_be_bytes(o[..8].try_into().expect("8-byte slice"));
            let lo = u64::from_be_bytes(o[8..].try_into().expect("8-byte slice"));
            hi.wrapping_add(lo)
                .wrapping_add(v6.port() as u64)
                .wrapping_add(local_socket as u64)
        }
    }
}

/// One (local socket, remote address) channel with send/receive metering
pub struct Path {
    local_socket: i64,
    remote: SocketAddr,
    last_send: AtomicI64,
    last_receive: AtomicI64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    // Smoothed round-trip latency in ms, -1 while unknown.
    latency: AtomicI64,
}

impl Path {
    /// Create a path; it becomes alive on its first receive
    pub fn new(local_socket: i64, remote: SocketAddr) -> Self {
        Self {
            local_socket,
            remote,
            last_send: AtomicI64::new(0),
            last_receive: AtomicI64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            latency: AtomicI64::new(-1),
        }
    }

    /// The local socket this path uses
    pub fn local_socket(&self) -> i64 {
        self.local_socket
    }

    /// The remote physical address
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// This path's canonical hash key
    pub fn key(&self) -> u64 {
        path_key(self.local_socket, &self.remote)
    }

    /// Record receipt of `bytes` at `now`
    pub fn received(&self, now: i64, bytes: usize) {
        self.last_receive.store(now, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record transmission of `bytes` at `now`
    pub fn sent(&self, now: i64, bytes: usize) {
        self.last_send.store(now, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Time anything was last received on this path
    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    /// Time anything was last sent on this path
    pub fn last_send(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    /// Total bytes received
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Total bytes sent
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// True while something has been received within `timeout` of `now`
    pub fn alive(&self, now: i64, timeout: i64) -> bool {
        let lr = self.last_receive.load(Ordering::Relaxed);
        lr > 0 && (now - lr) < timeout
    }

    /// Force the path dead until something is received again
    pub fn deactivate(&self) {
        self.last_receive.store(0, Ordering::Relaxed);
    }

    /// Smoothed latency in ms, or -1 while unknown
    pub fn latency(&self) -> i64 {
        self.latency.load(Ordering::Relaxed)
    }

    /// Fold a new round-trip sample into the smoothed latency
    pub fn update_latency(&self, sample_ms: i64) {
        let prev = self.latency.load(Ordering::Relaxed);
        let next = if prev < 0 {
            sample_ms
        } else {
            (prev * 3 + sample_ms) / 4
        };
        self.latency.store(next.max(0), Ordering::Relaxed);
    }

    /// Send a datagram over this path via the host's wire-send callback
    pub fn send(&self, host: &dyn HostInterface, data: &[u8], now: i64) -> bool {
        if host.wire_send(self.local_socket, self.remote, data, 0) {
            self.sent(now, data.len());
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path")
            .field("local_socket", &self.local_socket)
            .field("remote", &self.remote)
            .field("last_receive", &self.last_receive())
            .field("latency", &self.latency())
            .finish()
    }
}
