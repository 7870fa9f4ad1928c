//! Network endpoints
//!
//! A tagged union of the ways a node can be reached. Only IP endpoints are
//! dialed by this layer today; node and Ethernet endpoints exist so locators
//! and bootstrap records can carry them forward.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{WireError, WireResult};
use crate::fingerprint::{Fingerprint, FINGERPRINT_SIZE};

/// Endpoint type tags (also the wire discriminator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EndpointType {
    Nil = 0,
    Node = 1,
    Ethernet = 2,
    InetV4 = 3,
    InetV6 = 4,
}

/// A location at which a node may be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Empty/unset
    Nil,
    /// Another node, reached through the overlay itself
    Node(Fingerprint),
    /// A raw Ethernet MAC
    Ethernet([u8; 6]),
    /// IPv4 address and port
    InetV4(Ipv4Addr, u16),
    /// IPv6 address and port
    InetV6(Ipv6Addr, u16),
}

impl Endpoint {
    /// This endpoint's type tag
    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            Endpoint::Nil => EndpointType::Nil,
            Endpoint::Node(_) => EndpointType::Node,
            Endpoint::Ethernet(_) => EndpointType::Ethernet,
            Endpoint::InetV4(..) => EndpointType::InetV4,
            Endpoint::InetV6(..) => EndpointType::InetV6,
        }
    }

    /// True for IPv4/IPv6 endpoints
    pub fn is_inet(&self) -> bool {
        matches!(self, Endpoint::InetV4(..) | Endpoint::InetV6(..))
    }

    /// The socket address, for IP endpoints
    pub fn inet_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::InetV4(ip, port) => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
            Endpoint::InetV6(ip, port) => Some(SocketAddr::new(IpAddr::V6(*ip), *port)),
            _ => None,
        }
    }

    /// True if this endpoint is set
    pub fn is_set(&self) -> bool {
        !matches!(self, Endpoint::Nil)
    }

    /// Append the wire form: `[1 type][payload]`
    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.push(self.endpoint_type() as u8);
        match self {
            Endpoint::Nil => {}
            Endpoint::Node(fp) => fp.marshal(out),
            Endpoint::Ethernet(mac) => out.extend_from_slice(mac),
            Endpoint::InetV4(ip, port) => {
                out.extend_from_slice(&ip.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            Endpoint::InetV6(ip, port) => {
                out.extend_from_slice(&ip.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// The wire form as a fresh vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.marshal(&mut out);
        out
    }

    /// Parse an endpoint, returning it and the bytes consumed
    pub fn unmarshal(data: &[u8]) -> WireResult<(Self, usize)> {
        if data.is_empty() {
            return Err(WireError::Truncated { need: 1, have: 0 });
        }
        let need = |n: usize| -> WireResult<()> {
            if data.len() < 1 + n {
                Err(WireError::Truncated {
                    need: 1 + n,
                    have: data.len(),
                })
            } else {
                Ok(())
            }
        };
        match data[0] {
            0 => Ok((Endpoint::Nil, 1)),
            1 => {
                need(FINGERPRINT_SIZE)?;
                let (fp, n) = Fingerprint::unmarshal(&data[1..])?;
                Ok((Endpoint::Node(fp), 1 + n))
            }
            2 => {
                need(6)?;
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&data[1..7]);
                Ok((Endpoint::Ethernet(mac), 7))
            }
            3 => {
                need(6)?;
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&data[1..5]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Endpoint::InetV4(Ipv4Addr::from(ip), port), 7))
            }
            4 => {
                need(18)?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Endpoint::InetV6(Ipv6Addr::from(ip), port), 19))
            }
            _ => Err(WireError::InvalidField("endpoint type")),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => Endpoint::InetV4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Endpoint::InetV6(*v6.ip(), v6.port()),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Nil => write!(f, "nil"),
            Endpoint::Node(fp) => write!(f, "node:{}", fp),
            Endpoint::Ethernet(mac) => write!(
                f,
                "eth:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            Endpoint::InetV4(ip, port) => write!(f, "{}/{}", ip, port),
            Endpoint::InetV6(ip, port) => write!(f, "{}/{}", ip, port),
        }
    }
}
