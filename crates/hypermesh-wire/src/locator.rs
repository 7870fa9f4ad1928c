//! Locators
//!
//! A locator is a node's signed, timestamped claim about where it can be
//! reached. Endpoints are sorted into a canonical order before signing so
//! that the same endpoint set always produces the same signed bytes.

use hypermesh_crypto::identity::Identity;

use crate::endpoint::Endpoint;
use crate::error::{WireError, WireResult};
use crate::fingerprint::Fingerprint;

/// Maximum endpoints a locator may carry
pub const LOCATOR_MAX_ENDPOINTS: usize = 8;

/// A signed set of endpoints for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    timestamp: i64,
    signer: Fingerprint,
    endpoints: Vec<Endpoint>,
    signature: Vec<u8>,
}

impl Locator {
    /// An empty (nil) locator
    pub fn nil() -> Self {
        Self {
            timestamp: 0,
            signer: Fingerprint::address_only(hypermesh_crypto::identity::Address::NIL),
            endpoints: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// Build and sign a locator over the given endpoints
    ///
    /// Endpoints are deduplicated and sorted deterministically; the identity
    /// must hold its secret key. A timestamp of zero or below would make the
    /// locator nil, so it is rejected.
    pub fn create(id: &Identity, timestamp: i64, endpoints: &[Endpoint]) -> WireResult<Self> {
        if timestamp <= 0 {
            return Err(WireError::InvalidField("locator timestamp"));
        }
        if endpoints.len() > LOCATOR_MAX_ENDPOINTS {
            return Err(WireError::TooLarge("locator endpoints"));
        }
        let mut eps: Vec<Endpoint> = endpoints.to_vec();
        eps.sort_by(|a, b| a.to_bytes().cmp(&b.to_bytes()));
        eps.dedup();

        let mut loc = Self {
            timestamp,
            signer: Fingerprint::from_identity(id),
            endpoints: eps,
            signature: Vec::new(),
        };
        let signing_region = loc.signing_region();
        loc.signature = id.sign(&signing_region)?.as_bytes().to_vec();
        Ok(loc)
    }

    /// Timestamp, which doubles as a revision number
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Fingerprint of the signing identity
    pub fn signer(&self) -> &Fingerprint {
        &self.signer
    }

    /// The endpoints, in canonical order
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// True if this locator carries no claim
    pub fn is_nil(&self) -> bool {
        self.timestamp <= 0
    }

    /// Verify the signature against the identity it claims to be from
    pub fn verify(&self, id: &Identity) -> bool {
        if self.is_nil() || !self.signer.matches(id) {
            return false;
        }
        match hypermesh_crypto::identity::Signature::from_slice(&self.signature) {
            Ok(sig) => id.verify(&self.signing_region(), &sig),
            Err(_) => false,
        }
    }

    /// The bytes covered by the signature
    fn signing_region(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        self.signer.marshal(&mut out);
        out.extend_from_slice(&(self.endpoints.len() as u16).to_be_bytes());
        for ep in &self.endpoints {
            ep.marshal(&mut out);
        }
        out
    }

    /// Append the wire form
    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        if self.is_nil() {
            return;
        }
        self.signer.marshal(out);
        out.extend_from_slice(&(self.endpoints.len() as u16).to_be_bytes());
        for ep in &self.endpoints {
            ep.marshal(out);
        }
        out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.signature);
        // Length of additional fields, reserved.
        out.extend_from_slice(&0u16.to_be_bytes());
    }

    /// The wire form as a fresh vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.marshal(&mut out);
        out
    }

    /// Parse a locator, returning it and the bytes consumed
    pub fn unmarshal(data: &[u8]) -> WireResult<(Self, usize)> {
        if data.len() < 8 {
            return Err(WireError::Truncated {
                need: 8,
                have: data.len(),
            });
        }
        let timestamp = i64::from_be_bytes(data[..8].try_into().expect("8-byte slice"));
        if timestamp <= 0 {
            return Ok((Self::nil(), 8));
        }
        let mut p = 8;
        let (signer, n) = Fingerprint::unmarshal(&data[p..])?;
        p += n;

        if data.len() < p + 2 {
            return Err(WireError::Truncated {
                need: p + 2,
                have: data.len(),
            });
        }
        let count = u16::from_be_bytes([data[p], data[p + 1]]) as usize;
        p += 2;
        if count > LOCATOR_MAX_ENDPOINTS {
            return Err(WireError::TooLarge("locator endpoints"));
        }
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            let (ep, n) = Endpoint::unmarshal(&data[p..])?;
            endpoints.push(ep);
            p += n;
        }

        if data.len() < p + 2 {
            return Err(WireError::Truncated {
                need: p + 2,
                have: data.len(),
            });
        }
        let sig_len = u16::from_be_bytes([data[p], data[p + 1]]) as usize;
        p += 2;
        if data.len() < p + sig_len + 2 {
            return Err(WireError::Truncated {
                need: p + sig_len + 2,
                have: data.len(),
            });
        }
        let signature = data[p..p + sig_len].to_vec();
        p += sig_len;
        let extra = u16::from_be_bytes([data[p], data[p + 1]]) as usize;
        p += 2 + extra;
        if p > data.len() {
            return Err(WireError::Truncated {
                need: p,
                have: data.len(),
            });
        }

        Ok((
            Self {
                timestamp,
                signer,
                endpoints,
                signature,
            },
            p,
        ))
    }
}
