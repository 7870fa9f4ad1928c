//! Identity fingerprints

use hypermesh_crypto::identity::{Address, Identity};

use crate::error::{WireError, WireResult};

/// Marshaled fingerprint size: 5 address bytes + 48 hash bytes
pub const FINGERPRINT_SIZE: usize = 53;

/// A node address plus the SHA-384 of its identity's public key material
///
/// Used where stronger specificity than a 40-bit address is required, such
/// as root designations and locator signers. The hash may be all zero when
/// only the address is known.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub address: Address,
    pub hash: [u8; 48],
}

impl Fingerprint {
    /// Fingerprint of an identity
    pub fn from_identity(id: &Identity) -> Self {
        Self {
            address: id.address(),
            hash: id.key_hash(),
        }
    }

    /// An address-only fingerprint (zero hash)
    pub fn address_only(address: Address) -> Self {
        Self {
            address,
            hash: [0u8; 48],
        }
    }

    /// True if the hash half is present
    pub fn has_hash(&self) -> bool {
        self.hash.iter().any(|b| *b != 0)
    }

    /// True if this fingerprint designates the given identity
    ///
    /// An address-only fingerprint matches on address alone; a full one also
    /// requires the key hash to match.
    pub fn matches(&self, id: &Identity) -> bool {
        self.address == id.address() && (!self.has_hash() || self.hash == id.key_hash())
    }

    /// Write the 53 wire bytes
    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_bytes());
        out.extend_from_slice(&self.hash);
    }

    /// Parse 53 wire bytes, returning the fingerprint and bytes consumed
    pub fn unmarshal(data: &[u8]) -> WireResult<(Self, usize)> {
        if data.len() < FINGERPRINT_SIZE {
            return Err(WireError::Truncated {
                need: FINGERPRINT_SIZE,
                have: data.len(),
            });
        }
        let address = Address::from_bytes(&data[..5])?;
        let mut hash = [0u8; 48];
        hash.copy_from_slice(&data[5..FINGERPRINT_SIZE]);
        Ok((Self { address, hash }, FINGERPRINT_SIZE))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-", self.address)?;
        for b in &self.hash[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypermesh_crypto::identity::IdentityKind;

    #[test]
    fn test_roundtrip_and_matching() {
        let id = Identity::generate(IdentityKind::Curve25519);
        let fp = Fingerprint::from_identity(&id);
        assert!(fp.has_hash());
        assert!(fp.matches(&id));

        let mut data = Vec::new();
        fp.marshal(&mut data);
        let (back, n) = Fingerprint::unmarshal(&data).unwrap();
        assert_eq!(n, FINGERPRINT_SIZE);
        assert_eq!(back, fp);

        let address_only = Fingerprint::address_only(id.address());
        assert!(!address_only.has_hash());
        assert!(address_only.matches(&id));

        let other = Identity::generate(IdentityKind::Curve25519);
        assert!(!fp.matches(&other));
    }
}
