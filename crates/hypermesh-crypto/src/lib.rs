//! Hypermesh Cryptographic Primitives
//!
//! This crate provides all cryptographic operations for the hypermesh
//! virtual layer 1:
//! - Node identities with proof-of-work address derivation
//! - Hybrid key agreement (X25519, optionally combined with NIST P-384)
//! - The wire cipher suite (Salsa20/12 + Poly1305, HMAC-SHA384)
//! - Ephemeral session keys with dual time/message TTLs

pub mod error;
pub mod identity;
pub mod keys;
pub mod symmetric;

pub use error::CryptoError;
pub use identity::{Address, Identity, IdentityKind, Signature};
pub use keys::{EphemeralKey, SymmetricSecret};
pub use symmetric::CipherSuite;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::*;
    pub use crate::identity::*;
    pub use crate::keys::*;
    pub use crate::symmetric::*;
}

/// Protocol constants
pub mod constants {
    /// Size of the shared secret produced by identity agreement (SHA-384 width)
    pub const SYMMETRIC_KEY_SIZE: usize = 48;

    /// Salsa20/12 key size
    pub const SALSA_KEY_SIZE: usize = 32;

    /// Poly1305 one-time key size
    pub const POLY1305_KEY_SIZE: usize = 32;

    /// HMAC-SHA384 output size
    pub const HMAC_SHA384_SIZE: usize = 48;

    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// Ed25519 public key size
    pub const ED25519_PUBKEY_SIZE: usize = 32;

    /// Ed25519 signature size
    pub const ED25519_SIGNATURE_SIZE: usize = 64;

    /// Compressed SEC1 point size for P-384
    pub const P384_POINT_SIZE: usize = 49;

    /// P-384 scalar size
    pub const P384_SCALAR_SIZE: usize = 48;

    /// ECDSA P-384 fixed signature size
    pub const P384_SIGNATURE_SIZE: usize = 96;

    /// Node address length on the wire (40 bits)
    pub const ADDRESS_SIZE: usize = 5;

    /// SHA-384 hash size (fingerprints, work function output)
    pub const SHA384_SIZE: usize = 48;

    /// Size of the work buffer filled during address derivation
    pub const ADDRESS_DERIVATION_MEMORY: usize = 2 * 1024 * 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_handshake_flow() {
        // Two nodes agree on the same permanent key and can authenticate
        // each other's signatures.
        let alice = Identity::generate(IdentityKind::Curve25519);
        let bob = Identity::generate(IdentityKind::Curve25519);

        let k_ab = alice.agree(&bob).expect("alice agrees with bob");
        let k_ba = bob.agree(&alice).expect("bob agrees with alice");
        assert_eq!(k_ab.as_bytes(), k_ba.as_bytes());

        let message = b"hypermesh handshake transcript";
        let sig = alice.sign(message).expect("alice signs");
        assert!(alice.verify(message, &sig));
        assert!(!bob.verify(message, &sig));
    }
}
