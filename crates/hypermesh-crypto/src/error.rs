//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length provided
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid public key material
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Invalid secret key material
    #[error("Invalid secret key")]
    InvalidSecretKey,

    /// Identity failed local validation (address does not match key material)
    #[error("Identity failed local validation")]
    InvalidIdentity,

    /// Key agreement failed (incompatible or malformed identities)
    #[error("Key agreement failed")]
    AgreementFailed,

    /// Signing requires the secret half of an identity
    #[error("Identity has no secret key")]
    MissingSecretKey,

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Invalid signature format
    #[error("Invalid signature format")]
    InvalidSignature,

    /// MAC verification failed (packet corrupted or wrong key)
    #[error("MAC verification failed")]
    MacFailed,

    /// Buffer too short for the requested operation
    #[error("Buffer too short: need {need}, have {have}")]
    BufferTooShort { need: usize, have: usize },

    /// Marshaled object is malformed
    #[error("Malformed object: {0}")]
    MalformedObject(&'static str),

    /// The requested cipher suite cannot be used here
    #[error("Unsupported cipher suite: {0}")]
    UnsupportedCipher(u8),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
