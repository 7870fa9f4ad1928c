//! Wire layer errors

use thiserror::Error;

/// Errors raised while parsing or building wire objects
#[derive(Debug, Error)]
pub enum WireError {
    /// Packet or object too short
    #[error("Truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// A field held a value outside its legal range
    #[error("Invalid field: {0}")]
    InvalidField(&'static str),

    /// Unknown verb code
    #[error("Unrecognized verb: {0}")]
    UnrecognizedVerb(u8),

    /// Object exceeds its marshaled size bound
    #[error("Object too large: {0}")]
    TooLarge(&'static str),

    /// Signature over a marshaled object did not verify
    #[error("Signature verification failed")]
    BadSignature,

    /// Crypto layer failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] hypermesh_crypto::CryptoError),
}

/// Result type for wire operations
pub type WireResult<T> = Result<T, WireError>;
