//! Node-level errors

use thiserror::Error;

/// Errors surfaced by the node core
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A peer with this address but a different identity already exists
    #[error("Address collision for {0}")]
    AddressCollision(String),

    /// An identity, locator or other protocol object failed validation
    #[error("Invalid object: {0}")]
    InvalidObject(&'static str),

    /// The state store returned data that could not be decoded
    #[error("Corrupt state object: {0}")]
    CorruptStateObject(&'static str),

    /// Packet could not be composed (would exceed size bounds)
    #[error("Packet too large: {0}")]
    PacketTooLarge(&'static str),

    /// Crypto layer failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] hypermesh_crypto::CryptoError),

    /// Wire layer failure
    #[error("Wire error: {0}")]
    Wire(#[from] hypermesh_wire::WireError),
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
