//! Symmetric key containers
//!
//! A `SymmetricSecret` is the 48-byte output of identity agreement. An
//! `EphemeralKey` wraps one together with the bookkeeping needed to enforce
//! both a wall-clock and a message-count TTL, and to mint unique per-message
//! initialization vectors.

use std::sync::atomic::{AtomicU64, Ordering};

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::SYMMETRIC_KEY_SIZE;
use crate::error::{CryptoError, CryptoResult};

/// A 384-bit shared secret produced by identity key agreement
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricSecret {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

impl SymmetricSecret {
    /// Create a secret from raw bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SYMMETRIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }

    /// First 32 bytes, the portion used to key Salsa20/12 and AES-256
    pub fn cipher_key(&self) -> &[u8] {
        &self.bytes[..32]
    }
}

impl std::fmt::Debug for SymmetricSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "SymmetricSecret(..)")
    }
}

/// A session key with wall-clock and message-count expiry
///
/// The IV space is partitioned by creation time: the nonce base shifts the
/// creation timestamp into the most significant bits so that IVs minted under
/// successive keys never collide.
pub struct EphemeralKey {
    secret: SymmetricSecret,
    created_at: i64,
    nonce_base: u64,
    odometer: AtomicU64,
    ttl_ms: i64,
    ttl_messages: u64,
}

impl EphemeralKey {
    /// Wrap a fresh secret created at `now`
    pub fn new(now: i64, secret: SymmetricSecret, ttl_ms: i64, ttl_messages: u64) -> Self {
        Self {
            secret,
            created_at: now,
            nonce_base: (now as u64) << 22,
            odometer: AtomicU64::new(0),
            ttl_ms,
            ttl_messages,
        }
    }

    /// The wrapped secret
    pub fn secret(&self) -> &SymmetricSecret {
        &self.secret
    }

    /// Creation timestamp in milliseconds
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Number of messages sent under this key so far
    pub fn messages_used(&self) -> u64 {
        self.odometer.load(Ordering::Relaxed)
    }

    /// True once either TTL bound has been crossed
    pub fn expired(&self, now: i64) -> bool {
        (now - self.created_at) >= self.ttl_ms
            || self.odometer.load(Ordering::Relaxed) >= self.ttl_messages
    }

    /// True once half of either TTL bound has been consumed
    pub fn expiring_soon(&self, now: i64) -> bool {
        (now - self.created_at) >= (self.ttl_ms / 2)
            || self.odometer.load(Ordering::Relaxed) >= (self.ttl_messages / 2)
    }

    /// Advance the odometer and return the next unique message IV
    pub fn next_message_iv(&self) -> u64 {
        self.nonce_base + self.odometer.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("created_at", &self.created_at)
            .field("messages_used", &self.messages_used())
            .finish()
    }
}
