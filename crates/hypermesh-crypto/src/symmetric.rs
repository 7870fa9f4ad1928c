//! Wire cipher suite
//!
//! Packets are armored in place: the outer header stays in the clear, the
//! encrypted section starts at byte 27, and the 64-bit MAC lives in header
//! bytes 19..27. The per-packet Salsa20/12 key is derived from the permanent
//! identity key and the first 16 header bytes, with the 64-bit packet ID as
//! the stream nonce; one keystream block keys Poly1305 and the remainder of
//! the stream encrypts the payload.

use aes::cipher::{KeyIvInit as AesKeyIvInit, StreamCipher as AesStreamCipher};
use hmac::{Hmac, Mac};
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;
use sha2::Sha384;
use subtle::ConstantTimeEq;

use crate::constants::{HMAC_SHA384_SIZE, POLY1305_KEY_SIZE, SALSA_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricSecret;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Offset of the 64-bit MAC field in the outer header
pub const MAC_INDEX: usize = 19;

/// First byte of the encrypted (and authenticated) section
pub const ENCRYPTED_SECTION_START: usize = 27;

/// Number of leading packet bytes mixed into the per-packet key
const KEY_MIX_LEN: usize = 16;

/// Cipher selector carried in the outer packet header (header bits 5-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    /// No encryption, no MAC; only valid on configured trusted paths
    None = 0,
    /// Plaintext payload authenticated with Poly1305; legacy HELLO
    Poly1305None = 1,
    /// Salsa20/12 encryption, Poly1305 over the ciphertext; the default
    Poly1305Salsa2012 = 2,
    /// AES-GMAC-SIV; negotiated but not yet accepted on the inbound path
    AesGmacSiv = 3,
}

impl CipherSuite {
    /// Decode the three-bit wire field
    pub fn from_wire(v: u8) -> CryptoResult<Self> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Poly1305None),
            2 => Ok(Self::Poly1305Salsa2012),
            3 => Ok(Self::AesGmacSiv),
            other => Err(CryptoError::UnsupportedCipher(other)),
        }
    }
}

/// Derive the per-packet Salsa20/12 key from the identity key and header
fn per_packet_key(key: &SymmetricSecret, packet: &[u8]) -> [u8; SALSA_KEY_SIZE] {
    let mut out = [0u8; SALSA_KEY_SIZE];
    out.copy_from_slice(key.cipher_key());
    for (o, p) in out.iter_mut().zip(packet.iter()).take(KEY_MIX_LEN) {
        *o ^= *p;
    }
    out
}

/// Build the keystream cipher and the one-time Poly1305 key for a packet
///
/// Consumes the first keystream block so the returned cipher is positioned
/// where payload encryption begins.
fn packet_ciphers(key: &SymmetricSecret, packet: &[u8]) -> (Salsa12, [u8; POLY1305_KEY_SIZE]) {
    let pk = per_packet_key(key, packet);
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&packet[..8]);
    let mut cipher = Salsa12::new(&pk.into(), &nonce.into());

    let mut block = [0u8; 64];
    cipher.apply_keystream(&mut block);
    let mut mac_key = [0u8; POLY1305_KEY_SIZE];
    mac_key.copy_from_slice(&block[..POLY1305_KEY_SIZE]);
    (cipher, mac_key)
}

fn poly1305_mac64(mac_key: &[u8; POLY1305_KEY_SIZE], data: &[u8]) -> [u8; 8] {
    let tag = Poly1305::new(mac_key.into()).compute_unpadded(data);
    let mut out = [0u8; 8];
    out.copy_from_slice(&tag[..8]);
    out
}

/// Encrypt and authenticate an outgoing packet in place
///
/// `packet` is the complete packet including the 27-byte outer header. The
/// MAC field is overwritten. Suites `None` and `AesGmacSiv` cannot be
/// armored here: trusted-path packets carry a path ID instead of a MAC and
/// GMAC-SIV is not yet wired into the send path.
pub fn armor(key: &SymmetricSecret, packet: &mut [u8], suite: CipherSuite) -> CryptoResult<()> {
    if packet.len() < ENCRYPTED_SECTION_START + 1 {
        return Err(CryptoError::BufferTooShort {
            need: ENCRYPTED_SECTION_START + 1,
            have: packet.len(),
        });
    }
    match suite {
        CipherSuite::Poly1305None => {
            let (_, mac_key) = packet_ciphers(key, packet);
            let mac = poly1305_mac64(&mac_key, &packet[ENCRYPTED_SECTION_START..]);
            packet[MAC_INDEX..MAC_INDEX + 8].copy_from_slice(&mac);
            Ok(())
        }
        CipherSuite::Poly1305Salsa2012 => {
            let (mut cipher, mac_key) = packet_ciphers(key, packet);
            cipher.apply_keystream(&mut packet[ENCRYPTED_SECTION_START..]);
            let mac = poly1305_mac64(&mac_key, &packet[ENCRYPTED_SECTION_START..]);
            packet[MAC_INDEX..MAC_INDEX + 8].copy_from_slice(&mac);
            Ok(())
        }
        other => Err(CryptoError::UnsupportedCipher(other as u8)),
    }
}

/// Authenticate and decrypt an incoming packet in place
///
/// The MAC is checked in constant time before any decryption output is
/// produced. Failure leaves the buffer contents unspecified.
pub fn dearmor(key: &SymmetricSecret, packet: &mut [u8], suite: CipherSuite) -> CryptoResult<()> {
    if packet.len() < ENCRYPTED_SECTION_START + 1 {
        return Err(CryptoError::BufferTooShort {
            need: ENCRYPTED_SECTION_START + 1,
            have: packet.len(),
        });
    }
    match suite {
        CipherSuite::Poly1305None => {
            let (_, mac_key) = packet_ciphers(key, packet);
            let mac = poly1305_mac64(&mac_key, &packet[ENCRYPTED_SECTION_START..]);
            if !secure_eq(&mac, &packet[MAC_INDEX..MAC_INDEX + 8]) {
                return Err(CryptoError::MacFailed);
            }
            Ok(())
        }
        CipherSuite::Poly1305Salsa2012 => {
            let (mut cipher, mac_key) = packet_ciphers(key, packet);
            let mac = poly1305_mac64(&mac_key, &packet[ENCRYPTED_SECTION_START..]);
            if !secure_eq(&mac, &packet[MAC_INDEX..MAC_INDEX + 8]) {
                return Err(CryptoError::MacFailed);
            }
            cipher.apply_keystream(&mut packet[ENCRYPTED_SECTION_START..]);
            Ok(())
        }
        other => Err(CryptoError::UnsupportedCipher(other as u8)),
    }
}

/// Constant-time equality for MACs and similar short secrets
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// HMAC-SHA384 one-shot
pub fn hmac_sha384(key: &[u8], data: &[u8]) -> [u8; HMAC_SHA384_SIZE] {
    let mut mac = <Hmac<Sha384> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; HMAC_SHA384_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Derive the HELLO transcript HMAC key from the identity key
///
/// `iteration` is 0 for HELLO and 1 for OK(HELLO), so request and reply
/// transcripts are keyed apart.
pub fn hello_hmac_key(key: &SymmetricSecret, iteration: u8) -> [u8; HMAC_SHA384_SIZE] {
    hmac_sha384(key.as_bytes(), &[b'H', iteration])
}

/// Encrypt or decrypt a HELLO metadata section in place
///
/// AES-256-CTR keyed with the identity key's cipher half; the IV is the
/// first 12 outer-header bytes followed by a zero counter. Applying the
/// function twice restores the input.
pub fn crypt_hello_metadata(key: &SymmetricSecret, header: &[u8], data: &mut [u8]) -> CryptoResult<()> {
    if header.len() < 12 {
        return Err(CryptoError::BufferTooShort {
            need: 12,
            have: header.len(),
        });
    }
    let mut aes_key = [0u8; 32];
    aes_key.copy_from_slice(key.cipher_key());
    let mut iv = [0u8; 16];
    iv[..12].copy_from_slice(&header[..12]);
    let mut cipher = Aes256Ctr::new(&aes_key.into(), &iv.into());
    cipher.apply_keystream(data);
    Ok(())
}
