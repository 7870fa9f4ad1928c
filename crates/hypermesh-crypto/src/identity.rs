//! Node identities
//!
//! An identity is an asymmetric key set plus the 40-bit address derived from
//! it through a memory-hard work function. The work function makes bulk
//! generation of identities for a chosen address prefix expensive, which is
//! what lets a 40-bit address stand in for the full key set on the wire.
//!
//! Two kinds exist: `Curve25519` (an X25519 agreement key and an Ed25519
//! signing key) and `P384`, which adds a NIST P-384 ECDH and ECDSA pair and
//! combines both curves during agreement and signing.

use ed25519_dalek::{Signer as _, Verifier as _};
use hmac::{Hmac, Mac};
use p384::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;
use sha2::{Digest, Sha384};

use crate::constants::{
    ADDRESS_DERIVATION_MEMORY, ADDRESS_SIZE, ED25519_PUBKEY_SIZE, ED25519_SIGNATURE_SIZE,
    P384_POINT_SIZE, P384_SCALAR_SIZE, P384_SIGNATURE_SIZE, SHA384_SIZE, SYMMETRIC_KEY_SIZE,
    X25519_KEY_SIZE,
};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricSecret;

/// Acceptance predicate threshold for the address derivation digest
const WORK_THRESHOLD: u8 = 17;

/// A 40-bit node address, the low 40 bits of a u64
///
/// Zero and the `0xFF` most-significant-byte prefix are reserved and never
/// valid for a live node; the latter is claimed by the wire format's
/// fragment indicator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    /// The all-zero (nil) address
    pub const NIL: Address = Address(0);

    /// Construct from a u64, masking to 40 bits
    pub fn from_u64(v: u64) -> Self {
        Self(v & 0xff_ffff_ffff)
    }

    /// Read a 5-byte big-endian address from a slice
    pub fn from_bytes(b: &[u8]) -> CryptoResult<Self> {
        if b.len() < ADDRESS_SIZE {
            return Err(CryptoError::BufferTooShort {
                need: ADDRESS_SIZE,
                have: b.len(),
            });
        }
        Ok(Self(
            ((b[0] as u64) << 32)
                | ((b[1] as u64) << 24)
                | ((b[2] as u64) << 16)
                | ((b[3] as u64) << 8)
                | (b[4] as u64),
        ))
    }

    /// The address as a u64 (high 24 bits zero)
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// The 5 big-endian wire bytes
    pub fn to_bytes(self) -> [u8; ADDRESS_SIZE] {
        [
            (self.0 >> 32) as u8,
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    /// True for addresses no live node may hold
    pub fn is_reserved(self) -> bool {
        self.0 == 0 || (self.0 >> 32) == 0xff
    }

    /// True if this is not the nil address
    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    /// Parse a 10-digit hex address
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        if s.len() != 10 {
            return Err(CryptoError::MalformedObject("address hex length"));
        }
        u64::from_str_radix(s, 16)
            .map(Self::from_u64)
            .map_err(|_| CryptoError::MalformedObject("address hex digits"))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({:010x})", self.0)
    }
}

/// Identity kind discriminator (also the wire tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdentityKind {
    /// X25519 + Ed25519
    Curve25519 = 0,
    /// X25519 + Ed25519 combined with P-384 ECDH + ECDSA
    P384 = 1,
}

impl IdentityKind {
    fn from_u8(v: u8) -> CryptoResult<Self> {
        match v {
            0 => Ok(Self::Curve25519),
            1 => Ok(Self::P384),
            _ => Err(CryptoError::MalformedObject("identity kind")),
        }
    }
}

/// A detached identity signature
///
/// 64 bytes for `Curve25519` identities; `P384` identities append a 96-byte
/// fixed ECDSA signature and verification requires both to pass.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Wrap raw signature bytes
    pub fn from_slice(b: &[u8]) -> CryptoResult<Self> {
        if b.len() != ED25519_SIGNATURE_SIZE
            && b.len() != ED25519_SIGNATURE_SIZE + P384_SIGNATURE_SIZE
        {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(Self(b.to_vec()))
    }

    /// Raw signature bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

struct P384Public {
    ecdh: p384::PublicKey,
    ecdsa: p384::ecdsa::VerifyingKey,
}

struct SecretHalf {
    x25519: x25519_dalek::StaticSecret,
    ed25519: ed25519_dalek::SigningKey,
    p384: Option<(p384::SecretKey, p384::ecdsa::SigningKey)>,
}

/// A node identity: public keys, derived address, optional secret half
pub struct Identity {
    kind: IdentityKind,
    address: Address,
    x25519: x25519_dalek::PublicKey,
    ed25519: ed25519_dalek::VerifyingKey,
    p384: Option<P384Public>,
    secret: Option<SecretHalf>,
    // Canonical public key blob (kind + raw public keys, no address). Equality,
    // hashing, fingerprints and address derivation all operate on this.
    key_blob: Vec<u8>,
}

impl Identity {
    /// Generate a new identity of the given kind
    ///
    /// Iterates fresh key material through the address derivation work
    /// function until the acceptance predicate passes and the resulting
    /// address is not reserved.
    pub fn generate(kind: IdentityKind) -> Self {
        loop {
            let secret = SecretHalf {
                x25519: x25519_dalek::StaticSecret::random_from_rng(OsRng),
                ed25519: ed25519_dalek::SigningKey::generate(&mut OsRng),
                p384: match kind {
                    IdentityKind::Curve25519 => None,
                    IdentityKind::P384 => {
                        let ecdh = p384::SecretKey::random(&mut OsRng);
                        let ecdsa = p384::ecdsa::SigningKey::random(&mut OsRng);
                        Some((ecdh, ecdsa))
                    }
                },
            };
            let x25519 = x25519_dalek::PublicKey::from(&secret.x25519);
            let ed25519 = secret.ed25519.verifying_key();
            let p384 = secret.p384.as_ref().map(|(ecdh, ecdsa)| P384Public {
                ecdh: ecdh.public_key(),
                ecdsa: *ecdsa.verifying_key(),
            });
            let key_blob = build_key_blob(kind, &x25519, &ed25519, p384.as_ref());
            if let Some(address) = derive_address(&key_blob) {
                return Self {
                    kind,
                    address,
                    x25519,
                    ed25519,
                    p384,
                    secret: Some(secret),
                    key_blob,
                };
            }
        }
    }

    /// This identity's kind
    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    /// This identity's 40-bit address
    pub fn address(&self) -> Address {
        self.address
    }

    /// True if the secret half is present
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// SHA-384 of the public key blob, the hash half of a fingerprint
    pub fn key_hash(&self) -> [u8; SHA384_SIZE] {
        let mut out = [0u8; SHA384_SIZE];
        out.copy_from_slice(&Sha384::digest(&self.key_blob));
        out
    }

    /// Recompute address derivation and check it against the claimed address
    pub fn locally_validate(&self) -> bool {
        derive_address(&self.key_blob) == Some(self.address)
    }

    /// Agree on the permanent 48-byte shared secret with another identity
    ///
    /// X25519 scalar multiplication, concatenated with P-384 ECDH when both
    /// identities are of kind `P384`, hashed with SHA-384. The result is the
    /// same regardless of which side computes it.
    pub fn agree(&self, other: &Identity) -> CryptoResult<SymmetricSecret> {
        let secret = self.secret.as_ref().ok_or(CryptoError::MissingSecretKey)?;
        let c25519 = secret.x25519.diffie_hellman(&other.x25519);

        let mut h = Sha384::new();
        h.update(c25519.as_bytes());
        if let (Some((ecdh, _)), Some(their)) = (secret.p384.as_ref(), other.p384.as_ref()) {
            let shared = p384::ecdh::diffie_hellman(ecdh.to_nonzero_scalar(), their.ecdh.as_affine());
            h.update(shared.raw_secret_bytes());
        }

        let mut out = [0u8; SYMMETRIC_KEY_SIZE];
        out.copy_from_slice(&h.finalize());
        Ok(SymmetricSecret::from_bytes(out))
    }

    /// Sign a message with this identity's secret keys
    pub fn sign(&self, message: &[u8]) -> CryptoResult<Signature> {
        let secret = self.secret.as_ref().ok_or(CryptoError::MissingSecretKey)?;
        let mut bytes = secret.ed25519.sign(message).to_bytes().to_vec();
        if let Some((_, ecdsa)) = secret.p384.as_ref() {
            use p384::ecdsa::signature::Signer;
            let sig: p384::ecdsa::Signature = ecdsa.sign(message);
            bytes.extend_from_slice(sig.to_bytes().as_slice());
        }
        Ok(Signature(bytes))
    }

    /// Verify a signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let sig = signature.as_bytes();
        if sig.len() < ED25519_SIGNATURE_SIZE {
            return false;
        }
        let (ed, rest) = sig.split_at(ED25519_SIGNATURE_SIZE);
        let ed_sig = match ed25519_dalek::Signature::from_slice(ed) {
            Ok(s) => s,
            Err(_) => return false,
        };
        if self.ed25519.verify(message, &ed_sig).is_err() {
            return false;
        }
        match self.p384.as_ref() {
            None => rest.is_empty(),
            Some(p) => {
                use p384::ecdsa::signature::Verifier;
                if rest.len() != P384_SIGNATURE_SIZE {
                    return false;
                }
                match p384::ecdsa::Signature::from_slice(rest) {
                    Ok(s) => p.ecdsa.verify(message, &s).is_ok(),
                    Err(_) => false,
                }
            }
        }
    }

    /// Marshaled size of this identity with or without its secret half
    pub fn marshal_len(&self, include_secret: bool) -> usize {
        let secret_len = if include_secret && self.secret.is_some() {
            self.secret_blob_len()
        } else {
            0
        };
        ADDRESS_SIZE + self.key_blob.len() + 1 + secret_len
    }

    fn secret_blob_len(&self) -> usize {
        match self.kind {
            IdentityKind::Curve25519 => X25519_KEY_SIZE + 32,
            IdentityKind::P384 => X25519_KEY_SIZE + 32 + P384_SCALAR_SIZE * 2,
        }
    }

    /// Marshal: `[5 address][1 kind][public keys][1 secret len][secret keys]`
    pub fn marshal(&self, include_secret: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.marshal_len(include_secret));
        out.extend_from_slice(&self.address.to_bytes());
        out.extend_from_slice(&self.key_blob);
        match (include_secret, self.secret.as_ref()) {
            (true, Some(secret)) => {
                out.push(self.secret_blob_len() as u8);
                out.extend_from_slice(&secret.x25519.to_bytes());
                out.extend_from_slice(&secret.ed25519.to_bytes());
                if let Some((ecdh, ecdsa)) = secret.p384.as_ref() {
                    out.extend_from_slice(ecdh.to_bytes().as_slice());
                    out.extend_from_slice(ecdsa.to_bytes().as_slice());
                }
            }
            _ => out.push(0),
        }
        out
    }

    /// Unmarshal an identity, returning it and the bytes consumed
    ///
    /// The claimed address is not re-derived here; callers that admit remote
    /// identities must call [`Identity::locally_validate`].
    pub fn unmarshal(data: &[u8]) -> CryptoResult<(Self, usize)> {
        if data.len() < ADDRESS_SIZE + 1 {
            return Err(CryptoError::BufferTooShort {
                need: ADDRESS_SIZE + 1,
                have: data.len(),
            });
        }
        let address = Address::from_bytes(data)?;
        let mut p = ADDRESS_SIZE;
        let kind = IdentityKind::from_u8(data[p])?;
        let key_blob_len = key_blob_len(kind);
        if data.len() < p + key_blob_len + 1 {
            return Err(CryptoError::BufferTooShort {
                need: p + key_blob_len + 1,
                have: data.len(),
            });
        }
        let key_blob = data[p..p + key_blob_len].to_vec();
        p += key_blob_len;

        let (x25519, ed25519, p384) = parse_key_blob(kind, &key_blob)?;

        let secret_len = data[p] as usize;
        p += 1;
        let secret = if secret_len > 0 {
            if data.len() < p + secret_len {
                return Err(CryptoError::BufferTooShort {
                    need: p + secret_len,
                    have: data.len(),
                });
            }
            let sec = parse_secret_blob(kind, &data[p..p + secret_len])?;
            p += secret_len;
            Some(sec)
        } else {
            None
        };

        if address.is_reserved() {
            return Err(CryptoError::InvalidIdentity);
        }

        Ok((
            Self {
                kind,
                address,
                x25519,
                ed25519,
                p384,
                secret,
                key_blob,
            },
            p,
        ))
    }

    /// Render as `address:kind:pubhex[:sechex]` for the state store
    pub fn to_state_string(&self, include_secret: bool) -> String {
        let mut s = format!("{}:{}:{}", self.address, self.kind as u8, hex_encode(&self.key_blob[1..]));
        if include_secret {
            if let Some(secret) = self.secret.as_ref() {
                let mut sec = Vec::with_capacity(self.secret_blob_len());
                sec.extend_from_slice(&secret.x25519.to_bytes());
                sec.extend_from_slice(&secret.ed25519.to_bytes());
                if let Some((ecdh, ecdsa)) = secret.p384.as_ref() {
                    sec.extend_from_slice(ecdh.to_bytes().as_slice());
                    sec.extend_from_slice(ecdsa.to_bytes().as_slice());
                }
                s.push(':');
                s.push_str(&hex_encode(&sec));
            }
        }
        s
    }

    /// Parse the state-store string form
    pub fn from_state_string(s: &str) -> CryptoResult<Self> {
        let fields: Vec<&str> = s.trim().split(':').collect();
        if fields.len() < 3 {
            return Err(CryptoError::MalformedObject("identity string fields"));
        }
        let address = Address::from_hex(fields[0])?;
        let kind = IdentityKind::from_u8(
            fields[1]
                .parse::<u8>()
                .map_err(|_| CryptoError::MalformedObject("identity kind digit"))?,
        )?;
        let keys = hex_decode(fields[2])?;
        if keys.len() != key_blob_len(kind) - 1 {
            return Err(CryptoError::MalformedObject("identity key blob length"));
        }
        let mut key_blob = Vec::with_capacity(1 + keys.len());
        key_blob.push(kind as u8);
        key_blob.extend_from_slice(&keys);
        let (x25519, ed25519, p384) = parse_key_blob(kind, &key_blob)?;
        let secret = if fields.len() > 3 {
            Some(parse_secret_blob(kind, &hex_decode(fields[3])?)?)
        } else {
            None
        };
        if address.is_reserved() {
            return Err(CryptoError::InvalidIdentity);
        }
        Ok(Self {
            kind,
            address,
            x25519,
            ed25519,
            p384,
            secret,
            key_blob,
        })
    }

    /// Strip the secret half, leaving a public-only identity
    pub fn public_only(&self) -> Identity {
        Identity {
            kind: self.kind,
            address: self.address,
            x25519: self.x25519,
            ed25519: self.ed25519,
            p384: self.p384.as_ref().map(|p| P384Public {
                ecdh: p.ecdh,
                ecdsa: p.ecdsa,
            }),
            secret: None,
            key_blob: self.key_blob.clone(),
        }
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        let secret = self.secret.as_ref().map(|s| SecretHalf {
            x25519: s.x25519.clone(),
            ed25519: s.ed25519.clone(),
            p384: s.p384.clone(),
        });
        Identity {
            kind: self.kind,
            address: self.address,
            x25519: self.x25519,
            ed25519: self.ed25519,
            p384: self.p384.as_ref().map(|p| P384Public {
                ecdh: p.ecdh,
                ecdsa: p.ecdsa,
            }),
            secret,
            key_blob: self.key_blob.clone(),
        }
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        // Public key content, never pointer or secret-half identity.
        self.key_blob == other.key_blob
    }
}

impl Eq for Identity {}

impl std::hash::Hash for Identity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key_blob.hash(state);
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("has_secret", &self.has_secret())
            .finish()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_state_string(false))
    }
}

fn key_blob_len(kind: IdentityKind) -> usize {
    match kind {
        IdentityKind::Curve25519 => 1 + X25519_KEY_SIZE + ED25519_PUBKEY_SIZE,
        IdentityKind::P384 => 1 + X25519_KEY_SIZE + ED25519_PUBKEY_SIZE + P384_POINT_SIZE * 2,
    }
}

fn build_key_blob(
    kind: IdentityKind,
    x25519: &x25519_dalek::PublicKey,
    ed25519: &ed25519_dalek::VerifyingKey,
    p384: Option<&P384Public>,
) -> Vec<u8> {
    let mut blob = Vec::with_capacity(key_blob_len(kind));
    blob.push(kind as u8);
    blob.extend_from_slice(x25519.as_bytes());
    blob.extend_from_slice(ed25519.as_bytes());
    if let Some(p) = p384 {
        blob.extend_from_slice(p.ecdh.to_encoded_point(true).as_bytes());
        blob.extend_from_slice(p.ecdsa.to_encoded_point(true).as_bytes());
    }
    blob
}

fn parse_key_blob(
    kind: IdentityKind,
    blob: &[u8],
) -> CryptoResult<(
    x25519_dalek::PublicKey,
    ed25519_dalek::VerifyingKey,
    Option<P384Public>,
)> {
    if blob.len() != key_blob_len(kind) || blob[0] != kind as u8 {
        return Err(CryptoError::MalformedObject("identity key blob"));
    }
    let mut x = [0u8; X25519_KEY_SIZE];
    x.copy_from_slice(&blob[1..1 + X25519_KEY_SIZE]);
    let x25519 = x25519_dalek::PublicKey::from(x);

    let mut e = [0u8; ED25519_PUBKEY_SIZE];
    e.copy_from_slice(&blob[1 + X25519_KEY_SIZE..1 + X25519_KEY_SIZE + ED25519_PUBKEY_SIZE]);
    let ed25519 =
        ed25519_dalek::VerifyingKey::from_bytes(&e).map_err(|_| CryptoError::InvalidPublicKey)?;

    let p384 = match kind {
        IdentityKind::Curve25519 => None,
        IdentityKind::P384 => {
            let base = 1 + X25519_KEY_SIZE + ED25519_PUBKEY_SIZE;
            let ecdh = p384::PublicKey::from_sec1_bytes(&blob[base..base + P384_POINT_SIZE])
                .map_err(|_| CryptoError::InvalidPublicKey)?;
            let ecdsa = p384::ecdsa::VerifyingKey::from_sec1_bytes(
                &blob[base + P384_POINT_SIZE..base + P384_POINT_SIZE * 2],
            )
            .map_err(|_| CryptoError::InvalidPublicKey)?;
            Some(P384Public { ecdh, ecdsa })
        }
    };
    Ok((x25519, ed25519, p384))
}

fn parse_secret_blob(kind: IdentityKind, blob: &[u8]) -> CryptoResult<SecretHalf> {
    let expected = match kind {
        IdentityKind::Curve25519 => X25519_KEY_SIZE + 32,
        IdentityKind::P384 => X25519_KEY_SIZE + 32 + P384_SCALAR_SIZE * 2,
    };
    if blob.len() != expected {
        return Err(CryptoError::InvalidSecretKey);
    }
    let mut x = [0u8; X25519_KEY_SIZE];
    x.copy_from_slice(&blob[..X25519_KEY_SIZE]);
    let mut e = [0u8; 32];
    e.copy_from_slice(&blob[X25519_KEY_SIZE..X25519_KEY_SIZE + 32]);
    let p384 = match kind {
        IdentityKind::Curve25519 => None,
        IdentityKind::P384 => {
            let base = X25519_KEY_SIZE + 32;
            let ecdh = p384::SecretKey::from_slice(&blob[base..base + P384_SCALAR_SIZE])
                .map_err(|_| CryptoError::InvalidSecretKey)?;
            let ecdsa =
                p384::ecdsa::SigningKey::from_slice(&blob[base + P384_SCALAR_SIZE..])
                    .map_err(|_| CryptoError::InvalidSecretKey)?;
            Some((ecdh, ecdsa))
        }
    };
    Ok(SecretHalf {
        x25519: x25519_dalek::StaticSecret::from(x),
        ed25519: ed25519_dalek::SigningKey::from_bytes(&e),
        p384,
    })
}

/// The memory-hard address derivation work function
///
/// SHA-384 the key blob, use the digest to key a Salsa20/12 stream that fills
/// a 2 MiB work buffer, then HMAC-SHA384 the buffer under the same digest.
/// The acceptance predicate requires the first output byte to fall below the
/// work threshold; the address is the trailing 5 bytes of the output.
///
/// Returns `None` if the predicate fails or the address is reserved.
pub fn derive_address(key_blob: &[u8]) -> Option<Address> {
    let seed = Sha384::digest(key_blob);
    let mut key = [0u8; 32];
    key.copy_from_slice(&seed[..32]);
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&seed[32..40]);

    let mut genmem = vec![0u8; ADDRESS_DERIVATION_MEMORY];
    let mut cipher = Salsa12::new(&key.into(), &nonce.into());
    cipher.apply_keystream(&mut genmem);

    let mut mac = Hmac::<Sha384>::new_from_slice(&seed).expect("HMAC accepts any key length");
    mac.update(&genmem);
    let digest = mac.finalize().into_bytes();

    if digest[0] >= WORK_THRESHOLD {
        return None;
    }
    let address = Address::from_bytes(&digest[SHA384_SIZE - ADDRESS_SIZE..]).ok()?;
    if address.is_reserved() {
        return None;
    }
    Some(address)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> CryptoResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(CryptoError::MalformedObject("hex length"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| CryptoError::MalformedObject("hex digits"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_validate() {
        let id = Identity::generate(IdentityKind::Curve25519);
        assert!(id.address().is_set());
        assert!(!id.address().is_reserved());
        assert!(id.locally_validate());
    }

    #[test]
    fn test_tampered_identity_rejected() {
        let id = Identity::generate(IdentityKind::Curve25519);
        let mut data = id.marshal(false);
        // Flip a bit in the claimed address.
        data[2] ^= 0x01;
        let (forged, _) = Identity::unmarshal(&data).unwrap();
        assert!(!forged.locally_validate());
    }

    #[test]
    fn test_marshal_roundtrip_public() {
        let id = Identity::generate(IdentityKind::Curve25519);
        let data = id.marshal(false);
        assert_eq!(data.len(), id.marshal_len(false));
        let (back, consumed) = Identity::unmarshal(&data).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(id, back);
        assert!(!back.has_secret());
        assert_eq!(id.address(), back.address());
    }

    #[test]
    fn test_marshal_roundtrip_secret() {
        let id = Identity::generate(IdentityKind::Curve25519);
        let data = id.marshal(true);
        let (back, _) = Identity::unmarshal(&data).unwrap();
        assert!(back.has_secret());

        // The restored secret half must still produce the same agreements.
        let other = Identity::generate(IdentityKind::Curve25519);
        let k1 = id.agree(&other).unwrap();
        let k2 = back.agree(&other).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_state_string_roundtrip() {
        let id = Identity::generate(IdentityKind::Curve25519);
        let with_secret = Identity::from_state_string(&id.to_state_string(true)).unwrap();
        assert_eq!(id, with_secret);
        assert!(with_secret.has_secret());

        let public = Identity::from_state_string(&id.to_state_string(false)).unwrap();
        assert_eq!(id, public);
        assert!(!public.has_secret());
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let a = Identity::generate(IdentityKind::Curve25519);
        let b = Identity::generate(IdentityKind::Curve25519);
        assert_eq!(
            a.agree(&b).unwrap().as_bytes(),
            b.agree(&a).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_agreement_differs_per_pair() {
        let a = Identity::generate(IdentityKind::Curve25519);
        let b = Identity::generate(IdentityKind::Curve25519);
        let c = Identity::generate(IdentityKind::Curve25519);
        assert_ne!(
            a.agree(&b).unwrap().as_bytes(),
            a.agree(&c).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate(IdentityKind::Curve25519);
        let message = b"locator signing test";
        let sig = id.sign(message).unwrap();
        assert!(id.verify(message, &sig));
        assert!(!id.verify(b"different message", &sig));

        let public = id.public_only();
        assert!(public.verify(message, &sig));
        assert!(public.sign(message).is_err());
    }

    #[test]
    fn test_address_wire_roundtrip() {
        let a = Address::from_u64(0x0123_4567_89);
        assert_eq!(Address::from_bytes(&a.to_bytes()).unwrap(), a);
        assert_eq!(a.to_string(), "0123456789");
        assert_eq!(Address::from_hex("0123456789").unwrap(), a);
    }

    #[test]
    fn test_reserved_addresses() {
        assert!(Address::NIL.is_reserved());
        assert!(Address::from_u64(0xff00_0000_01).is_reserved());
        assert!(!Address::from_u64(0x1000_0000_01).is_reserved());
    }

    // P-384 hybrid identities are expensive to generate; one combined test
    // keeps the suite fast while covering the second kind end to end.
    #[test]
    fn test_p384_identity_end_to_end() {
        let a = Identity::generate(IdentityKind::P384);
        let b = Identity::generate(IdentityKind::P384);
        assert!(a.locally_validate());

        let data = a.marshal(true);
        let (back, _) = Identity::unmarshal(&data).unwrap();
        assert_eq!(a, back);

        assert_eq!(
            a.agree(&b).unwrap().as_bytes(),
            b.agree(&a).unwrap().as_bytes()
        );

        let sig = a.sign(b"hybrid").unwrap();
        assert_eq!(
            sig.as_bytes().len(),
            ED25519_SIGNATURE_SIZE + P384_SIGNATURE_SIZE
        );
        assert!(a.verify(b"hybrid", &sig));

        // A mixed-kind pair still agrees over the curve both sides share.
        let c = Identity::generate(IdentityKind::Curve25519);
        assert_eq!(
            a.agree(&c).unwrap().as_bytes(),
            c.agree(&a).unwrap().as_bytes()
        );
    }
}
