//! Crypto: RSA identity keypair, per-peer symmetric keys, key wrapping and content encryption.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::protocol::PUBLIC_KEY_LEN;

/// Modulus size of identity keys. Its PKCS#1 DER encoding fits the 160-byte wire field.
pub const RSA_BITS: usize = 1024;

/// Symmetric session key length (XChaCha20-Poly1305).
pub const SYMMETRIC_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 24;

/// Public key as carried on the wire: PKCS#1 DER, zero-padded to 160 bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Create a `PublicKey` from the raw wire field. Not validated until used.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        PublicKey(bytes)
    }

    fn from_rsa(key: &RsaPublicKey) -> Result<Self, CryptoError> {
        let der = key
            .to_pkcs1_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        let der = der.as_bytes();
        if der.len() > PUBLIC_KEY_LEN {
            return Err(CryptoError::KeyEncoding(format!(
                "public key encodes to {} bytes",
                der.len()
            )));
        }
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out[..der.len()].copy_from_slice(der);
        Ok(PublicKey(out))
    }

    fn to_rsa(&self) -> Result<RsaPublicKey, CryptoError> {
        let len = der_len(&self.0).ok_or(CryptoError::InvalidPublicKey)?;
        RsaPublicKey::from_pkcs1_der(&self.0[..len]).map_err(|_| CryptoError::InvalidPublicKey)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:02x?}..)", &self.0[..8])
    }
}

/// Total length (header + content) of the DER SEQUENCE at the start of `bytes`.
fn der_len(bytes: &[u8]) -> Option<usize> {
    if *bytes.first()? != 0x30 {
        return None;
    }
    let first = *bytes.get(1)? as usize;
    let (header, content) = match first {
        n if n < 0x80 => (2, n),
        0x81 => (3, *bytes.get(2)? as usize),
        0x82 => (4, (*bytes.get(2)? as usize) << 8 | *bytes.get(3)? as usize),
        _ => return None,
    };
    let total = header + content;
    (total <= bytes.len()).then_some(total)
}

/// Per-peer shared secret used for message and file bodies.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SYMMETRIC_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        SymmetricKey(key)
    }

    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_LEN]) -> Self {
        SymmetricKey(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SYMMETRIC_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::KeySizeMismatch {
                expected: SYMMETRIC_KEY_LEN,
                got: bytes.len(),
            })?;
        Ok(SymmetricKey(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// RSA identity keypair. Keep the private half local; only the public key goes on the wire.
#[derive(Clone)]
pub struct Keypair {
    private: RsaPrivateKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh identity keypair. Done once, before registering.
    pub fn generate() -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_private(private)
    }

    /// Restore a keypair from its PKCS#1 DER private key.
    pub fn from_private_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private =
            RsaPrivateKey::from_pkcs1_der(der).map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public = PublicKey::from_rsa(&RsaPublicKey::from(&private))?;
        Ok(Self { private, public })
    }

    /// PKCS#1 DER of the private key, for the identity store.
    pub fn private_der(&self) -> Result<Vec<u8>, CryptoError> {
        let der = self
            .private
            .to_pkcs1_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(der.as_bytes().to_vec())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Generate the local identity keypair: wire public key plus private half.
pub fn generate_identity_keypair() -> Result<(PublicKey, Keypair), CryptoError> {
    let keypair = Keypair::generate()?;
    Ok((keypair.public_key().clone(), keypair))
}

/// Encrypt a symmetric key under a peer's public key (RSA-OAEP-SHA256).
pub fn wrap_symmetric_key(
    peer_public: &PublicKey,
    key: &SymmetricKey,
) -> Result<Vec<u8>, CryptoError> {
    peer_public
        .to_rsa()?
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| CryptoError::Wrap(e.to_string()))
}

/// Decrypt a wrapped symmetric key with our own private key. A plaintext of
/// the wrong length is a decryption failure like any other bad ciphertext.
pub fn unwrap_symmetric_key(own: &Keypair, wrapped: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let raw = own
        .private
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|_| CryptoError::Decryption)?;
    SymmetricKey::from_slice(&raw).map_err(|_| CryptoError::Decryption)
}

/// Content encryption: XChaCha20-Poly1305, output is nonce(24) || ciphertext+tag.
/// Nonce is random per call.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Content decryption. Fails if the body was tampered with or the key is wrong.
pub fn decrypt(key: &SymmetricKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_LEN {
        return Err(CryptoError::Decryption);
    }
    let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Key)?;
    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::Decryption)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("key encoding failed: {0}")]
    KeyEncoding(String),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid key")]
    Key,
    #[error("key size mismatch: expected {expected}, got {got}")]
    KeySizeMismatch { expected: usize, got: usize },
    #[error("key wrap failed: {0}")]
    Wrap(String),
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
}
