//! Transport Encryption
//!
//! The engine only needs an authenticated-encryption capability, expressed as
//! the [`Cipher`] trait. The shipped implementation is AES-256-GCM keyed by
//! an X25519 key agreement, with the key derived as `SHA-256(shared secret)`.
//!
//! # Sealed Format
//!
//! ```text
//! +--------------+--------------------------------+
//! | Nonce (12)   | Ciphertext + GCM tag (16)      |
//! +--------------+--------------------------------+
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Nonce length for AES-GCM
pub const NONCE_SIZE: usize = 12;

/// Authentication tag length for AES-GCM
pub const TAG_SIZE: usize = 16;

/// Bytes a sealed payload grows by
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Length of an X25519 public key on the wire
pub const PUBLIC_KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material")]
    InvalidKey,

    #[error("encryption failed")]
    SealFailed,

    #[error("decryption failed")]
    OpenFailed,

    #[error("ciphertext too short: {0} bytes")]
    Truncated(usize),
}

/// Authenticated encryption bound to one negotiated session
pub trait Cipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// AES-256-GCM session cipher with a random nonce per message
pub struct AesGcmCipher {
    aead: Aes256Gcm,
}

impl AesGcmCipher {
    /// Derive the session key from a raw shared secret
    pub fn from_shared_secret(secret: &[u8]) -> Result<Self, CryptoError> {
        let key = Sha256::digest(secret);
        let aead = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { aead })
    }
}

impl Cipher for AesGcmCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::SealFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::OpenFailed)
    }
}

/// One side of an X25519 key agreement
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Combine with the peer's public key into a session cipher
    pub fn complete(self, peer: [u8; PUBLIC_KEY_SIZE]) -> Result<AesGcmCipher, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey);
        }
        AesGcmCipher::from_shared_secret(shared.as_bytes())
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}
