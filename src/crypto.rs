//! Encryption at rest
//!
//! The page store and the WAL only see the [`Cipher`] boundary. The shipped
//! implementation is AES-256-GCM from `ring`; every sealed buffer is laid out
//! as `nonce (12) | ciphertext | tag (16)`.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{AtlasError, Result};

/// Authenticated encrypt/decrypt primitive
pub trait Cipher: Send + Sync {
    /// Seal `plaintext`, returning ciphertext with nonce and tag attached
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Open a buffer produced by [`Cipher::encrypt`]
    ///
    /// Fails with `AuthenticationFailure` when the tag does not verify; it
    /// never returns altered plaintext.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Bytes added to every plaintext by `encrypt`
    fn overhead(&self) -> usize;
}

/// AES-256-GCM cipher with random 96-bit nonces
pub struct AesGcmCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmCipher {
    /// Size of the authentication tag
    pub const TAG_LEN: usize = 16;

    /// Create a cipher from a 256-bit key
    pub fn new(key: &[u8; 32]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| AtlasError::Config("invalid AES-256-GCM key".to_string()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| AtlasError::Config("failed to generate nonce".to_string()))?;

        let mut sealed = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| AtlasError::Serialization("encryption failed".to_string()))?;

        // Prepend nonce to ciphertext
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + Self::TAG_LEN {
            return Err(AtlasError::AuthenticationFailure(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| AtlasError::AuthenticationFailure("invalid nonce".to_string()))?;

        let mut buffer = sealed.to_vec();
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| AtlasError::AuthenticationFailure("tag mismatch".to_string()))?
            .len();

        buffer.truncate(plaintext_len);
        Ok(buffer)
    }

    fn overhead(&self) -> usize {
        NONCE_LEN + Self::TAG_LEN
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesGcmCipher")
    }
}
