//! ChaCha20-Poly1305 secret box
//!
//! Token format: URL-safe Base64 (no padding) of `nonce[12] || ciphertext || tag[16]`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{SecretsError, SecretsService};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Produces the 256-bit key the secret box encrypts with.
///
/// Injected at construction so the key never lives in ambient global state.
pub trait KeyDerivation: Send + Sync {
    fn derive_key(&self) -> Zeroizing<[u8; 32]>;
}

/// Derives the key as SHA-256 of a process-wide secret string
pub struct Sha256KeyDerivation {
    secret: Zeroizing<String>,
}

impl Sha256KeyDerivation {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }
}

impl KeyDerivation for Sha256KeyDerivation {
    fn derive_key(&self) -> Zeroizing<[u8; 32]> {
        let digest = Sha256::digest(self.secret.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);
        key
    }
}

/// Secrets Service backed by ChaCha20-Poly1305
pub struct SecretBox {
    key: Zeroizing<[u8; 32]>,
}

impl SecretBox {
    pub fn new(kdf: &dyn KeyDerivation) -> Self {
        Self {
            key: kdf.derive_key(),
        }
    }

    /// Shorthand for a box keyed by `SHA-256(secret)`
    pub fn from_secret(secret: &str) -> Self {
        Self::new(&Sha256KeyDerivation::new(secret))
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, SecretsError> {
        ChaCha20Poly1305::new_from_slice(&*self.key).map_err(|_| SecretsError::EncryptionFailed)
    }
}

impl SecretsService for SecretBox {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| SecretsError::EncryptionFailed)?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>, SecretsError> {
        let raw = URL_SAFE_NO_PAD
            .decode(ciphertext.trim())
            .map_err(|_| SecretsError::InvalidEncoding)?;

        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(SecretsError::Truncated);
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .map_err(|_| SecretsError::DecryptionFailed)?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SecretsError::DecryptionFailed)?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|_| SecretsError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_is_stable() {
        let a = Sha256KeyDerivation::new("WSTestSecretKey").derive_key();
        let b = Sha256KeyDerivation::new("WSTestSecretKey").derive_key();
        let c = Sha256KeyDerivation::new("other").derive_key();

        assert_eq!(&*a, &*b);
        assert_ne!(&*a, &*c);
    }

    #[test]
    fn test_encrypt_decrypt() {
        let sbox = SecretBox::from_secret("WSTestSecretKey");
        let token = sbox.encrypt("hunter2").unwrap();

        assert_ne!(token, "hunter2");
        assert_eq!(sbox.decrypt(&token).unwrap().as_str(), "hunter2");
    }

    #[test]
    fn test_nonce_is_random() {
        let sbox = SecretBox::from_secret("k");
        assert_ne!(sbox.encrypt("same").unwrap(), sbox.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let token = SecretBox::from_secret("right").encrypt("secret").unwrap();
        let result = SecretBox::from_secret("wrong").decrypt(&token);
        assert!(matches!(result, Err(SecretsError::DecryptionFailed)));
    }

    #[test]
    fn test_tamper_detection() {
        let sbox = SecretBox::from_secret("k");
        let token = sbox.encrypt("secret").unwrap();

        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = URL_SAFE_NO_PAD.encode(raw);

        assert!(matches!(
            sbox.decrypt(&tampered),
            Err(SecretsError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_malformed_input() {
        let sbox = SecretBox::from_secret("k");
        assert!(matches!(
            sbox.decrypt("not base64 !!"),
            Err(SecretsError::InvalidEncoding)
        ));
        assert!(matches!(
            sbox.decrypt(&URL_SAFE_NO_PAD.encode([0u8; 8])),
            Err(SecretsError::Truncated)
        ));
    }
}
