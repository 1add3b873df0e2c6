//! Secrets Service
//!
//! At-rest encryption for target credentials (password, private key,
//! passphrase). The terminal bridge only ever decrypts; `encrypt` exists for
//! provisioning tools and tests.

mod crypto;

pub use crypto::{KeyDerivation, SecretBox, Sha256KeyDerivation};

use zeroize::Zeroizing;

/// Secrets errors
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("Ciphertext is not valid base64")]
    InvalidEncoding,

    #[error("Ciphertext too short")]
    Truncated,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    #[error("Decrypted secret is not valid UTF-8")]
    InvalidUtf8,
}

/// Symmetric encryption of stored secrets.
///
/// Implementations are pure transforms over their input and must be safe to
/// share across sessions.
pub trait SecretsService: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError>;

    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>, SecretsError>;
}
