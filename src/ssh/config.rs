//! SSH Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConnectionError;

/// Private key algorithms accepted for public key authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
    Ed25519,
}

impl KeyAlgorithm {
    /// Parse a stored key type tag ("RSA", "ECDSA", "Ed25519", "ed25519", ...)
    pub fn parse(tag: &str) -> Result<Self, ConnectionError> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "rsa" | "ssh-rsa" => Ok(KeyAlgorithm::Rsa),
            "ecdsa" | "ecdsa-sha2-nistp256" | "ecdsa-sha2-nistp384" | "ecdsa-sha2-nistp521" => {
                Ok(KeyAlgorithm::Ecdsa)
            }
            "ed25519" | "ssh-ed25519" => Ok(KeyAlgorithm::Ed25519),
            _ => Err(ConnectionError::UnsupportedKeyType(tag.to_string())),
        }
    }

    /// Whether an SSH algorithm name (as reported by a decoded key) belongs
    /// to this family
    pub fn matches(&self, algorithm_name: &str) -> bool {
        match self {
            KeyAlgorithm::Rsa => algorithm_name == "ssh-rsa" || algorithm_name.starts_with("rsa-sha2-"),
            KeyAlgorithm::Ecdsa => algorithm_name.starts_with("ecdsa-sha2-"),
            KeyAlgorithm::Ed25519 => algorithm_name == "ssh-ed25519",
        }
    }
}

/// Pseudo-terminal size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalGeometry {
    /// Terminal columns
    #[serde(default = "default_cols")]
    pub cols: u32,

    /// Terminal rows
    #[serde(default = "default_rows")]
    pub rows: u32,
}

impl TerminalGeometry {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    /// Replace zero dimensions with the defaults
    pub fn normalized(self) -> Self {
        Self {
            cols: if self.cols == 0 { default_cols() } else { self.cols },
            rows: if self.rows == 0 { default_rows() } else { self.rows },
        }
    }
}

impl Default for TerminalGeometry {
    fn default() -> Self {
        Self {
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

/// Connector settings shared by every session
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Bounds the whole handshake: TCP connect, key exchange, auth, shell
    pub timeout: Duration,

    /// TERM value requested for the PTY
    pub term: String,

    /// Reject remembered hosts whose key changed.
    /// Unknown hosts are always trusted on first use.
    pub strict_host_key_checking: bool,

    /// SSH-level keepalive
    pub keepalive_interval: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            term: "xterm".to_string(),
            strict_host_key_checking: false,
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }
}
