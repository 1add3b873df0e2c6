//! SSH connection errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("No password or private key configured")]
    NoCredentials,

    #[error("Connection timed out after {0}s")]
    Timeout(u64),

    #[error("Authentication rejected by server")]
    AuthRejected,

    #[error("Host unreachable: {0}")]
    Unreachable(String),

    #[error("Host key for {host} changed (expected {expected}, got {actual})")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),
}

impl ConnectionError {
    /// Close reason sent to the browser when the connect attempt fails
    pub fn close_reason(&self) -> String {
        match self {
            ConnectionError::Timeout(_) => "SSH connection failed: timeout".to_string(),
            ConnectionError::AuthRejected => {
                "SSH connection failed: authentication rejected".to_string()
            }
            ConnectionError::UnsupportedKeyType(_) => {
                "SSH connection failed: unsupported key type".to_string()
            }
            ConnectionError::InvalidKey(_) => "SSH connection failed: invalid key".to_string(),
            ConnectionError::NoCredentials => {
                "SSH connection failed: no credentials configured".to_string()
            }
            ConnectionError::Unreachable(_) => "SSH connection failed: host unreachable".to_string(),
            ConnectionError::HostKeyMismatch { .. } => {
                "SSH connection failed: host key changed".to_string()
            }
            ConnectionError::Channel(_) | ConnectionError::Protocol(_) => {
                "SSH connection failed".to_string()
            }
        }
    }
}

impl From<russh::Error> for ConnectionError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => ConnectionError::Unreachable(e.to_string()),
            other => ConnectionError::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for ConnectionError {
    fn from(err: russh::keys::Error) -> Self {
        ConnectionError::InvalidKey(err.to_string())
    }
}
