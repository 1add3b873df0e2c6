//! Session error taxonomy and its mapping to WebSocket close frames

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use super::protocol::close_frame;
use crate::access::AccessError;
use crate::credentials::CredentialError;
use crate::ssh::ConnectionError;

/// The first client frame never produced a usable geometry
#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("No terminal size received in time")]
    Timeout,

    #[error("Malformed terminal size: {0}")]
    Malformed(String),

    #[error("Client disconnected before sending terminal size")]
    Disconnected,
}

/// Browser-side transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket send timed out")]
    SendTimeout,

    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,
}

/// Remote-side failures while streaming
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Remote read failed: {0}")]
    RemoteRead(#[source] io::Error),

    #[error("Remote write failed: {0}")]
    RemoteWrite(#[source] io::Error),
}

/// Failures before streaming starts. Mid-stream failures end the bridge
/// as a [`DisconnectReason`](super::terminal::DisconnectReason) instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Too many active sessions (limit {limit})")]
    RegistryFull { limit: usize },

    #[error("Session cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn close_code(&self) -> CloseCode {
        match self {
            SessionError::Access(_) | SessionError::Geometry(_) => CloseCode::Policy,
            SessionError::Credential(_) | SessionError::Connection(_) => CloseCode::Error,
            SessionError::RegistryFull { .. } => CloseCode::Again,
            SessionError::Cancelled => CloseCode::Away,
        }
    }

    /// Reason text shown to the browser. Internal details stay in the logs.
    pub fn close_reason(&self) -> String {
        match self {
            SessionError::Access(e) => e.to_string(),
            SessionError::Credential(_) => "Failed to load credentials".to_string(),
            SessionError::Geometry(_) => "No term size".to_string(),
            SessionError::Connection(e) => e.close_reason(),
            SessionError::RegistryFull { .. } => "Too many active sessions".to_string(),
            SessionError::Cancelled => "Session terminated".to_string(),
        }
    }

    pub fn close_frame(&self) -> CloseFrame<'static> {
        close_frame(self.close_code(), &self.close_reason())
    }
}
