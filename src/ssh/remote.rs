//! Remote shell seam
//!
//! An open shell is split into two halves owned by different units of the
//! bridge:
//!
//! - [`RemoteReader`] is driven from a blocking thread (`spawn_blocking`)
//!   and returns `Ok(0)` at end of stream.
//! - [`RemoteWriter`] stays on the bridge's main task; it forwards input,
//!   resizes the PTY and tears the connection down.
//!
//! Closing the channel through the writer must unblock a reader that is
//! parked in `read`.

use std::io;

use async_trait::async_trait;

use super::config::TerminalGeometry;
use super::error::ConnectionError;
use crate::credentials::CredentialBundle;

/// Blocking read half of a remote shell
pub trait RemoteReader: Send + 'static {
    /// Read up to `buf.len()` bytes, blocking until data, EOF or error
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write/control half of a remote shell
#[async_trait]
pub trait RemoteWriter: Send {
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    async fn resize(&mut self, geometry: TerminalGeometry) -> io::Result<()>;

    /// Close the shell channel. Idempotent. A reader blocked in `read`
    /// returns once this completes.
    async fn shutdown_channel(&mut self) -> io::Result<()>;

    /// Close the channel (if still open), then the client connection
    async fn close(&mut self) -> io::Result<()>;

    fn is_closed(&self) -> bool;
}

/// An open remote shell, ready to stream
pub struct RemoteHandle {
    pub reader: Box<dyn RemoteReader>,
    pub writer: Box<dyn RemoteWriter>,
}

impl RemoteHandle {
    pub fn new(reader: Box<dyn RemoteReader>, writer: Box<dyn RemoteWriter>) -> Self {
        Self { reader, writer }
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("closed", &self.writer.is_closed())
            .finish()
    }
}

/// Opens remote shells. The credential bundle is consumed by the attempt.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: CredentialBundle,
        geometry: TerminalGeometry,
    ) -> Result<RemoteHandle, ConnectionError>;
}
