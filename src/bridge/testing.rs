//! Test doubles: scripted remote shells, connectors and in-memory WebSockets

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Condvar, Mutex};
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::credentials::CredentialBundle;
use crate::ssh::{
    ConnectionError, RemoteConnector, RemoteHandle, RemoteReader, RemoteWriter, TerminalGeometry,
};

/// Server and client ends of an in-memory WebSocket
pub(crate) async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
    (server, client)
}

/// Collect binary payloads until the server's close frame, then finish the
/// close handshake
pub(crate) async fn read_until_close(
    client: &mut WebSocketStream<DuplexStream>,
) -> (Vec<u8>, Option<CloseFrame<'static>>) {
    let mut received = Vec::new();
    let mut close = None;

    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => received.extend_from_slice(&data),
            Ok(Some(Ok(Message::Close(frame)))) => {
                close = frame.map(CloseFrame::into_owned);
                break;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) | Err(_) => break,
        }
    }

    // Polling again sends our close reply
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(Ok(_)) = client.next().await {}
    })
    .await;

    (received, close)
}

#[derive(Default)]
struct ShellState {
    output: VecDeque<Vec<u8>>,
    eof: bool,
    channel_closed: bool,
    client_closed: bool,
    /// Reader ignores channel close until released
    stubborn: bool,
    fail_writes: bool,
    /// Writes never complete, like a shell that stopped reading stdin
    stall_writes: bool,
    stalled_writes: usize,
    input: Vec<u8>,
    resizes: Vec<TerminalGeometry>,
}

struct Shared {
    state: Mutex<ShellState>,
    cond: Condvar,
}

/// Scripted remote shell. Clones share the same state.
#[derive(Clone)]
pub(crate) struct FakeShell {
    shared: Arc<Shared>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ShellState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn stubborn() -> Self {
        let shell = Self::new();
        shell.shared.state.lock().stubborn = true;
        shell
    }

    fn update(&self, f: impl FnOnce(&mut ShellState)) {
        f(&mut self.shared.state.lock());
        self.shared.cond.notify_all();
    }

    pub fn emit(&self, data: &[u8]) {
        let data = data.to_vec();
        self.update(|s| s.output.push_back(data));
    }

    /// Remote side ends the shell
    pub fn finish(&self) {
        self.update(|s| s.eof = true);
    }

    pub fn release(&self) {
        self.update(|s| s.stubborn = false);
    }

    pub fn fail_writes(&self) {
        self.update(|s| s.fail_writes = true);
    }

    pub fn stall_writes(&self) {
        self.update(|s| s.stall_writes = true);
    }

    pub fn stalled_writes(&self) -> usize {
        self.shared.state.lock().stalled_writes
    }

    pub fn input(&self) -> Vec<u8> {
        self.shared.state.lock().input.clone()
    }

    pub fn resizes(&self) -> Vec<TerminalGeometry> {
        self.shared.state.lock().resizes.clone()
    }

    pub fn is_closed(&self) -> bool {
        let s = self.shared.state.lock();
        s.channel_closed && s.client_closed
    }

    pub fn remote_handle(&self) -> RemoteHandle {
        RemoteHandle::new(
            Box::new(FakeReader {
                shared: self.shared.clone(),
            }),
            Box::new(FakeWriter {
                shell: self.clone(),
            }),
        )
    }
}

struct FakeReader {
    shared: Arc<Shared>,
}

impl RemoteReader for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut s = self.shared.state.lock();
        loop {
            if let Some(mut chunk) = s.output.pop_front() {
                let n = buf.len().min(chunk.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    s.output.push_front(chunk.split_off(n));
                }
                return Ok(n);
            }
            let stopped = s.eof || (s.channel_closed && !s.stubborn);
            if stopped {
                return Ok(0);
            }
            self.shared.cond.wait(&mut s);
        }
    }
}

struct FakeWriter {
    shell: FakeShell,
}

#[async_trait]
impl RemoteWriter for FakeWriter {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let stalled = {
            let mut s = self.shell.shared.state.lock();
            if s.fail_writes || s.channel_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
            }
            if s.stall_writes {
                s.stalled_writes += 1;
                true
            } else {
                s.input.extend_from_slice(data);
                false
            }
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn resize(&mut self, geometry: TerminalGeometry) -> io::Result<()> {
        self.shell.update(|s| s.resizes.push(geometry));
        Ok(())
    }

    async fn shutdown_channel(&mut self) -> io::Result<()> {
        self.shell.update(|s| s.channel_closed = true);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.shell.update(|s| {
            s.channel_closed = true;
            s.client_closed = true;
        });
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shell.is_closed()
    }
}

/// Connector handing out one scripted shell, or a scripted failure
pub(crate) struct FakeConnector {
    shell: FakeShell,
    failure: Option<fn() -> ConnectionError>,
    attempts: AtomicUsize,
    geometries: Mutex<Vec<TerminalGeometry>>,
    usernames: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(shell: FakeShell) -> Self {
        Self {
            shell,
            failure: None,
            attempts: AtomicUsize::new(0),
            geometries: Mutex::new(Vec::new()),
            usernames: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(failure: fn() -> ConnectionError) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(FakeShell::new())
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn geometries(&self) -> Vec<TerminalGeometry> {
        self.geometries.lock().clone()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.usernames.lock().clone()
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        credentials: CredentialBundle,
        geometry: TerminalGeometry,
    ) -> Result<RemoteHandle, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.geometries.lock().push(geometry);
        self.usernames.lock().push(credentials.username.clone());

        match self.failure {
            Some(failure) => Err(failure()),
            None => Ok(self.shell.remote_handle()),
        }
    }
}
