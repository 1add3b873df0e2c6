//! Terminal Bridge
//!
//! Pumps bytes between one browser WebSocket and one remote shell until
//! either side goes away.
//!
//! Three units run per session:
//!
//! ```text
//!   remote reader (spawn_blocking) ──▶ relay queue (bounded) ──▶ relay writer task ──▶ WS sink
//!   WS stream ──▶ main task ──▶ remote writer (input, resize)
//! ```
//!
//! Teardown is asymmetric. The relay writer and the main loop observe the
//! session's cancellation token. The reader may be parked in a blocking
//! read, so draining also closes the remote channel and joins the reader
//! with a bounded timeout.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{StreamError, TransportError};
use super::protocol::{close_frame, parse_resize};
use crate::ssh::{RemoteHandle, RemoteReader, RemoteWriter};

/// Time allowed for the peer to answer our close frame
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Connecting,
    Streaming,
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Relay queue capacity, in chunks
    pub relay_capacity: usize,
    /// Largest single read from the remote
    pub chunk_size: usize,
    /// How long draining waits for the remote reader
    pub reader_join_timeout: Duration,
    /// Per-frame send timeout towards the browser
    pub send_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            relay_capacity: 100,
            chunk_size: 1024,
            reader_join_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// What ended the Streaming phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Close frame, end of stream
    ClientClosed,
    /// Remote EOF, everything read was delivered
    RemoteClosed,
    RemoteError(String),
    TransportError(String),
    /// Supervisor-issued (logout, shutdown)
    Cancelled,
}

impl DisconnectReason {
    fn close_frame(&self) -> CloseFrame<'static> {
        match self {
            DisconnectReason::Cancelled => close_frame(CloseCode::Away, "Session terminated"),
            _ => close_frame(CloseCode::Normal, ""),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientClosed => write!(f, "client closed"),
            DisconnectReason::RemoteClosed => write!(f, "remote closed"),
            DisconnectReason::RemoteError(e) => write!(f, "remote error: {}", e),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {}", e),
            DisconnectReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one bridge run
#[derive(Debug, Clone)]
pub struct BridgeReport {
    pub session_id: Uuid,
    pub reason: DisconnectReason,
    pub transitions: Vec<BridgeState>,
    pub bytes_to_client: u64,
    pub bytes_from_remote: u64,
    pub bytes_to_remote: u64,
    pub resizes: u32,
    /// The reader finished within the join timeout
    pub reader_joined: bool,
    pub remote_closed: bool,
    /// The WebSocket was released, with or without a close handshake
    pub transport_closed: bool,
    /// Our close frame reached the transport
    pub close_frame_sent: bool,
}

struct StateTracker<'a> {
    tx: &'a watch::Sender<BridgeState>,
    transitions: Vec<BridgeState>,
}

impl<'a> StateTracker<'a> {
    fn new(tx: &'a watch::Sender<BridgeState>) -> Self {
        Self {
            tx,
            transitions: Vec::with_capacity(3),
        }
    }

    fn enter(&mut self, state: BridgeState) {
        self.transitions.push(state);
        self.tx.send_replace(state);
    }
}

struct ReaderOutcome {
    bytes: u64,
    error: Option<StreamError>,
}

struct RelayOutcome<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    bytes: u64,
    result: Result<(), TransportError>,
}

/// Remote reader unit: blocking reads into the relay queue
fn pump_remote(
    mut reader: Box<dyn RemoteReader>,
    relay_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    chunk_size: usize,
) -> ReaderOutcome {
    let mut buf = vec![0u8; chunk_size];
    let mut bytes = 0u64;

    loop {
        if cancel.is_cancelled() {
            return ReaderOutcome { bytes, error: None };
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => return ReaderOutcome { bytes, error: None },
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return ReaderOutcome {
                    bytes,
                    error: Some(StreamError::RemoteRead(e)),
                }
            }
        };

        // Blocks while the queue is full; fails once the relay writer is gone
        if relay_tx
            .blocking_send(Bytes::copy_from_slice(&buf[..n]))
            .is_err()
        {
            return ReaderOutcome { bytes, error: None };
        }
        bytes += n as u64;
    }
}

/// Relay writer unit: drains the queue, in order, into the WebSocket
async fn relay_to_client<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut relay_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    send_timeout: Duration,
) -> RelayOutcome<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut bytes = 0u64;

    let result = loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            chunk = relay_rx.recv() => chunk,
        };

        // Queue closed and empty: the reader is done
        let Some(chunk) = chunk else {
            break Ok(());
        };

        let len = chunk.len() as u64;
        match tokio::time::timeout(send_timeout, sink.send(Message::Binary(chunk.to_vec()))).await
        {
            Ok(Ok(())) => bytes += len,
            Ok(Err(e)) => {
                debug!("WebSocket send failed: {:?}", e);
                break Err(TransportError::WebSocket(e));
            }
            Err(_) => {
                warn!("WebSocket send timeout - client unresponsive");
                break Err(TransportError::SendTimeout);
            }
        }
    };

    RelayOutcome {
        sink,
        bytes,
        result,
    }
}

async fn forward_input(writer: &mut Box<dyn RemoteWriter>, data: &[u8]) -> Result<(), StreamError> {
    writer.write(data).await.map_err(StreamError::RemoteWrite)
}

/// Send our close frame and give the peer a moment to answer it.
/// Returns whether the frame was written; the socket is dropped either way.
async fn close_transport<S>(mut ws: WebSocketStream<S>, frame: CloseFrame<'static>) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match ws.close(Some(frame)).await {
        Ok(()) => {}
        Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return false,
        Err(e) => {
            // Peer already gone (reset, broken pipe)
            debug!("WebSocket close failed: {}", e);
            return false;
        }
    }

    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    true
}

/// One live terminal session. Consumed by [`TerminalBridge::run`]; never reused.
pub struct TerminalBridge<S> {
    id: Uuid,
    ws: WebSocketStream<S>,
    remote: RemoteHandle,
    settings: BridgeSettings,
    cancel: CancellationToken,
}

impl<S> TerminalBridge<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: Uuid,
        ws: WebSocketStream<S>,
        remote: RemoteHandle,
        settings: BridgeSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            ws,
            remote,
            settings,
            cancel,
        }
    }

    /// Stream until either side disconnects, then tear everything down.
    /// State transitions are published on `state`.
    pub async fn run(self, state: &watch::Sender<BridgeState>) -> BridgeReport {
        let Self {
            id,
            ws,
            remote,
            settings,
            cancel,
        } = self;
        let RemoteHandle { reader, mut writer } = remote;

        let mut tracker = StateTracker::new(state);
        tracker.enter(BridgeState::Streaming);
        info!("Session {} streaming", id);

        let (sink, mut stream) = ws.split();
        let (relay_tx, relay_rx) = mpsc::channel::<Bytes>(settings.relay_capacity.max(1));

        let reader_cancel = cancel.clone();
        let chunk_size = settings.chunk_size.max(1);
        let mut reader_task = tokio::task::spawn_blocking(move || {
            pump_remote(reader, relay_tx, reader_cancel, chunk_size)
        });

        let mut relay_task = tokio::spawn(relay_to_client(
            sink,
            relay_rx,
            cancel.clone(),
            settings.send_timeout,
        ));
        let mut relayed = None;

        let mut bytes_to_remote = 0u64;
        let mut resizes = 0u32;

        let mut reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break DisconnectReason::Cancelled,

                joined = &mut relay_task => {
                    let reason = match &joined {
                        _ if cancel.is_cancelled() => DisconnectReason::Cancelled,
                        Ok(outcome) => match &outcome.result {
                            Ok(()) => DisconnectReason::RemoteClosed,
                            Err(e) => DisconnectReason::TransportError(e.to_string()),
                        },
                        Err(e) => DisconnectReason::TransportError(format!("relay task failed: {}", e)),
                    };
                    relayed = Some(joined);
                    break reason;
                }

                // Remote writes can stall on a full SSH window, so each one
                // is raced against cancellation
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let written = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break DisconnectReason::Cancelled,
                            written = forward_input(&mut writer, &data) => written,
                        };
                        if let Err(e) = written {
                            break DisconnectReason::RemoteError(e.to_string());
                        }
                        bytes_to_remote += data.len() as u64;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(geometry) = parse_resize(&text) {
                            let resized = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => break DisconnectReason::Cancelled,
                                resized = writer.resize(geometry) => resized,
                            };
                            match resized {
                                Ok(()) => {
                                    resizes += 1;
                                    debug!("Session {} resized to {}x{}", id, geometry.cols, geometry.rows);
                                }
                                Err(e) => debug!("Resize failed for session {}: {}", id, e),
                            }
                        } else {
                            let written = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => break DisconnectReason::Cancelled,
                                written = forward_input(&mut writer, text.as_bytes()) => written,
                            };
                            if let Err(e) = written {
                                break DisconnectReason::RemoteError(e.to_string());
                            }
                            bytes_to_remote += text.len() as u64;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break DisconnectReason::ClientClosed,
                    // Pings are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break DisconnectReason::TransportError(e.to_string()),
                },
            }
        };

        tracker.enter(BridgeState::Draining);
        info!("Session {} draining: {}", id, reason);

        cancel.cancel();
        if let Err(e) = writer.shutdown_channel().await {
            debug!("Closing remote channel for session {} failed: {}", id, e);
        }

        let mut bytes_from_remote = 0;
        let reader_joined =
            match tokio::time::timeout(settings.reader_join_timeout, &mut reader_task).await {
                Ok(Ok(outcome)) => {
                    bytes_from_remote = outcome.bytes;
                    if let Some(e) = outcome.error {
                        debug!("Remote reader for session {} ended: {}", id, e);
                        if reason == DisconnectReason::RemoteClosed {
                            reason = DisconnectReason::RemoteError(e.to_string());
                        }
                    }
                    true
                }
                Ok(Err(e)) => {
                    warn!("Remote reader for session {} panicked: {}", id, e);
                    true
                }
                Err(_) => {
                    warn!(
                        "Remote reader for session {} did not stop within {:?}",
                        id, settings.reader_join_timeout
                    );
                    false
                }
            };

        let relayed = match relayed {
            Some(joined) => joined,
            None => relay_task.await,
        };
        let (sink, bytes_to_client) = match relayed {
            Ok(outcome) => {
                if let Err(e) = &outcome.result {
                    debug!("Relay to client for session {} ended: {}", id, e);
                }
                (Some(outcome.sink), outcome.bytes)
            }
            Err(e) => {
                warn!("Relay task for session {} failed: {}", id, e);
                (None, 0)
            }
        };

        // Remote and transport closes are independent of each other
        if let Err(e) = writer.close().await {
            warn!("Failed to close remote for session {}: {}", id, e);
        }
        let remote_closed = writer.is_closed();

        let close_frame_sent = match sink.map(|sink| sink.reunite(stream)) {
            Some(Ok(ws)) => close_transport(ws, reason.close_frame()).await,
            Some(Err(e)) => {
                warn!("Failed to reunite WebSocket for session {}: {}", id, e);
                false
            }
            None => false,
        };
        // Both halves are consumed or dropped by now
        let transport_closed = true;

        tracker.enter(BridgeState::Closed);
        info!(
            "Session {} closed ({}): {} bytes to client, {} bytes to remote",
            id, reason, bytes_to_client, bytes_to_remote
        );

        BridgeReport {
            session_id: id,
            reason,
            transitions: tracker.transitions,
            bytes_to_client,
            bytes_from_remote,
            bytes_to_remote,
            resizes,
            reader_joined,
            remote_closed,
            transport_closed,
            close_frame_sent,
        }
    }
}
