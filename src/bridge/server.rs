//! WebSocket Server for the terminal bridge
//!
//! Accepts TCP connections, upgrades `/ws/ssh/{target_id}` to WebSocket
//! (capturing the `session` cookie from the upgrade request) and runs one
//! supervisor task per connection. Other paths get a 404 during the
//! handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{SessionError, TransportError};
use super::supervisor::{SessionRequest, SessionSupervisor};
use crate::identity::TargetId;

/// WebSocket handshake timeout (seconds)
const WS_ACCEPT_TIMEOUT_SECS: u64 = 30;

/// How long shutdown waits for cancelled sessions to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SESSION_COOKIE: &str = "session";

/// Target id from `/ws/ssh/{id}`
fn parse_target_path(path: &str) -> Option<TargetId> {
    let id = path.strip_prefix("/ws/ssh/")?;
    let id = id.strip_suffix('/').unwrap_or(id);
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse().ok()
}

/// Value of the `session` cookie, if any Cookie header carries one
fn session_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

pub struct WsServer {
    supervisor: Arc<SessionSupervisor>,
    shutdown: CancellationToken,
}

impl WsServer {
    pub fn new(supervisor: Arc<SessionSupervisor>) -> Self {
        Self {
            supervisor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the accept loop and every session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        info!("Terminal bridge listening on ws://{}/ws/ssh/{{id}}", local);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let supervisor = self.supervisor.clone();
                        connections.spawn(handle_connection(supervisor, stream, peer));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        let cancelled = self.supervisor.registry().cancel_all();
        info!(
            "Shutting down: {} active session(s), {} connection task(s)",
            cancelled,
            connections.len()
        );

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} connection task(s) after grace period", connections.len());
            connections.abort_all();
        }

        Ok(())
    }
}

async fn handle_connection(supervisor: Arc<SessionSupervisor>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let mut upgrade: Option<(TargetId, Option<String>)> = None;
    let callback = |request: &Request, response: Response| match parse_target_path(
        request.uri().path(),
    ) {
        Some(target_id) => {
            upgrade = Some((target_id, session_cookie(request)));
            Ok(response)
        }
        None => {
            debug!("Rejecting upgrade for {} from {}", request.uri().path(), peer);
            Err(not_found())
        }
    };

    let handshake = tokio::time::timeout(
        Duration::from_secs(WS_ACCEPT_TIMEOUT_SECS),
        accept_hdr_async(stream, callback),
    )
    .await;

    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("WebSocket handshake with {} failed: {}", peer, TransportError::from(e));
            return;
        }
        Err(_) => {
            debug!("{} from {}", TransportError::HandshakeTimeout, peer);
            return;
        }
    };

    let Some((target_id, session_token)) = upgrade else {
        return;
    };

    let request = SessionRequest {
        target_id,
        session_token,
        peer: Some(peer),
    };

    match supervisor.run(ws, request).await {
        Ok(report) => debug!(
            "Session {} finished: {} ({} bytes out, {} bytes in)",
            report.session_id, report.reason, report.bytes_to_client, report.bytes_to_remote
        ),
        Err(SessionError::Access(_)) | Err(SessionError::Geometry(_)) => {}
        Err(e) => error!("Session from {} for target {} failed: {}", peer, target_id, e),
    }
}
