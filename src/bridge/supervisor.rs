//! Session Supervisor
//!
//! Per-connection entry point. Sequences the pre-stream phases
//! (authorize, register, resolve credentials, read the initial terminal
//! size, connect) and then hands the WebSocket and the remote shell to a
//! [`TerminalBridge`]. A failure before streaming closes the WebSocket
//! with the matching close frame and never creates a bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{GeometryError, SessionError};
use super::protocol::parse_initial_geometry;
use super::registry::SessionRegistry;
use super::terminal::{BridgeReport, BridgeSettings, TerminalBridge};
use crate::access::AccessGuard;
use crate::credentials::CredentialResolver;
use crate::identity::TargetId;
use crate::ssh::{RemoteConnector, RemoteHandle, TerminalGeometry};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long the client has to send its terminal size
    pub geometry_timeout: Duration,
    pub bridge: BridgeSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            geometry_timeout: Duration::from_secs(10),
            bridge: BridgeSettings::default(),
        }
    }
}

/// What the upgrade request told us about the caller
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub target_id: TargetId,
    /// Value of the `session` cookie
    pub session_token: Option<String>,
    pub peer: Option<SocketAddr>,
}

pub struct SessionSupervisor {
    guard: AccessGuard,
    resolver: CredentialResolver,
    connector: Arc<dyn RemoteConnector>,
    registry: Arc<SessionRegistry>,
    settings: SupervisorSettings,
}

impl SessionSupervisor {
    pub fn new(
        guard: AccessGuard,
        resolver: CredentialResolver,
        connector: Arc<dyn RemoteConnector>,
        registry: Arc<SessionRegistry>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            guard,
            resolver,
            connector,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Cancel live sessions whose caller session no longer validates
    /// (logged out or expired). Returns the number of sessions cancelled.
    pub async fn revoke_dead_callers(&self) -> usize {
        let mut cancelled = 0;
        for token in self.registry.caller_tokens() {
            if !self.guard.session_is_live(&token).await {
                cancelled += self.registry.cancel_caller(&token);
            }
        }
        cancelled
    }

    /// Drive one accepted WebSocket to completion
    pub async fn run<S>(
        &self,
        mut ws: WebSocketStream<S>,
        request: SessionRequest,
    ) -> Result<BridgeReport, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = Uuid::new_v4();
        let target_id = request.target_id;
        let peer = request
            .peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let caller = match self
            .guard
            .check(request.session_token.as_deref(), target_id)
            .await
        {
            Ok(caller) => caller,
            Err(e) => {
                info!("Rejected {} for target {}: {}", peer, target_id, e);
                return reject(ws, e.into()).await;
            }
        };

        let token = request.session_token.as_deref().unwrap_or_default();
        let lease = match self.registry.register(session_id, target_id, token) {
            Ok(lease) => lease,
            Err(e) => return reject(ws, e).await,
        };
        info!(
            "Session {} started: user {} -> target {} from {}",
            session_id, caller.user_id, target_id, peer
        );

        let cancel = lease.cancel_token();
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            prepared = self.prepare(&mut ws, target_id) => prepared,
        };

        let remote = match prepared {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Session {} failed before streaming: {}", session_id, e);
                return reject(ws, e).await;
            }
        };

        let bridge = TerminalBridge::new(
            session_id,
            ws,
            remote,
            self.settings.bridge.clone(),
            cancel,
        );
        let report = bridge.run(lease.state()).await;
        drop(lease);

        Ok(report)
    }

    /// Credentials, terminal size, connect. Credentials are consumed by the
    /// connect attempt.
    async fn prepare<S>(
        &self,
        ws: &mut WebSocketStream<S>,
        target_id: TargetId,
    ) -> Result<RemoteHandle, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let credentials = self.resolver.resolve(target_id).await?;
        let geometry = read_geometry(ws, self.settings.geometry_timeout).await?;
        debug!(
            "Target {} terminal size {}x{}",
            target_id, geometry.cols, geometry.rows
        );

        let remote = self.connector.connect(credentials, geometry).await?;
        Ok(remote)
    }
}

/// Wait for the first data frame and parse it as terminal geometry.
/// Control frames before it are skipped.
async fn read_geometry<S>(
    ws: &mut WebSocketStream<S>,
    timeout: Duration,
) -> Result<TerminalGeometry, GeometryError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + timeout;

    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| GeometryError::Timeout)?;

        match msg {
            Some(Ok(Message::Text(text))) => return parse_initial_geometry(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => return parse_initial_geometry(&data),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                return Err(GeometryError::Disconnected)
            }
            Some(Ok(_)) => continue,
        }
    }
}

/// Close the WebSocket with the error's close frame and hand the error back
async fn reject<S>(mut ws: WebSocketStream<S>, err: SessionError) -> Result<BridgeReport, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = ws.close(Some(err.close_frame())).await {
        debug!("Failed to send close frame: {}", e);
    } else {
        // Let the client answer the close so it sees a clean shutdown
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::terminal::{BridgeState, DisconnectReason};
    use crate::bridge::testing::{read_until_close, ws_pair, FakeConnector, FakeShell};
    use crate::identity::{
        CallerSession, GroupLink, IdentitySnapshot, JsonIdentityStore, TargetRecord, UserRecord,
    };
    use crate::secrets::{SecretBox, SecretsService};
    use crate::ssh::ConnectionError;
    use futures_util::SinkExt;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    const SECRET: &str = "test-secret";

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn snapshot() -> IdentitySnapshot {
        let secrets = SecretBox::from_secret(SECRET);
        IdentitySnapshot {
            targets: vec![
                TargetRecord {
                    id: 1,
                    host: "10.0.0.5".into(),
                    port: 22,
                    username: "root".into(),
                    password: Some(secrets.encrypt("hunter2").unwrap()),
                    ssh_key: None,
                    ssh_key_type: None,
                    passphrase: None,
                },
                TargetRecord {
                    id: 2,
                    host: "10.0.0.6".into(),
                    port: 22,
                    username: "ops".into(),
                    password: Some("not-a-valid-token".into()),
                    ssh_key: None,
                    ssh_key_type: None,
                    passphrase: None,
                },
                TargetRecord {
                    id: 3,
                    host: "10.0.0.7".into(),
                    port: 22,
                    username: "db".into(),
                    password: Some(secrets.encrypt("pw").unwrap()),
                    ssh_key: None,
                    ssh_key_type: None,
                    passphrase: None,
                },
            ],
            sessions: vec![
                CallerSession {
                    token: "live".into(),
                    user_id: 10,
                    created_at: now() - 60,
                    expires_at: now() + 3600,
                },
                CallerSession {
                    token: "expired".into(),
                    user_id: 10,
                    created_at: now() - 7200,
                    expires_at: now() - 60,
                },
            ],
            users: vec![UserRecord {
                id: 10,
                group_id: 5,
            }],
            links: vec![
                GroupLink {
                    group_id: 5,
                    target_id: 1,
                },
                GroupLink {
                    group_id: 5,
                    target_id: 2,
                },
            ],
        }
    }

    fn supervisor_with(
        connector: Arc<FakeConnector>,
        max_sessions: usize,
        settings: SupervisorSettings,
    ) -> SessionSupervisor {
        let store = Arc::new(JsonIdentityStore::from_snapshot(snapshot()));
        SessionSupervisor::new(
            AccessGuard::new(store.clone()),
            CredentialResolver::new(store, Arc::new(SecretBox::from_secret(SECRET))),
            connector,
            SessionRegistry::new(max_sessions),
            settings,
        )
    }

    fn supervisor(connector: Arc<FakeConnector>) -> SessionSupervisor {
        supervisor_with(
            connector,
            8,
            SupervisorSettings {
                geometry_timeout: Duration::from_millis(300),
                ..Default::default()
            },
        )
    }

    fn request(target_id: TargetId, token: Option<&str>) -> SessionRequest {
        SessionRequest {
            target_id,
            session_token: token.map(str::to_string),
            peer: None,
        }
    }

    /// Run the supervisor against an in-memory client. The client script
    /// gets the client end and returns what it observed.
    async fn drive<F, Fut, T>(
        supervisor: Arc<SessionSupervisor>,
        request: SessionRequest,
        client_script: F,
    ) -> (Result<BridgeReport, SessionError>, T)
    where
        F: FnOnce(WebSocketStream<DuplexStream>) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (server, client) = ws_pair().await;
        let client_task = tokio::spawn(client_script(client));
        let result = supervisor.run(server, request).await;
        let observed = client_task.await.unwrap();
        (result, observed)
    }

    fn close_of(frame: Option<CloseFrame<'static>>) -> (u16, String) {
        let frame = frame.expect("no close frame");
        (u16::from(frame.code), frame.reason.to_string())
    }

    async fn send_size_then_read(
        mut client: WebSocketStream<DuplexStream>,
    ) -> (Vec<u8>, Option<CloseFrame<'static>>) {
        let _ = client
            .send(Message::Text(r#"{"cols":100,"rows":40}"#.into()))
            .await;
        read_until_close(&mut client).await
    }

    #[tokio::test]
    async fn test_happy_path_input_seen_once() {
        let shell = FakeShell::new();
        let connector = Arc::new(FakeConnector::new(shell.clone()));
        let supervisor = Arc::new(supervisor(connector.clone()));

        let remote = shell.clone();
        let (result, (output, close)) = drive(supervisor.clone(), request(1, Some("live")), |mut client| async move {
            client
                .send(Message::Text(r#"{"cols":120,"rows":40}"#.into()))
                .await
                .unwrap();
            client.send(Message::Binary(b"ls\r\n".to_vec())).await.unwrap();
            client.send(Message::Binary(b"x".to_vec())).await.unwrap();

            // Wait for the shell to see the input, then let it answer and exit
            for _ in 0..100 {
                if remote.input().len() == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            remote.emit(b"file.txt\r\n");
            remote.finish();
            read_until_close(&mut client).await
        })
        .await;

        let report = result.unwrap();
        assert_eq!(shell.input(), b"ls\r\nx");
        assert_eq!(output, b"file.txt\r\n");
        assert_eq!(close_of(close), (1000, String::new()));
        assert_eq!(connector.attempts(), 1);
        assert_eq!(connector.geometries(), vec![TerminalGeometry::new(120, 40)]);
        assert_eq!(connector.usernames(), vec!["root".to_string()]);
        assert_eq!(report.reason, DisconnectReason::RemoteClosed);
        assert_eq!(report.transitions.last(), Some(&BridgeState::Closed));
        assert!(shell.is_closed());
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_denied_caller_never_connects() {
        let connector = Arc::new(FakeConnector::new(FakeShell::new()));
        let supervisor = Arc::new(supervisor(connector.clone()));

        let (result, (_, close)) =
            drive(supervisor, request(3, Some("live")), send_size_then_read).await;

        assert!(matches!(result, Err(SessionError::Access(_))));
        assert_eq!(close_of(close), (1008, "Access denied".to_string()));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_session_errors_close_with_policy() {
        let connector = Arc::new(FakeConnector::new(FakeShell::new()));
        let supervisor = Arc::new(supervisor(connector.clone()));

        let cases = [
            (request(1, None), "No session cookie found"),
            (request(1, Some("expired")), "Invalid or expired session"),
            (request(1, Some("forged")), "Invalid or expired session"),
            (request(99, Some("live")), "Virtual user not found"),
        ];
        for (req, reason) in cases {
            let (result, (_, close)) = drive(supervisor.clone(), req, send_size_then_read).await;
            assert!(result.is_err());
            assert_eq!(close_of(close), (1008, reason.to_string()));
        }
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_undecryptable_credentials() {
        let connector = Arc::new(FakeConnector::new(FakeShell::new()));
        let supervisor = Arc::new(supervisor(connector.clone()));

        let (result, (_, close)) =
            drive(supervisor, request(2, Some("live")), send_size_then_read).await;

        assert!(matches!(result, Err(SessionError::Credential(_))));
        assert_eq!(close_of(close), (1011, "Failed to load credentials".to_string()));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_missing_geometry() {
        let connector = Arc::new(FakeConnector::new(FakeShell::new()));
        let supervisor = Arc::new(supervisor(connector.clone()));

        // Silent client: geometry timeout
        let (result, (_, close)) = drive(supervisor.clone(), request(1, Some("live")), |mut client| async move {
            read_until_close(&mut client).await
        })
        .await;
        assert!(matches!(result, Err(SessionError::Geometry(GeometryError::Timeout))));
        assert_eq!(close_of(close), (1008, "No term size".to_string()));

        // Garbage first frame
        let (result, (_, close)) = drive(supervisor, request(1, Some("live")), |mut client| async move {
            client.send(Message::Text("hello".into())).await.unwrap();
            read_until_close(&mut client).await
        })
        .await;
        assert!(matches!(result, Err(SessionError::Geometry(GeometryError::Malformed(_)))));
        assert_eq!(close_of(close), (1008, "No term size".to_string()));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_closes_with_error() {
        let connector = Arc::new(FakeConnector::failing(|| ConnectionError::AuthRejected));
        let supervisor = Arc::new(supervisor(connector.clone()));

        let (result, (_, close)) =
            drive(supervisor.clone(), request(1, Some("live")), send_size_then_read).await;

        assert!(matches!(
            result,
            Err(SessionError::Connection(ConnectionError::AuthRejected))
        ));
        assert_eq!(
            close_of(close),
            (1011, "SSH connection failed: authentication rejected".to_string())
        );
        assert_eq!(connector.attempts(), 1);
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_registry_full() {
        let shell = FakeShell::new();
        let connector = Arc::new(FakeConnector::new(shell.clone()));
        let supervisor = Arc::new(supervisor_with(
            connector.clone(),
            1,
            SupervisorSettings::default(),
        ));

        // First session occupies the only slot
        let (server, mut first_client) = ws_pair().await;
        let first = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run(server, request(1, Some("live"))).await })
        };
        first_client
            .send(Message::Text(r#"{"cols":80,"rows":24}"#.into()))
            .await
            .unwrap();
        for _ in 0..100 {
            if connector.attempts() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (result, (_, close)) =
            drive(supervisor.clone(), request(1, Some("live")), send_size_then_read).await;
        assert!(matches!(result, Err(SessionError::RegistryFull { limit: 1 })));
        assert_eq!(close_of(close), (1013, "Too many active sessions".to_string()));

        // Logout ends the first session
        assert_eq!(supervisor.registry().cancel_caller("live"), 1);
        let (_, close) = read_until_close(&mut first_client).await;
        assert_eq!(close_of(close).0, 1001);
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.reason, DisconnectReason::Cancelled);
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_client_leaves_while_reader_blocked() {
        let shell = FakeShell::new();
        let connector = Arc::new(FakeConnector::new(shell.clone()));
        let supervisor = Arc::new(supervisor(connector.clone()));

        let (result, ()) = drive(supervisor, request(1, Some("live")), |mut client| async move {
            client
                .send(Message::Text(r#"{"cols":80,"rows":24}"#.into()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(client);
        })
        .await;

        let report = result.unwrap();
        assert!(report.reader_joined);
        assert!(report.remote_closed);
        assert!(report.transport_closed);
        assert!(shell.is_closed());
        assert_eq!(report.transitions.last(), Some(&BridgeState::Closed));
    }

    #[tokio::test]
    async fn test_revoke_dead_callers() {
        let sup = supervisor(Arc::new(FakeConnector::new(FakeShell::new())));
        let live = sup.registry().register(Uuid::new_v4(), 1, "live").unwrap();
        let gone = sup.registry().register(Uuid::new_v4(), 1, "expired").unwrap();

        assert_eq!(sup.revoke_dead_callers().await, 1);
        assert!(gone.cancel_token().is_cancelled());
        assert!(!live.cancel_token().is_cancelled());
    }
}
