//! wsterm server binary.
//!
//! Usage: `wsterm [CONFIG_PATH]`. Without a path the config is read from
//! ~/.wsterm/config.json; `WSTERM_*` environment variables override it.
//!
//! Signals:
//! - Ctrl-C / SIGINT: stop accepting, cancel live sessions, exit
//! - SIGHUP (unix): reload the identity store and revoke logged-out callers

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wsterm::access::AccessGuard;
use wsterm::bridge::{SessionRegistry, SessionSupervisor, WsServer};
use wsterm::config::{ConfigStorage, ServerConfig};
use wsterm::credentials::CredentialResolver;
use wsterm::identity::JsonIdentityStore;
use wsterm::secrets::SecretBox;
use wsterm::ssh::{KnownHostsStore, SshConnector};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often live sessions are re-checked against the identity store
const REVOKE_INTERVAL: Duration = Duration::from_secs(60);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && (args[1] == "--version" || args[1] == "-V") {
        println!("wsterm {}", VERSION);
        return;
    }

    wsterm::init_logging();

    if let Err(e) = run(args.get(1).map(PathBuf::from)).await {
        error!("wsterm failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config_path: Option<PathBuf>) -> Result<(), BoxError> {
    let storage = match config_path {
        Some(path) => ConfigStorage::with_path(path),
        None => ConfigStorage::new()?,
    };
    let mut config = storage.load().await?;
    config.apply_env();
    config.validate()?;
    info!("wsterm v{} starting with {:?}", VERSION, config);

    let identity = Arc::new(JsonIdentityStore::load(config.identity_store_path()?).await?);
    let supervisor = Arc::new(build_supervisor(&config, identity.clone())?);

    let listener = TcpListener::bind(config.bind_addr()?).await?;
    info!("Listening on {}", listener.local_addr()?);

    let server = WsServer::new(supervisor.clone());
    let shutdown = server.shutdown_token();

    let maintenance = tokio::spawn(maintain_sessions(
        identity,
        supervisor,
        shutdown.clone(),
    ));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received, shutting down"),
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
            shutdown.cancel();
        }
    });

    server.serve(listener).await?;
    let _ = maintenance.await;
    info!("Shutdown complete");
    Ok(())
}

fn build_supervisor(
    config: &ServerConfig,
    identity: Arc<JsonIdentityStore>,
) -> Result<SessionSupervisor, BoxError> {
    let secret = config.secret.as_deref().unwrap_or_default();
    let secrets = Arc::new(SecretBox::from_secret(secret));

    let known_hosts = Arc::new(match &config.known_hosts {
        Some(path) => KnownHostsStore::with_path(path.clone()),
        None => KnownHostsStore::in_memory(),
    });
    let connector = Arc::new(SshConnector::new(config.connect_options(), known_hosts));

    Ok(SessionSupervisor::new(
        AccessGuard::new(identity.clone()),
        CredentialResolver::new(identity, secrets),
        connector,
        SessionRegistry::new(config.max_sessions),
        config.supervisor_settings(),
    ))
}

/// Periodically revoke sessions whose caller has logged out or expired.
/// On unix, SIGHUP also reloads the identity store first.
async fn maintain_sessions(
    identity: Arc<JsonIdentityStore>,
    supervisor: Arc<SessionSupervisor>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(REVOKE_INTERVAL);
    ticker.tick().await;

    #[cfg(unix)]
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!("SIGHUP handler unavailable: {}", e);
            None
        }
    };

    loop {
        #[cfg(unix)]
        let reload = async {
            match hangup.as_mut() {
                Some(signal) => signal.recv().await,
                None => std::future::pending().await,
            }
        };
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            _ = reload => {
                if let Err(e) = identity.reload().await {
                    error!("Identity store reload failed, keeping previous data: {}", e);
                    continue;
                }
            }
        }

        let revoked = supervisor.revoke_dead_callers().await;
        if revoked > 0 {
            info!("Revoked {} session(s) with dead caller sessions", revoked);
        }
    }
}
