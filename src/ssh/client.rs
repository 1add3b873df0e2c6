//! SSH Connector implementation using russh

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PrivateKey, PublicKey, PublicKeyBase64};
use russh::{Channel, Disconnect};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::config::{ConnectOptions, KeyAlgorithm, TerminalGeometry};
use super::error::ConnectionError;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::remote::{RemoteConnector, RemoteHandle};
use super::shell;
use crate::credentials::CredentialBundle;

/// How the connector will authenticate, decided before any network I/O
enum AuthPlan {
    Password(Zeroizing<String>),
    Key {
        key: PrivateKey,
        algorithm: KeyAlgorithm,
        /// Tried if the server rejects the key
        fallback_password: Option<Zeroizing<String>>,
    },
}

/// Validate the credential bundle and decode key material.
///
/// A private key takes precedence over a password. Key type tags are
/// checked against the decoded key so a mislabelled key fails here rather
/// than as an opaque auth rejection.
fn prepare_auth(credentials: &CredentialBundle) -> Result<AuthPlan, ConnectionError> {
    let Some(material) = credentials.private_key.as_deref() else {
        return match &credentials.password {
            Some(password) => Ok(AuthPlan::Password(password.clone())),
            None => Err(ConnectionError::NoCredentials),
        };
    };

    let declared = credentials
        .key_type
        .as_deref()
        .map(KeyAlgorithm::parse)
        .transpose()?;

    let passphrase = credentials.passphrase.as_deref().map(String::as_str);
    let key = russh::keys::decode_secret_key(material, passphrase)?;
    let actual = key.algorithm();
    let actual_name = actual.as_str();

    let algorithm = match declared {
        Some(algorithm) if algorithm.matches(actual_name) => algorithm,
        Some(algorithm) => {
            return Err(ConnectionError::InvalidKey(format!(
                "declared {:?} but key is {}",
                algorithm, actual_name
            )))
        }
        // No tag stored: accept any supported family
        None => KeyAlgorithm::parse(actual_name)?,
    };

    Ok(AuthPlan::Key {
        key,
        algorithm,
        fallback_password: credentials.password.clone(),
    })
}

/// Opens interactive shells on target hosts
pub struct SshConnector {
    options: ConnectOptions,
    known_hosts: Arc<KnownHostsStore>,
}

impl SshConnector {
    pub fn new(options: ConnectOptions, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            options,
            known_hosts,
        }
    }

    async fn establish(
        &self,
        host: String,
        port: u16,
        username: String,
        auth: AuthPlan,
        geometry: TerminalGeometry,
    ) -> Result<RemoteHandle, ConnectionError> {
        let address = format!("{}:{}", host, port);

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| ConnectionError::Unreachable(format!("{}: {}", address, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectionError::Unreachable(format!(
                "{}: no address found",
                address
            )));
        }

        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.options.keepalive_interval,
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            host.clone(),
            port,
            self.options.strict_host_key_checking,
            self.known_hosts.clone(),
        );

        let mut handle = client::connect(Arc::new(config), &addrs[..], handler).await?;
        debug!("SSH handshake completed with {}", address);

        match self.open_shell(&mut handle, &username, auth, geometry).await {
            Ok(channel) => {
                info!("Interactive shell started on {} as {}", address, username);
                Ok(shell::into_remote(
                    handle,
                    channel,
                    format!("{}@{}", username, address),
                ))
            }
            Err(e) => {
                if let Err(err) = handle
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await
                {
                    debug!("Cleanup disconnect from {} failed: {}", address, err);
                }
                Err(e)
            }
        }
    }

    async fn open_shell(
        &self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
        auth: AuthPlan,
        geometry: TerminalGeometry,
    ) -> Result<Channel<client::Msg>, ConnectionError> {
        authenticate(handle, username, auth).await?;

        let channel = handle.channel_open_session().await?;

        let requested = async {
            channel
                .request_pty(
                    false,
                    &self.options.term,
                    geometry.cols,
                    geometry.rows,
                    0,
                    0,
                    &[],
                )
                .await
                .map_err(|e| ConnectionError::Channel(format!("PTY request failed: {}", e)))?;

            channel
                .request_shell(false)
                .await
                .map_err(|e| ConnectionError::Channel(format!("Shell request failed: {}", e)))
        }
        .await;

        match requested {
            Ok(()) => Ok(channel),
            Err(e) => {
                if let Err(err) = channel.close().await {
                    debug!("Cleanup channel close failed: {}", err);
                }
                Err(e)
            }
        }
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    auth: AuthPlan,
) -> Result<(), ConnectionError> {
    let result = match auth {
        AuthPlan::Password(password) => {
            handle
                .authenticate_password(username, password.as_str())
                .await?
        }
        AuthPlan::Key {
            key,
            algorithm,
            fallback_password,
        } => {
            // Servers increasingly refuse SHA-1 RSA signatures
            let hash_alg = match algorithm {
                KeyAlgorithm::Rsa => Some(HashAlg::Sha256),
                _ => None,
            };
            let result = handle
                .authenticate_publickey(
                    username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await?;

            match fallback_password {
                Some(password) if !result.success() => {
                    debug!("Public key rejected for {}, trying password", username);
                    handle
                        .authenticate_password(username, password.as_str())
                        .await?
                }
                _ => result,
            }
        }
    };

    if !result.success() {
        return Err(ConnectionError::AuthRejected);
    }

    debug!("SSH authentication successful for {}", username);
    Ok(())
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        credentials: CredentialBundle,
        geometry: TerminalGeometry,
    ) -> Result<RemoteHandle, ConnectionError> {
        let auth = prepare_auth(&credentials)?;

        let CredentialBundle {
            target_id,
            host,
            port,
            username,
            ..
        } = credentials;

        info!(
            "Connecting to target {} at {}:{} ({}x{})",
            target_id, host, port, geometry.cols, geometry.rows
        );

        let timeout = self.options.timeout;
        match tokio::time::timeout(timeout, self.establish(host, port, username, auth, geometry))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Connection to target {} timed out after {}s",
                    target_id,
                    timeout.as_secs()
                );
                Err(ConnectionError::Timeout(timeout.as_secs()))
            }
        }
    }
}

/// Client handler for russh callbacks: host key verification
pub struct ClientHandler {
    host: String,
    port: u16,
    /// Reject remembered keys that changed. Unknown keys are always trusted.
    strict: bool,
    known_hosts: Arc<KnownHostsStore>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts,
        }
    }

    async fn check_encoded(&self, key_type: &str, key_b64: &str) -> Result<bool, ConnectionError> {
        match self
            .known_hosts
            .verify_encoded(&self.host, self.port, key_type, key_b64)
        {
            HostKeyVerification::Verified => Ok(true),
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    "TOFU: trusting new host key for {}:{} ({})",
                    self.host, self.port, fingerprint
                );
                self.remember(key_type, key_b64).await;
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "Host key for {}:{} changed: expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                if self.strict {
                    return Err(ConnectionError::HostKeyMismatch {
                        host: format!("{}:{}", self.host, self.port),
                        expected: expected_fingerprint,
                        actual: actual_fingerprint,
                    });
                }
                self.remember(key_type, key_b64).await;
                Ok(true)
            }
        }
    }

    async fn remember(&self, key_type: &str, key_b64: &str) {
        if let Err(e) = self
            .known_hosts
            .remember_encoded(&self.host, self.port, key_type, key_b64)
            .await
        {
            warn!("Failed to save host key: {}", e);
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = ConnectionError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let algorithm = server_public_key.algorithm();
        let encoded = BASE64.encode(server_public_key.public_key_bytes());
        self.check_encoded(algorithm.as_str(), &encoded).await
    }
}
