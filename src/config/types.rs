//! Server configuration types

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::bridge::{BridgeSettings, SupervisorSettings};
use crate::ssh::ConnectOptions;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

pub const ENV_SECRET: &str = "WSTERM_SECRET";
pub const ENV_BIND: &str = "WSTERM_BIND";
pub const ENV_IDENTITY_STORE: &str = "WSTERM_IDENTITY_STORE";

/// Contents of `config.json`. Every field is optional in the file.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,

    /// Listen address for the WebSocket server
    pub bind: String,

    /// Master secret for decrypting stored credentials
    #[serde(skip_serializing)]
    pub secret: Option<String>,

    /// Identity store JSON document. Defaults to `identity.json` next to the config.
    pub identity_store: Option<PathBuf>,

    /// Persist trusted host keys here; in-memory only when unset
    pub known_hosts: Option<PathBuf>,

    pub connect_timeout_secs: u64,
    pub geometry_timeout_secs: u64,
    pub relay_capacity: usize,
    pub chunk_size: usize,
    pub reader_join_timeout_ms: u64,
    pub send_timeout_secs: u64,
    pub max_sessions: usize,
    pub strict_host_key_checking: bool,
    pub term: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            bind: "0.0.0.0:2280".to_string(),
            secret: None,
            identity_store: None,
            known_hosts: None,
            connect_timeout_secs: 120,
            geometry_timeout_secs: 10,
            relay_capacity: 100,
            chunk_size: 1024,
            reader_join_timeout_ms: 2000,
            send_timeout_secs: 5,
            max_sessions: 64,
            strict_host_key_checking: false,
            term: "xterm".to_string(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind", &self.bind)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("identity_store", &self.identity_store)
            .field("known_hosts", &self.known_hosts)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("geometry_timeout_secs", &self.geometry_timeout_secs)
            .field("relay_capacity", &self.relay_capacity)
            .field("chunk_size", &self.chunk_size)
            .field("max_sessions", &self.max_sessions)
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Apply `WSTERM_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(ENV_SECRET).filter(|s| !s.is_empty()) {
            self.secret = Some(secret);
        }
        if let Some(bind) = lookup(ENV_BIND).filter(|s| !s.is_empty()) {
            self.bind = bind;
        }
        if let Some(path) = lookup(ENV_IDENTITY_STORE).filter(|s| !s.is_empty()) {
            self.identity_store = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingSecret);
        }
        self.bind_addr()?;

        let positive = [
            ("relay_capacity", self.relay_capacity as u64),
            ("chunk_size", self.chunk_size as u64),
            ("max_sessions", self.max_sessions as u64),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("geometry_timeout_secs", self.geometry_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bind address {:?}: {}", self.bind, e)))
    }

    pub fn identity_store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.identity_store {
            Some(path) => Ok(path.clone()),
            None => Ok(super::config_dir()?.join("identity.json")),
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            timeout: Duration::from_secs(self.connect_timeout_secs),
            term: self.term.clone(),
            strict_host_key_checking: self.strict_host_key_checking,
            ..Default::default()
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            geometry_timeout: Duration::from_secs(self.geometry_timeout_secs),
            bridge: BridgeSettings {
                relay_capacity: self.relay_capacity,
                chunk_size: self.chunk_size,
                reader_join_timeout: Duration::from_millis(self.reader_join_timeout_ms),
                send_timeout: Duration::from_secs(self.send_timeout_secs),
            },
        }
    }
}
