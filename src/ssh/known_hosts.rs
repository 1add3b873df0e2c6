//! Trust-on-first-use host key memory
//!
//! The first key a host presents is accepted and remembered. What happens
//! when a remembered key changes is decided by the connector's
//! `strict_host_key_checking` setting, not here. This is a convenience
//! policy: it protects against a key swap after the first contact, never
//! against an attacker present at the first contact.
//!
//! Entries can optionally be persisted to an OpenSSH-style known_hosts file
//! (`host keytype base64key`); without a path the memory lasts for the
//! process lifetime.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches the remembered entry
    Verified,
    /// Host (or this key type) never seen before
    Unknown { fingerprint: String },
    /// Key differs from the remembered entry
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    /// host -> keys (one per key type)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: Option<PathBuf>,
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl KnownHostsStore {
    /// Remember keys for the lifetime of the process only
    pub fn in_memory() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Load from and append to a known_hosts file
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: Some(path),
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts: {}", e);
        }

        store
    }

    fn load(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let reader = BufReader::new(fs::File::open(path)?);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            for hostname in parts[0].split(',') {
                // Hashed hostnames are not supported
                if hostname.starts_with('|') {
                    continue;
                }
                let entries = hosts.entry(hostname.to_lowercase()).or_default();
                // Later lines win: a re-learned key is appended after the old one
                entries.retain(|e| e.key_type != parts[1]);
                entries.push(HostKeyEntry {
                    key_type: parts[1].to_string(),
                    key_data: parts[2].to_string(),
                });
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// Lookup key for host:port, in known_hosts notation
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint of base64-encoded public key bytes
    pub fn fingerprint_of_encoded(key_b64: &str) -> String {
        match BASE64.decode(key_b64) {
            Ok(bytes) => {
                let hash = Sha256::digest(&bytes);
                format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
            }
            Err(_) => "unknown".to_string(),
        }
    }

    pub fn verify_encoded(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_b64: &str,
    ) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let fingerprint = Self::fingerprint_of_encoded(key_b64);
        let hosts = self.hosts.read();

        let stored = hosts
            .get(&lookup_key)
            .and_then(|entries| entries.iter().find(|e| e.key_type == key_type));

        match stored {
            Some(entry) if entry.key_data == key_b64 => {
                debug!("Host key verified for {} (type: {})", lookup_key, key_type);
                HostKeyVerification::Verified
            }
            Some(entry) => HostKeyVerification::Changed {
                expected_fingerprint: Self::fingerprint_of_encoded(&entry.key_data),
                actual_fingerprint: fingerprint,
            },
            None => {
                debug!("Unknown host key: {} (type: {})", lookup_key, key_type);
                HostKeyVerification::Unknown { fingerprint }
            }
        }
    }

    /// Store (or replace) the key of this type for host:port.
    /// Runs inside the SSH handshake, so the file append is async.
    pub async fn remember_encoded(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_b64: &str,
    ) -> std::io::Result<()> {
        let lookup_key = Self::make_key(host, port);

        {
            let mut hosts = self.hosts.write();
            let entries = hosts.entry(lookup_key.clone()).or_default();
            entries.retain(|e| e.key_type != key_type);
            entries.push(HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_b64.to_string(),
            });
        }

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(format!("{} {} {}\n", lookup_key, key_type, key_b64).as_bytes())
                .await?;
            file.flush().await?;
        }

        info!("Remembered host key for {} (type: {})", lookup_key, key_type);
        Ok(())
    }
}
