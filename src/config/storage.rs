//! Configuration Storage
//!
//! Reads the server configuration file from disk.
//! Config location: ~/.wsterm/config.json unless a path is given.

use std::path::PathBuf;
use tokio::fs;

use super::types::{ServerConfig, CONFIG_VERSION};
use super::ConfigError;

/// Get the wsterm configuration directory (~/.wsterm)
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".wsterm"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Get the default config file path
pub fn config_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a storage manager with the default path
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    /// Create storage manager with custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load configuration from disk.
    /// Returns the default config if the file doesn't exist. A file that
    /// exists but does not parse is an error: the server must not start
    /// with a silently different secret.
    pub async fn load(&self) -> Result<ServerConfig, ConfigError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let config: ServerConfig = serde_json::from_str(&contents)?;
                if config.version > CONFIG_VERSION {
                    return Err(ConfigError::VersionTooNew {
                        found: config.version,
                        supported: CONFIG_VERSION,
                    });
                }
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {:?}, using defaults", self.path);
                Ok(ServerConfig::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Get config file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("config.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config.bind, "0.0.0.0:2280");
        assert_eq!(config.relay_capacity, 100);
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.max_sessions, 64);
        assert!(!config.strict_host_key_checking);
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"bind": "127.0.0.1:9000", "secret": "s3cret", "max_sessions": 4}"#,
        )
        .unwrap();

        let config = ConfigStorage::with_path(path).load().await.unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.connect_timeout_secs, 120);
        assert!(config.validate().is_ok());
        assert!(!format!("{:?}", config).contains("s3cret"));
    }

    #[tokio::test]
    async fn test_corrupted_file_is_an_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            ConfigStorage::with_path(path).load().await,
            Err(ConfigError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_version_too_new() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();

        assert!(matches!(
            ConfigStorage::with_path(path).load().await,
            Err(ConfigError::VersionTooNew { found: 99, .. })
        ));
    }

    #[test]
    fn test_env_overrides_and_validation() {
        let mut config = ServerConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingSecret)));

        config.apply_overrides(|key| match key {
            "WSTERM_SECRET" => Some("from-env".to_string()),
            "WSTERM_BIND" => Some("127.0.0.1:7000".to_string()),
            "WSTERM_IDENTITY_STORE" => Some("/srv/identity.json".to_string()),
            _ => None,
        });
        assert_eq!(config.secret.as_deref(), Some("from-env"));
        assert_eq!(config.bind_addr().unwrap().port(), 7000);
        assert_eq!(
            config.identity_store_path().unwrap(),
            PathBuf::from("/srv/identity.json")
        );
        assert!(config.validate().is_ok());

        config.relay_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.relay_capacity = 1;
        config.bind = "not an address".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_derived_settings() {
        let config = ServerConfig {
            reader_join_timeout_ms: 250,
            strict_host_key_checking: true,
            ..Default::default()
        };
        let settings = config.supervisor_settings();
        assert_eq!(settings.geometry_timeout.as_secs(), 10);
        assert_eq!(settings.bridge.reader_join_timeout.as_millis(), 250);
        assert_eq!(settings.bridge.relay_capacity, 100);

        let options = config.connect_options();
        assert_eq!(options.timeout.as_secs(), 120);
        assert!(options.strict_host_key_checking);
        assert_eq!(options.term, "xterm");
    }
}
