//! Configuration Management Module
//!
//! Server settings loaded from a JSON file with environment overrides.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage};
pub use types::{ServerConfig, CONFIG_VERSION};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("No secret configured (set `secret` or WSTERM_SECRET)")]
    MissingSecret,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
