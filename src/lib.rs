//! wsterm - Browser terminal gateway
//!
//! Bridges authenticated WebSocket sessions to interactive SSH shells.

pub mod access;
pub mod bridge;
pub mod config;
pub mod credentials;
pub mod identity;
pub mod secrets;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. `RUST_LOG` wins over the default `info` level.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
