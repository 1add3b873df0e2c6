//! SSH module - opens remote shells using the russh library
//!
//! # Features
//! - Password and public key authentication (RSA, ECDSA, Ed25519)
//! - PTY allocation with the browser's initial geometry
//! - Trust-on-first-use host key memory (see `known_hosts`)
//! - Split reader/writer halves for the terminal bridge (see `remote`)

mod client;
mod config;
mod error;
pub mod known_hosts;
pub mod remote;
mod shell;

pub use client::{ClientHandler, SshConnector};
pub use config::{ConnectOptions, KeyAlgorithm, TerminalGeometry};
pub use error::ConnectionError;
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use remote::{RemoteConnector, RemoteHandle, RemoteReader, RemoteWriter};
pub use shell::{SshShellReader, SshShellWriter};
