//! WebSocket terminal bridge
//!
//! `server` accepts connections, `supervisor` runs the pre-stream phases
//! of each one and `terminal` pumps bytes once the shell is open.

pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod terminal;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{GeometryError, SessionError, StreamError, TransportError};
pub use registry::{SessionInfo, SessionLease, SessionRegistry};
pub use server::WsServer;
pub use supervisor::{SessionRequest, SessionSupervisor, SupervisorSettings};
pub use terminal::{BridgeReport, BridgeSettings, BridgeState, DisconnectReason, TerminalBridge};
