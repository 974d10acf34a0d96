//! Tunnel engine
//!
//! Keeps a set of SSH tunnels alive for the lifetime of the process:
//!
//! - [`TunnelSupervisor`] starts one [`SessionManager`] per [`TunnelSpec`]
//!   and drains them all on shutdown
//! - [`SessionManager`] runs connect → bind → accept → teardown cycles,
//!   retrying with a fixed delay
//! - [`KeepaliveMonitor`] pings a live session and tears it down once too
//!   many pings go unanswered
//! - [`ConnectionRelay`] copies bytes between one accepted connection and
//!   its dialed counterpart
//!
//! Cancellation flows down a token tree (supervisor → tunnel → session →
//! relay); a session's teardown never reaches past its own subtree.
//!
//! # Example
//!
//! ```ignore
//! let supervisor = TunnelSupervisor::new(specs, connector);
//! supervisor.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
//! ```

pub mod error;
pub mod keepalive;
pub mod manager;
pub mod relay;
pub mod report;
pub mod supervisor;

pub use error::TunnelError;
pub use keepalive::{KeepaliveMonitor, KeepaliveOutcome};
pub use manager::{SessionManager, SessionState};
pub use relay::{ConnectionRelay, RelayStats};
pub use report::ReportOnce;
pub use supervisor::TunnelSupervisor;

// Re-export for convenience
pub use sshtun_proto::TunnelSpec;
pub use sshtun_transport::{TransportConnector, TransportError, TransportSession};
