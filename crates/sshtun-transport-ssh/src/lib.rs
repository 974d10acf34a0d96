//! SSH transport for tunnel sessions
//!
//! Implements the `sshtun-transport` traits on top of `russh`:
//!
//! - [`SshConnector`] dials the SSH server and authenticates with the
//!   credentials produced by a [`CredentialProvider`]
//! - [`SshSession`] opens `direct-tcpip` channels for forward tunnels and
//!   requests `tcpip-forward` listeners for reverse tunnels
//! - keepalive requests open (and immediately close) a session channel
//!
//! russh's own keepalive is switched off; the tunnel engine decides when a
//! session is dead.

pub mod credentials;
mod handler;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use russh::client;

pub use credentials::{CredentialError, CredentialProvider, Credentials, KeyFileCredentialProvider};
pub use session::{SshConnector, SshSession};

/// TCP connect + SSH handshake deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on cancelling remote forwards and disconnecting
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pending inbound channels buffered per remote listener
pub const FORWARD_BACKLOG: usize = 64;

/// russh client configuration used for every tunnel session
pub fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: None,
        ..Default::default()
    })
}
