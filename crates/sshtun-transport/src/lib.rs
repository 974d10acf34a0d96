//! Transport abstraction layer for tunnel sessions
//!
//! The tunnel engine never talks to an SSH library directly. It works against
//! the traits in this crate, which a concrete transport implements:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    sshtun-client                         │
//! │      (supervisor, session manager, keepalive, relay)     │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │             sshtun-transport (this crate)                │
//! │  - TransportConnector   - TransportSession               │
//! │  - TransportListener    - TransportStream                │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────────┬──────────────────────────────┐
//! │  sshtun-transport-ssh    │  in-memory mocks (tests)     │
//! └──────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Local sockets (the listening side of a forward tunnel, the dialing side of
//! a reverse tunnel) live in [`tcp`] so both sides of a relay are plain
//! [`BoxedStream`]s.

pub mod tcp;

use async_trait::async_trait;
use sshtun_proto::{Endpoint, TunnelSpec};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use tcp::{dial_local, TcpTransportListener};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Listen error: {0}")]
    ListenError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Session closed")]
    SessionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A raw bidirectional byte stream
///
/// Blanket-implemented for anything that is `AsyncRead + AsyncWrite`, so TCP
/// sockets, SSH channel streams and in-memory duplex pipes all qualify.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased stream handed to the relay
pub type BoxedStream = Box<dyn TransportStream>;

/// A listening socket, local or opened through a session
#[async_trait]
pub trait TransportListener: Send + Debug {
    /// Accept the next inbound connection
    ///
    /// Returns the stream and a printable description of the peer. An error
    /// means the listener itself is broken and will not accept again.
    async fn accept(&mut self) -> TransportResult<(BoxedStream, String)>;

    /// The endpoint this listener is actually bound to
    fn local_endpoint(&self) -> Endpoint;
}

/// One authenticated transport session
///
/// A session is created by a [`TransportConnector`] for a single
/// connect-to-teardown cycle and is never reused once closed.
#[async_trait]
pub trait TransportSession: Send + Sync + Debug {
    /// Open a stream through the session to `target` (forward tunnels)
    async fn open_stream(&self, target: &Endpoint) -> TransportResult<BoxedStream>;

    /// Listen on the remote side of the session (reverse tunnels)
    async fn listen(&self, bind: &Endpoint) -> TransportResult<Box<dyn TransportListener>>;

    /// Send one liveness ping and wait for the peer's answer
    async fn keepalive(&self) -> TransportResult<()>;

    /// Resolve once the session has ended
    ///
    /// `Ok(())` for an orderly end (peer disconnect, EOF, local close),
    /// `Err` when the transport failed.
    async fn closed(&self) -> TransportResult<()>;

    /// Close the session, unblocking every pending operation on it
    async fn close(&self);

    /// Check if the session has ended
    fn is_closed(&self) -> bool;
}

/// Establishes authenticated sessions for tunnel specs
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// Connect and authenticate to the spec's remote host
    async fn connect(&self, spec: &TunnelSpec) -> TransportResult<Arc<dyn TransportSession>>;
}
