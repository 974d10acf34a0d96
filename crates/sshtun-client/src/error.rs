//! Tunnel-level errors

use sshtun_transport::TransportError;
use thiserror::Error;

/// Everything that can end a connection or a session cycle
///
/// The display form is what ends up in the log, prefixed with the tunnel
/// label.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("SSH dial error: {0}")]
    Connect(TransportError),

    #[error("bind error: {0}")]
    Bind(TransportError),

    #[error("accept error: {0}")]
    Accept(TransportError),

    #[error("dial error: {0}")]
    Dial(TransportError),

    #[error("connection error: {0}")]
    Relay(#[from] std::io::Error),

    #[error("SSH keep-alive termination")]
    KeepaliveTimeout,

    #[error("SSH error: {0}")]
    SessionClosed(TransportError),
}
