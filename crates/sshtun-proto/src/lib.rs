//! Tunnel specification types
//!
//! This crate defines the validated, immutable description of a tunnel that the
//! rest of the workspace consumes: endpoints, direction, retry and keepalive
//! settings, and the opaque credential reference handed to the transport.

pub mod endpoint;
pub mod spec;

pub use endpoint::Endpoint;
pub use spec::{
    parse_binding, CredentialRef, Direction, KeepaliveConfig, SpecError, TunnelBinding,
    TunnelSpec, TunnelSpecBuilder,
};

/// Default SSH server port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default delay between connection attempts (seconds)
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 30;

/// Default keepalive interval (seconds)
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Default number of unanswered keepalive requests tolerated
pub const DEFAULT_KEEPALIVE_MAX_MISSES: u32 = 2;
