//! Tunnel specification

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::{
    DEFAULT_KEEPALIVE_INTERVAL_SECS, DEFAULT_KEEPALIVE_MAX_MISSES, DEFAULT_RETRY_INTERVAL_SECS,
    DEFAULT_SSH_PORT,
};

/// Specification errors
///
/// These are fatal for the tunnel they describe: a rejected spec never
/// reaches the engine and is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("invalid tunnel syntax: {0}")]
    InvalidSyntax(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("tunnel name must not be empty")]
    EmptyName,

    #[error("duplicate tunnel name: {0}")]
    DuplicateName(String),

    #[error("invalid server: {0:?}")]
    InvalidServer(String),

    #[error("retry interval must be greater than zero")]
    ZeroRetryInterval,
}

/// Which side of the session listens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Listen locally, dial through the session
    Forward,
    /// Listen through the session (on the remote host), dial locally
    Reverse,
}

impl Direction {
    /// The operator used in the bind syntax
    pub fn operator(&self) -> &'static str {
        match self {
            Direction::Forward => "->",
            Direction::Reverse => "<-",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Reverse => f.write_str("reverse"),
        }
    }
}

/// Parsed form of a `"<endpoint> (-> | <-) <endpoint>"` expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelBinding {
    pub direction: Direction,
    /// Where the listening socket is opened
    pub bind: Endpoint,
    /// What each accepted connection is relayed to
    pub dial: Endpoint,
}

impl TunnelBinding {
    /// One-line summary in the same orientation as the bind syntax
    pub fn summary(&self) -> String {
        let (left, right) = match self.direction {
            Direction::Forward => (&self.bind, &self.dial),
            Direction::Reverse => (&self.dial, &self.bind),
        };
        format!("{} {} {}", left, self.direction.operator(), right)
    }
}

/// Parse a bind expression.
///
/// `"A -> B"` is a forward tunnel (bind locally at A, dial B through the
/// session). `"A <- B"` is a reverse tunnel (bind B on the remote side, dial A
/// locally).
pub fn parse_binding(expr: &str) -> Result<TunnelBinding, SpecError> {
    let tokens: Vec<&str> = expr.split_whitespace().collect();
    let [left, op, right] = tokens.as_slice() else {
        return Err(SpecError::InvalidSyntax(expr.to_string()));
    };

    let (direction, bind, dial) = match *op {
        "->" => (Direction::Forward, *left, *right),
        "<-" => (Direction::Reverse, *right, *left),
        _ => return Err(SpecError::InvalidSyntax(expr.to_string())),
    };

    Ok(TunnelBinding {
        direction,
        bind: Endpoint::parse(bind)?,
        dial: Endpoint::parse(dial)?,
    })
}

/// Keepalive request cadence and failure tolerance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub max_misses: u32,
}

impl KeepaliveConfig {
    pub fn new(interval: Duration, max_misses: u32) -> Self {
        Self {
            interval,
            max_misses,
        }
    }

    /// Monitoring that never runs
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    /// Zero interval or zero tolerance disables monitoring
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero() && self.max_misses > 0
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            DEFAULT_KEEPALIVE_MAX_MISSES,
        )
    }
}

/// Opaque credential handle, resolved by the transport's credential provider
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialRef {
    pub user: String,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRef")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

/// Validated description of one tunnel
///
/// Immutable once built; construct through [`TunnelSpec::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    name: String,
    remote_host: String,
    remote_port: u16,
    binding: TunnelBinding,
    retry_interval: Duration,
    keepalive: KeepaliveConfig,
    credential: CredentialRef,
}

impl TunnelSpec {
    pub fn builder(name: impl Into<String>, bind: impl Into<String>) -> TunnelSpecBuilder {
        TunnelSpecBuilder::new(name, bind)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// The SSH server as `host:port`
    pub fn remote_addr(&self) -> String {
        Endpoint::new(self.remote_host.clone(), self.remote_port).to_string()
    }

    pub fn direction(&self) -> Direction {
        self.binding.direction
    }

    pub fn bind(&self) -> &Endpoint {
        &self.binding.bind
    }

    pub fn dial(&self) -> &Endpoint {
        &self.binding.dial
    }

    pub fn binding(&self) -> &TunnelBinding {
        &self.binding
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn keepalive(&self) -> KeepaliveConfig {
        self.keepalive
    }

    pub fn credential(&self) -> &CredentialRef {
        &self.credential
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({})",
            self.name,
            self.remote_addr(),
            self.binding.summary()
        )
    }
}

/// Builder for [`TunnelSpec`]
#[derive(Debug, Clone)]
pub struct TunnelSpecBuilder {
    name: String,
    bind: String,
    remote_host: String,
    remote_port: u16,
    retry_interval: Duration,
    keepalive: KeepaliveConfig,
    credential: CredentialRef,
}

impl TunnelSpecBuilder {
    pub fn new(name: impl Into<String>, bind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind: bind.into(),
            remote_host: String::new(),
            remote_port: DEFAULT_SSH_PORT,
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            keepalive: KeepaliveConfig::default(),
            credential: CredentialRef::default(),
        }
    }

    pub fn server(mut self, host: impl Into<String>) -> Self {
        self.remote_host = host.into();
        self
    }

    /// SSH port; `0` selects the default port
    pub fn port(mut self, port: u16) -> Self {
        self.remote_port = if port == 0 { DEFAULT_SSH_PORT } else { port };
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.credential.user = user.into();
        self
    }

    pub fn password(mut self, password: Option<String>) -> Self {
        self.credential.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn identity_file(mut self, path: Option<PathBuf>) -> Self {
        self.credential.identity_file = path;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn build(self) -> Result<TunnelSpec, SpecError> {
        if self.name.trim().is_empty() {
            return Err(SpecError::EmptyName);
        }
        let binding = parse_binding(&self.bind)?;
        if self.remote_host.trim().is_empty() {
            return Err(SpecError::InvalidServer(self.remote_host));
        }
        if self.retry_interval.is_zero() {
            return Err(SpecError::ZeroRetryInterval);
        }

        Ok(TunnelSpec {
            name: self.name,
            remote_host: self.remote_host,
            remote_port: self.remote_port,
            binding,
            retry_interval: self.retry_interval,
            keepalive: self.keepalive,
            credential: self.credential,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forward_binding() {
        let binding = parse_binding("127.0.0.1:8080 -> 10.0.0.5:80").unwrap();
        assert_eq!(binding.direction, Direction::Forward);
        assert_eq!(binding.bind.to_string(), "127.0.0.1:8080");
        assert_eq!(binding.dial.to_string(), "10.0.0.5:80");
        assert_eq!(binding.summary(), "127.0.0.1:8080 -> 10.0.0.5:80");
    }

    #[test]
    fn test_parse_reverse_binding() {
        let binding = parse_binding("10.0.0.5:80 <- 127.0.0.1:8080").unwrap();
        assert_eq!(binding.direction, Direction::Reverse);
        assert_eq!(binding.bind.to_string(), "127.0.0.1:8080");
        assert_eq!(binding.dial.to_string(), "10.0.0.5:80");
        assert_eq!(binding.summary(), "10.0.0.5:80 <- 127.0.0.1:8080");
    }

    #[test]
    fn test_parse_binding_tolerates_extra_whitespace() {
        let binding = parse_binding("  :3000\t->   db:5432 ").unwrap();
        assert_eq!(binding.direction, Direction::Forward);
        assert_eq!(binding.bind.port(), 3000);
        assert_eq!(binding.dial.host(), "db");
    }

    #[test]
    fn test_parse_binding_rejects_bad_syntax() {
        for expr in [
            "notanaddress",
            "",
            "127.0.0.1:80 127.0.0.1:81",
            "127.0.0.1:80 => 127.0.0.1:81",
            "127.0.0.1:80 -> 127.0.0.1:81 -> 127.0.0.1:82",
            "a:1 <-> b:2",
        ] {
            assert!(
                matches!(parse_binding(expr), Err(SpecError::InvalidSyntax(_))),
                "expected syntax error for {:?}",
                expr
            );
        }
    }

    #[test]
    fn test_parse_binding_rejects_bad_endpoint() {
        let err = parse_binding("127.0.0.1 -> 10.0.0.5:80").unwrap_err();
        assert_eq!(err, SpecError::InvalidEndpoint("127.0.0.1".to_string()));

        let err = parse_binding("10.0.0.5:80 <- localhost:http").unwrap_err();
        assert_eq!(err, SpecError::InvalidEndpoint("localhost:http".to_string()));
    }

    #[test]
    fn test_builder_defaults() {
        let spec = TunnelSpec::builder("db", "127.0.0.1:5432 -> 10.0.0.5:5432")
            .server("bastion")
            .user("deploy")
            .build()
            .unwrap();

        assert_eq!(spec.name(), "db");
        assert_eq!(spec.remote_addr(), "bastion:22");
        assert_eq!(spec.retry_interval(), Duration::from_secs(30));
        assert_eq!(spec.keepalive(), KeepaliveConfig::new(Duration::from_secs(30), 2));
        assert_eq!(spec.credential().user, "deploy");
        assert!(spec.credential().password.is_none());
    }

    #[test]
    fn test_builder_port_zero_uses_default() {
        let spec = TunnelSpec::builder("db", ":1 -> :2")
            .server("bastion")
            .port(0)
            .build()
            .unwrap();
        assert_eq!(spec.remote_port(), 22);
    }

    #[test]
    fn test_builder_validation() {
        let err = TunnelSpec::builder("", ":1 -> :2")
            .server("h")
            .build()
            .unwrap_err();
        assert_eq!(err, SpecError::EmptyName);

        let err = TunnelSpec::builder("t", ":1 -> :2").build().unwrap_err();
        assert!(matches!(err, SpecError::InvalidServer(_)));

        let err = TunnelSpec::builder("t", ":1 -> :2")
            .server("h")
            .retry_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, SpecError::ZeroRetryInterval);
    }

    #[test]
    fn test_display_label() {
        let spec = TunnelSpec::builder("web", "10.0.0.5:80 <- 127.0.0.1:8080")
            .server("edge.example.com")
            .port(2222)
            .build()
            .unwrap();
        assert_eq!(
            spec.to_string(),
            "[web] edge.example.com:2222 (10.0.0.5:80 <- 127.0.0.1:8080)"
        );
    }

    #[test]
    fn test_keepalive_enabled() {
        assert!(KeepaliveConfig::default().is_enabled());
        assert!(!KeepaliveConfig::disabled().is_enabled());
        assert!(!KeepaliveConfig::new(Duration::from_secs(1), 0).is_enabled());
        assert!(!KeepaliveConfig::new(Duration::ZERO, 3).is_enabled());
    }

    #[test]
    fn test_credential_debug_masks_password() {
        let cred = CredentialRef {
            user: "u".into(),
            password: Some("hunter2".into()),
            identity_file: None,
        };
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("hunter2"));
    }
}
