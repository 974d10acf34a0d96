//! Tunnel configuration file
//!
//! A TOML file with one `[tunnel.<name>]` table per tunnel. Keys are accepted
//! in lowercase or in the capitalized form older config files use:
//!
//! ```toml
//! [tunnel.default]
//! Server = "bastion.example.com"
//! ID = "deploy"
//!
//! [tunnel.db]
//! Bind = "127.0.0.1:5432 -> 10.0.0.5:5432"
//! ```
//!
//! A tunnel named `default` is never started; its `server`, `port`, `id` and
//! `password` apply to every tunnel that leaves `server` empty.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sshtun_proto::{
    KeepaliveConfig, SpecError, TunnelSpec, DEFAULT_KEEPALIVE_INTERVAL_SECS,
    DEFAULT_KEEPALIVE_MAX_MISSES, DEFAULT_RETRY_INTERVAL_SECS,
};
use thiserror::Error;
use tracing::warn;

/// Name of the entry that carries shared connection settings
pub const DEFAULT_ENTRY: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("[{name}] {source}")]
    Rejected {
        name: String,
        #[source]
        source: SpecError,
    },

    #[error("No valid tunnels configured")]
    NoTunnels,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default, alias = "Tunnel")]
    tunnel: BTreeMap<String, TunnelEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TunnelEntry {
    #[serde(alias = "Server")]
    server: String,
    #[serde(alias = "Port")]
    port: u16,
    #[serde(alias = "ID", alias = "Id")]
    id: String,
    #[serde(alias = "Password")]
    password: String,
    #[serde(alias = "Bind")]
    bind: String,
    #[serde(alias = "IdentityFile")]
    identity_file: Option<PathBuf>,
    /// Seconds
    retry_interval: Option<u64>,
    /// Seconds
    keepalive_interval: Option<u64>,
    keepalive_max: Option<u32>,
}

impl TunnelEntry {
    /// Inherit the connection settings of `default` when no server is set
    fn inherit(mut self, default: Option<&TunnelEntry>) -> Self {
        if let Some(default) = default {
            if self.server.is_empty() && !default.server.is_empty() {
                self.server = default.server.clone();
                self.port = default.port;
                self.id = default.id.clone();
                self.password = default.password.clone();
            }
        }
        self
    }

    fn into_spec(self, name: &str) -> Result<TunnelSpec, SpecError> {
        let keepalive = KeepaliveConfig::new(
            Duration::from_secs(
                self.keepalive_interval
                    .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            ),
            self.keepalive_max.unwrap_or(DEFAULT_KEEPALIVE_MAX_MISSES),
        );

        TunnelSpec::builder(name, self.bind)
            .server(self.server)
            .port(self.port)
            .user(self.id)
            .password(Some(self.password))
            .identity_file(self.identity_file)
            .retry_interval(Duration::from_secs(
                self.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL_SECS),
            ))
            .keepalive(keepalive)
            .build()
    }
}

/// A tunnel that failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub name: String,
    pub error: SpecError,
}

/// Every tunnel of a config file, validated individually
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    specs: Vec<TunnelSpec>,
    rejected: Vec<Rejection>,
}

impl TunnelConfig {
    /// Load and validate the config file at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Validate config text; only malformed TOML is an error here
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut file: ConfigFile = toml::from_str(text)?;
        let default = file.tunnel.remove(DEFAULT_ENTRY);

        let mut config = TunnelConfig::default();
        let mut seen = HashSet::new();
        for (name, entry) in file.tunnel {
            // Table keys are case sensitive, tunnel names are not
            if !seen.insert(name.to_lowercase()) {
                config.reject(&name, SpecError::DuplicateName(name.clone()));
                continue;
            }
            match entry.inherit(default.as_ref()).into_spec(&name) {
                Ok(spec) => config.specs.push(spec),
                Err(error) => config.reject(&name, error),
            }
        }
        Ok(config)
    }

    fn reject(&mut self, name: &str, error: SpecError) {
        self.rejected.push(Rejection {
            name: name.to_string(),
            error,
        });
    }

    /// Valid tunnels, sorted by name
    pub fn specs(&self) -> &[TunnelSpec] {
        &self.specs
    }

    pub fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }

    /// The tunnels to start
    ///
    /// Rejections are logged and skipped; with `strict` the first one is
    /// returned as an error instead. An empty result is always an error.
    pub fn into_runnable(self, strict: bool) -> Result<Vec<TunnelSpec>, ConfigError> {
        if strict {
            if let Some(rejection) = self.rejected.into_iter().next() {
                return Err(ConfigError::Rejected {
                    name: rejection.name,
                    source: rejection.error,
                });
            }
        } else {
            for rejection in &self.rejected {
                warn!("[{}] rejected: {}", rejection.name, rejection.error);
            }
        }

        if self.specs.is_empty() {
            return Err(ConfigError::NoTunnels);
        }
        Ok(self.specs)
    }
}

/// Human-readable listing used by print mode
impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for spec in &self.specs {
            let credential = spec.credential();
            let keepalive = spec.keepalive();
            writeln!(f, "NAME = {}", spec.name())?;
            writeln!(f, "\tSERVER = {}", spec.remote_host())?;
            writeln!(f, "\tPORT = {}", spec.remote_port())?;
            writeln!(f, "\tID = {}", credential.user)?;
            writeln!(
                f,
                "\tPASSWORD = {}",
                if credential.password.is_some() { "********" } else { "" }
            )?;
            if let Some(identity) = &credential.identity_file {
                writeln!(f, "\tIDENTITY FILE = {}", identity.display())?;
            }
            writeln!(f, "\tBIND = {}", spec.binding().summary())?;
            writeln!(f, "\tHOST ADDR = {}", spec.remote_addr())?;
            writeln!(
                f,
                "\tBIND-DIAL = {} => {} ({})",
                spec.bind(),
                spec.dial(),
                spec.direction()
            )?;
            writeln!(f, "\tRETRY INTERVAL = {:?}", spec.retry_interval())?;
            writeln!(
                f,
                "\tKEEP ALIVE INTERVAL/COUNT = {:?}/{}",
                keepalive.interval, keepalive.max_misses
            )?;
        }
        for rejection in &self.rejected {
            writeln!(f, "REJECTED = {}: {}", rejection.name, rejection.error)?;
        }
        Ok(())
    }
}

/// `<directory of the executable>/config/config.toml`
pub fn default_config_path() -> PathBuf {
    let base = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("config").join("config.toml")
}
