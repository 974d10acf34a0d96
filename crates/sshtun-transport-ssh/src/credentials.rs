//! Credential resolution
//!
//! A [`CredentialRef`] in a tunnel spec only names where credentials come
//! from. The provider turns it into key material right before each connect,
//! so a rotated key file is picked up on the next retry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::{load_secret_key, PrivateKey};
use sshtun_proto::CredentialRef;
use sshtun_transport::{TransportError, TransportResult};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to load key {path}: {message}")]
    KeyFile { path: PathBuf, message: String },

    #[error("No authentication method available for user {0}")]
    NoMethod(String),
}

impl From<CredentialError> for TransportError {
    fn from(err: CredentialError) -> Self {
        TransportError::AuthenticationFailed(err.to_string())
    }
}

/// Resolved authentication material for one connect attempt
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub key: Option<Arc<PrivateKey>>,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("key", &self.key.as_ref().map(|_| "<key>"))
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Turns a spec's credential reference into usable credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    async fn resolve(&self, reference: &CredentialRef) -> TransportResult<Credentials>;
}

/// Loads private keys from disk, falling back to password authentication
#[derive(Debug, Clone)]
pub struct KeyFileCredentialProvider {
    default_identity: Option<PathBuf>,
}

impl KeyFileCredentialProvider {
    /// Provider whose default identity is `~/.ssh/id_rsa`
    pub fn new() -> Self {
        Self {
            default_identity: dirs::home_dir().map(|home| home.join(".ssh").join("id_rsa")),
        }
    }

    /// Override the identity used when a spec names none
    pub fn with_default_identity(mut self, path: Option<PathBuf>) -> Self {
        self.default_identity = path;
        self
    }

    fn load(&self, reference: &CredentialRef) -> Result<Credentials, CredentialError> {
        let explicit = reference.identity_file.as_deref().map(expand_home);
        let key = match (&explicit, &self.default_identity) {
            (Some(path), _) => match load_key(path) {
                Ok(key) => Some(key),
                Err(e) if reference.password.is_some() => {
                    warn!("{}, falling back to password authentication", e);
                    None
                }
                Err(e) => return Err(e),
            },
            (None, Some(path)) if path.exists() => match load_key(path) {
                Ok(key) => Some(key),
                Err(e) => {
                    debug!("Skipping default identity: {}", e);
                    None
                }
            },
            (None, _) => None,
        };

        if key.is_none() && reference.password.is_none() {
            return Err(CredentialError::NoMethod(reference.user.clone()));
        }

        Ok(Credentials {
            user: reference.user.clone(),
            key,
            password: reference.password.clone(),
        })
    }
}

impl Default for KeyFileCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for KeyFileCredentialProvider {
    async fn resolve(&self, reference: &CredentialRef) -> TransportResult<Credentials> {
        Ok(self.load(reference)?)
    }
}

fn load_key(path: &Path) -> Result<Arc<PrivateKey>, CredentialError> {
    load_secret_key(path, None)
        .map(Arc::new)
        .map_err(|e| CredentialError::KeyFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
