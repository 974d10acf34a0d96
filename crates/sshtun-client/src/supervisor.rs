//! Runs every configured tunnel until shutdown

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use sshtun_proto::TunnelSpec;
use sshtun_transport::TransportConnector;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::manager::{SessionManager, SessionState};

/// Owns one [`SessionManager`] per tunnel
pub struct TunnelSupervisor {
    managers: Vec<SessionManager>,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl TunnelSupervisor {
    pub fn new(specs: Vec<TunnelSpec>, connector: Arc<dyn TransportConnector>) -> Self {
        let managers = specs
            .into_iter()
            .map(|spec| SessionManager::new(spec, connector.clone()))
            .collect();
        Self {
            managers,
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// State receivers keyed by tunnel name
    pub fn states(&self) -> HashMap<String, watch::Receiver<SessionState>> {
        self.managers
            .iter()
            .map(|m| (m.spec().name().to_string(), m.subscribe()))
            .collect()
    }

    /// Start all tunnels and block until they have all stopped
    ///
    /// Tunnels only stop for good once `shutdown` resolves, which cancels
    /// every tunnel exactly once and then waits for them to drain.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("Starting {} tunnel(s)", self.managers.len());
        for manager in self.managers {
            self.tracker.spawn(manager.run(self.root.child_token()));
        }
        self.tracker.close();

        tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested, stopping {} tunnel(s)", self.tracker.len());
                self.root.cancel();
            }
            _ = self.tracker.wait() => {}
        }

        self.tracker.wait().await;
        info!("All tunnels stopped");
    }
}
