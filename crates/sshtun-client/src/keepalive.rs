//! Session liveness monitoring

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use sshtun_proto::{KeepaliveConfig, TunnelSpec};
use sshtun_transport::TransportSession;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TunnelError;
use crate::report::ReportOnce;

/// Why a monitor stopped watching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// Keepalive is switched off for this tunnel
    Disabled,
    /// The teardown scope was cancelled by someone else
    Stopped,
    /// The session ended on its own
    SessionClosed,
    /// Too many pings went unanswered; the session was torn down
    Dead,
}

/// Pings one session on a fixed tick
#[derive(Debug, Clone)]
pub struct KeepaliveMonitor {
    label: String,
    config: KeepaliveConfig,
}

impl KeepaliveMonitor {
    pub fn new(spec: &TunnelSpec) -> Self {
        Self {
            label: spec.to_string(),
            config: spec.keepalive(),
        }
    }

    /// Watch `session` until it dies, closes, or `teardown` is cancelled
    ///
    /// Every tick counts a miss before sending the ping; an answered ping
    /// resets the count. Once the count exceeds the configured maximum the
    /// termination is reported through `report`, the session is closed and
    /// `teardown` is cancelled.
    pub async fn watch(
        self,
        session: Arc<dyn TransportSession>,
        teardown: CancellationToken,
        report: ReportOnce,
    ) -> KeepaliveOutcome {
        if !self.config.is_enabled() {
            return KeepaliveOutcome::Disabled;
        }

        let period = self.config.interval;
        let max_misses = self.config.max_misses;
        let misses = Arc::new(AtomicU32::new(0));
        // Dropping the set aborts pings still in flight
        let mut pings = JoinSet::new();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = teardown.cancelled() => return KeepaliveOutcome::Stopped,
                closed = session.closed() => {
                    if let Err(e) = closed {
                        report.report(&self.label, &TunnelError::SessionClosed(e));
                    }
                    return KeepaliveOutcome::SessionClosed;
                }
                _ = ticker.tick() => {
                    while pings.try_join_next().is_some() {}

                    let missed = misses.fetch_add(1, Ordering::AcqRel) + 1;
                    if missed > max_misses {
                        report.report(&self.label, &TunnelError::KeepaliveTimeout);
                        // Pings in flight would hold up the close
                        pings.shutdown().await;
                        session.close().await;
                        teardown.cancel();
                        return KeepaliveOutcome::Dead;
                    }

                    let session = session.clone();
                    let misses = misses.clone();
                    let label = self.label.clone();
                    pings.spawn(async move {
                        match session.keepalive().await {
                            Ok(()) => misses.store(0, Ordering::Release),
                            Err(e) => debug!("{} - keep-alive ping failed: {}", label, e),
                        }
                    });
                }
            }
        }
    }
}
