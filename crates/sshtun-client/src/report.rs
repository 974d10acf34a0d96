//! Single-assignment error reporting

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::TunnelError;

/// Logs only the first failure of a scope
///
/// One guard is shared by every task of a session cycle (or of a relay).
/// The first caller to [`report`](Self::report) wins and is logged; later
/// failures are consequences of the same teardown and go to debug only.
#[derive(Debug, Clone, Default)]
pub struct ReportOnce {
    used: Arc<AtomicBool>,
}

impl ReportOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `err` under `label` if nothing was reported yet
    ///
    /// Returns whether this call was the one that got logged.
    pub fn report(&self, label: impl fmt::Display, err: &TunnelError) -> bool {
        if self.claim() {
            warn!("{} - {}", label, err);
            true
        } else {
            debug!("{} - {} (suppressed)", label, err);
            false
        }
    }

    /// Mark the scope as reported without logging anything
    pub fn suppress(&self) -> bool {
        self.claim()
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        self.used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
