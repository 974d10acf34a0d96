//! Bidirectional byte relay between two connected streams

use std::sync::Arc;

use sshtun_transport::BoxedStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TunnelError;
use crate::report::ReportOnce;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Outcome of one relay invocation
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Bytes copied from the accepted side to the dialed side
    pub local_to_remote: u64,
    /// Bytes copied from the dialed side to the accepted side
    pub remote_to_local: u64,
    /// The error that was logged, if any
    pub error: Option<TunnelError>,
    /// Errors that were dropped because another one was logged first
    pub suppressed: usize,
}

/// Copies bytes both ways until either side stops
#[derive(Debug, Clone)]
pub struct ConnectionRelay {
    label: Arc<str>,
}

struct PumpEnd {
    bytes: u64,
    reported: Option<TunnelError>,
    suppressed: bool,
}

impl ConnectionRelay {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
        }
    }

    /// Relay between `local` (accepted) and `remote` (dialed)
    ///
    /// Returns once both directions have stopped. Cancelling `parent` ends
    /// the relay; so does either direction reaching EOF or failing.
    pub async fn run(
        &self,
        local: BoxedStream,
        remote: BoxedStream,
        parent: &CancellationToken,
    ) -> RelayStats {
        let token = parent.child_token();
        let report = ReportOnce::new();
        debug!("{} - connection established", self.label);

        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);

        let outbound = tokio::spawn(pump(
            local_read,
            remote_write,
            token.clone(),
            report.clone(),
            self.label.clone(),
        ));
        let inbound = tokio::spawn(pump(
            remote_read,
            local_write,
            token.clone(),
            report,
            self.label.clone(),
        ));

        let (outbound, inbound) = tokio::join!(outbound, inbound);
        token.cancel();

        let mut stats = RelayStats::default();
        for (end, counter) in [
            (outbound, &mut stats.local_to_remote),
            (inbound, &mut stats.remote_to_local),
        ] {
            let Ok(end) = end else { continue };
            *counter = end.bytes;
            if end.reported.is_some() {
                stats.error = end.reported;
            }
            if end.suppressed {
                stats.suppressed += 1;
            }
        }

        debug!(
            "{} - connection closed ({} bytes out, {} bytes in)",
            self.label, stats.local_to_remote, stats.remote_to_local
        );
        stats
    }
}

/// Copy one direction until EOF, error or cancellation
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    token: CancellationToken,
    report: ReportOnce,
    label: Arc<str>,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Whichever direction stops first takes the other one down with it
    let _stop_sibling = token.clone().drop_guard();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let failure = loop {
        // A read that has already failed wins over cancellation so the
        // failure is accounted for below
        let n = tokio::select! {
            biased;
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = writer.shutdown().await;
                    break None;
                }
                Ok(n) => n,
                Err(e) => break Some(e),
            },
            _ = token.cancelled() => break None,
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => break None,
            written = writer.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    break Some(e);
                }
            }
        }
        bytes += n as u64;
    };

    let Some(e) = failure else {
        return PumpEnd {
            bytes,
            reported: None,
            suppressed: false,
        };
    };
    // An error observed after the sibling already stopped is fallout
    if token.is_cancelled() {
        report.suppress();
    }
    let err = TunnelError::Relay(e);
    if report.report(&*label, &err) {
        PumpEnd {
            bytes,
            reported: Some(err),
            suppressed: false,
        }
    } else {
        PumpEnd {
            bytes,
            reported: None,
            suppressed: true,
        }
    }
}
