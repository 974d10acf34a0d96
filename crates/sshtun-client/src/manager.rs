//! Per-tunnel session lifecycle

use std::sync::Arc;

use sshtun_proto::{Direction, Endpoint, TunnelSpec};
use sshtun_transport::{
    dial_local, BoxedStream, TcpTransportListener, TransportConnector, TransportListener,
    TransportResult, TransportSession,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::keepalive::KeepaliveMonitor;
use crate::relay::ConnectionRelay;
use crate::report::ReportOnce;

/// Where a tunnel currently is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Dialing and authenticating (also while waiting to retry)
    Connecting,
    /// Session is up, bind socket being opened
    Bound,
    /// Accepting connections on the given endpoint
    Accepting(Endpoint),
    /// Tearing the session down
    Closing,
    /// Cancelled; the manager has returned
    Stopped,
}

/// How one connect-to-teardown cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    Cancelled,
    /// Never got as far as accepting
    Failed,
    /// Was accepting until the session went away
    Collapsed,
}

/// Keeps one tunnel up until cancelled
pub struct SessionManager {
    spec: Arc<TunnelSpec>,
    connector: Arc<dyn TransportConnector>,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(spec: TunnelSpec, connector: Arc<dyn TransportConnector>) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            spec: Arc::new(spec),
            connector,
            state,
        }
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Follow state changes of this tunnel
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run cycles until `cancel` fires
    ///
    /// Returns only after the current session, its bind socket, its
    /// keepalive monitor and all of its relays are gone.
    pub async fn run(self, cancel: CancellationToken) {
        debug!("{} - starting", self.spec);
        loop {
            if self.cycle(&cancel).await == CycleEnd::Cancelled {
                break;
            }

            self.set_state(SessionState::Connecting);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.spec.retry_interval()) => {}
            }
            info!("{} - retrying...", self.spec);
        }
        self.set_state(SessionState::Stopped);
        debug!("{} - stopped", self.spec);
    }

    async fn cycle(&self, cancel: &CancellationToken) -> CycleEnd {
        self.set_state(SessionState::Connecting);
        let report = ReportOnce::new();

        let connected = tokio::select! {
            _ = cancel.cancelled() => return CycleEnd::Cancelled,
            connected = self.connector.connect(&self.spec) => connected,
        };
        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                report.report(&*self.spec, &TunnelError::Connect(e));
                return CycleEnd::Failed;
            }
        };

        let session_token = cancel.child_token();
        let monitor = tokio::spawn(KeepaliveMonitor::new(&self.spec).watch(
            session.clone(),
            session_token.clone(),
            report.clone(),
        ));
        let relays = TaskTracker::new();

        let end = self.serve(&session, &session_token, &report, &relays).await;

        // Everything below is fallout of this teardown
        self.set_state(SessionState::Closing);
        report.suppress();
        session_token.cancel();
        session.close().await;
        relays.close();
        relays.wait().await;
        if let Err(e) = monitor.await {
            warn!("{} - keep-alive monitor failed: {}", self.spec, e);
        }
        if end == CycleEnd::Collapsed {
            info!("{} - collapsed tunnel", self.spec);
        }

        if cancel.is_cancelled() {
            CycleEnd::Cancelled
        } else {
            end
        }
    }

    /// Bind and accept until the session ends
    async fn serve(
        &self,
        session: &Arc<dyn TransportSession>,
        session_token: &CancellationToken,
        report: &ReportOnce,
        relays: &TaskTracker,
    ) -> CycleEnd {
        self.set_state(SessionState::Bound);
        let bound = tokio::select! {
            _ = session_token.cancelled() => return CycleEnd::Failed,
            bound = self.bind(session) => bound,
        };
        let mut listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                report.report(&*self.spec, &TunnelError::Bind(e));
                return CycleEnd::Failed;
            }
        };

        let local = listener.local_endpoint();
        info!("{} - bound tunnel on {}", self.spec, local);
        self.set_state(SessionState::Accepting(local));

        loop {
            tokio::select! {
                biased;
                _ = session_token.cancelled() => {
                    report.suppress();
                    break;
                }
                closed = session.closed() => {
                    match closed {
                        Err(e) => {
                            report.report(&*self.spec, &TunnelError::SessionClosed(e));
                        }
                        Ok(()) => debug!("{} - session closed", self.spec),
                    }
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("{} - accepted connection from {}", self.spec, peer);
                        relays.spawn(dial_and_relay(
                            self.spec.clone(),
                            session.clone(),
                            stream,
                            session_token.child_token(),
                        ));
                    }
                    Err(e) => {
                        report.report(&*self.spec, &TunnelError::Accept(e));
                        break;
                    }
                },
            }
        }

        CycleEnd::Collapsed
    }

    async fn bind(
        &self,
        session: &Arc<dyn TransportSession>,
    ) -> TransportResult<Box<dyn TransportListener>> {
        match self.spec.direction() {
            Direction::Forward => {
                let listener = TcpTransportListener::bind(self.spec.bind()).await?;
                Ok(Box::new(listener))
            }
            Direction::Reverse => session.listen(self.spec.bind()).await,
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

/// Dial the far side of one accepted connection and relay it
async fn dial_and_relay(
    spec: Arc<TunnelSpec>,
    session: Arc<dyn TransportSession>,
    accepted: BoxedStream,
    token: CancellationToken,
) {
    let dialed = tokio::select! {
        _ = token.cancelled() => return,
        dialed = dial(&spec, &session) => dialed,
    };
    match dialed {
        Ok(remote) => {
            ConnectionRelay::new(spec.to_string())
                .run(accepted, remote, &token)
                .await;
        }
        Err(e) => warn!("{} - {}", spec, TunnelError::Dial(e)),
    }
}

async fn dial(
    spec: &TunnelSpec,
    session: &Arc<dyn TransportSession>,
) -> TransportResult<BoxedStream> {
    match spec.direction() {
        Direction::Forward => session.open_stream(spec.dial()).await,
        Direction::Reverse => dial_local(spec.dial()).await,
    }
}
