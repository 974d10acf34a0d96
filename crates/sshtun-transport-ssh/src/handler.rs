//! russh client callbacks

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An inbound `forwarded-tcpip` channel and its originator
pub(crate) type ForwardedChannel = (Channel<Msg>, String);

/// Remote forwards of one session
///
/// A forward stays active on the server after its listener is dropped; it is
/// cancelled when the session closes.
#[derive(Debug, Clone, Default)]
pub(crate) struct RemoteForwards {
    table: Arc<Mutex<ForwardTable>>,
}

#[derive(Debug, Default)]
struct ForwardTable {
    // Listeners by bound port
    routes: HashMap<u32, mpsc::Sender<ForwardedChannel>>,
    active: Vec<(String, u32)>,
}

impl RemoteForwards {
    fn table(&self) -> MutexGuard<'_, ForwardTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn route(&self, port: u32, tx: mpsc::Sender<ForwardedChannel>) {
        self.table().routes.insert(port, tx);
    }

    pub(crate) fn unroute(&self, port: u32) {
        self.table().routes.remove(&port);
    }

    fn sender(&self, port: u32) -> Option<mpsc::Sender<ForwardedChannel>> {
        self.table().routes.get(&port).cloned()
    }

    /// Record a forward the server accepted
    pub(crate) fn activate(&self, host: &str, port: u32) {
        self.table().active.push((host.to_string(), port));
    }

    /// Forwards still to be cancelled; each one is handed out once
    pub(crate) fn take_active(&self) -> Vec<(String, u32)> {
        std::mem::take(&mut self.table().active)
    }
}

/// Liveness state shared between the handler and the session
#[derive(Debug, Default)]
pub(crate) struct SessionSignals {
    closed: CancellationToken,
    error: Mutex<Option<String>>,
}

impl SessionSignals {
    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    fn record_error(&self, message: String) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(message);
    }

    /// The transport failure that ended the session, if any
    pub(crate) fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) struct TunnelHandler {
    forwards: RemoteForwards,
    signals: Arc<SessionSignals>,
}

impl TunnelHandler {
    pub(crate) fn new(forwards: RemoteForwards, signals: Arc<SessionSignals>) -> Self {
        Self { forwards, signals }
    }
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let peer = format!("{}:{}", originator_address, originator_port);
        match self.forwards.sender(connected_port) {
            Some(tx) => {
                if let Err(e) = tx.try_send((channel, peer)) {
                    warn!(
                        "Dropping forwarded connection to {}:{}: listener not keeping up",
                        connected_address, connected_port
                    );
                    let (channel, _) = e.into_inner();
                    let _ = channel.close().await;
                }
            }
            None => {
                debug!(
                    "No listener for forwarded connection to {}:{}",
                    connected_address, connected_port
                );
                let _ = channel.close().await;
            }
        }
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        match reason {
            client::DisconnectReason::ReceivedDisconnect(_) => {
                debug!("Server closed the SSH session");
            }
            client::DisconnectReason::Error(e) => {
                self.signals.record_error(e.to_string());
            }
        }
        Ok(())
    }
}

impl Drop for TunnelHandler {
    fn drop(&mut self) {
        // The handler lives exactly as long as the russh session task
        self.signals.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropping_handler_closes_session() {
        let signals = Arc::new(SessionSignals::default());
        let handler = TunnelHandler::new(RemoteForwards::default(), signals.clone());
        assert!(!signals.is_closed());

        drop(handler);
        assert!(signals.is_closed());
        signals.wait_closed().await;
        assert!(signals.error().is_none());
    }

    #[test]
    fn test_dropped_listener_keeps_forward_until_taken() {
        let forwards = RemoteForwards::default();
        let (tx, _rx) = mpsc::channel(1);
        forwards.route(8080, tx);
        forwards.activate("0.0.0.0", 8080);
        forwards.activate("", 9090);

        forwards.unroute(8080);
        assert!(forwards.sender(8080).is_none());

        assert_eq!(
            forwards.take_active(),
            vec![("0.0.0.0".to_string(), 8080), (String::new(), 9090)]
        );
        assert!(forwards.take_active().is_empty());
    }

    #[test]
    fn test_first_error_wins() {
        let signals = SessionSignals::default();
        signals.record_error("connection reset".to_string());
        signals.record_error("broken pipe".to_string());
        assert_eq!(signals.error().as_deref(), Some("connection reset"));
    }
}
