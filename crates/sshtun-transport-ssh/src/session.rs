//! SSH-backed connector, session and remote listener

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use sshtun_proto::{Endpoint, TunnelSpec};
use sshtun_transport::{
    BoxedStream, TransportConnector, TransportError, TransportListener, TransportResult,
    TransportSession,
};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::credentials::{CredentialProvider, Credentials};
use crate::handler::{ForwardedChannel, RemoteForwards, SessionSignals, TunnelHandler};
use crate::{client_config, CLOSE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, FORWARD_BACKLOG};

/// Opens authenticated SSH sessions
#[derive(Debug)]
pub struct SshConnector {
    credentials: Arc<dyn CredentialProvider>,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            credentials,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl TransportConnector for SshConnector {
    async fn connect(&self, spec: &TunnelSpec) -> TransportResult<Arc<dyn TransportSession>> {
        let credentials = self.credentials.resolve(spec.credential()).await?;

        let forwards = RemoteForwards::default();
        let signals = Arc::new(SessionSignals::default());
        let handler = TunnelHandler::new(forwards.clone(), signals.clone());

        let connecting = client::connect(
            client_config(),
            (spec.remote_host(), spec.remote_port()),
            handler,
        );
        let mut handle = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                TransportError::ConnectionError(format!("{}: {}", spec.remote_addr(), e))
            })?;

        if let Err(e) = authenticate(&mut handle, &credentials).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            return Err(e);
        }
        debug!("Authenticated to {} as {}", spec.remote_addr(), credentials.user);

        Ok(Arc::new(SshSession {
            inner: Arc::new(SessionInner {
                handle: RwLock::new(handle),
                forwards,
                signals,
            }),
        }))
    }
}

async fn authenticate(
    handle: &mut Handle<TunnelHandler>,
    credentials: &Credentials,
) -> TransportResult<()> {
    let user = credentials.user.as_str();
    let auth_error = |e: russh::Error| TransportError::AuthenticationFailed(e.to_string());

    if let Some(key) = &credentials.key {
        let key = PrivateKeyWithHashAlg::new(key.clone(), None);
        if handle
            .authenticate_publickey(user, key)
            .await
            .map_err(auth_error)?
            .success()
        {
            return Ok(());
        }
        debug!("Public key rejected for {}", user);
    }

    if let Some(password) = &credentials.password {
        if handle
            .authenticate_password(user, password.as_str())
            .await
            .map_err(auth_error)?
            .success()
        {
            return Ok(());
        }
    }

    Err(TransportError::AuthenticationFailed(format!(
        "no method accepted for user {}",
        user
    )))
}

struct SessionInner {
    // Written only while requesting a remote forward
    handle: RwLock<Handle<TunnelHandler>>,
    forwards: RemoteForwards,
    signals: Arc<SessionSignals>,
}

impl SessionInner {
    fn channel_error(&self, context: impl fmt::Display, e: russh::Error) -> TransportError {
        if self.signals.is_closed() {
            TransportError::SessionClosed
        } else {
            TransportError::ChannelError(format!("{}: {}", context, e))
        }
    }
}

/// One authenticated SSH connection
pub struct SshSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("closed", &self.inner.signals.is_closed())
            .finish()
    }
}

#[async_trait]
impl TransportSession for SshSession {
    async fn open_stream(&self, target: &Endpoint) -> TransportResult<BoxedStream> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let host = match target.host() {
            "" => "127.0.0.1",
            host => host,
        };
        let channel = self
            .inner
            .handle
            .read()
            .await
            .channel_open_direct_tcpip(host, u32::from(target.port()), "127.0.0.1", 0)
            .await
            .map_err(|e| self.inner.channel_error(target, e))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen(&self, bind: &Endpoint) -> TransportResult<Box<dyn TransportListener>> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let (tx, rx) = mpsc::channel::<ForwardedChannel>(FORWARD_BACKLOG);
        let requested = u32::from(bind.port());
        if requested != 0 {
            // Registered up front so no early channel is lost
            self.inner.forwards.route(requested, tx.clone());
        }

        let result = {
            let mut handle = self.inner.handle.write().await;
            handle.tcpip_forward(bind.host(), requested).await
        };
        let assigned = match result {
            Ok(assigned) => assigned,
            Err(e) => {
                self.inner.forwards.unroute(requested);
                return Err(TransportError::ListenError(format!("{}: {}", bind, e)));
            }
        };

        let port = if requested == 0 {
            self.inner.forwards.route(assigned, tx);
            assigned
        } else {
            requested
        };
        self.inner.forwards.activate(bind.host(), port);
        debug!("Remote forward established on {}:{}", bind.host(), port);

        Ok(Box::new(ForwardedListener {
            inner: self.inner.clone(),
            rx,
            local: Endpoint::new(bind.host(), u16::try_from(port).unwrap_or(bind.port())),
            port,
        }))
    }

    async fn keepalive(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let opened = self.inner.handle.read().await.channel_open_session().await;
        match opened {
            Ok(channel) => {
                let _ = channel.close().await;
                Ok(())
            }
            // A refusal is still an answer
            Err(russh::Error::ChannelOpenFailure(_)) => Ok(()),
            Err(e) => Err(self.inner.channel_error("keepalive", e)),
        }
    }

    async fn closed(&self) -> TransportResult<()> {
        self.inner.signals.wait_closed().await;
        match self.inner.signals.error() {
            Some(e) => Err(TransportError::ConnectionError(e)),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        if self.inner.signals.is_closed() {
            return;
        }
        self.inner.signals.mark_closed();

        let forwards = self.inner.forwards.take_active();
        let shutdown = async {
            let mut handle = self.inner.handle.write().await;
            for (host, port) in &forwards {
                if let Err(e) = handle.cancel_tcpip_forward(host.as_str(), *port).await {
                    debug!("Failed to cancel remote forward on {}:{}: {}", host, port, e);
                }
            }
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        };
        // A keepalive request stuck on a dead peer may hold the lock; the
        // connection then goes down when the last handle is dropped
        if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            debug!("SSH session did not close within {:?}", CLOSE_TIMEOUT);
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.signals.is_closed()
    }
}

/// Listener backed by a `tcpip-forward` request on the server
struct ForwardedListener {
    inner: Arc<SessionInner>,
    rx: mpsc::Receiver<ForwardedChannel>,
    local: Endpoint,
    port: u32,
}

impl fmt::Debug for ForwardedListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedListener")
            .field("local", &self.local)
            .finish()
    }
}

#[async_trait]
impl TransportListener for ForwardedListener {
    async fn accept(&mut self) -> TransportResult<(BoxedStream, String)> {
        tokio::select! {
            next = self.rx.recv() => match next {
                Some((channel, peer)) => Ok((Box::new(channel.into_stream()), peer)),
                None => Err(TransportError::SessionClosed),
            },
            _ = self.inner.signals.wait_closed() => Err(TransportError::SessionClosed),
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }
}

impl Drop for ForwardedListener {
    fn drop(&mut self) {
        // The forward itself is cancelled by `SshSession::close`
        self.inner.forwards.unroute(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshtun_proto::CredentialRef;

    #[derive(Debug)]
    struct PasswordOnly;

    #[async_trait]
    impl CredentialProvider for PasswordOnly {
        async fn resolve(&self, reference: &CredentialRef) -> TransportResult<Credentials> {
            Ok(Credentials {
                user: reference.user.clone(),
                key: None,
                password: Some("secret".to_string()),
            })
        }
    }

    #[derive(Debug)]
    struct NoCredentials;

    #[async_trait]
    impl CredentialProvider for NoCredentials {
        async fn resolve(&self, reference: &CredentialRef) -> TransportResult<Credentials> {
            Err(TransportError::AuthenticationFailed(reference.user.clone()))
        }
    }

    fn spec_for(port: u16) -> TunnelSpec {
        TunnelSpec::builder("test", "127.0.0.1:0 -> 127.0.0.1:80")
            .server("127.0.0.1")
            .port(port)
            .user("deploy")
            .build()
            .unwrap()
    }

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = SshConnector::new(Arc::new(PasswordOnly));
        let result = connector.connect(&spec_for(unused_port().await)).await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_connect_times_out_on_silent_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold the socket without ever sending an SSH banner
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let connector = SshConnector::new(Arc::new(PasswordOnly))
            .with_connect_timeout(Duration::from_millis(200));
        let result = connector.connect(&spec_for(port)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        server.abort();
    }

    #[tokio::test]
    async fn test_credential_failure_skips_dial() {
        let connector = SshConnector::new(Arc::new(NoCredentials));
        let result = connector.connect(&spec_for(unused_port().await)).await;
        assert!(matches!(
            result,
            Err(TransportError::AuthenticationFailed(ref user)) if user == "deploy"
        ));
    }
}
