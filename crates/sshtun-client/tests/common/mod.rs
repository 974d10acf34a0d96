//! In-memory transport for engine tests
//!
//! Sessions are backed by local TCP: a "remote" listener is a local socket
//! and streams opened through the session dial locally. Connect failures,
//! keepalive answers and session death are scripted by the test.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sshtun_proto::{Endpoint, KeepaliveConfig, TunnelSpec};
use sshtun_transport::{
    dial_local, BoxedStream, TcpTransportListener, TransportConnector, TransportError,
    TransportListener, TransportResult, TransportSession,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct MockSession {
    closed: CancellationToken,
    failure: Mutex<Option<String>>,
    answers_keepalive: AtomicBool,
    breaks_on_close: AtomicBool,
    pub pings: AtomicUsize,
    pub close_calls: AtomicUsize,
}

impl MockSession {
    pub fn new(answers_keepalive: bool) -> Self {
        let session = Self::default();
        session
            .answers_keepalive
            .store(answers_keepalive, Ordering::SeqCst);
        session
    }

    /// Simulate the transport dying underneath the session
    pub fn fail(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
        self.closed.cancel();
    }

    pub fn set_answers_keepalive(&self, answers: bool) {
        self.answers_keepalive.store(answers, Ordering::SeqCst);
    }

    /// Make `close` tear the transport down with an error, yielding before it
    /// returns so that other waiters observe the failure first
    pub fn set_breaks_on_close(&self, breaks: bool) {
        self.breaks_on_close.store(breaks, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn open_stream(&self, target: &Endpoint) -> TransportResult<BoxedStream> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        dial_local(target).await
    }

    async fn listen(&self, bind: &Endpoint) -> TransportResult<Box<dyn TransportListener>> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        Ok(Box::new(TcpTransportListener::bind(bind).await?))
    }

    async fn keepalive(&self) -> TransportResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.answers_keepalive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            // A dead peer never answers
            std::future::pending().await
        }
    }

    async fn closed(&self) -> TransportResult<()> {
        self.closed.cancelled().await;
        match self.failure.lock().unwrap().clone() {
            Some(reason) => Err(TransportError::ConnectionError(reason)),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.breaks_on_close.load(Ordering::SeqCst) {
            self.fail("connection reset by peer");
            tokio::task::yield_now().await;
        } else {
            self.closed.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[derive(Debug)]
pub struct MockConnector {
    failures_left: AtomicUsize,
    answers_keepalive: bool,
    breaks_on_close: bool,
    attempts: Mutex<Vec<Instant>>,
    attempt_count: watch::Sender<usize>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            failures_left: AtomicUsize::new(0),
            answers_keepalive: true,
            breaks_on_close: false,
            attempts: Mutex::new(Vec::new()),
            attempt_count: watch::channel(0).0,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `n` connects
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Sessions whose keepalive pings are never answered
    pub fn unresponsive(mut self) -> Self {
        self.answers_keepalive = false;
        self
    }

    /// Sessions whose `close` surfaces as a transport error
    pub fn breaking_on_close(mut self) -> Self {
        self.breaks_on_close = true;
        self
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub async fn wait_for_attempts(&self, n: usize) {
        let mut rx = self.attempt_count.subscribe();
        rx.wait_for(|count| *count >= n).await.unwrap();
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, _spec: &TunnelSpec) -> TransportResult<Arc<dyn TransportSession>> {
        self.attempts.lock().unwrap().push(Instant::now());
        self.attempt_count.send_modify(|count| *count += 1);

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::ConnectionError("connection refused".into()));
        }

        let session = Arc::new(MockSession::new(self.answers_keepalive));
        session.set_breaks_on_close(self.breaks_on_close);
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub fn spec(name: &str, bind: &str) -> TunnelSpec {
    spec_with(name, bind, Duration::from_secs(5), KeepaliveConfig::disabled())
}

pub fn spec_with(
    name: &str,
    bind: &str,
    retry: Duration,
    keepalive: KeepaliveConfig,
) -> TunnelSpec {
    TunnelSpec::builder(name, bind)
        .server("ssh.example.com")
        .user("deploy")
        .retry_interval(retry)
        .keepalive(keepalive)
        .build()
        .unwrap()
}

/// Echo server on an ephemeral local port
pub async fn echo_server() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    (port, handle)
}

/// Formatted log output at WARN and above, for counting reported errors
#[derive(Debug, Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Route this thread's events here until the guard drops
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
