//! Local TCP sockets

use async_trait::async_trait;
use sshtun_proto::Endpoint;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::{BoxedStream, TransportError, TransportListener, TransportResult};

/// A local TCP listener
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
    local: Endpoint,
}

impl TcpTransportListener {
    /// Bind a local listening socket at `endpoint`
    pub async fn bind(endpoint: &Endpoint) -> TransportResult<Self> {
        let addr = endpoint.local_bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::ListenError(format!("{}: {}", addr, e)))?;
        let bound = listener.local_addr()?;
        debug!("Listening locally on {}", bound);

        Ok(Self {
            listener,
            local: Endpoint::new(bound.ip().to_string(), bound.port()),
        })
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&mut self) -> TransportResult<(BoxedStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }
}

/// Dial `endpoint` from this machine
pub async fn dial_local(endpoint: &Endpoint) -> TransportResult<BoxedStream> {
    let addr = endpoint.local_dial_addr();
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| TransportError::ConnectionError(format!("{}: {}", addr, e)))?;
    let _ = stream.set_nodelay(true);
    Ok(Box::new(stream))
}
