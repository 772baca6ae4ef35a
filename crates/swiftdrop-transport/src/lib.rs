//! The byte transport factory: produces a [`PeerConnection`] by
//! connecting to `(host, port)` or by accepting on a bound listener.
//!
//! TCP gives the reliable, ordered, bidirectional, stream-oriented
//! guarantee the core requires; nothing above this layer cares that it
//! isn't QUIC.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use swiftdrop_core::connection::PeerConnection;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, #[source] source: std::io::Error },
    #[error("failed to bind listener on {addr}: {source}")]
    Bind { addr: SocketAddr, #[source] source: std::io::Error },
    #[error("failed to accept incoming connection: {0}")]
    Accept(#[source] std::io::Error),
}

/// Connects outbound, producing the stream a sender session wraps.
pub async fn connect(addr: SocketAddr) -> Result<PeerConnection<TcpStream>, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Connect { addr, source })?;
    stream.set_nodelay(true).ok();
    debug!(%addr, "connected outbound transport");
    Ok(PeerConnection::new(stream))
}

/// A bound TCP listener accepting inbound transfer connections.
pub struct TransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TransportListener {
    /// Bind on `addr`. Pass port `0` to let the OS pick an ephemeral port;
    /// read it back with [`TransportListener::local_addr`].
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind { addr, source })?;
        info!(%local_addr, "transport listener bound");
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accept the next inbound connection, wrapped as a [`PeerConnection`].
    pub async fn accept(&self) -> Result<(PeerConnection<TcpStream>, SocketAddr), TransportError> {
        let (stream, peer_addr) = self.listener.accept().await.map_err(TransportError::Accept)?;
        stream.set_nodelay(true).ok();
        debug!(%peer_addr, "accepted inbound transport");
        Ok((PeerConnection::new(stream), peer_addr))
    }
}
