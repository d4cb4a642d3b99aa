//! Transport abstraction
//!
//! The engine only needs ordered, reliable byte streams: a way to dial a
//! peer and a way to accept inbound peers. [`TcpTransport`] provides both
//! over TCP.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::error::TorrentError;

/// Accepts inbound streams
#[async_trait]
pub trait Listener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn accept(&mut self) -> Result<(Self::Stream, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Provides byte streams to peers
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Listener: Listener<Stream = Self::Stream>;

    /// Start accepting on `port` (0 = OS-assigned)
    async fn listen(&self, port: u16) -> Result<Self::Listener>;

    /// Open a stream to `addr`
    async fn dial(&self, addr: SocketAddr) -> Result<Self::Stream>;
}

/// TCP transport with a dial timeout
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind_ip: std::net::IpAddr,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            bind_ip: std::net::IpAddr::from([0, 0, 0, 0]),
            connect_timeout,
        }
    }

    /// Listen on a specific interface instead of all of them
    pub fn with_bind_ip(mut self, bind_ip: std::net::IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = TcpListener::accept(self)
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to accept connection", "listener", e.to_string()))?;
        stream.set_nodelay(true).ok();
        Ok((stream, addr))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(TcpListener::local_addr(self)?)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpListener;

    async fn listen(&self, port: u16) -> Result<TcpListener> {
        let bind_addr = SocketAddr::new(self.bind_ip, port);
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind {}: {}", bind_addr, e);
            TorrentError::network_error_full("Failed to bind listener", bind_addr.to_string(), e.to_string())
        })?;
        info!("Listening for peers on {}", Listener::local_addr(&listener)?);
        Ok(listener)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream> {
        debug!("Connecting to peer {}", addr);
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                debug!("Connection to {} timed out", addr);
                TorrentError::network_error_with_address("Connection timed out", addr.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}
