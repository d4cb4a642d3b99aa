//! Engine controller
//!
//! Owns the registered torrents, the listening socket and every spawned peer
//! unit. Inbound connections are routed to a torrent by the info hash of
//! their handshake; outbound connections are dialled on request or from a
//! stream of peer candidates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::TorrentError;
use crate::peer::{Listener, PeerCandidate, PeerConnection, PeerSource, TcpTransport, Transport};
use crate::protocol::{BitTorrentWire, Handshake};
use crate::storage::Storage;
use crate::torrent::Torrent;
use crate::transfer::{AnnounceStats, Orchestrator};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

type TorrentMap = Arc<RwLock<HashMap<[u8; 20], Arc<Orchestrator>>>>;

/// Top-level engine handle
pub struct Controller<T: Transport = TcpTransport> {
    config: EngineConfig,
    transport: Arc<T>,
    peer_id: [u8; 20],
    torrents: TorrentMap,
    /// Accept loop and candidate intake
    services: Mutex<Vec<JoinHandle<()>>>,
    /// Peer units (including ones still handshaking)
    peers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Controller<TcpTransport> {
    /// Controller over TCP
    pub fn new(config: EngineConfig) -> Result<Self> {
        let transport = TcpTransport::new(config.connect_timeout());
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> Controller<T> {
    pub fn with_transport(config: EngineConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let peer_id = Handshake::generate_peer_id();
        info!("Engine peer id {}", hex::encode(peer_id));
        Ok(Self {
            config,
            transport: Arc::new(transport),
            peer_id,
            torrents: Arc::new(RwLock::new(HashMap::new())),
            services: Mutex::new(Vec::new()),
            peers: Arc::new(Mutex::new(Vec::new())),
            local_addr: Mutex::new(None),
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Address of the listener once [`Controller::start`] succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Start managing a torrent
    pub fn register_torrent(&self, torrent: Arc<Torrent>, storage: Arc<dyn Storage>) -> Result<Arc<Orchestrator>> {
        let info_hash = *torrent.info_hash();
        let mut torrents = self.torrents.write();
        if torrents.contains_key(&info_hash) {
            return Err(TorrentError::validation_error_with_field(
                format!("Torrent {} already registered", hex::encode(info_hash)),
                "info_hash",
            )
            .into());
        }

        let orchestrator = Arc::new(Orchestrator::new(torrent, storage, self.config.clone(), self.peer_id));
        orchestrator.start_sampler();
        torrents.insert(info_hash, orchestrator.clone());
        Ok(orchestrator)
    }

    /// Stop managing a torrent and close its peers
    pub fn remove_torrent(&self, info_hash: &[u8; 20]) -> Option<Arc<Orchestrator>> {
        let removed = self.torrents.write().remove(info_hash);
        if let Some(orchestrator) = &removed {
            orchestrator.shutdown();
        }
        removed
    }

    pub fn find_torrent(&self, info_hash: &[u8; 20]) -> Option<Arc<Orchestrator>> {
        self.torrents.read().get(info_hash).cloned()
    }

    fn require_torrent(&self, info_hash: &[u8; 20]) -> Result<Arc<Orchestrator>> {
        self.find_torrent(info_hash).ok_or_else(|| {
            TorrentError::validation_error_with_field(
                format!("Unknown torrent {}", hex::encode(info_hash)),
                "info_hash",
            )
            .into()
        })
    }

    pub fn announce_stats(&self, info_hash: &[u8; 20]) -> Option<AnnounceStats> {
        self.find_torrent(info_hash).map(|o| o.announce_stats())
    }

    /// Torrent-wide failure recorded for a torrent, if any
    pub fn torrent_error(&self, info_hash: &[u8; 20]) -> Option<TorrentError> {
        self.find_torrent(info_hash).and_then(|o| o.last_error())
    }

    /// Listen for inbound peers on `port` (0 = OS-assigned)
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let listener = self.transport.listen(port).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        let handle = tokio::spawn(accept_loop(
            listener,
            self.torrents.clone(),
            self.peers.clone(),
            self.config.handshake_timeout(),
        ));
        push_task(&self.services, handle);
        Ok(addr)
    }

    /// Dial a peer for a torrent and start its unit once handshaked
    pub async fn connect(&self, info_hash: &[u8; 20], addr: SocketAddr) -> Result<()> {
        let orchestrator = self.require_torrent(info_hash)?;
        orchestrator.swarm().add(addr, None, PeerSource::Manual);
        let connection = dial(self.transport.clone(), orchestrator, addr, PeerSource::Manual).await?;
        push_task(&self.peers, tokio::spawn(connection.run()));
        Ok(())
    }

    /// Connect to candidates as they arrive (e.g. from a tracker client)
    pub fn add_peers(&self, info_hash: &[u8; 20], mut candidates: mpsc::Receiver<PeerCandidate>) -> Result<()> {
        let orchestrator = self.require_torrent(info_hash)?;
        let transport = self.transport.clone();
        let peers = self.peers.clone();

        let handle = tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                if !orchestrator
                    .swarm()
                    .add(candidate.addr, candidate.peer_id, PeerSource::Tracker)
                {
                    trace!("Skipping candidate {}: already dialling or connected", candidate.addr);
                    continue;
                }
                if let Err(e) = orchestrator.admit(&candidate.addr) {
                    trace!("Skipping candidate {}: {}", candidate.addr, e);
                    orchestrator.swarm().forget(&candidate.addr);
                    continue;
                }

                let transport = transport.clone();
                let orchestrator = orchestrator.clone();
                let handle = tokio::spawn(async move {
                    match dial(transport, orchestrator, candidate.addr, PeerSource::Tracker).await {
                        Ok(connection) => connection.run().await,
                        Err(e) => debug!("Failed to connect to {}: {}", candidate.addr, e),
                    }
                });
                push_task(&peers, handle);
            }
            debug!("Peer candidate stream ended");
        });
        push_task(&self.services, handle);
        Ok(())
    }

    /// Stop listening, close every peer and stop all torrents.
    ///
    /// Peer units are signalled first so a storage write in progress
    /// completes; units still running after the handshake timeout are aborted.
    pub async fn stop(&self) {
        let services: Vec<JoinHandle<()>> = self.services.lock().drain(..).collect();
        for service in &services {
            service.abort();
        }
        *self.local_addr.lock() = None;

        let orchestrators: Vec<Arc<Orchestrator>> = self.torrents.read().values().cloned().collect();
        for orchestrator in &orchestrators {
            orchestrator.shutdown();
        }

        let peers: Vec<JoinHandle<()>> = self.peers.lock().drain(..).collect();
        let count = peers.len();
        let grace = self.config.handshake_timeout();
        for mut peer in peers {
            if timeout(grace, &mut peer).await.is_err() {
                warn!("Peer unit did not exit within {:?}, aborting", grace);
                peer.abort();
            }
        }
        info!("Engine stopped ({} services, {} peer units)", services.len(), count);
    }
}

fn push_task(tasks: &Mutex<Vec<JoinHandle<()>>>, handle: JoinHandle<()>) {
    let mut tasks = tasks.lock();
    tasks.retain(|task| !task.is_finished());
    tasks.push(handle);
}

/// Dial and handshake, honouring the connection limit.
/// A peer that could not be reached is dropped from the registry.
async fn dial<T: Transport>(
    transport: Arc<T>,
    orchestrator: Arc<Orchestrator>,
    addr: SocketAddr,
    source: PeerSource,
) -> Result<PeerConnection<T::Stream>> {
    let result: Result<PeerConnection<T::Stream>> = async {
        orchestrator.admit(&addr)?;
        let stream = transport.dial(addr).await?;
        PeerConnection::establish_outbound(stream, addr, orchestrator.clone(), source).await
    }
    .await;
    if result.is_err() {
        orchestrator.swarm().forget(&addr);
    }
    result
}

async fn accept_loop<L: Listener>(
    mut listener: L,
    torrents: TorrentMap,
    peers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    handshake_timeout: std::time::Duration,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        trace!("Inbound connection from {}", addr);

        let torrents = torrents.clone();
        let handle = tokio::spawn(async move {
            match handle_inbound(stream, addr, torrents, handshake_timeout).await {
                Ok(connection) => connection.run().await,
                Err(e) => debug!("Rejected inbound peer {}: {}", addr, e),
            }
        });
        push_task(&peers, handle);
    }
}

/// Read the remote handshake, route it to a torrent and answer it
async fn handle_inbound<S>(
    mut stream: S,
    addr: SocketAddr,
    torrents: TorrentMap,
    handshake_timeout: std::time::Duration,
) -> Result<PeerConnection<S>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let remote = timeout(handshake_timeout, BitTorrentWire::default().read_handshake(&mut stream))
        .await
        .map_err(|_| TorrentError::network_error_with_address("Handshake timed out", addr.to_string()))??;

    let orchestrator = torrents.read().get(&remote.info_hash).cloned().ok_or_else(|| {
        warn!("Peer {} asked for unknown torrent {}", addr, hex::encode(remote.info_hash));
        TorrentError::protocol_error_with_source("Unknown info hash", hex::encode(remote.info_hash))
    })?;
    orchestrator.admit(&addr)?;

    PeerConnection::establish_inbound(stream, addr, remote, orchestrator).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::torrent::TorrentInfo;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::net::TcpStream;

    /// Listener whose accept always fails
    struct ExhaustedListener {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Listener for ExhaustedListener {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> Result<(DuplexStream, SocketAddr)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TorrentError::network_error("Too many open files").into())
        }

        fn local_addr(&self) -> Result<SocketAddr> {
            Ok("127.0.0.1:6881".parse()?)
        }
    }

    fn loopback_controller() -> Controller {
        let transport = TcpTransport::new(Duration::from_secs(2)).with_bind_ip([127, 0, 0, 1].into());
        Controller::with_transport(EngineConfig::default(), transport).unwrap()
    }

    fn torrent(name: &str) -> Arc<Torrent> {
        let info = TorrentInfo::from_content(name, 16384, &[(PathBuf::from(name), vec![1u8; 20000])]);
        Arc::new(Torrent::from_info(&info).unwrap())
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let controller = loopback_controller();
        let t = torrent("a");
        let hash = *t.info_hash();
        controller
            .register_torrent(t.clone(), Arc::new(MemoryStorage::new(20000)))
            .unwrap();
        assert!(controller
            .register_torrent(t, Arc::new(MemoryStorage::new(20000)))
            .is_err());

        assert!(controller.find_torrent(&hash).is_some());
        assert_eq!(controller.announce_stats(&hash).unwrap().left, 20000);
        assert!(controller.torrent_error(&hash).is_none());

        assert!(controller.remove_torrent(&hash).is_some());
        assert!(controller.find_torrent(&hash).is_none());
        assert!(controller.announce_stats(&hash).is_none());
    }

    #[tokio::test]
    async fn test_connect_unknown_torrent() {
        let controller = loopback_controller();
        let err = controller
            .connect(&[3u8; 20], "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            crate::error::as_torrent_error(&err),
            Some(TorrentError::ValidationError { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_dial_leaves_no_registry_entry() {
        let controller = loopback_controller();
        let t = torrent("b");
        let hash = *t.info_hash();
        let orchestrator = controller
            .register_torrent(t, Arc::new(MemoryStorage::new(20000)))
            .unwrap();

        // Nothing listens on port 1
        assert!(controller.connect(&hash, "127.0.0.1:1".parse().unwrap()).await.is_err());
        assert!(orchestrator.swarm().is_empty());
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_unknown_info_hash_is_dropped() {
        let controller = loopback_controller();
        let addr = controller.start(0).await.unwrap();
        assert_eq!(controller.local_addr(), Some(addr));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let handshake = Handshake::new([8u8; 20], [9u8; 20]);
        stream.write_all(&handshake.serialize()).await.unwrap();

        // The engine closes without answering
        let wire = BitTorrentWire::default();
        let result = tokio::time::timeout(Duration::from_secs(5), wire.read_handshake(&mut stream))
            .await
            .unwrap();
        assert!(result.is_err());
        controller.stop().await;
        assert!(controller.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_accept_errors_back_off() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let listener = ExhaustedListener {
            attempts: attempts.clone(),
        };
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(RwLock::new(HashMap::new())),
            Arc::new(Mutex::new(Vec::new())),
            Duration::from_secs(1),
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        task.abort();
        let attempts = attempts.load(Ordering::SeqCst);
        assert!((2..=6).contains(&attempts), "accept retried {} times", attempts);
    }
}
