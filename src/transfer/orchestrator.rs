//! Download/upload orchestration
//!
//! One [`Orchestrator`] per torrent. Peer units hand it every session event
//! together with their exclusively owned [`PeerSession`] and an outbox; the
//! orchestrator updates torrent-wide state (completed pieces, in-flight
//! assignments, bans) under its own locks and queues the wire messages the
//! peer unit must send next.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::{as_torrent_error, TorrentError};
use crate::peer::session::{BlockRequest, PeerEvent, PeerSession};
use crate::peer::swarm::{PeerCommand, Swarm};
use crate::protocol::Message;
use crate::storage::Storage;
use crate::torrent::Torrent;
use crate::traffic::TrafficShaper;
use crate::transfer::selector::{PiecePolicy, PieceSelector};

/// Largest block a peer may request from us
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// What to do with a peer whose data failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionPolicy {
    /// Never assign it pieces again; uploads to it continue
    #[default]
    Ban,
    /// Keep the peer and pick a new piece
    Retry,
}

impl FromStr for CorruptionPolicy {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ban" => Ok(CorruptionPolicy::Ban),
            "retry" => Ok(CorruptionPolicy::Retry),
            other => Err(TorrentError::config_error_with_field(
                format!("Unknown corruption policy '{}'", other),
                "corruption_policy",
            )),
        }
    }
}

impl fmt::Display for CorruptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CorruptionPolicy::Ban => "ban",
            CorruptionPolicy::Retry => "retry",
        })
    }
}

/// Whether a peer unit keeps its connection after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// Counters reported to a tracker on announce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Per-torrent transfer engine
pub struct Orchestrator {
    torrent: Arc<Torrent>,
    storage: Arc<dyn Storage>,
    swarm: Swarm,
    shaper: Arc<TrafficShaper>,
    selector: PieceSelector,
    config: EngineConfig,
    peer_id: [u8; 20],
    /// Piece index -> peers currently assigned to it
    in_flight: Mutex<HashMap<u32, HashSet<SocketAddr>>>,
    banned: Mutex<HashSet<IpAddr>>,
    last_error: Mutex<Option<TorrentError>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("torrent", &self.torrent.name())
            .field("info_hash", &self.torrent.info_hash_hex())
            .field("policy", &self.selector.policy())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(torrent: Arc<Torrent>, storage: Arc<dyn Storage>, config: EngineConfig, peer_id: [u8; 20]) -> Self {
        info!(
            "Managing torrent '{}' ({}), {} of {} pieces complete",
            torrent.name(),
            torrent.info_hash_hex(),
            torrent.completed_count(),
            torrent.piece_count()
        );
        Self {
            shaper: TrafficShaper::new(config.download_limit, config.upload_limit),
            selector: PieceSelector::new(config.piece_policy, config.end_game),
            torrent,
            storage,
            swarm: Swarm::new(),
            config,
            peer_id,
            in_flight: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashSet::new()),
            last_error: Mutex::new(None),
            sampler: Mutex::new(None),
        }
    }

    /// Replace the piece selector (e.g. with a seeded one)
    pub fn with_selector(mut self, selector: PieceSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        self.torrent.info_hash()
    }

    pub fn swarm(&self) -> &Swarm {
        &self.swarm
    }

    pub fn shaper(&self) -> &Arc<TrafficShaper> {
        &self.shaper
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn set_download_limit(&self, bytes_per_sec: u64) {
        self.shaper.set_download_limit(bytes_per_sec);
    }

    pub fn set_upload_limit(&self, bytes_per_sec: u64) {
        self.shaper.set_upload_limit(bytes_per_sec);
    }

    pub fn current_download_speed(&self) -> u64 {
        self.shaper.current_download_speed()
    }

    pub fn current_upload_speed(&self) -> u64 {
        self.shaper.current_upload_speed()
    }

    pub fn announce_stats(&self) -> AnnounceStats {
        AnnounceStats {
            uploaded: self.shaper.uploaded(),
            downloaded: self.shaper.downloaded(),
            left: self.torrent.bytes_left(),
        }
    }

    /// Last torrent-wide failure (e.g. storage unavailable)
    pub fn last_error(&self) -> Option<TorrentError> {
        self.last_error.lock().clone()
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.banned.lock().contains(ip)
    }

    pub fn ban(&self, ip: IpAddr) {
        if self.banned.lock().insert(ip) {
            warn!("Banned {} for torrent {}", ip, self.torrent.name());
        }
    }

    /// Pieces currently assigned to at least one peer
    pub fn in_flight(&self) -> HashSet<u32> {
        self.in_flight.lock().keys().copied().collect()
    }

    /// Start periodic traffic sampling
    pub fn start_sampler(&self) {
        let mut sampler = self.sampler.lock();
        if sampler.is_none() {
            *sampler = Some(self.shaper.spawn_sampler(self.config.sample_interval()));
        }
    }

    /// Stop sampling and close every peer
    pub fn shutdown(&self) {
        if let Some(handle) = self.sampler.lock().take() {
            handle.abort();
        }
        let report = self.swarm.disconnect_all();
        info!("Shutting down {}: {} peers signalled", self.torrent.name(), report.delivered);
    }

    /// Check whether a new connection from/to `addr` may be admitted
    pub fn admit(&self, addr: &SocketAddr) -> Result<()> {
        if self.swarm.is_connected(addr) {
            return Err(TorrentError::peer_error_with_peer("Peer already connected", addr.to_string()).into());
        }
        if self.swarm.connected_count() >= self.config.max_connections {
            return Err(TorrentError::peer_error_with_peer(
                format!("Connection limit of {} reached", self.config.max_connections),
                addr.to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Fresh session for a peer of this torrent
    pub fn new_session(&self, addr: SocketAddr) -> PeerSession {
        PeerSession::new(addr, self.torrent.piece_count(), self.config.pipeline_depth)
    }

    /// Verify whatever the storage already holds and mark matching pieces complete
    pub async fn recheck(&self) -> usize {
        let mut verified = 0;
        for piece in self.torrent.pieces() {
            match self.storage.checksum(piece).await {
                Ok(hash) if hash == piece.hash => {
                    self.torrent.mark_complete(piece.index);
                    verified += 1;
                }
                Ok(_) => trace!("Piece {} does not match on disk", piece.index),
                Err(e) => trace!("Piece {} unreadable: {}", piece.index, e),
            }
        }
        info!(
            "Recheck of {}: {} of {} pieces present",
            self.torrent.name(),
            verified,
            self.torrent.piece_count()
        );
        verified
    }

    /// Handshake exchanged: announce what we have
    pub fn on_handshaked(&self, session: &PeerSession, out: &mut Vec<Message>) {
        let completed = self.torrent.completed_bitfield();
        debug!(
            "Sending bitfield ({} of {} pieces) to {}",
            completed.cardinality(),
            completed.len(),
            session.addr()
        );
        out.push(Message::Bitfield {
            bitfield: completed.to_bytes(),
        });
    }

    /// Dispatch a session event
    pub async fn handle_event(&self, session: &mut PeerSession, event: PeerEvent, out: &mut Vec<Message>) -> Result<Flow> {
        match event {
            PeerEvent::KeepAlive | PeerEvent::Ignored | PeerEvent::Port(_) => Ok(Flow::Continue),
            PeerEvent::Bitfield | PeerEvent::Have(_) => self.on_availability(session, out),
            PeerEvent::Unchoked => {
                debug!("Unchoked by {}", session.addr());
                self.fill_pipeline(session, out)
            }
            PeerEvent::Choked { dropped } => Ok(self.on_choked(session, &dropped)),
            PeerEvent::Interested => {
                if let Some(message) = session.unchoke() {
                    debug!("Unchoking interested peer {}", session.addr());
                    out.push(message);
                }
                Ok(Flow::Continue)
            }
            PeerEvent::NotInterested => {
                if let Some(message) = session.choke() {
                    debug!("Choking uninterested peer {}", session.addr());
                    out.push(message);
                }
                Ok(Flow::Continue)
            }
            PeerEvent::Request(request) => {
                self.validate_request(session, &request)?;
                Ok(Flow::Continue)
            }
            PeerEvent::Cancel(request) => {
                debug!("Peer {} cancelled {}", session.addr(), request);
                Ok(Flow::Continue)
            }
            PeerEvent::Block { request, data } => self.on_block(session, request, data, out).await,
        }
    }

    /// Peer bitfield changed: publish it, then decide interest or disconnect
    fn on_availability(&self, session: &mut PeerSession, out: &mut Vec<Message>) -> Result<Flow> {
        self.swarm.update_bitfield(&session.addr(), session.bitfield());
        let completed = self.torrent.completed_bitfield();

        if self.is_redundant_seed(session) {
            info!("Peer {} is a seed and we are complete, disconnecting", session.addr());
            return Ok(Flow::Disconnect);
        }

        if session.bitfield().has_any_missing_from(&completed) && !self.is_banned(&session.addr().ip()) {
            if let Some(message) = session.interested() {
                debug!("Interested in {}", session.addr());
                out.push(message);
            }
            if !session.peer_choking() {
                return self.fill_pipeline(session, out);
            }
        }
        Ok(Flow::Continue)
    }

    fn on_choked(&self, session: &mut PeerSession, dropped: &[BlockRequest]) -> Flow {
        debug!("Choked by {}, {} requests dropped", session.addr(), dropped.len());
        if let Some(piece) = session.assigned_piece() {
            self.release_piece(piece, &session.addr());
            session.assign_piece(None);
        }
        if self.is_redundant_seed(session) {
            info!("Peer {} is a redundant seed, disconnecting", session.addr());
            return Flow::Disconnect;
        }
        Flow::Continue
    }

    fn is_redundant_seed(&self, session: &PeerSession) -> bool {
        session.bitfield().is_seeder() && self.torrent.is_complete()
    }

    /// Reject requests we can never serve
    fn validate_request(&self, session: &PeerSession, request: &BlockRequest) -> Result<()> {
        let violation = |reason: &str| -> anyhow::Error {
            warn!("Invalid request {} from {}: {}", request, session.addr(), reason);
            TorrentError::protocol_error_with_source(format!("Invalid request: {}", reason), request.to_string()).into()
        };

        if request.length == 0 || request.length > MAX_REQUEST_LENGTH {
            return Err(violation("bad length"));
        }
        let piece = self
            .torrent
            .piece(request.piece_index)
            .ok_or_else(|| violation("piece out of range"))?;
        if !self.torrent.has_piece(request.piece_index) {
            return Err(violation("piece not available"));
        }
        if piece.sub_range(request.begin, request.length).is_none() {
            return Err(violation("range outside piece"));
        }
        trace!("Accepted request {} from {}", request, session.addr());
        Ok(())
    }

    /// Serve the session's outstanding upload request
    pub async fn serve_upload(&self, session: &mut PeerSession, out: &mut Vec<Message>) -> Result<Flow> {
        let Some(request) = session.complete_upload() else {
            return Ok(Flow::Continue);
        };
        if session.am_choking() {
            return Ok(Flow::Continue);
        }

        let range = self
            .torrent
            .piece(request.piece_index)
            .and_then(|p| p.sub_range(request.begin, request.length))
            .ok_or_else(|| TorrentError::protocol_error_with_source("Invalid request", request.to_string()))?;

        let block = match self.storage.read(range).await {
            Ok(block) => block,
            Err(e) => {
                error!("Failed to read {} for {}: {}", request, session.addr(), e);
                self.record_error(&e);
                return Err(e);
            }
        };

        trace!("Uploading {} to {}", request, session.addr());
        out.push(Message::Piece {
            index: request.piece_index,
            begin: request.begin,
            block,
        });
        Ok(Flow::Continue)
    }

    async fn on_block(&self, session: &mut PeerSession, request: BlockRequest, data: Bytes, out: &mut Vec<Message>) -> Result<Flow> {
        let addr = session.addr();
        let index = request.piece_index;
        let piece = self.torrent.piece(index).ok_or_else(|| {
            TorrentError::protocol_error_with_source("Block for unknown piece", request.to_string())
        })?;

        if self.torrent.has_piece(index) {
            trace!("Discarding {} from {}: piece already complete", request, addr);
            return self.fill_pipeline(session, out);
        }

        let range = piece
            .sub_range(request.begin, request.length)
            .ok_or_else(|| TorrentError::protocol_error_with_source("Block outside piece", request.to_string()))?;
        if let Err(e) = self.storage.write(range, &data).await {
            error!("Failed to store {} from {}: {}", request, addr, e);
            self.record_error(&e);
            return Err(e);
        }
        if let Some(block) = piece.block_at(request.begin) {
            block.set_downloaded(true);
        }
        trace!("Stored {} from {} ({}/{} blocks)", request, addr, piece.downloaded_blocks(), piece.block_count());

        if !piece.is_downloaded() {
            return self.fill_pipeline(session, out);
        }

        self.in_flight.lock().remove(&index);
        session.assign_piece(None);
        let checksum = match self.storage.checksum(piece).await {
            Ok(hash) => hash,
            Err(e) => {
                error!("Failed to checksum piece {}: {}", index, e);
                piece.reset();
                self.record_error(&e);
                return Err(e);
            }
        };

        if checksum == piece.hash {
            debug!("Piece {} verified (last block from {})", index, addr);
            if self.torrent.mark_complete(index) {
                self.broadcast_have(index);
                if self.torrent.is_complete() {
                    info!("Download of '{}' complete", self.torrent.name());
                }
            }
            return self.fill_pipeline(session, out);
        }

        let integrity = TorrentError::integrity_error(
            format!("expected {}, got {}", hex::encode(piece.hash), hex::encode(checksum)),
            index,
        );
        warn!("{}, last block from {}", integrity, addr);
        piece.reset();
        if self.config.corruption_policy == CorruptionPolicy::Ban {
            self.ban(addr.ip());
        }
        self.fill_pipeline(session, out)
    }

    /// Tell every connected peer unit about a completed piece
    fn broadcast_have(&self, index: u32) {
        let report = self.swarm.broadcast(|peer| peer.send(PeerCommand::Have(index)));
        debug!(
            "Broadcast have({}) to {} peers ({} failed)",
            index, report.delivered, report.failed
        );
    }

    /// A piece was completed locally (possibly by another peer unit)
    pub fn on_local_have(&self, session: &mut PeerSession, index: u32, out: &mut Vec<Message>) -> Result<Flow> {
        let outstanding: Vec<BlockRequest> = session
            .outstanding_downloads()
            .filter(|r| r.piece_index == index)
            .copied()
            .collect();
        for request in outstanding {
            out.push(Message::Cancel {
                index: request.piece_index,
                begin: request.begin,
                length: request.length,
            });
        }
        session.drop_requests_for(index);
        if session.assigned_piece() == Some(index) {
            self.release_piece(index, &session.addr());
            session.assign_piece(None);
        }
        out.push(Message::Have { piece_index: index });

        if self.is_redundant_seed(session) {
            info!("Complete and {} is a seed, disconnecting", session.addr());
            return Ok(Flow::Disconnect);
        }
        if !session.peer_choking() {
            self.fill_pipeline(session, out)?;
        }
        let completed = self.torrent.completed_bitfield();
        if session.outstanding_download_count() == 0 && !session.bitfield().has_any_missing_from(&completed) {
            if let Some(message) = session.not_interested() {
                out.push(message);
            }
        }
        Ok(Flow::Continue)
    }

    /// Keep the request pipeline of an unchoked peer full
    fn fill_pipeline(&self, session: &mut PeerSession, out: &mut Vec<Message>) -> Result<Flow> {
        // Pieces with nothing left to request from this peer in this pass
        let mut exhausted = HashSet::new();
        while session.can_request() {
            let index = match session.assigned_piece() {
                Some(index) if !self.torrent.has_piece(index) && !exhausted.contains(&index) => index,
                previous => {
                    if let Some(previous) = previous {
                        self.release_piece(previous, &session.addr());
                        session.assign_piece(None);
                    }
                    match self.assign_piece(session, &exhausted) {
                        Some(index) => index,
                        None => {
                            if session.outstanding_download_count() == 0 && exhausted.is_empty() {
                                if let Some(message) = session.not_interested() {
                                    debug!("Nothing to request from {}, withdrawing interest", session.addr());
                                    out.push(message);
                                }
                            }
                            break;
                        }
                    }
                }
            };

            let Some(piece) = self.torrent.piece(index) else {
                break;
            };
            let Some(block) = piece.next_missing_block(|b| session.is_requested(index, b.offset)) else {
                if session.outstanding_downloads().any(|r| r.piece_index == index) {
                    break;
                }
                trace!("Piece {} has no block left for {}, choosing another", index, session.addr());
                exhausted.insert(index);
                continue;
            };
            let request = BlockRequest::new(index, block.offset, block.length);
            trace!("Requesting {} from {}", request, session.addr());
            out.push(session.request(request)?);
        }
        Ok(Flow::Continue)
    }

    /// Choose a piece for this peer and record the assignment
    fn assign_piece(&self, session: &mut PeerSession, exclude: &HashSet<u32>) -> Option<u32> {
        let addr = session.addr();
        if self.is_banned(&addr.ip()) {
            return None;
        }
        let swarm = match self.selector.policy() {
            PiecePolicy::RarestFirst => self.swarm.bitfields(),
            _ => Vec::new(),
        };
        // Excluded pieces are treated as done so end-game cannot pick them either
        let mut completed = self.torrent.completed_bitfield();
        for &index in exclude {
            completed.set(index as usize);
        }

        let mut in_flight = self.in_flight.lock();
        let busy: HashSet<u32> = in_flight.keys().copied().collect();
        let index = self.selector.select(session.bitfield(), &completed, &busy, &swarm)?;
        in_flight.entry(index).or_default().insert(addr);
        drop(in_flight);

        session.assign_piece(Some(index));
        debug!("Assigned piece {} to {}", index, addr);
        Some(index)
    }

    fn release_piece(&self, index: u32, addr: &SocketAddr) {
        let mut in_flight = self.in_flight.lock();
        if let Some(peers) = in_flight.get_mut(&index) {
            peers.remove(addr);
            if peers.is_empty() {
                in_flight.remove(&index);
            }
        }
    }

    /// Idle handling: keep-alive after send-idle time, disconnect after receive-idle time
    pub fn check_idle(&self, session: &PeerSession, out: &mut Vec<Message>) -> Flow {
        if let Some(limit) = self.config.idle_timeout() {
            if session.idle_receive_time() >= limit {
                info!("Peer {} idle for {:?}, disconnecting", session.addr(), session.idle_receive_time());
                return Flow::Disconnect;
            }
        }
        if session.idle_send_time() >= self.config.keepalive_interval() && out.is_empty() {
            trace!("Sending keep-alive to {}", session.addr());
            out.push(Message::KeepAlive);
        }
        Flow::Continue
    }

    /// Peer unit is exiting: release its assignments and registry slot
    pub fn on_disconnect(&self, session: &mut PeerSession) {
        let addr = session.addr();
        if let Some(piece) = session.assigned_piece() {
            self.release_piece(piece, &addr);
        }
        self.swarm.remove(&addr);
        session.reset();
        debug!("Peer {} disconnected from {}", addr, self.torrent.name());
    }

    fn record_error(&self, err: &anyhow::Error) {
        if let Some(torrent_error) = as_torrent_error(err).filter(|e| e.is_torrent_wide()) {
            error!("Torrent-wide failure on {}: {}", self.torrent.name(), torrent_error);
            *self.last_error.lock() = Some(torrent_error.clone());
        }
    }
}
