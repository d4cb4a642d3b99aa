//! Peer session state machine
//!
//! One [`PeerSession`] per live connection, owned by that connection's
//! execution unit. It tracks the lifecycle, both choke/interest pairs, the
//! remote bitfield and request bookkeeping, and turns received messages
//! into [`PeerEvent`]s. It never performs I/O.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::TorrentError;
use crate::protocol::{Capabilities, Message};
use crate::torrent::bitfield::Bitfield;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Both handshakes exchanged
    Handshaked,
    /// At least one post-handshake message exchanged
    Active,
}

impl ConnectionState {
    /// True once regular messages may be processed
    pub fn is_handshaked(&self) -> bool {
        matches!(self, ConnectionState::Handshaked | ConnectionState::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChokeState {
    #[default]
    Choked,
    Unchoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterestState {
    #[default]
    NotInterested,
    Interested,
}

/// A block request, in either direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece_index: u32, begin: u32, length: u32) -> Self {
        Self {
            piece_index,
            begin,
            length,
        }
    }

    pub fn to_message(self) -> Message {
        Message::Request {
            index: self.piece_index,
            begin: self.begin,
            length: self.length,
        }
    }
}

impl fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece {} [{}+{}]", self.piece_index, self.begin, self.length)
    }
}

/// Semantic outcome of a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    KeepAlive,
    /// Remote choked us; outstanding download requests were dropped
    Choked { dropped: Vec<BlockRequest> },
    Unchoked,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield,
    /// Upload request accepted as the session's outstanding upload
    Request(BlockRequest),
    /// Data for one of our outstanding download requests
    Block { request: BlockRequest, data: Bytes },
    /// Outstanding upload request withdrawn
    Cancel(BlockRequest),
    Port(u16),
    /// Message had no effect (unrequested block, request while choked, unmatched cancel)
    Ignored,
}

/// Per-connection protocol state
#[derive(Debug)]
pub struct PeerSession {
    addr: SocketAddr,
    peer_id: Option<[u8; 20]>,
    capabilities: Capabilities,
    state: ConnectionState,
    /// Whether we choke the remote
    local_choke: ChokeState,
    /// Whether the remote chokes us
    remote_choke: ChokeState,
    local_interest: InterestState,
    remote_interest: InterestState,
    bitfield: Bitfield,
    pipeline_depth: usize,
    downloads: VecDeque<BlockRequest>,
    upload: Option<BlockRequest>,
    /// Piece this peer is currently assigned to download
    assigned_piece: Option<u32>,
    last_received: Instant,
    last_sent: Instant,
}

impl PeerSession {
    /// New session for a torrent of `piece_count` pieces
    pub fn new(addr: SocketAddr, piece_count: usize, pipeline_depth: usize) -> Self {
        let now = Instant::now();
        Self {
            addr,
            peer_id: None,
            capabilities: Capabilities::new(),
            state: ConnectionState::Disconnected,
            local_choke: ChokeState::Choked,
            remote_choke: ChokeState::Choked,
            local_interest: InterestState::NotInterested,
            remote_interest: InterestState::NotInterested,
            bitfield: Bitfield::new(piece_count),
            pipeline_depth: pipeline_depth.max(1),
            downloads: VecDeque::new(),
            upload: None,
            assigned_piece: None,
            last_received: now,
            last_sent: now,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.peer_id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// True if we choke the remote
    pub fn am_choking(&self) -> bool {
        self.local_choke == ChokeState::Choked
    }

    /// True if the remote chokes us
    pub fn peer_choking(&self) -> bool {
        self.remote_choke == ChokeState::Choked
    }

    pub fn am_interested(&self) -> bool {
        self.local_interest == InterestState::Interested
    }

    pub fn peer_interested(&self) -> bool {
        self.remote_interest == InterestState::Interested
    }

    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Record the remote handshake once both sides have sent theirs
    pub fn handshake_completed(&mut self, peer_id: [u8; 20], capabilities: Capabilities) {
        self.peer_id = Some(peer_id);
        self.capabilities = capabilities;
        self.state = ConnectionState::Handshaked;
        self.last_received = Instant::now();
        debug!("Peer {} handshaked ({:?})", self.addr, capabilities);
    }

    /// Apply a received message
    pub fn receive(&mut self, message: Message) -> Result<PeerEvent> {
        if !self.state.is_handshaked() {
            warn!("Peer {} sent {:?} before handshake", self.addr, message.message_id());
            return Err(TorrentError::protocol_error_with_source(
                "Message received before handshake",
                self.addr.to_string(),
            )
            .into());
        }
        self.state = ConnectionState::Active;
        self.last_received = Instant::now();

        let event = match message {
            Message::KeepAlive => PeerEvent::KeepAlive,
            Message::Choke => {
                self.remote_choke = ChokeState::Choked;
                let dropped: Vec<BlockRequest> = self.downloads.drain(..).collect();
                PeerEvent::Choked { dropped }
            }
            Message::Unchoke => {
                self.remote_choke = ChokeState::Unchoked;
                PeerEvent::Unchoked
            }
            Message::Interested => {
                self.remote_interest = InterestState::Interested;
                PeerEvent::Interested
            }
            Message::NotInterested => {
                self.remote_interest = InterestState::NotInterested;
                PeerEvent::NotInterested
            }
            Message::Have { piece_index } => {
                if piece_index as usize >= self.bitfield.len() {
                    return Err(TorrentError::protocol_error_with_source(
                        "Have for piece out of range",
                        format!("piece {} of {}", piece_index, self.bitfield.len()),
                    )
                    .into());
                }
                self.bitfield.set(piece_index as usize);
                PeerEvent::Have(piece_index)
            }
            Message::Bitfield { bitfield } => {
                self.bitfield = Bitfield::from_bytes(&bitfield, self.bitfield.len())?;
                PeerEvent::Bitfield
            }
            Message::Request { index, begin, length } => {
                let request = BlockRequest::new(index, begin, length);
                if let Some(outstanding) = self.upload {
                    warn!("Peer {} requested {} while {} is outstanding", self.addr, request, outstanding);
                    return Err(TorrentError::protocol_error_with_source(
                        "Duplicate outstanding upload request",
                        format!("{} while {}", request, outstanding),
                    )
                    .into());
                }
                if self.am_choking() {
                    debug!("Dropping request {} from choked peer {}", request, self.addr);
                    PeerEvent::Ignored
                } else {
                    self.upload = Some(request);
                    PeerEvent::Request(request)
                }
            }
            Message::Piece { index, begin, block } => {
                let position = self
                    .downloads
                    .iter()
                    .position(|r| r.piece_index == index && r.begin == begin && r.length as usize == block.len());
                match position.and_then(|i| self.downloads.remove(i)) {
                    Some(request) => PeerEvent::Block { request, data: block },
                    None => {
                        debug!("Ignoring unrequested block piece {} [{}] from {}", index, begin, self.addr);
                        PeerEvent::Ignored
                    }
                }
            }
            Message::Cancel { index, begin, length } => {
                let request = BlockRequest::new(index, begin, length);
                if self.upload == Some(request) {
                    self.upload = None;
                    PeerEvent::Cancel(request)
                } else {
                    PeerEvent::Ignored
                }
            }
            Message::Port { listen_port } => PeerEvent::Port(listen_port),
        };

        trace!("Peer {} event {:?}", self.addr, event);
        Ok(event)
    }

    /// Choke the remote; returns the message to send if the state changed
    pub fn choke(&mut self) -> Option<Message> {
        if self.local_choke == ChokeState::Choked {
            return None;
        }
        self.local_choke = ChokeState::Choked;
        self.upload = None;
        Some(Message::Choke)
    }

    pub fn unchoke(&mut self) -> Option<Message> {
        if self.local_choke == ChokeState::Unchoked {
            return None;
        }
        self.local_choke = ChokeState::Unchoked;
        Some(Message::Unchoke)
    }

    pub fn interested(&mut self) -> Option<Message> {
        if self.local_interest == InterestState::Interested {
            return None;
        }
        self.local_interest = InterestState::Interested;
        Some(Message::Interested)
    }

    pub fn not_interested(&mut self) -> Option<Message> {
        if self.local_interest == InterestState::NotInterested {
            return None;
        }
        self.local_interest = InterestState::NotInterested;
        Some(Message::NotInterested)
    }

    /// True if another download request may be sent now
    pub fn can_request(&self) -> bool {
        !self.peer_choking() && self.downloads.len() < self.pipeline_depth
    }

    /// Queue a download request and return the message for it
    pub fn request(&mut self, request: BlockRequest) -> Result<Message> {
        if !self.can_request() {
            return Err(TorrentError::peer_error_with_peer(
                format!("Cannot request {}: choked or pipeline full", request),
                self.addr.to_string(),
            )
            .into());
        }
        self.downloads.push_back(request);
        Ok(request.to_message())
    }

    /// True if `piece_index`/`begin` is already requested from this peer
    pub fn is_requested(&self, piece_index: u32, begin: u32) -> bool {
        self.downloads
            .iter()
            .any(|r| r.piece_index == piece_index && r.begin == begin)
    }

    pub fn outstanding_downloads(&self) -> impl Iterator<Item = &BlockRequest> {
        self.downloads.iter()
    }

    pub fn outstanding_download_count(&self) -> usize {
        self.downloads.len()
    }

    /// Outstanding upload request, if any
    pub fn pending_upload(&self) -> Option<BlockRequest> {
        self.upload
    }

    /// Clear the outstanding upload once served (or abandoned)
    pub fn complete_upload(&mut self) -> Option<BlockRequest> {
        self.upload.take()
    }

    pub fn assigned_piece(&self) -> Option<u32> {
        self.assigned_piece
    }

    pub fn assign_piece(&mut self, piece_index: Option<u32>) {
        self.assigned_piece = piece_index;
    }

    /// Drop outstanding download requests for `piece_index`
    pub fn drop_requests_for(&mut self, piece_index: u32) {
        self.downloads.retain(|r| r.piece_index != piece_index);
    }

    pub fn record_sent(&mut self) {
        self.last_sent = Instant::now();
    }

    pub fn idle_send_time(&self) -> Duration {
        self.last_sent.elapsed()
    }

    pub fn idle_receive_time(&self) -> Duration {
        self.last_received.elapsed()
    }

    /// Discard all per-connection state; identity is kept
    pub fn reset(&mut self) {
        debug!("Resetting session for {}", self.addr);
        let piece_count = self.bitfield.len();
        self.state = ConnectionState::Disconnected;
        self.local_choke = ChokeState::Choked;
        self.remote_choke = ChokeState::Choked;
        self.local_interest = InterestState::NotInterested;
        self.remote_interest = InterestState::NotInterested;
        self.bitfield = Bitfield::new(piece_count);
        self.downloads.clear();
        self.upload = None;
        self.assigned_piece = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn active_session(pieces: usize) -> PeerSession {
        let mut session = PeerSession::new(addr(), pieces, 1);
        session.connecting();
        session.handshake_completed([7u8; 20], Capabilities::new());
        session
    }

    fn is_violation(err: &anyhow::Error) -> bool {
        crate::error::as_torrent_error(err).map_or(false, |e| e.is_protocol_violation())
    }

    #[test]
    fn test_initial_state() {
        let session = PeerSession::new(addr(), 4, 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.am_choking());
        assert!(session.peer_choking());
        assert!(!session.am_interested());
        assert!(!session.peer_interested());
        assert!(session.bitfield().is_empty());
    }

    #[test]
    fn test_message_before_handshake_is_violation() {
        let mut session = PeerSession::new(addr(), 4, 1);
        session.connecting();
        let err = session.receive(Message::Interested).unwrap_err();
        assert!(is_violation(&err));
    }

    #[test]
    fn test_first_message_activates() {
        let mut session = active_session(4);
        assert_eq!(session.state(), ConnectionState::Handshaked);
        session.receive(Message::KeepAlive).unwrap();
        assert_eq!(session.state(), ConnectionState::Active);
    }

    #[test]
    fn test_keepalive_changes_nothing() {
        let mut session = active_session(4);
        session.receive(Message::Unchoke).unwrap();
        session.request(BlockRequest::new(0, 0, 16384)).unwrap();

        assert_eq!(session.receive(Message::KeepAlive).unwrap(), PeerEvent::KeepAlive);
        assert_eq!(session.outstanding_download_count(), 1);
        assert!(session.bitfield().is_empty());
        assert!(!session.peer_choking());
    }

    #[test]
    fn test_remote_choke_transitions() {
        let mut session = active_session(4);
        assert_eq!(session.receive(Message::Unchoke).unwrap(), PeerEvent::Unchoked);
        assert!(!session.peer_choking());

        let request = BlockRequest::new(1, 0, 16384);
        session.request(request).unwrap();
        assert_eq!(
            session.receive(Message::Choke).unwrap(),
            PeerEvent::Choked { dropped: vec![request] }
        );
        assert!(session.peer_choking());
        assert!(!session.can_request());
    }

    #[test]
    fn test_local_transitions_report_changes_once() {
        let mut session = active_session(4);
        assert_eq!(session.interested(), Some(Message::Interested));
        assert_eq!(session.interested(), None);
        assert_eq!(session.unchoke(), Some(Message::Unchoke));
        assert_eq!(session.unchoke(), None);
        assert_eq!(session.choke(), Some(Message::Choke));
        assert_eq!(session.not_interested(), Some(Message::NotInterested));
    }

    #[test]
    fn test_have_and_bitfield() {
        let mut session = active_session(10);
        assert_eq!(session.receive(Message::Have { piece_index: 9 }).unwrap(), PeerEvent::Have(9));
        assert!(session.bitfield().has(9));

        let err = session.receive(Message::Have { piece_index: 10 }).unwrap_err();
        assert!(is_violation(&err));

        let event = session
            .receive(Message::Bitfield {
                bitfield: Bytes::from_static(&[0xFF, 0xC0]),
            })
            .unwrap();
        assert_eq!(event, PeerEvent::Bitfield);
        assert!(session.bitfield().is_seeder());

        let err = session
            .receive(Message::Bitfield {
                bitfield: Bytes::from_static(&[0xFF]),
            })
            .unwrap_err();
        assert!(is_violation(&err));
    }

    #[test]
    fn test_duplicate_upload_request_is_violation() {
        let mut session = active_session(4);
        session.unchoke();

        let event = session
            .receive(Message::Request {
                index: 3,
                begin: 0,
                length: 16384,
            })
            .unwrap();
        assert_eq!(event, PeerEvent::Request(BlockRequest::new(3, 0, 16384)));

        let err = session
            .receive(Message::Request {
                index: 3,
                begin: 0,
                length: 16384,
            })
            .unwrap_err();
        assert!(is_violation(&err));
        assert_eq!(session.pending_upload(), Some(BlockRequest::new(3, 0, 16384)));
    }

    #[test]
    fn test_request_while_choking_is_dropped() {
        let mut session = active_session(4);
        let event = session
            .receive(Message::Request {
                index: 0,
                begin: 0,
                length: 16384,
            })
            .unwrap();
        assert_eq!(event, PeerEvent::Ignored);
        assert!(session.pending_upload().is_none());
    }

    #[test]
    fn test_cancel_clears_upload() {
        let mut session = active_session(4);
        session.unchoke();
        session
            .receive(Message::Request {
                index: 2,
                begin: 16384,
                length: 100,
            })
            .unwrap();

        let unmatched = session
            .receive(Message::Cancel {
                index: 2,
                begin: 0,
                length: 100,
            })
            .unwrap();
        assert_eq!(unmatched, PeerEvent::Ignored);

        let event = session
            .receive(Message::Cancel {
                index: 2,
                begin: 16384,
                length: 100,
            })
            .unwrap();
        assert_eq!(event, PeerEvent::Cancel(BlockRequest::new(2, 16384, 100)));
        assert!(session.pending_upload().is_none());
    }

    #[test]
    fn test_block_matches_request() {
        let mut session = active_session(4);
        session.receive(Message::Unchoke).unwrap();
        let request = BlockRequest::new(0, 0, 4);
        session.request(request).unwrap();
        assert!(session.is_requested(0, 0));

        let unrequested = session
            .receive(Message::Piece {
                index: 1,
                begin: 0,
                block: Bytes::from_static(b"abcd"),
            })
            .unwrap();
        assert_eq!(unrequested, PeerEvent::Ignored);

        let event = session
            .receive(Message::Piece {
                index: 0,
                begin: 0,
                block: Bytes::from_static(b"abcd"),
            })
            .unwrap();
        assert_eq!(
            event,
            PeerEvent::Block {
                request,
                data: Bytes::from_static(b"abcd")
            }
        );
        assert_eq!(session.outstanding_download_count(), 0);
    }

    #[test]
    fn test_pipeline_is_bounded_fifo() {
        let mut session = PeerSession::new(addr(), 4, 2);
        session.handshake_completed([1u8; 20], Capabilities::new());
        session.receive(Message::Unchoke).unwrap();

        session.request(BlockRequest::new(0, 0, 10)).unwrap();
        session.request(BlockRequest::new(0, 16384, 10)).unwrap();
        assert!(!session.can_request());
        assert!(session.request(BlockRequest::new(0, 32768, 10)).is_err());

        let order: Vec<u32> = session.outstanding_downloads().map(|r| r.begin).collect();
        assert_eq!(order, vec![0, 16384]);
    }

    #[test]
    fn test_reset_discards_state_keeps_identity() {
        let mut session = active_session(4);
        session.receive(Message::Have { piece_index: 1 }).unwrap();
        session.receive(Message::Unchoke).unwrap();
        session.request(BlockRequest::new(1, 0, 10)).unwrap();
        session.assign_piece(Some(1));

        session.reset();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.bitfield().is_empty());
        assert_eq!(session.bitfield().len(), 4);
        assert_eq!(session.outstanding_download_count(), 0);
        assert!(session.assigned_piece().is_none());
        assert_eq!(session.peer_id(), Some([7u8; 20]));
    }
}
