//! peerwire
//!
//! BitTorrent peer-wire engine: wire codec, peer sessions, piece selection,
//! download/upload orchestration and traffic shaping.

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod traffic;
pub mod transfer;

pub use config::EngineConfig;
pub use controller::Controller;
pub use error::TorrentError;

pub use peer::{PeerCandidate, PeerConnection, PeerSession, PeerSource, Swarm, TcpTransport, Transport};
pub use protocol::{BitTorrentWire, Capabilities, Handshake, Message, MessageId};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use torrent::{Bitfield, Piece, Torrent, TorrentInfo, TorrentParser};
pub use traffic::{RateLimiter, TrafficCounters, TrafficShaper};
pub use transfer::{AnnounceStats, CorruptionPolicy, Orchestrator, PiecePolicy, PieceSelector};
