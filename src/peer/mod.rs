//! Peer module
//!
//! Per-connection session state, the execution unit that drives it, the
//! per-torrent swarm registry and the transport it all runs over.

pub mod connection;
pub mod session;
pub mod swarm;
pub mod transport;

pub use connection::PeerConnection;
pub use session::{BlockRequest, ChokeState, ConnectionState, InterestState, PeerEvent, PeerSession};
pub use swarm::{BroadcastReport, PeerCandidate, PeerCommand, PeerEntry, PeerSource, Swarm};
pub use transport::{Listener, TcpTransport, Transport};
