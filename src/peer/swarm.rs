//! Swarm registry
//!
//! Per-torrent set of peers being dialled or connected. Live connections
//! register a command channel here; everything the rest of the torrent
//! wants to tell a peer unit goes through that channel. Entries leave the
//! registry when their dial fails or their connection ends.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

use crate::error::TorrentError;
use crate::torrent::bitfield::Bitfield;

/// Where a peer was learned from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Manual,
    Incoming,
}

/// A peer address supplied by a tracker or the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCandidate {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
}

impl PeerCandidate {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, peer_id: None }
    }

    pub fn with_peer_id(addr: SocketAddr, peer_id: [u8; 20]) -> Self {
        Self {
            addr,
            peer_id: Some(peer_id),
        }
    }
}

/// Instructions delivered to a peer unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    /// A piece was completed locally
    Have(u32),
    /// Close the connection
    Disconnect,
}

/// Registry view of one peer
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub source: PeerSource,
    /// Last bitfield reported by the peer unit while connected
    pub bitfield: Option<Bitfield>,
    commands: Option<UnboundedSender<PeerCommand>>,
}

impl PeerEntry {
    fn new(addr: SocketAddr, peer_id: Option<[u8; 20]>, source: PeerSource) -> Self {
        Self {
            addr,
            peer_id,
            source,
            bitfield: None,
            commands: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.commands.is_some()
    }

    /// Deliver a command to the peer unit
    pub fn send(&self, command: PeerCommand) -> Result<()> {
        let sender = self.commands.as_ref().ok_or_else(|| {
            TorrentError::peer_error_with_peer("Peer is not connected", self.addr.to_string())
        })?;
        sender.send(command).map_err(|_| {
            TorrentError::peer_error_with_peer("Peer unit has exited", self.addr.to_string()).into()
        })
    }
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// All peers of one torrent
#[derive(Debug, Default)]
pub struct Swarm {
    peers: RwLock<HashMap<SocketAddr, PeerEntry>>,
}

impl Swarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer; returns false if the address is already known
    pub fn add(&self, addr: SocketAddr, peer_id: Option<[u8; 20]>, source: PeerSource) -> bool {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(&addr) {
            if entry.peer_id.is_none() {
                entry.peer_id = peer_id;
            }
            trace!("Peer {} already known", addr);
            return false;
        }
        peers.insert(addr, PeerEntry::new(addr, peer_id, source));
        debug!("Added peer {} (total: {})", addr, peers.len());
        true
    }

    /// Forget a peer entirely
    pub fn remove(&self, addr: &SocketAddr) -> Option<PeerEntry> {
        let removed = self.peers.write().remove(addr);
        if removed.is_some() {
            debug!("Removed peer {}", addr);
        }
        removed
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<PeerEntry> {
        self.peers.read().get(addr).cloned()
    }

    pub fn find_by_peer_id(&self, peer_id: &[u8; 20]) -> Option<PeerEntry> {
        self.peers
            .read()
            .values()
            .find(|p| p.peer_id.as_ref() == Some(peer_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Register a live connection; fails if the peer is already connected
    pub fn attach(
        &self,
        addr: SocketAddr,
        peer_id: [u8; 20],
        source: PeerSource,
        commands: UnboundedSender<PeerCommand>,
    ) -> Result<()> {
        let mut peers = self.peers.write();
        let entry = peers
            .entry(addr)
            .or_insert_with(|| PeerEntry::new(addr, Some(peer_id), source));
        if entry.is_connected() {
            return Err(TorrentError::peer_error_with_peer("Peer already connected", addr.to_string()).into());
        }
        entry.peer_id = Some(peer_id);
        entry.commands = Some(commands);
        entry.bitfield = None;
        debug!("Peer {} attached ({})", addr, hex::encode(peer_id));
        Ok(())
    }

    /// Drop a peer that never connected; a live connection is left alone
    pub fn forget(&self, addr: &SocketAddr) -> bool {
        let mut peers = self.peers.write();
        match peers.get(addr) {
            Some(entry) if !entry.is_connected() => {
                peers.remove(addr);
                trace!("Forgot unconnected peer {}", addr);
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.peers.read().get(addr).map_or(false, PeerEntry::is_connected)
    }

    /// Connected subset
    pub fn connected(&self) -> Vec<PeerEntry> {
        self.peers
            .read()
            .values()
            .filter(|p| p.is_connected())
            .cloned()
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.read().values().filter(|p| p.is_connected()).count()
    }

    /// Publish a peer's bitfield for swarm-wide piece statistics
    pub fn update_bitfield(&self, addr: &SocketAddr, bitfield: &Bitfield) {
        if let Some(entry) = self.peers.write().get_mut(addr) {
            entry.bitfield = Some(bitfield.clone());
        }
    }

    /// Bitfields of all connected peers
    pub fn bitfields(&self) -> Vec<Bitfield> {
        self.peers
            .read()
            .values()
            .filter(|p| p.is_connected())
            .filter_map(|p| p.bitfield.clone())
            .collect()
    }

    /// Invoke `callback` on every connected peer.
    ///
    /// A failure for one peer is logged and counted; the remaining peers are
    /// still visited.
    pub fn broadcast<F>(&self, mut callback: F) -> BroadcastReport
    where
        F: FnMut(&PeerEntry) -> Result<()>,
    {
        let targets = self.connected();
        let mut report = BroadcastReport::default();
        for peer in &targets {
            match callback(peer) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", peer.addr, e);
                    report.failed += 1;
                }
            }
        }
        trace!("Broadcast delivered to {}, failed for {}", report.delivered, report.failed);
        report
    }

    /// Ask every connected peer unit to close
    pub fn disconnect_all(&self) -> BroadcastReport {
        self.broadcast(|peer| peer.send(PeerCommand::Disconnect))
    }
}
