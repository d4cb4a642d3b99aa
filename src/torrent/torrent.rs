//! Runtime torrent model
//!
//! [`Torrent`] owns the pieces, files and the completed-pieces bitfield of
//! one torrent. Everything except the bitfield (and the per-block download
//! flags) is immutable after construction.

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::TorrentError;
use crate::torrent::bitfield::Bitfield;
use crate::torrent::info::{TorrentFile, TorrentInfo};
use crate::torrent::piece::Piece;

/// A loaded torrent
#[derive(Debug)]
pub struct Torrent {
    info_hash: [u8; 20],
    name: String,
    piece_length: u32,
    total_size: u64,
    pieces: Vec<Piece>,
    files: Vec<TorrentFile>,
    trackers: Vec<String>,
    completed: Mutex<Bitfield>,
}

impl Torrent {
    /// Build the runtime model from decoded metadata, rejecting inconsistent layouts
    pub fn from_info(info: &TorrentInfo) -> Result<Self> {
        info.validate()?;

        let piece_length = info.piece_length as u64;
        let pieces: Vec<Piece> = info
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                let offset = i as u64 * piece_length;
                let length = piece_length.min(info.total_length - offset) as u32;
                Piece::new(i as u32, *hash, offset, length)
            })
            .collect();

        if pieces.iter().any(|p| p.length == 0) {
            return Err(TorrentError::validation_error_with_field("Empty piece in layout", "pieces").into());
        }

        debug!(
            "Torrent {} split into {} pieces of {} bytes",
            info.info_hash_hex(),
            pieces.len(),
            info.piece_length
        );

        Ok(Self {
            info_hash: info.info_hash,
            name: info.name.clone(),
            piece_length: info.piece_length,
            total_size: info.total_length,
            completed: Mutex::new(Bitfield::new(pieces.len())),
            pieces,
            files: info.files.clone(),
            trackers: info.trackers.clone(),
        })
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Piece by index, if in range
    pub fn piece(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(index as usize)
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    /// Snapshot of the locally completed pieces
    pub fn completed_bitfield(&self) -> Bitfield {
        self.completed.lock().clone()
    }

    pub fn has_piece(&self, index: u32) -> bool {
        (index as usize) < self.pieces.len() && self.completed.lock().has(index as usize)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().cardinality()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.lock().is_seeder()
    }

    /// Mark a verified piece complete.
    ///
    /// Returns `true` only for the call that actually flipped the bit, so a
    /// caller broadcasting `have` on `true` broadcasts at most once per piece.
    pub fn mark_complete(&self, index: u32) -> bool {
        let Some(piece) = self.piece(index) else {
            return false;
        };
        let newly = {
            let mut completed = self.completed.lock();
            if completed.has(index as usize) {
                false
            } else {
                completed.set(index as usize);
                true
            }
        };
        piece.mark_all_downloaded();
        if newly {
            info!("Piece {} of {} complete", index, self.name);
        }
        newly
    }

    /// Bytes still missing locally
    pub fn bytes_left(&self) -> u64 {
        let completed = self.completed.lock();
        self.pieces
            .iter()
            .filter(|p| !completed.has(p.index as usize))
            .map(|p| p.length as u64)
            .sum()
    }
}
