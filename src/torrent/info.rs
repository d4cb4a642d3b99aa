//! Torrent metadata
//!
//! The static description the engine consumes: piece hashes, piece length,
//! total length, file layout and tracker URLs.

use std::path::PathBuf;

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// A file of the torrent with its position in the torrent's byte space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path relative to the download directory
    pub path: PathBuf,
    /// Absolute offset of the first byte of the file
    pub offset: u64,
    /// File size in bytes
    pub length: u64,
}

impl TorrentFile {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Decoded torrent metadata
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Torrent name
    pub name: String,
    /// Size of each piece in bytes (the last piece may be shorter)
    pub piece_length: u32,
    /// Piece hashes in index order
    pub piece_hashes: Vec<[u8; 20]>,
    /// Total size of all files
    pub total_length: u64,
    /// Files in torrent order, offsets assigned contiguously
    pub files: Vec<TorrentFile>,
    /// Tracker announce URLs, primary first
    pub trackers: Vec<String>,
}

impl TorrentInfo {
    /// Build metadata for a torrent from its file list; offsets are assigned in order.
    pub fn new(
        info_hash: [u8; 20],
        name: impl Into<String>,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        files: Vec<(PathBuf, u64)>,
    ) -> Self {
        let mut offset = 0u64;
        let files: Vec<TorrentFile> = files
            .into_iter()
            .map(|(path, length)| {
                let file = TorrentFile { path, offset, length };
                offset += length;
                file
            })
            .collect();

        Self {
            info_hash,
            name: name.into(),
            piece_length,
            piece_hashes,
            total_length: offset,
            files,
            trackers: Vec::new(),
        }
    }

    /// Build metadata for arbitrary content, hashing it piece by piece
    pub fn from_content(name: impl Into<String>, piece_length: u32, files: &[(PathBuf, Vec<u8>)]) -> Self {
        let content: Vec<u8> = files.iter().flat_map(|(_, data)| data.iter().copied()).collect();
        let piece_hashes = content
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let layout = files.iter().map(|(path, data)| (path.clone(), data.len() as u64)).collect();
        let name = name.into();
        let info_hash = Self::generate_info_hash(name.as_bytes());
        Self::new(info_hash, name, piece_length, piece_hashes, layout)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// SHA1 of the bencoded info dictionary
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Split the concatenated `pieces` field into 20-byte hashes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {}", pieces_bytes.len()),
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Check that pieces and files both tile `[0, total_length)`
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("Piece length must be positive", "piece_length").into());
        }

        let expected_pieces = self.total_length.div_ceil(self.piece_length as u64);
        if expected_pieces != self.piece_hashes.len() as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!(
                    "Expected {} pieces for {} bytes, metadata lists {}",
                    expected_pieces,
                    self.total_length,
                    self.piece_hashes.len()
                ),
                "pieces",
            )
            .into());
        }

        let mut cursor = 0u64;
        for file in &self.files {
            if file.offset != cursor {
                return Err(TorrentError::validation_error_with_field(
                    format!("File {} starts at {} but previous file ends at {}", file.path.display(), file.offset, cursor),
                    "files",
                )
                .into());
            }
            cursor = file.end();
        }
        if cursor != self.total_length {
            return Err(TorrentError::validation_error_with_field(
                format!("Files cover {} bytes, torrent has {}", cursor, self.total_length),
                "files",
            )
            .into());
        }

        Ok(())
    }
}
