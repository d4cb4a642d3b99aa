//! Storage abstraction for torrent data
//!
//! The engine only ever addresses storage by absolute byte range of the
//! torrent's byte space. Mapping ranges onto files (or memory) is the
//! backend's business.

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::torrent::piece::{ByteRange, Piece};
use anyhow::Result;

/// Abstract storage backend for torrent data
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist `data` at `range`; `data.len()` equals `range.length`
    async fn write(&self, range: ByteRange, data: &[u8]) -> Result<()>;

    /// Read back exactly `range.length` bytes.
    ///
    /// Ranges with no backing data are an error, never zero-filled.
    async fn read(&self, range: ByteRange) -> Result<Bytes>;

    /// SHA1 of the bytes currently stored for `piece`
    async fn checksum(&self, piece: &Piece) -> Result<[u8; 20]> {
        let data = self.read(piece.range()).await?;
        let mut hasher = Sha1::new();
        hasher.update(&data);
        Ok(hasher.finalize().into())
    }

    /// Storage type identifier, for logging
    fn storage_type(&self) -> StorageType;
}

/// Storage type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Local filesystem storage
    File,
    /// In-process memory
    Memory,
}
