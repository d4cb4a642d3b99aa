//! In-memory storage
//!
//! Keeps the whole torrent in one buffer and remembers which bytes were
//! ever written, so reading unwritten data fails like a missing file would.
//! Failures can be injected for tests.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::TorrentError;
use crate::storage::backend::{Storage, StorageType};
use crate::torrent::piece::ByteRange;

#[derive(Debug)]
struct MemoryState {
    data: Vec<u8>,
    written: Vec<bool>,
    fail_writes: Option<TorrentError>,
    fail_reads: Option<TorrentError>,
}

/// Storage backed by a byte vector
#[derive(Debug)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    /// Empty storage for `total_length` bytes
    pub fn new(total_length: u64) -> Self {
        let len = total_length as usize;
        Self {
            state: Mutex::new(MemoryState {
                data: vec![0; len],
                written: vec![false; len],
                fail_writes: None,
                fail_reads: None,
            }),
        }
    }

    /// Storage already holding `content`
    pub fn with_content(content: Vec<u8>) -> Self {
        let len = content.len();
        Self {
            state: Mutex::new(MemoryState {
                data: content,
                written: vec![true; len],
                fail_writes: None,
                fail_reads: None,
            }),
        }
    }

    /// Make every following write fail with `error`
    pub fn fail_writes(&self, error: Option<TorrentError>) {
        self.state.lock().fail_writes = error;
    }

    /// Make every following read fail with `error`
    pub fn fail_reads(&self, error: Option<TorrentError>) {
        self.state.lock().fail_reads = error;
    }

    /// Copy of the stored bytes
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    fn check_range(len: usize, range: ByteRange) -> Result<(usize, usize)> {
        let start = range.offset as usize;
        let end = range.end() as usize;
        if end > len {
            return Err(TorrentError::storage_error_with_range(
                format!("Range beyond end of storage ({} bytes)", len),
                range.to_string(),
            )
            .into());
        }
        Ok((start, end))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write(&self, range: ByteRange, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = &state.fail_writes {
            return Err(err.clone().into());
        }
        let (start, end) = Self::check_range(state.data.len(), range)?;
        if data.len() != end - start {
            return Err(TorrentError::storage_error_with_range("Data length does not match range", range.to_string()).into());
        }
        state.data[start..end].copy_from_slice(data);
        state.written[start..end].iter_mut().for_each(|w| *w = true);
        trace!("Stored range {}", range);
        Ok(())
    }

    async fn read(&self, range: ByteRange) -> Result<Bytes> {
        let state = self.state.lock();
        if let Some(err) = &state.fail_reads {
            return Err(err.clone().into());
        }
        let (start, end) = Self::check_range(state.data.len(), range)?;
        if !state.written[start..end].iter().all(|&w| w) {
            return Err(TorrentError::storage_error_with_range("Range has no stored data", range.to_string()).into());
        }
        Ok(Bytes::copy_from_slice(&state.data[start..end]))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }
}
