//! File storage module
//!
//! Maps absolute byte ranges onto the torrent's files under a base
//! directory. A range spanning several files is split at file boundaries.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::backend::{Storage, StorageType};
use crate::torrent::info::TorrentFile;
use crate::torrent::piece::ByteRange;

/// File storage for torrent data
#[derive(Debug)]
pub struct FileStorage {
    /// Base download directory
    base_path: PathBuf,
    /// Files in torrent order
    files: Vec<TorrentFile>,
    total_length: u64,
}

/// A piece of a byte range that falls inside one file
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSegment {
    path: PathBuf,
    /// Offset inside the file
    file_offset: u64,
    /// Offset inside the requested range
    range_offset: usize,
    length: usize,
}

fn io_error(context: &str, path: &Path, e: std::io::Error) -> TorrentError {
    error!("{} '{}': {}", context, path.display(), e);
    match e.kind() {
        std::io::ErrorKind::StorageFull | std::io::ErrorKind::PermissionDenied => {
            TorrentError::storage_unavailable(format!("{} '{}'", context, path.display()), e.to_string())
        }
        _ => TorrentError::storage_error_full(context, path.display().to_string(), e.to_string()),
    }
}

impl FileStorage {
    /// Create a new file storage rooted at `base_path`
    pub fn new(base_path: PathBuf, files: Vec<TorrentFile>) -> Self {
        info!("Creating file storage at {}", base_path.display());
        let total_length = files.last().map_or(0, TorrentFile::end);
        Self {
            base_path,
            files,
            total_length,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create directories and preallocate any file that does not exist yet
    pub async fn create_files(&self) -> Result<()> {
        info!("Creating file structure for {} files", self.files.len());

        for file in &self.files {
            let file_path = self.base_path.join(&file.path);
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("Failed to create directory", parent, e))?;
            }
            if fs::try_exists(&file_path).await.unwrap_or(false) {
                debug!("Keeping existing file: {}", file_path.display());
                continue;
            }

            debug!("Creating file: {} ({} bytes)", file_path.display(), file.length);
            let f = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file_path)
                .await
                .map_err(|e| io_error("Failed to create file", &file_path, e))?;
            f.set_len(file.length)
                .await
                .map_err(|e| io_error("Failed to set file length", &file_path, e))?;
        }

        info!("File structure created successfully");
        Ok(())
    }

    /// Split `range` into per-file segments
    fn segments(&self, range: ByteRange) -> Result<Vec<FileSegment>> {
        if range.end() > self.total_length {
            return Err(TorrentError::storage_error_with_range(
                format!("Range beyond end of torrent ({} bytes)", self.total_length),
                range.to_string(),
            )
            .into());
        }

        let segments = self
            .files
            .iter()
            .filter_map(|file| {
                let overlap = range.intersect(&ByteRange::new(file.offset, file.length))?;
                Some(FileSegment {
                    path: self.base_path.join(&file.path),
                    file_offset: overlap.offset - file.offset,
                    range_offset: (overlap.offset - range.offset) as usize,
                    length: overlap.length as usize,
                })
            })
            .collect();
        Ok(segments)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn write(&self, range: ByteRange, data: &[u8]) -> Result<()> {
        if data.len() as u64 != range.length {
            return Err(TorrentError::storage_error_with_range(
                format!("Data length {} does not match range", data.len()),
                range.to_string(),
            )
            .into());
        }

        for segment in self.segments(range)? {
            trace!(
                "Writing {} bytes to {} at offset {}",
                segment.length,
                segment.path.display(),
                segment.file_offset
            );
            let mut file_handle = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&segment.path)
                .await
                .map_err(|e| io_error("Failed to open file for writing", &segment.path, e))?;
            file_handle
                .seek(SeekFrom::Start(segment.file_offset))
                .await
                .map_err(|e| io_error("Failed to seek in file", &segment.path, e))?;
            file_handle
                .write_all(&data[segment.range_offset..segment.range_offset + segment.length])
                .await
                .map_err(|e| io_error("Failed to write to file", &segment.path, e))?;
            file_handle
                .flush()
                .await
                .map_err(|e| io_error("Failed to flush file", &segment.path, e))?;
        }

        trace!("Wrote range {}", range);
        Ok(())
    }

    async fn read(&self, range: ByteRange) -> Result<Bytes> {
        let mut buffer = vec![0u8; range.length as usize];

        for segment in self.segments(range)? {
            trace!(
                "Reading {} bytes from {} at offset {}",
                segment.length,
                segment.path.display(),
                segment.file_offset
            );
            let mut file_handle = fs::File::open(&segment.path)
                .await
                .map_err(|e| io_error("Failed to open file for reading", &segment.path, e))?;
            file_handle
                .seek(SeekFrom::Start(segment.file_offset))
                .await
                .map_err(|e| io_error("Failed to seek in file", &segment.path, e))?;
            file_handle
                .read_exact(&mut buffer[segment.range_offset..segment.range_offset + segment.length])
                .await
                .map_err(|e| io_error("Failed to read from file", &segment.path, e))?;
        }

        trace!("Read range {}", range);
        Ok(Bytes::from(buffer))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::TorrentInfo;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("peerwire_{}_{}", name, std::process::id()))
    }

    fn layout() -> Vec<TorrentFile> {
        TorrentInfo::new(
            [0u8; 20],
            "multi",
            100,
            vec![[0u8; 20]; 3],
            vec![
                (PathBuf::from("multi/a.bin"), 120),
                (PathBuf::from("multi/sub/b.bin"), 30),
                (PathBuf::from("multi/c.bin"), 100),
            ],
        )
        .files
    }

    #[tokio::test]
    async fn test_write_read_across_files() {
        let dir = temp_dir("file_span");
        let storage = FileStorage::new(dir.clone(), layout());
        storage.create_files().await.unwrap();

        let data: Vec<u8> = (0..100u8).collect();
        storage.write(ByteRange::new(100, 100), &data).await.unwrap();

        let read = storage.read(ByteRange::new(100, 100)).await.unwrap();
        assert_eq!(read.as_ref(), data.as_slice());

        let b = std::fs::read(dir.join("multi/sub/b.bin")).unwrap();
        assert_eq!(b, data[20..50].to_vec());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_error_not_zeroes() {
        let dir = temp_dir("file_missing");
        let storage = FileStorage::new(dir.clone(), layout());
        let err = storage.read(ByteRange::new(0, 10)).await.unwrap_err();
        assert!(crate::error::as_torrent_error(&err).is_some());
    }

    #[tokio::test]
    async fn test_range_beyond_end() {
        let storage = FileStorage::new(temp_dir("file_end"), layout());
        assert!(storage.read(ByteRange::new(240, 20)).await.is_err());
        assert!(storage.write(ByteRange::new(0, 5), &[1, 2, 3]).await.is_err());
    }

    #[tokio::test]
    async fn test_checksum_uses_stored_bytes() {
        use crate::torrent::piece::Piece;
        use sha1::{Digest, Sha1};

        let dir = temp_dir("file_checksum");
        let storage = FileStorage::new(dir.clone(), layout());
        storage.create_files().await.unwrap();

        let data = vec![42u8; 50];
        storage.write(ByteRange::new(200, 50), &data).await.unwrap();

        let piece = Piece::new(2, [0u8; 20], 200, 50);
        let expected: [u8; 20] = Sha1::digest(&data).into();
        assert_eq!(storage.checksum(&piece).await.unwrap(), expected);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_segments_split_at_file_boundaries() {
        let storage = FileStorage::new(PathBuf::from("/data"), layout());
        let segments = storage.segments(ByteRange::new(110, 50)).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!((segments[0].file_offset, segments[0].range_offset, segments[0].length), (110, 0, 10));
        assert_eq!((segments[1].file_offset, segments[1].range_offset, segments[1].length), (0, 10, 30));
        assert_eq!((segments[2].file_offset, segments[2].range_offset, segments[2].length), (0, 40, 10));
    }
}
