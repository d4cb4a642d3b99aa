//! Piece and block model
//!
//! A torrent's byte space is split into pieces, and each piece into fixed-size
//! blocks. Blocks are the unit that travels over the wire.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Size of a block in bytes; the last block of a piece holds the remainder
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// A contiguous range of the torrent's byte space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// Absolute offset from the start of the torrent
    pub offset: u64,
    /// Number of bytes
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Intersection with another range, if any
    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        (start < end).then(|| ByteRange::new(start, end - start))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.offset, self.length)
    }
}

/// A block within a piece
#[derive(Debug)]
pub struct Block {
    /// Index of the owning piece
    pub piece_index: u32,
    /// Offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
    downloaded: AtomicBool,
}

impl Block {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
            downloaded: AtomicBool::new(false),
        }
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn set_downloaded(&self, downloaded: bool) {
        self.downloaded.store(downloaded, Ordering::Release);
    }
}

/// A piece of the torrent
#[derive(Debug)]
pub struct Piece {
    /// Piece index
    pub index: u32,
    /// Expected SHA1 hash
    pub hash: [u8; 20],
    /// Absolute byte offset of the piece
    pub offset: u64,
    /// Length of this piece
    pub length: u32,
    blocks: Vec<Block>,
}

impl Piece {
    /// Create a piece and split it into blocks of [`BLOCK_SIZE`]
    pub fn new(index: u32, hash: [u8; 20], offset: u64, length: u32) -> Self {
        let block_count = length.div_ceil(BLOCK_SIZE);
        let blocks = (0..block_count)
            .map(|i| {
                let begin = i * BLOCK_SIZE;
                Block::new(index, begin, BLOCK_SIZE.min(length - begin))
            })
            .collect();

        Self {
            index,
            hash,
            offset,
            length,
            blocks,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Block starting at `begin`, if `begin` is a block boundary of this piece
    pub fn block_at(&self, begin: u32) -> Option<&Block> {
        if begin % BLOCK_SIZE != 0 {
            return None;
        }
        self.blocks.get((begin / BLOCK_SIZE) as usize)
    }

    /// Absolute byte range covered by this piece
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.offset, self.length as u64)
    }

    /// Absolute byte range of `length` bytes starting `begin` bytes into the piece
    pub fn sub_range(&self, begin: u32, length: u32) -> Option<ByteRange> {
        let end = begin.checked_add(length)?;
        (end <= self.length).then(|| ByteRange::new(self.offset + begin as u64, length as u64))
    }

    /// True once every block is marked downloaded
    pub fn is_downloaded(&self) -> bool {
        self.blocks.iter().all(Block::is_downloaded)
    }

    pub fn downloaded_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_downloaded()).count()
    }

    /// First block not yet downloaded and not excluded by `skip`
    pub fn next_missing_block(&self, skip: impl Fn(&Block) -> bool) -> Option<&Block> {
        self.blocks.iter().find(|b| !b.is_downloaded() && !skip(b))
    }

    /// Mark every block downloaded
    pub fn mark_all_downloaded(&self) {
        for block in &self.blocks {
            block.set_downloaded(true);
        }
    }

    /// Forget all downloaded blocks
    pub fn reset(&self) {
        for block in &self.blocks {
            block.set_downloaded(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_blocks_partition_length() {
        for length in [1u32, 848, 16384, 16385, 32768, 17232, 262144, 100_000] {
            let piece = Piece::new(0, [0u8; 20], 0, length);
            let total: u32 = piece.blocks().iter().map(|b| b.length).sum();
            assert_eq!(total, length);
            assert_eq!(piece.block_count() as u32, length.div_ceil(BLOCK_SIZE));

            let last = piece.blocks().last().unwrap();
            let expected_last = if length % BLOCK_SIZE == 0 { BLOCK_SIZE } else { length % BLOCK_SIZE };
            assert_eq!(last.length, expected_last);
        }
    }

    #[test]
    fn test_block_offsets_are_contiguous() {
        let piece = Piece::new(3, [0u8; 20], 3 * 40000, 40000);
        let mut expected = 0;
        for block in piece.blocks() {
            assert_eq!(block.piece_index, 3);
            assert_eq!(block.offset, expected);
            expected += block.length;
        }
    }

    #[test]
    fn test_block_at() {
        let piece = Piece::new(0, [0u8; 20], 0, 32768);
        assert_eq!(piece.block_at(16384).unwrap().offset, 16384);
        assert!(piece.block_at(100).is_none());
        assert!(piece.block_at(32768).is_none());
    }

    #[test]
    fn test_is_downloaded_and_reset() {
        let piece = Piece::new(0, [0u8; 20], 0, 20000);
        assert!(!piece.is_downloaded());

        piece.blocks()[0].set_downloaded(true);
        assert_eq!(piece.downloaded_blocks(), 1);
        assert_eq!(piece.next_missing_block(|_| false).unwrap().offset, BLOCK_SIZE);

        piece.blocks()[1].set_downloaded(true);
        assert!(piece.is_downloaded());
        assert!(piece.next_missing_block(|_| false).is_none());

        piece.reset();
        assert_eq!(piece.downloaded_blocks(), 0);
    }

    #[test]
    fn test_next_missing_block_skips_requested() {
        let piece = Piece::new(0, [0u8; 20], 0, 3 * BLOCK_SIZE);
        let next = piece.next_missing_block(|b| b.offset == 0).unwrap();
        assert_eq!(next.offset, BLOCK_SIZE);
    }

    #[test]
    fn test_sub_range() {
        let piece = Piece::new(1, [0u8; 20], 32768, 17232);
        assert_eq!(piece.sub_range(16384, 848), Some(ByteRange::new(49152, 848)));
        assert_eq!(piece.sub_range(16384, 849), None);
        assert_eq!(piece.sub_range(u32::MAX, 2), None);
    }

    #[test]
    fn test_byte_range_intersect() {
        let a = ByteRange::new(0, 100);
        let b = ByteRange::new(50, 100);
        assert_eq!(a.intersect(&b), Some(ByteRange::new(50, 50)));
        assert_eq!(a.intersect(&ByteRange::new(100, 5)), None);
    }
}
