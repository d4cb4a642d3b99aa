//! Torrent model module
//!
//! Metadata decoding, the piece/block model, bitfields and the runtime torrent.

pub mod bitfield;
pub mod info;
pub mod parser;
pub mod piece;
#[allow(clippy::module_inception)]
pub mod torrent;

pub use bitfield::Bitfield;
pub use info::{TorrentFile, TorrentInfo};
pub use parser::TorrentParser;
pub use piece::{Block, ByteRange, Piece, BLOCK_SIZE};
pub use torrent::Torrent;
