//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Capabilities, Handshake, HANDSHAKE_LENGTH, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{BitTorrentWire, DEFAULT_MAX_FRAME_LENGTH};
