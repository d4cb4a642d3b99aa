//! BitTorrent handshake protocol
//!
//! The fixed 68-byte frame exchanged before any other message, and the
//! reserved capability bitmap it carries.

use std::fmt;

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Size of a serialized handshake
pub const HANDSHAKE_LENGTH: usize = 68;

/// Peer id prefix identifying this client
pub const PEER_ID_PREFIX: &[u8; 8] = b"-PW0100-";

/// Reserved capability bits of the handshake.
///
/// Bit `n` lives in byte `n / 8` at position `7 - n % 8`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities([u8; 8]);

impl Capabilities {
    /// Extension protocol (BEP 10)
    pub const EXTENSION: u32 = 43;
    /// Fast extension (BEP 6)
    pub const FAST: u32 = 61;
    /// DHT (BEP 5)
    pub const DHT: u32 = 63;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn with(mut self, bit: u32) -> Self {
        self.set(bit);
        self
    }

    pub fn set(&mut self, bit: u32) {
        let (byte, mask) = Self::locate(bit);
        self.0[byte] |= mask;
    }

    pub fn has(&self, bit: u32) -> bool {
        let (byte, mask) = Self::locate(bit);
        self.0[byte] & mask != 0
    }

    fn locate(bit: u32) -> (usize, u8) {
        assert!(bit < 64, "capability bit {} out of range", bit);
        ((bit / 8) as usize, 0x80 >> (bit % 8))
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities({})", hex::encode(self.0))
    }
}

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved capability bitmap
    pub reserved: Capabilities,
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id and no capabilities
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            reserved: Capabilities::new(),
            info_hash,
            peer_id,
        }
    }

    /// Create a handshake advertising capability bits
    pub fn with_capabilities(info_hash: [u8; 20], peer_id: [u8; 20], reserved: Capabilities) -> Self {
        debug!("Creating handshake with capabilities {:?}", reserved);
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to its 68-byte frame
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(self.reserved.as_bytes());
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from its 68-byte frame
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() != HANDSHAKE_LENGTH {
            error!("Handshake has wrong size: expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake has wrong size",
                format!("expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len()),
            )
            .into());
        }

        let protocol_length = data[0];
        if protocol_length != PROTOCOL_LENGTH {
            error!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, protocol_length);
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, protocol_length),
            )
            .into());
        }

        if &data[1..20] != PROTOCOL_STRING.as_bytes() {
            error!("Invalid protocol string");
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Handshake info_hash: {}, peer_id: {}",
            hex::encode(info_hash),
            hex::encode(peer_id)
        );
        Ok(Self {
            reserved: Capabilities::from_bytes(reserved),
            info_hash,
            peer_id,
        })
    }

    /// Validate the handshake info_hash
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake validation failed: expected info hash {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}
