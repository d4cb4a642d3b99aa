//! BitTorrent protocol messages
//!
//! Typed messages of the post-handshake regime and their length-prefixed
//! frame encoding. All integers are big-endian.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, trace};

use crate::error::TorrentError;

/// Size of the frame length prefix
pub const LENGTH_PREFIX: usize = 4;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    /// Exact payload size after the opcode, or the minimum for variable-size messages
    fn body_size(self) -> (usize, bool) {
        match self {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested => (0, true),
            MessageId::Have => (4, true),
            MessageId::Bitfield => (0, false),
            MessageId::Request | MessageId::Cancel => (12, true),
            MessageId::Piece => (8, false),
            MessageId::Port => (2, true),
        }
    }
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_error_with_source("Unknown message opcode", format!("value: {}", value)).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
        }
    }

    /// Serialize the message to a frame, length prefix included.
    ///
    /// The prefix is computed from the serialized payload.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        if let Some(id) = self.message_id() {
            payload.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => payload.put_u32(*piece_index),
            Message::Bitfield { bitfield } => payload.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_slice(block);
            }
            Message::Port { listen_port } => payload.put_u16(*listen_port),
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        trace!("Encoded {:?} into {} byte frame", self.message_id(), frame.len());
        frame.freeze()
    }

    /// Decode a frame payload (the `L` bytes after the length prefix)
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(payload.get_u8())?;
        let (size, exact) = id.body_size();
        if payload.len() < size || (exact && payload.len() != size) {
            error!("{:?} frame has {} payload bytes, expected {}", id, payload.len(), size);
            return Err(TorrentError::protocol_error_with_source(
                format!("Malformed {:?} frame", id),
                format!("expected {}{} bytes, got {}", if exact { "" } else { "at least " }, size, payload.len()),
            )
            .into());
        }

        let message = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: payload.get_u32(),
            },
            MessageId::Bitfield => Message::Bitfield { bitfield: payload },
            MessageId::Request => Message::Request {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            },
            MessageId::Piece => {
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: payload,
                }
            }
            MessageId::Cancel => Message::Cancel {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            },
            MessageId::Port => Message::Port {
                listen_port: payload.get_u16(),
            },
        };

        trace!("Decoded {:?}", message.message_id());
        Ok(message)
    }
}
