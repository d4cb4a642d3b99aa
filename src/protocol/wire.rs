//! Wire framing over a byte stream
//!
//! Reads and writes handshakes and length-prefixed frames on any
//! `AsyncRead`/`AsyncWrite`. When a [`TrafficShaper`] is attached, this is
//! where bandwidth is enforced: outgoing frames wait for upload allowance
//! before they are written, and incoming frames are charged against the
//! download allowance before the next read.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::message::{Message, LENGTH_PREFIX};
use crate::error::TorrentError;
use crate::traffic::TrafficShaper;

/// Largest frame accepted by default: a 128 KiB block plus the piece header
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 128 * 1024 + 9;

/// Frame reader/writer for one connection
#[derive(Debug, Clone)]
pub struct BitTorrentWire {
    max_frame_length: usize,
    shaper: Option<Arc<TrafficShaper>>,
}

impl Default for BitTorrentWire {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl BitTorrentWire {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            shaper: None,
        }
    }

    /// Enforce bandwidth limits through `shaper`
    pub fn with_shaper(mut self, shaper: Arc<TrafficShaper>) -> Self {
        self.shaper = Some(shaper);
        self
    }

    pub fn shaper(&self) -> Option<&Arc<TrafficShaper>> {
        self.shaper.as_ref()
    }

    /// Read a 68-byte handshake frame
    pub async fn read_handshake<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        reader.read_exact(&mut buf[..1]).await?;
        if buf[0] as usize != super::handshake::PROTOCOL_LENGTH as usize {
            error!("Handshake announces protocol string of {} bytes", buf[0]);
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("got {}", buf[0]),
            )
            .into());
        }
        reader.read_exact(&mut buf[1..]).await?;
        Handshake::deserialize(&buf)
    }

    /// Write a handshake frame
    pub async fn write_handshake<W: AsyncWrite + Unpin>(&self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next length-prefixed frame and decode it
    pub async fn read_message<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Message> {
        let mut length_buf = [0u8; LENGTH_PREFIX];
        reader.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length > self.max_frame_length {
            error!("Frame of {} bytes exceeds limit of {}", length, self.max_frame_length);
            return Err(TorrentError::protocol_error_with_source(
                "Frame too large",
                format!("{} > {}", length, self.max_frame_length),
            )
            .into());
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        trace!("Read frame of {} bytes", length);

        if let Some(shaper) = &self.shaper {
            shaper.throttle_download(LENGTH_PREFIX + length).await;
        }

        Message::decode(Bytes::from(payload))
    }

    /// Encode and write a message
    pub async fn write_message<W: AsyncWrite + Unpin>(&self, writer: &mut W, message: &Message) -> Result<()> {
        let frame = message.encode();
        if let Some(shaper) = &self.shaper {
            shaper.throttle_upload(frame.len()).await;
        }
        writer.write_all(&frame).await?;
        writer.flush().await?;
        trace!("Wrote {:?} ({} bytes)", message.message_id(), frame.len());
        Ok(())
    }
}
