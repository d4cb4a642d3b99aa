//! Engine configuration
//!
//! Loaded from a JSON file (every field optional) and then overridden from
//! command-line flags.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::TorrentError;
use crate::protocol::DEFAULT_MAX_FRAME_LENGTH;
use crate::torrent::BLOCK_SIZE;
use crate::transfer::{CorruptionPolicy, PiecePolicy};

/// Peer-wire engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Listening port (0 = OS-assigned)
    pub listen_port: u16,
    /// Connected peers per torrent
    pub max_connections: usize,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Send a keep-alive after this long without sending anything
    pub keepalive_interval_secs: u64,
    /// Disconnect after this long without receiving anything (0 = never)
    pub idle_timeout_secs: u64,
    /// Outstanding block requests per peer
    pub pipeline_depth: usize,
    pub piece_policy: PiecePolicy,
    pub corruption_policy: CorruptionPolicy,
    /// Request in-flight pieces again once nothing else is left
    pub end_game: bool,
    /// Torrent-wide download ceiling in bytes/sec (0 = unlimited)
    pub download_limit: u64,
    /// Torrent-wide upload ceiling in bytes/sec (0 = unlimited)
    pub upload_limit: u64,
    pub peer_download_limit: u64,
    pub peer_upload_limit: u64,
    /// Traffic sampling period
    pub sample_interval_ms: u64,
    /// Largest accepted frame
    pub max_frame_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_connections: 50,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 20,
            keepalive_interval_secs: 120,
            idle_timeout_secs: 300,
            pipeline_depth: 1,
            piece_policy: PiecePolicy::Random,
            corruption_policy: CorruptionPolicy::Ban,
            end_game: false,
            download_limit: 0,
            upload_limit: 0,
            peer_download_limit: 0,
            peer_upload_limit: 0,
            sample_interval_ms: 1000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let data = std::fs::read_to_string(path).map_err(|e| {
            TorrentError::config_error(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&data).map_err(TorrentError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "max_connections").into());
        }
        if self.pipeline_depth == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "pipeline_depth").into());
        }
        if self.connect_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err(TorrentError::config_error_with_field("timeouts must be positive", "connect_timeout_secs").into());
        }
        if self.keepalive_interval_secs == 0 {
            return Err(TorrentError::config_error_with_field("must be positive", "keepalive_interval_secs").into());
        }
        if self.idle_timeout_secs != 0 && self.idle_timeout_secs <= self.keepalive_interval_secs {
            return Err(TorrentError::config_error_with_field(
                "must exceed keepalive_interval_secs",
                "idle_timeout_secs",
            )
            .into());
        }
        if self.sample_interval_ms == 0 {
            return Err(TorrentError::config_error_with_field("must be positive", "sample_interval_ms").into());
        }
        if self.max_frame_length < BLOCK_SIZE as usize + 9 {
            return Err(TorrentError::config_error_with_field(
                format!("must hold at least one {} byte block", BLOCK_SIZE),
                "max_frame_length",
            )
            .into());
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Receive-idle limit, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}
