//! Error types for the peer-wire engine
//!
//! Every failure the engine can observe is one of these variants. Peer units
//! use [`TorrentError::is_protocol_violation`] and
//! [`TorrentError::is_torrent_wide`] to decide whether a failure only drops a
//! connection or must be surfaced at the torrent level.

use std::fmt;

/// Error type for torrent and peer-wire operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Torrent metadata parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer-wire protocol violations (fatal to the connection)
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Storage read/write/checksum errors
    StorageError {
        message: String,
        range: Option<String>,
        source: Option<String>,
        torrent_wide: bool,
    },

    /// Piece checksum mismatches
    IntegrityError {
        message: String,
        piece: u32,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError scoped to a single operation
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            range: None,
            source: None,
            torrent_wide: false,
        }
    }

    /// Create a new StorageError for a byte range
    pub fn storage_error_with_range(message: impl Into<String>, range: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            range: Some(range.into()),
            source: None,
            torrent_wide: false,
        }
    }

    /// Create a new StorageError with range and source
    pub fn storage_error_full(message: impl Into<String>, range: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            range: Some(range.into()),
            source: Some(source.into()),
            torrent_wide: false,
        }
    }

    /// Create a StorageError that affects the whole torrent (disk full, storage gone)
    pub fn storage_unavailable(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            range: None,
            source: Some(source.into()),
            torrent_wide: true,
        }
    }

    /// Create a new IntegrityError for a piece
    pub fn integrity_error(message: impl Into<String>, piece: u32) -> Self {
        TorrentError::IntegrityError {
            message: message.into(),
            piece,
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// True for errors that must close the offending connection
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, TorrentError::ProtocolError { .. })
    }

    /// True for storage failures that affect every peer of the torrent
    pub fn is_torrent_wide(&self) -> bool {
        matches!(self, TorrentError::StorageError { torrent_wide: true, .. })
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        let chain = |source: &mut Option<String>| {
            *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
        };
        match &mut self {
            TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::NetworkError { source, .. } => chain(source),
            _ => {}
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            TorrentError::PeerError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Peer error: {}", message),
                }
            }
            TorrentError::StorageError { message, range, source, torrent_wide } => {
                let label = if *torrent_wide { "Storage unavailable" } else { "Storage error" };
                match (range, source) {
                    (Some(r), Some(s)) => write!(f, "{}: {} (range: {}, source: {})", label, message, r, s),
                    (Some(r), None) => write!(f, "{}: {} (range: {})", label, message, r),
                    (None, Some(s)) => write!(f, "{}: {} (source: {})", label, message, s),
                    (None, None) => write!(f, "{}: {}", label, message),
                }
            }
            TorrentError::IntegrityError { message, piece } => {
                write!(f, "Integrity error: {} (piece: {})", message, piece)
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            TorrentError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::PermissionDenied => {
                TorrentError::storage_unavailable("Storage unavailable", err.to_string())
            }
            _ => TorrentError::StorageError {
                message: err.to_string(),
                range: None,
                source: Some(err.kind().to_string()),
                torrent_wide: false,
            },
        }
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::config_error(format!("Failed to parse JSON configuration: {}", err))
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown", err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}

/// Classify an `anyhow` error coming out of a peer unit
pub fn as_torrent_error(err: &anyhow::Error) -> Option<&TorrentError> {
    err.downcast_ref::<TorrentError>()
}
