//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::EngineConfig;
use crate::transfer::{CorruptionPolicy, PiecePolicy};

/// CLI arguments for the peer-wire engine
#[derive(Debug, Parser)]
#[command(name = "peerwire")]
#[command(about = "Download and seed a torrent over the BitTorrent peer-wire protocol", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Listening port for incoming connections (0 = any)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Peer to connect to (repeatable)
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// JSON engine configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Download limit in bytes/sec (0 = unlimited)
    #[arg(long, value_name = "BYTES")]
    pub download_limit: Option<u64>,

    /// Upload limit in bytes/sec (0 = unlimited)
    #[arg(long, value_name = "BYTES")]
    pub upload_limit: Option<u64>,

    /// Piece selection policy: random, sequential, rarest-first
    #[arg(long, value_name = "POLICY")]
    pub policy: Option<PiecePolicy>,

    /// What to do with peers sending corrupt data: ban, retry
    #[arg(long, value_name = "POLICY")]
    pub on_corrupt: Option<CorruptionPolicy>,

    /// Outstanding block requests per peer
    #[arg(long, value_name = "N")]
    pub pipeline: Option<usize>,

    /// Request in-flight pieces again once nothing else is left
    #[arg(long)]
    pub end_game: bool,

    /// Exit once the download completes instead of seeding
    #[arg(long)]
    pub no_seed: bool,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    /// Engine configuration: config file (or defaults) overridden by flags
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };

        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(limit) = self.download_limit {
            config.download_limit = limit;
        }
        if let Some(limit) = self.upload_limit {
            config.upload_limit = limit;
        }
        if let Some(policy) = self.policy {
            config.piece_policy = policy;
        }
        if let Some(policy) = self.on_corrupt {
            config.corruption_policy = policy;
        }
        if let Some(depth) = self.pipeline {
            config.pipeline_depth = depth;
        }
        if self.end_game {
            config.end_game = true;
        }

        config.validate()?;
        Ok(config)
    }
}
