//! Transfer module
//!
//! Piece selection and the per-torrent orchestration of downloads and uploads.

pub mod orchestrator;
pub mod selector;

pub use orchestrator::{AnnounceStats, CorruptionPolicy, Flow, Orchestrator, MAX_REQUEST_LENGTH};
pub use selector::{PiecePolicy, PieceSelector};
