//! CLI module
//!
//! Command-line interface for the peerwire binary.

pub mod args;
pub mod progress;

pub use args::CliArgs;
pub use progress::{ProgressReporter, TransferStats};
