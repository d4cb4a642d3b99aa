//! Storage module
//!
//! Byte-range storage backends for torrent data.

pub mod backend;
pub mod file;
pub mod memory;

pub use backend::{Storage, StorageType};
pub use file::FileStorage;
pub use memory::MemoryStorage;
