//! Durable per-worker cache.
//!
//! A POSIX-friendly key/value store backed by a directory of
//! fingerprint-named files. Key name and birth time ride in extended
//! attributes where the filesystem supports them; without xattr support
//! the key is encoded directly in the filename and the metadata lives
//! inside the stored envelope. The external API is identical either way.

pub mod merge;
pub mod queue;
mod store;

pub use merge::merge_value;
pub use queue::DurableQueue;
pub use store::{Cache, SetOptions};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cache entry is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
