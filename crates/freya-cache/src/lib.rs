//! # freya-cache
//!
//! The in-memory working set of FreyaFS.
//!
//! Plaintext lives here and only here: the file-system front-end reads
//! and writes byte buffers held by the [`Cache`], while the disk and the
//! block store only ever see Mix&Slice ciphertext. The cache enforces a
//! memory cap with pluggable eviction, keeps reference counts for open
//! handles, and defers encryption to flush time.
//!
//! Layering, bottom up:
//!
//! - [`FileByteContent`]: a length-tracked plaintext buffer with
//!   multi-reader / single-writer coordination.
//! - [`mixslice`]: the file-level codec that pads, mixes, splits each
//!   macroblock into a 1024-byte kept prefix (sidecar) and a remote tail
//!   (block store), and back.
//! - [`CacheEntry`] + [`EvictionPolicy`]: per-file bookkeeping and the
//!   ordering used to reclaim memory.
//! - [`Cache`]: the working-set manager itself.

mod cache;
mod content;
mod entry;
mod eviction;
pub mod mixslice;

pub use cache::{Cache, SharedCidMap};
pub use content::{FileByteContent, WriteOutcome};
pub use entry::CacheEntry;
pub use eviction::EvictionPolicy;

use thiserror::Error;

/// Errors from cache operations and the file codec underneath them.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A single entry is larger than the whole memory cap.
    #[error("entry does not fit in the cache memory cap")]
    OutOfMemory,

    /// The object has no sidecar/CID state to load from.
    #[error("no such cached object")]
    Missing,

    #[error("sidecar length {sidecar} does not match {cids} macroblocks")]
    Corruption { sidecar: u64, cids: usize },

    #[error(transparent)]
    Codec(#[from] freya_mix::MixError),

    #[error(transparent)]
    Store(#[from] freya_store::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
