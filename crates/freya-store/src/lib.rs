//! # freya-store
//!
//! Content-addressed block storage for FreyaFS.
//!
//! The cache only ever needs two operations: `put(bytes) -> cid` and
//! `get(cid) -> bytes`, with exact-byte round-trip. Everything else about
//! the store is opaque, so it lives behind the [`BlockStore`] trait with
//! two implementations:
//!
//! - [`DiskBlockStore`]: blobs under a local directory, addressed by
//!   BLAKE3 hex with a 2-level fan-out (`blocks/ab/cd/<hex>`).
//! - [`IpfsBlockStore`]: the IPFS HTTP API (`/api/v0/block/put` and
//!   `/api/v0/block/get`), CIDs verbatim as the daemon returns them.

mod disk;
mod ipfs;

pub use disk::DiskBlockStore;
pub use ipfs::IpfsBlockStore;

use std::io;

use thiserror::Error;

/// Opaque content identifier returned by a block store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid(pub String);

impl Cid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Cid {
    fn from(s: String) -> Self {
        Cid(s)
    }
}

/// Errors that can occur during block-store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("block not found: {cid}")]
    NotFound { cid: String },

    #[error("content mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("block store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected block store response: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A content-addressed store with exact-byte round-trip.
///
/// Implementations must be shareable across the FUSE dispatch threads and
/// the codec worker pool.
pub trait BlockStore: Send + Sync {
    /// Store a block, returning its content identifier.
    fn put(&self, data: &[u8]) -> Result<Cid>;

    /// Fetch the exact bytes previously stored under `cid`.
    fn get(&self, cid: &Cid) -> Result<Vec<u8>>;
}
