//! Per-file cache bookkeeping.

use std::sync::{Arc, Mutex};

use crate::content::FileByteContent;
use crate::unix_now;

/// One cached file: the live plaintext (absent once evicted), an
/// open-handle count, a dirty flag and timestamps.
///
/// Field mutations happen under the cache-wide lock; the buffer itself
/// has its own reader/writer coordination, and `flush_lock` serializes
/// encrypts of this one file while other files flush in parallel.
#[derive(Debug)]
pub struct CacheEntry {
    pub content: Option<Arc<FileByteContent>>,
    pub opens: u32,
    pub modified: bool,
    pub atime: i64,
    pub mtime: i64,
    pub(crate) flush_lock: Arc<Mutex<()>>,
}

impl CacheEntry {
    /// A new entry for freshly materialized plaintext. With a known
    /// `mtime` (loaded from persisted state) the entry starts clean;
    /// without one it is dirty from birth and must be flushed.
    pub fn new(content: FileByteContent, mtime: Option<i64>) -> Self {
        let atime = unix_now();
        Self {
            content: Some(Arc::new(content)),
            opens: 1,
            modified: mtime.is_none(),
            atime,
            mtime: mtime.unwrap_or(atime),
            flush_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Current plaintext size in bytes; zero once evicted.
    pub fn size(&self) -> u64 {
        self.content.as_ref().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_with_known_mtime_starts_clean() {
        let entry = CacheEntry::new(FileByteContent::new(vec![1, 2, 3]), Some(17));
        assert!(!entry.modified);
        assert_eq!(entry.mtime, 17);
        assert_eq!(entry.opens, 1);
        assert_eq!(entry.size(), 3);
    }

    #[test]
    fn entry_without_mtime_is_dirty_from_birth() {
        let entry = CacheEntry::new(FileByteContent::new(Vec::new()), None);
        assert!(entry.modified);
        assert_eq!(entry.atime, entry.mtime);
        assert_eq!(entry.size(), 0);
    }
}
