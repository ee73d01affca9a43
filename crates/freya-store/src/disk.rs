//! Local disk block store.
//!
//! Blobs are addressed by their BLAKE3 hash (lowercase hex) with a
//! 2-level fan-out directory layout:
//!
//! ```text
//! <root>/blocks/ab/cd/abcd1234...
//! ```
//!
//! Writes go through a uniquely-named temp file plus an atomic rename, so
//! concurrent puts of the same content cannot tear each other. Reads
//! re-hash the blob and fail on mismatch.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{BlockStore, Cid, Result, StoreError};

#[derive(Debug, Clone)]
pub struct DiskBlockStore {
    root: PathBuf,
}

impl DiskBlockStore {
    /// Open (creating if needed) a block store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("blocks"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hex: &str) -> PathBuf {
        let l1 = &hex[..2];
        let l2 = &hex[2..4];
        self.root.join("blocks").join(l1).join(l2).join(hex)
    }

    fn cid_for(data: &[u8]) -> String {
        hex::encode(blake3::hash(data).as_bytes())
    }
}

impl BlockStore for DiskBlockStore {
    fn put(&self, data: &[u8]) -> Result<Cid> {
        let hex = Self::cid_for(data);
        let path = self.blob_path(&hex);

        // Deduplication: identical content is already in place.
        if path.exists() {
            return Ok(Cid(hex));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_name = format!(
            "{}.{}.{:?}.tmp",
            hex,
            std::process::id(),
            std::thread::current().id()
        );
        let temp_path = path.with_file_name(&temp_name);
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            // Lost a race to another put of the same content: fine.
            if path.exists() {
                return Ok(Cid(hex));
            }
            return Err(StoreError::Io(e));
        }

        debug!(cid = %hex, len = data.len(), "stored block");
        Ok(Cid(hex))
    }

    fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        if cid.as_str().len() < 4 {
            return Err(StoreError::NotFound {
                cid: cid.as_str().to_string(),
            });
        }
        let path = self.blob_path(cid.as_str());
        if !path.exists() {
            return Err(StoreError::NotFound {
                cid: cid.as_str().to_string(),
            });
        }

        let data = fs::read(&path)?;
        let actual = Self::cid_for(&data);
        if actual != cid.as_str() {
            return Err(StoreError::HashMismatch {
                expected: cid.as_str().to_string(),
                actual,
            });
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::new(dir.path()).unwrap();

        let cid = store.put(b"hello blocks").unwrap();
        assert_eq!(store.get(&cid).unwrap(), b"hello blocks");
    }

    #[test]
    fn put_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::new(dir.path()).unwrap();

        let a = store.put(b"same").unwrap();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn get_missing_block_is_not_found() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::new(dir.path()).unwrap();

        let cid = Cid("deadbeef".repeat(8));
        assert!(matches!(
            store.get(&cid),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn get_detects_corruption() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::new(dir.path()).unwrap();

        let cid = store.put(b"pristine").unwrap();
        let path = store.blob_path(cid.as_str());
        fs::write(&path, b"tampered").unwrap();

        assert!(matches!(
            store.get(&cid),
            Err(StoreError::HashMismatch { .. })
        ));
    }
}
