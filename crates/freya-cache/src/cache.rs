//! The working-set manager.
//!
//! Three tiers per object: `files` (plaintext resident), `evicted`
//! (plaintext dropped, bookkeeping kept so identity and open counts
//! survive), and the implicit on-disk tier (sidecar + block store),
//! loaded on demand.
//!
//! Lock discipline: one cache-wide mutex guards map membership, the
//! `total_size` accounting and the files↔evicted transitions. It is
//! never held across a codec or block-store call; per-file buffers have
//! their own reader/writer coordination and each entry carries a flush
//! lock so one file's encrypt serializes while other files proceed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use nix::sys::stat::utimes;
use nix::sys::time::TimeVal;
use tracing::debug;

use freya_manifest::{CidMap, PathInfo};
use freya_store::{BlockStore, Cid};

use crate::content::FileByteContent;
use crate::entry::CacheEntry;
use crate::eviction::EvictionPolicy;
use crate::mixslice;
use crate::{unix_now, CacheError, Result};

/// Shared ownership of the CID map: the cache updates it on flush, the
/// file-system front-end reads it for the manifest and unlink.
pub type SharedCidMap = Arc<RwLock<CidMap>>;

#[derive(Default)]
struct CacheState {
    files: HashMap<PathInfo, CacheEntry>,
    evicted: HashMap<PathInfo, CacheEntry>,
    total_size: u64,
}

pub struct Cache {
    root: PathBuf,
    store: Arc<dyn BlockStore>,
    cids: SharedCidMap,
    memory_cap: u64,
    policy: EvictionPolicy,
    state: Mutex<CacheState>,
}

impl Cache {
    pub fn new(
        root: impl Into<PathBuf>,
        store: Arc<dyn BlockStore>,
        cids: SharedCidMap,
        memory_cap: u64,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            root: root.into(),
            store,
            cids,
            memory_cap,
            policy,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `path` is currently resident in memory.
    pub fn contains(&self, path: &PathInfo) -> bool {
        self.lock_state().files.contains_key(path)
    }

    /// Total plaintext bytes currently resident.
    pub fn resident_bytes(&self) -> u64 {
        self.lock_state().total_size
    }

    fn sidecar_path(&self, path: &PathInfo) -> PathBuf {
        self.root.join(&path.path_id)
    }

    // ------------------------------------------------------------ codec

    fn decrypt(&self, path: &PathInfo) -> Result<Vec<u8>> {
        let cids: Vec<Cid> = {
            let map = self.cids.read().unwrap_or_else(|e| e.into_inner());
            map.get(&path.path_id)
                .ok_or(CacheError::Missing)?
                .iter()
                .map(|c| Cid(c.clone()))
                .collect()
        };
        mixslice::decrypt_file(
            self.store.as_ref(),
            &self.sidecar_path(path),
            &path.key,
            &path.iv,
            &cids,
        )
    }

    fn encrypt(&self, path: &PathInfo, plaintext: Vec<u8>) -> Result<()> {
        let cids = mixslice::encrypt_file(
            self.store.as_ref(),
            plaintext,
            &self.sidecar_path(path),
            &path.key,
            &path.iv,
        )?;
        let mut map = self.cids.write().unwrap_or_else(|e| e.into_inner());
        map.insert(
            path.path_id.clone(),
            cids.into_iter().map(|c| c.0).collect(),
        );
        Ok(())
    }

    // ------------------------------------------------------------ residency

    /// Make `path` resident. Returns whether a brand-new entry was
    /// created (as opposed to already-resident or re-hydrated).
    fn load(&self, path: &PathInfo, mtime: Option<i64>) -> Result<bool> {
        let stashed = {
            let mut state = self.lock_state();
            if state.files.contains_key(path) {
                return Ok(false);
            }
            state.evicted.remove(path)
        };

        match stashed {
            Some(mut entry) => {
                // Re-hydrate without losing the retained bookkeeping.
                match self.decrypt(path) {
                    Ok(plaintext) => {
                        entry.content = Some(Arc::new(FileByteContent::new(plaintext)));
                        self.insert_entry(path, entry)?;
                        Ok(false)
                    }
                    Err(e) => {
                        // Leave the entry where it was.
                        self.lock_state().evicted.insert(path.clone(), entry);
                        Err(e)
                    }
                }
            }
            None => {
                let plaintext = self.decrypt(path)?;
                let entry = CacheEntry::new(FileByteContent::new(plaintext), mtime);
                self.insert_entry(path, entry)?;
                Ok(true)
            }
        }
    }

    fn insert_entry(&self, path: &PathInfo, entry: CacheEntry) -> Result<()> {
        let size = entry.size();
        if size > self.memory_cap {
            return Err(CacheError::OutOfMemory);
        }
        self.free_space(size)?;

        let mut state = self.lock_state();
        if state.files.contains_key(path) {
            // A concurrent load won the race; keep the resident entry.
            return Ok(());
        }
        state.total_size += size;
        state.files.insert(path.clone(), entry);
        Ok(())
    }

    /// Evict by policy order until at least `target` bytes fit.
    fn free_space(&self, target: u64) -> Result<()> {
        loop {
            let candidate = {
                let state = self.lock_state();
                if self.memory_cap - state.total_size.min(self.memory_cap) >= target {
                    return Ok(());
                }
                let mut scored: Vec<(i64, PathInfo)> = state
                    .files
                    .iter()
                    .map(|(p, e)| (self.policy.score(e), p.clone()))
                    .collect();
                if scored.is_empty() {
                    return Ok(());
                }
                scored.sort_by(|a, b| a.0.cmp(&b.0));
                scored.swap_remove(0).1
            };
            self.evict(&candidate)?;
        }
    }

    /// Flush (persists if dirty), reclaim the plaintext, and park the
    /// bookkeeping record in the evicted bucket.
    fn evict(&self, path: &PathInfo) -> Result<()> {
        self.flush(path, false)?;

        let mut state = self.lock_state();
        if let Some(mut entry) = state.files.remove(path) {
            let size = entry.size();
            state.total_size -= size.min(state.total_size);
            entry.opens = entry.opens.saturating_sub(1);
            entry.content = None;
            debug!(path_id = %path.path_id, bytes = size, "evicted");
            state.evicted.insert(path.clone(), entry);
        }
        Ok(())
    }

    // ------------------------------------------------------------ opening and creating

    /// Ensure residency and take an open reference. `mtime` stamps a
    /// freshly loaded entry so it starts clean.
    pub fn open(&self, path: &PathInfo, mtime: i64) -> Result<()> {
        let freshly_created = self.load(path, Some(mtime))?;
        if !freshly_created {
            let mut state = self.lock_state();
            if let Some(entry) = state.files.get_mut(path) {
                entry.opens += 1;
            }
        }
        Ok(())
    }

    /// Install a brand-new empty entry (or re-hydrate an evicted one)
    /// and persist it immediately, so later lookups find a sidecar and a
    /// CID list on disk.
    pub fn create(&self, path: &PathInfo) -> Result<()> {
        let stashed = {
            let mut state = self.lock_state();
            if let Some(entry) = state.files.get_mut(path) {
                entry.opens += 1;
                return Ok(());
            }
            state.evicted.remove(path)
        };

        if let Some(mut entry) = stashed {
            return match self.decrypt(path) {
                Ok(plaintext) => {
                    entry.content = Some(Arc::new(FileByteContent::new(plaintext)));
                    entry.opens += 1;
                    self.insert_entry(path, entry)
                }
                Err(e) => {
                    self.lock_state().evicted.insert(path.clone(), entry);
                    Err(e)
                }
            };
        }

        {
            let mut state = self.lock_state();
            // Empty plaintext: no accounting change, nothing to evict.
            state
                .files
                .insert(path.clone(), CacheEntry::new(FileByteContent::new(Vec::new()), None));
        }
        self.flush(path, true)
    }

    // ------------------------------------------------------------ reading and writing

    /// Read up to `length` bytes at `offset`. `Ok(None)` when the object
    /// has no cached or persisted state at all.
    pub fn read_bytes(
        &self,
        path: &PathInfo,
        offset: u64,
        length: usize,
        mtime: Option<i64>,
    ) -> Result<Option<Vec<u8>>> {
        match self.load(path, mtime) {
            Ok(_) => {}
            Err(CacheError::Missing) => return Ok(None),
            Err(e) => return Err(e),
        }

        let content = {
            let state = self.lock_state();
            state.files.get(path).and_then(|e| e.content.clone())
        };
        Ok(content.map(|c| c.read_bytes(offset, length)))
    }

    /// Write `buf` at `offset`, growing on demand. Returns the bytes
    /// written and the new file size.
    pub fn write_bytes(
        &self,
        path: &PathInfo,
        buf: &[u8],
        offset: u64,
        mtime: Option<i64>,
    ) -> Result<(usize, u64)> {
        match self.load(path, mtime) {
            Ok(_) => {}
            Err(CacheError::Missing) => return Ok((0, 0)),
            Err(e) => return Err(e),
        }

        let content = {
            let state = self.lock_state();
            state.files.get(path).and_then(|e| e.content.clone())
        };
        let Some(content) = content else {
            return Ok((0, 0));
        };

        let outcome = content.write_bytes(buf, offset);

        let mut state = self.lock_state();
        if let Some(entry) = state.files.get_mut(path) {
            entry.modified = true;
            entry.mtime = unix_now();
            let delta = outcome.new_len as i64 - outcome.prev_len as i64;
            state.total_size = (state.total_size as i64 + delta).max(0) as u64;
        }
        Ok((outcome.written, outcome.new_len))
    }

    /// Resize the plaintext to `length` (zero-extending upward).
    pub fn truncate_bytes(&self, path: &PathInfo, length: u64, mtime: Option<i64>) -> Result<()> {
        match self.load(path, mtime) {
            Ok(_) => {}
            Err(CacheError::Missing) => return Ok(()),
            Err(e) => return Err(e),
        }

        let content = {
            let state = self.lock_state();
            state.files.get(path).and_then(|e| e.content.clone())
        };
        let Some(content) = content else {
            return Ok(());
        };

        let outcome = content.truncate(length);

        let mut state = self.lock_state();
        if let Some(entry) = state.files.get_mut(path) {
            entry.modified = true;
            entry.mtime = unix_now();
            let delta = outcome.new_len as i64 - outcome.prev_len as i64;
            state.total_size = (state.total_size as i64 + delta).max(0) as u64;
        }
        Ok(())
    }

    // ------------------------------------------------------------ closing

    /// Re-encrypt and persist if dirty (or `force`), then stamp the
    /// sidecar with the entry's access/modification times.
    pub fn flush(&self, path: &PathInfo, force: bool) -> Result<()> {
        let snapshot = {
            let state = self.lock_state();
            match state.files.get(path) {
                Some(e) => (
                    e.content.clone(),
                    e.flush_lock.clone(),
                    e.atime,
                    e.mtime,
                    e.modified,
                ),
                None => return Ok(()),
            }
        };
        let (content, flush_lock, atime, mtime, modified) = snapshot;

        if modified || force {
            if let Some(content) = content {
                let _serialize = flush_lock.lock().unwrap_or_else(|e| e.into_inner());
                self.encrypt(path, content.read_all())?;
                let mut state = self.lock_state();
                if let Some(entry) = state.files.get_mut(path) {
                    entry.modified = false;
                }
            }
        }

        let sidecar = self.sidecar_path(path);
        if sidecar.exists() {
            utimes(&sidecar, &TimeVal::new(atime, 0), &TimeVal::new(mtime, 0))
                .map_err(std::io::Error::from)?;
        }
        Ok(())
    }

    /// Drop one open reference; at zero (or `force`) the entry leaves
    /// the cache entirely. A dirty entry is persisted before its
    /// plaintext is dropped.
    pub fn release(&self, path: &PathInfo, force: bool) -> Result<()> {
        let dropping_dirty = {
            let state = self.lock_state();
            match state.files.get(path) {
                Some(e) => e.modified && (force || e.opens <= 1),
                None => false,
            }
        };
        if dropping_dirty {
            self.flush(path, false)?;
        }

        let mut state = self.lock_state();
        if let Some(entry) = state.evicted.get_mut(path) {
            entry.opens = entry.opens.saturating_sub(1);
            if entry.opens == 0 || force {
                state.evicted.remove(path);
            }
        } else if let Some(entry) = state.files.get_mut(path) {
            entry.opens = entry.opens.saturating_sub(1);
            if entry.opens == 0 || force {
                if let Some(entry) = state.files.remove(path) {
                    let size = entry.size();
                    state.total_size -= size.min(state.total_size);
                }
            }
        }
        Ok(())
    }

    /// Forget an unlinked object entirely: no flush, plaintext and
    /// bookkeeping both dropped.
    pub fn discard(&self, path: &PathInfo) {
        let mut state = self.lock_state();
        if let Some(entry) = state.files.remove(path) {
            let size = entry.size();
            state.total_size -= size.min(state.total_size);
        }
        state.evicted.remove(path);
    }

    /// The sidecar file for `path`, for callers that manage on-disk
    /// cleanup (unlink).
    pub fn sidecar_for(&self, path: &PathInfo) -> PathBuf {
        self.sidecar_path(path)
    }

    /// Flush every dirty resident entry (mount teardown).
    pub fn flush_all(&self) -> Result<()> {
        let paths: Vec<PathInfo> = {
            let state = self.lock_state();
            state
                .files
                .iter()
                .filter(|(_, e)| e.modified)
                .map(|(p, _)| p.clone())
                .collect()
        };
        for path in paths {
            self.flush(&path, false)?;
        }
        Ok(())
    }
}
