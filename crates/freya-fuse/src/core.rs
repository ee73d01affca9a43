//! The FreyaFS core: every mount operation as a path-keyed method.
//!
//! One value owns all mount-global state: the structure and metadata
//! under a single `RwLock`, the CID map shared with the cache, and the
//! cache itself. Lookups take the read lock, namespace mutations the
//! write lock; neither is ever held across a codec or block-store call.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info};

use freya_cache::{Cache, CacheError, EvictionPolicy};
use freya_manifest::persist::{self, PersistError, SEAL_KEY_LEN};
use freya_manifest::{
    CidMap, Manifest, Metadata, PathInfo, PathMetadata, PathStructure, StructureError,
    MANIFEST_FILE_NAME,
};
use freya_store::BlockStore;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    AccessDenied,

    #[error("too many levels of symbolic links")]
    Loop,

    #[error("directory not empty")]
    NotEmpty,

    #[error("out of memory")]
    OutOfMemory,

    #[error(transparent)]
    Cache(CacheError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The errno the kernel adapter reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AccessDenied => libc::EACCES,
            FsError::Loop => libc::ELOOP,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::Cache(_) | FsError::Persist(_) | FsError::Io(_) => libc::EIO,
        }
    }
}

impl From<StructureError> for FsError {
    fn from(e: StructureError) -> Self {
        match e {
            StructureError::NotFound => FsError::NotFound,
            StructureError::TooManyLinks => FsError::Loop,
        }
    }
}

impl From<CacheError> for FsError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::OutOfMemory => FsError::OutOfMemory,
            CacheError::Missing => FsError::NotFound,
            other => FsError::Cache(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Filesystem-level statistics for `statfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

struct Shared {
    structure: PathStructure,
    metadata: Metadata,
}

/// The mounted file system: one value constructed at mount, torn down
/// at unmount.
pub struct FreyaFs {
    root: PathBuf,
    manifest_path: PathBuf,
    seal_key: [u8; SEAL_KEY_LEN],
    shared: RwLock<Shared>,
    cids: Arc<RwLock<CidMap>>,
    cache: Cache,
}

impl std::fmt::Debug for FreyaFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreyaFs")
            .field("root", &self.root)
            .field("manifest_path", &self.manifest_path)
            .finish_non_exhaustive()
    }
}

impl FreyaFs {
    /// Unseal (or initialize) the manifest under `root` and assemble the
    /// cache on top of `store`. Fails with [`PersistError::Auth`] inside
    /// [`FsError::Persist`] when the password does not match an existing
    /// manifest.
    pub fn new(
        root: impl Into<PathBuf>,
        store: Arc<dyn BlockStore>,
        password: &str,
        memory_cap: u64,
        policy: EvictionPolicy,
    ) -> Result<Self> {
        let root = root.into();
        let manifest_path = root.join(MANIFEST_FILE_NAME);
        let seal_key = persist::derive_key(password)?;

        let manifest = match persist::load(&seal_key, &manifest_path)? {
            Some(m) => {
                debug!(path = %manifest_path.display(), "manifest unsealed");
                m
            }
            None => {
                info!(root = %root.display(), "no manifest found, initializing a fresh store");
                Manifest::new()
            }
        };

        let cids = Arc::new(RwLock::new(manifest.cids));
        let cache = Cache::new(root.clone(), store, cids.clone(), memory_cap, policy);

        Ok(Self {
            root,
            manifest_path,
            seal_key,
            shared: RwLock::new(Shared {
                structure: manifest.structure,
                metadata: manifest.metadata,
            }),
            cids,
            cache,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Seal the current `{structure, metadata, cids}` back into the
    /// manifest file. Called after a clean unmount.
    pub fn dump(&self) -> Result<()> {
        self.cache.flush_all().map_err(FsError::from)?;
        let manifest = {
            let shared = self.read_shared();
            Manifest {
                structure: shared.structure.clone(),
                metadata: shared.metadata.clone(),
                cids: self.cids.read().unwrap_or_else(|e| e.into_inner()).clone(),
            }
        };
        persist::save(&self.seal_key, &self.manifest_path, &manifest)?;
        Ok(())
    }

    fn read_shared(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_shared(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Identity of `path` following symlinks, plus the entry mtime used
    /// to stamp cache loads.
    fn file_info(&self, path: &str) -> Result<(PathInfo, i64)> {
        let shared = self.read_shared();
        let info = shared.structure.get(path, true)?;
        let mtime = shared
            .metadata
            .get(&info)
            .map(|m| m.st_mtime as i64)
            .ok_or(FsError::NotFound)?;
        Ok((info, mtime))
    }

    // ----------------------------------------------------- namespace operations

    pub fn access(&self, path: &str) -> Result<()> {
        if !self.read_shared().structure.contains(path) {
            return Err(FsError::AccessDenied);
        }
        Ok(())
    }

    pub fn getattr(&self, path: &str) -> Result<PathMetadata> {
        let shared = self.read_shared();
        if !shared.structure.contains(path) {
            return Err(FsError::NotFound);
        }
        let info = shared.structure.get(path, false)?;
        shared
            .metadata
            .get(&info)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let mut shared = self.write_shared();
        let info = shared.structure.get(path, true)?;
        shared
            .metadata
            .get_mut(&info)
            .ok_or(FsError::NotFound)?
            .chmod(mode);
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let mut shared = self.write_shared();
        let info = shared.structure.get(path, true)?;
        shared
            .metadata
            .get_mut(&info)
            .ok_or(FsError::NotFound)?
            .chown(uid, gid);
        Ok(())
    }

    pub fn utimens(&self, path: &str, times: Option<(f64, f64)>) -> Result<()> {
        let mut shared = self.write_shared();
        let info = shared.structure.get(path, true)?;
        shared
            .metadata
            .get_mut(&info)
            .ok_or(FsError::NotFound)?
            .utimens(times);
        Ok(())
    }

    /// Names of the entries under `path`, without `.`/`..`.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.read_shared().structure.contents(path)?)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let shared = self.read_shared();
        let info = shared.structure.get(path, false)?;
        let target = info.link_to_path.ok_or(FsError::NotFound)?;
        if target.starts_with('/') {
            // Absolute targets are stored as virtual paths; hand the
            // kernel something relative to the data root instead.
            Ok(relpath(&target, &self.root.to_string_lossy()))
        } else {
            Ok(target)
        }
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let info = PathInfo::make_only_id();
        let mut shared = self.write_shared();
        shared.metadata.add_dir(&info, mode);
        shared.structure.add(path, info);
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let mut shared = self.write_shared();
        let info = shared.structure.get(path, true)?;
        if !shared.structure.contents(path)?.is_empty() {
            return Err(FsError::NotEmpty);
        }
        shared.structure.delete(path);
        shared.metadata.remove(&info);
        Ok(())
    }

    pub fn statfs(&self, _path: &str) -> Result<StatFs> {
        let vfs = nix::sys::statvfs::statvfs(&self.root).map_err(std::io::Error::from)?;
        Ok(StatFs {
            blocks: vfs.blocks(),
            bfree: vfs.blocks_free(),
            bavail: vfs.blocks_available(),
            files: vfs.files(),
            ffree: vfs.files_free(),
            bsize: vfs.block_size() as u32,
            namelen: vfs.name_max() as u32,
            frsize: vfs.fragment_size() as u32,
        })
    }

    /// Remove one name. The object itself (metadata, sidecar, CID list)
    /// goes away only when its last name does.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let info = {
            let mut shared = self.write_shared();
            let info = shared.structure.get(path, false)?;
            shared.structure.delete(path);

            let Some(meta) = shared.metadata.get_mut(&info) else {
                return Ok(());
            };
            if meta.is_dir() {
                shared.metadata.remove(&info);
                return Ok(());
            }

            meta.dec_nlink();
            if meta.nlink() > 0 {
                debug!(path_id = %info.path_id, nlink = meta.nlink(), "unlinked one name");
                return Ok(());
            }
            shared.metadata.remove(&info);
            info
        };

        // Last name gone: drop the plaintext, the CID list and the
        // kept sidecar.
        self.cache.discard(&info);
        self.cids
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&info.path_id);
        match std::fs::remove_file(self.cache.sidecar_for(&info)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(path_id = %info.path_id, "removed object");
        Ok(())
    }

    /// Create a symbolic link at `name` pointing to `target`. The
    /// target string is resolved in memory through the structure, and
    /// also persisted as the link's encrypted file content.
    pub fn symlink(&self, name: &str, target: &str) -> Result<()> {
        let info = PathInfo::make_symlink(target);
        {
            let mut shared = self.write_shared();
            shared.metadata.add_soft_link(&info, 0o777);
            shared.structure.add(name, info.clone());
        }

        self.cache.create(&info)?;
        let (_, size) = self
            .cache
            .write_bytes(&info, target.as_bytes(), 0, None)?;
        {
            let mut shared = self.write_shared();
            if let Some(meta) = shared.metadata.get_mut(&info) {
                meta.set_size(size);
            }
        }
        self.cache.flush(&info, true)?;
        self.cache.release(&info, false)?;
        Ok(())
    }

    /// Relocate a subtree. Sidecars and CID lists are keyed by id, not
    /// by name, so nothing on disk moves.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.write_shared().structure.rename(old, new);
        Ok(())
    }

    /// Install a second name for the object at `target`.
    pub fn link(&self, name: &str, target: &str) -> Result<()> {
        let mut shared = self.write_shared();
        let info = shared.structure.add_hard_link(name, target)?;
        shared
            .metadata
            .get_mut(&info)
            .ok_or(FsError::NotFound)?
            .inc_nlink();
        Ok(())
    }

    // ----------------------------------------------------- file operations

    pub fn open(&self, path: &str) -> Result<()> {
        if !self.read_shared().structure.contains(path) {
            return Err(FsError::NotFound);
        }
        let (info, mtime) = self.file_info(path)?;
        if !info.has_key_material() {
            // Directories and id-only handles have nothing to decrypt.
            return Ok(());
        }
        self.cache.open(&info, mtime)?;
        Ok(())
    }

    pub fn create(&self, path: &str, mode: u32) -> Result<()> {
        let info = PathInfo::make();
        {
            let mut shared = self.write_shared();
            shared.metadata.add_file(&info, mode);
            shared.structure.add(path, info.clone());
        }
        self.cache.create(&info)?;
        Ok(())
    }

    /// Create a file node without leaving it open.
    pub fn mknod(&self, path: &str, mode: u32) -> Result<()> {
        self.create(path, mode)?;
        let (info, _) = self.file_info(path)?;
        self.cache.release(&info, false)?;
        Ok(())
    }

    pub fn read(&self, path: &str, offset: u64, length: usize) -> Result<Vec<u8>> {
        let (info, mtime) = self.file_info(path)?;
        self.cache
            .read_bytes(&info, offset, length, Some(mtime))?
            .ok_or(FsError::NotFound)
    }

    pub fn write(&self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        let (info, mtime) = self.file_info(path)?;
        let (written, size) = self.cache.write_bytes(&info, buf, offset, Some(mtime))?;
        let mut shared = self.write_shared();
        if let Some(meta) = shared.metadata.get_mut(&info) {
            meta.set_size(size);
        }
        Ok(written)
    }

    pub fn truncate(&self, path: &str, length: u64) -> Result<()> {
        let (info, mtime) = self.file_info(path)?;
        self.cache.truncate_bytes(&info, length, Some(mtime))?;
        let mut shared = self.write_shared();
        if let Some(meta) = shared.metadata.get_mut(&info) {
            meta.set_size(length);
        }
        Ok(())
    }

    pub fn flush(&self, path: &str) -> Result<()> {
        let (info, _) = self.file_info(path)?;
        self.cache.flush(&info, true)?;
        Ok(())
    }

    pub fn release(&self, path: &str) -> Result<()> {
        let (info, _) = self.file_info(path)?;
        self.cache.release(&info, false)?;
        Ok(())
    }

    pub fn fsync(&self, path: &str) -> Result<()> {
        self.flush(path)
    }

    // ----------------------------------------------------- diagnostics

    /// Human-readable per-file and manifest statistics, for the
    /// `--dump-metadata` flag.
    pub fn metadata_report(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let shared = self.read_shared();
        let cids = self.cids.read().unwrap_or_else(|e| e.into_inner());

        out.push_str("[i] Files\n");
        for (path_id, cid_list) in cids.iter() {
            let handle = PathInfo::for_id(path_id.clone());
            let size = shared
                .metadata
                .get(&handle)
                .map(|m| m.st_size)
                .unwrap_or(0);
            let on_disk = std::fs::metadata(self.root.join(path_id))
                .map(|m| m.len())
                .unwrap_or(0);
            let _ = writeln!(out, "> ID:                       {path_id}");
            let _ = writeln!(out, "  Size:                     {size}");
            let _ = writeln!(out, "  On disk size (encrypted): {on_disk}");
            let _ = writeln!(out, "  Number of CIDs:           {}", cid_list.len());
        }

        let manifest = Manifest {
            structure: shared.structure.clone(),
            metadata: shared.metadata.clone(),
            cids: cids.clone(),
        };
        let json_len = serde_json::to_vec(&manifest).map(|v| v.len()).unwrap_or(0);
        let envelope_len = std::fs::metadata(&self.manifest_path)
            .map(|m| m.len())
            .unwrap_or(0);
        out.push_str("[i] FreyaFS metadata\n");
        let _ = writeln!(out, "> In memory size (JSON):    {json_len}");
        let _ = writeln!(out, "> On disk size (encrypted): {envelope_len}");
        out
    }
}

/// Lexical relative path from `base` to `target` (both absolute).
fn relpath(target: &str, base: &str) -> String {
    let t: Vec<&str> = target.split('/').filter(|c| !c.is_empty()).collect();
    let b: Vec<&str> = base.split('/').filter(|c| !c.is_empty()).collect();

    let common = t.iter().zip(b.iter()).take_while(|(a, b)| a == b).count();
    let mut parts: Vec<&str> = Vec::new();
    for _ in common..b.len() {
        parts.push("..");
    }
    parts.extend(&t[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relpath_walks_up_and_down() {
        assert_eq!(relpath("/data/file", "/data"), "file");
        assert_eq!(relpath("/other/file", "/data"), "../other/file");
        assert_eq!(relpath("/data", "/data"), ".");
    }
}
