//! POSIX stat attributes keyed by path id.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::pathinfo::PathInfo;

/// RWX for the owner, RX for everyone else.
pub const DEFAULT_MODE: u32 = 0o755;

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// What kind of object a metadata record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    File,
    Dir,
    Symlink,
}

impl PathType {
    /// The type bits ORed into `st_mode`. Symlinks are marked as regular
    /// files too, because their target is persisted as file content.
    fn stat_flags(self) -> u32 {
        match self {
            PathType::File => libc::S_IFREG as u32,
            PathType::Dir => libc::S_IFDIR as u32,
            PathType::Symlink => (libc::S_IFREG | libc::S_IFLNK) as u32,
        }
    }
}

/// One POSIX stat record, serialized with the `st_*` keys of the
/// manifest schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMetadata {
    pub st_mode: u32,
    pub st_size: u64,
    pub st_nlink: u32,
    pub st_atime: f64,
    pub st_ctime: f64,
    pub st_mtime: f64,
    pub st_uid: u32,
    pub st_gid: u32,
}

impl PathMetadata {
    /// A fresh record: timestamps now, ownership from the process,
    /// nlink 2 for directories and 1 otherwise.
    pub fn new(path_type: PathType, mode: u32) -> Self {
        let now = now();
        Self {
            st_mode: path_type.stat_flags() | mode,
            st_size: 0,
            st_nlink: if path_type == PathType::Dir { 2 } else { 1 },
            st_atime: now,
            st_ctime: now,
            st_mtime: now,
            st_uid: nix::unistd::getuid().as_raw(),
            st_gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn mode_has(&self, flag: u32) -> bool {
        self.st_mode & flag == flag
    }

    pub fn is_file(&self) -> bool {
        self.mode_has(libc::S_IFREG as u32)
    }

    pub fn is_dir(&self) -> bool {
        self.mode_has(libc::S_IFDIR as u32)
    }

    pub fn chmod(&mut self, mode: u32) {
        self.st_mode = mode;
    }

    pub fn chown(&mut self, uid: u32, gid: u32) {
        self.st_uid = uid;
        self.st_gid = gid;
    }

    /// Set access/modification times; `None` means "now" for both.
    pub fn utimens(&mut self, times: Option<(f64, f64)>) {
        let (atime, mtime) = times.unwrap_or_else(|| {
            let now = now();
            (now, now)
        });
        self.st_atime = atime;
        self.st_mtime = mtime;
    }

    pub fn set_size(&mut self, size: u64) {
        self.st_size = size;
    }

    pub fn nlink(&self) -> u32 {
        self.st_nlink
    }

    pub fn inc_nlink(&mut self) {
        self.st_nlink += 1;
    }

    pub fn dec_nlink(&mut self) {
        self.st_nlink = self.st_nlink.saturating_sub(1);
    }
}

/// The map from path id to stat record.
///
/// Invariant: every `PathInfo` reachable from the structure has an entry
/// here, and `st_nlink` counts the distinct paths referencing that id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    data: HashMap<String, PathMetadata>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &PathInfo) -> bool {
        self.data.contains_key(&path.path_id)
    }

    pub fn get(&self, path: &PathInfo) -> Option<&PathMetadata> {
        self.data.get(&path.path_id)
    }

    pub fn get_mut(&mut self, path: &PathInfo) -> Option<&mut PathMetadata> {
        self.data.get_mut(&path.path_id)
    }

    pub fn remove(&mut self, path: &PathInfo) -> Option<PathMetadata> {
        self.data.remove(&path.path_id)
    }

    pub fn add_file(&mut self, path: &PathInfo, mode: u32) {
        self.data
            .insert(path.path_id.clone(), PathMetadata::new(PathType::File, mode));
    }

    pub fn add_dir(&mut self, path: &PathInfo, mode: u32) {
        self.data
            .insert(path.path_id.clone(), PathMetadata::new(PathType::Dir, mode));
    }

    pub fn add_soft_link(&mut self, path: &PathInfo, mode: u32) {
        self.data.insert(
            path.path_id.clone(),
            PathMetadata::new(PathType::Symlink, mode),
        );
    }
}
