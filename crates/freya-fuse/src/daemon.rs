//! Kernel attachment.
//!
//! Translates inode-addressed `fuser` callbacks into the path-keyed
//! operations of [`FreyaFs`](crate::FreyaFs), maintaining the inode↔path
//! table on the way. Only compiled in on Linux with the `fuse` feature;
//! elsewhere a stub reports the platform gap.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
        ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
        TimeOrNow,
    };
    use tracing::debug;

    use crate::core::{FreyaFs, FsError};
    use freya_manifest::PathMetadata;

    const TTL: Duration = Duration::from_secs(1);
    const BLOCK_SIZE: u32 = 4096;

    /// Bidirectional inode↔path map. Inode 1 is `/`.
    struct InodeTable {
        paths: HashMap<u64, String>,
        inos: HashMap<String, u64>,
        next: u64,
    }

    impl InodeTable {
        fn new() -> Self {
            let mut table = Self {
                paths: HashMap::new(),
                inos: HashMap::new(),
                next: 2,
            };
            table.paths.insert(1, "/".to_string());
            table.inos.insert("/".to_string(), 1);
            table
        }

        fn get_or_assign(&mut self, path: &str) -> u64 {
            if let Some(&ino) = self.inos.get(path) {
                return ino;
            }
            let ino = self.next;
            self.next += 1;
            self.paths.insert(ino, path.to_string());
            self.inos.insert(path.to_string(), ino);
            ino
        }

        fn path(&self, ino: u64) -> Option<String> {
            self.paths.get(&ino).cloned()
        }

        fn forget_path(&mut self, path: &str) {
            if let Some(ino) = self.inos.remove(path) {
                self.paths.remove(&ino);
            }
        }

        /// Rewrite every tracked path under `old` to live under `new`.
        fn rename_prefix(&mut self, old: &str, new: &str) {
            let affected: Vec<(String, u64)> = self
                .inos
                .iter()
                .filter(|(p, _)| {
                    p.as_str() == old || p.starts_with(&format!("{}/", old.trim_end_matches('/')))
                })
                .map(|(p, &i)| (p.clone(), i))
                .collect();
            for (path, ino) in affected {
                let renamed = format!("{}{}", new, &path[old.len()..]);
                self.inos.remove(&path);
                self.inos.insert(renamed.clone(), ino);
                self.paths.insert(ino, renamed);
            }
        }
    }

    fn child_path(parent: &str, name: &OsStr) -> Option<String> {
        let name = name.to_str()?;
        Some(if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        })
    }

    fn float_time(t: f64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs_f64(t.max(0.0))
    }

    fn to_attr(ino: u64, meta: &PathMetadata) -> FileAttr {
        let kind = if meta.st_mode & libc::S_IFLNK as u32 == libc::S_IFLNK as u32 {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino,
            size: meta.st_size,
            blocks: meta.st_size.div_ceil(BLOCK_SIZE as u64),
            atime: float_time(meta.st_atime),
            mtime: float_time(meta.st_mtime),
            ctime: float_time(meta.st_ctime),
            crtime: float_time(meta.st_ctime),
            kind,
            perm: (meta.st_mode & 0o7777) as u16,
            nlink: meta.st_nlink,
            uid: meta.st_uid,
            gid: meta.st_gid,
            rdev: 0,
            flags: 0,
            blksize: BLOCK_SIZE,
        }
    }

    /// A mounted session: the shared core plus the kernel's inode view.
    pub struct FreyaSession {
        fs: Arc<FreyaFs>,
        inodes: InodeTable,
    }

    impl FreyaSession {
        pub fn new(fs: Arc<FreyaFs>) -> Self {
            Self {
                fs,
                inodes: InodeTable::new(),
            }
        }

        /// Attach to the kernel and serve until unmounted.
        pub fn mount(self, mountpoint: &Path) -> anyhow::Result<()> {
            let opts = vec![
                MountOption::FSName("freyafs".to_string()),
                MountOption::DefaultPermissions,
            ];
            fuser::mount2(self, mountpoint, &opts)?;
            Ok(())
        }

        fn attr_for(&mut self, path: &str) -> Result<FileAttr, FsError> {
            let meta = self.fs.getattr(path)?;
            let ino = self.inodes.get_or_assign(path);
            Ok(to_attr(ino, &meta))
        }
    }

    impl Filesystem for FreyaSession {
        fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let Some(path) = self.inodes.path(parent).and_then(|p| child_path(&p, name))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.attr_for(&path) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.attr_for(&path) {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(e) => reply.error(e.errno()),
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn setattr(
            &mut self,
            _req: &Request,
            ino: u64,
            mode: Option<u32>,
            uid: Option<u32>,
            gid: Option<u32>,
            size: Option<u64>,
            atime: Option<TimeOrNow>,
            mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };

            let result = (|| -> Result<(), FsError> {
                if let Some(mode) = mode {
                    self.fs.chmod(&path, mode)?;
                }
                if uid.is_some() || gid.is_some() {
                    let current = self.fs.getattr(&path)?;
                    self.fs.chown(
                        &path,
                        uid.unwrap_or(current.st_uid),
                        gid.unwrap_or(current.st_gid),
                    )?;
                }
                if let Some(size) = size {
                    self.fs.truncate(&path, size)?;
                }
                if atime.is_some() || mtime.is_some() {
                    let current = self.fs.getattr(&path)?;
                    let resolve = |t: Option<TimeOrNow>, fallback: f64| match t {
                        Some(TimeOrNow::SpecificTime(st)) => st
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs_f64())
                            .unwrap_or(0.0),
                        Some(TimeOrNow::Now) => SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs_f64())
                            .unwrap_or(0.0),
                        None => fallback,
                    };
                    let at = resolve(atime, current.st_atime);
                    let mt = resolve(mtime, current.st_mtime);
                    self.fs.utimens(&path, Some((at, mt)))?;
                }
                Ok(())
            })();

            match result.and_then(|_| self.attr_for(&path)) {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.readlink(&path) {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn mknod(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            _umask: u32,
            _rdev: u32,
            reply: ReplyEntry,
        ) {
            let Some(path) = self.inodes.path(parent).and_then(|p| child_path(&p, name))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            match self
                .fs
                .mknod(&path, mode & 0o7777)
                .and_then(|_| self.attr_for(&path))
            {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn mkdir(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            let Some(path) = self.inodes.path(parent).and_then(|p| child_path(&p, name))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            match self
                .fs
                .mkdir(&path, mode & 0o7777)
                .and_then(|_| self.attr_for(&path))
            {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(path) = self.inodes.path(parent).and_then(|p| child_path(&p, name))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.unlink(&path) {
                Ok(()) => {
                    self.inodes.forget_path(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        }

        fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(path) = self.inodes.path(parent).and_then(|p| child_path(&p, name))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.rmdir(&path) {
                Ok(()) => {
                    self.inodes.forget_path(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        }

        fn symlink(
            &mut self,
            _req: &Request,
            parent: u64,
            link_name: &OsStr,
            target: &Path,
            reply: ReplyEntry,
        ) {
            let Some(path) = self
                .inodes
                .path(parent)
                .and_then(|p| child_path(&p, link_name))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            let target = target.to_string_lossy().to_string();
            match self
                .fs
                .symlink(&path, &target)
                .and_then(|_| self.attr_for(&path))
            {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn rename(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            _flags: u32,
            reply: ReplyEmpty,
        ) {
            let (Some(old), Some(new)) = (
                self.inodes.path(parent).and_then(|p| child_path(&p, name)),
                self.inodes
                    .path(newparent)
                    .and_then(|p| child_path(&p, newname)),
            ) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.rename(&old, &new) {
                Ok(()) => {
                    self.inodes.forget_path(&new);
                    self.inodes.rename_prefix(&old, &new);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        }

        fn link(
            &mut self,
            _req: &Request,
            ino: u64,
            newparent: u64,
            newname: &OsStr,
            reply: ReplyEntry,
        ) {
            let (Some(target), Some(path)) = (
                self.inodes.path(ino),
                self.inodes
                    .path(newparent)
                    .and_then(|p| child_path(&p, newname)),
            ) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self
                .fs
                .link(&path, &target)
                .and_then(|_| self.attr_for(&path))
            {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.open(&path) {
                Ok(()) => reply.opened(0, 0),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn create(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            _umask: u32,
            _flags: i32,
            reply: ReplyCreate,
        ) {
            let Some(path) = self.inodes.path(parent).and_then(|p| child_path(&p, name))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            match self
                .fs
                .create(&path, mode & 0o7777)
                .and_then(|_| self.attr_for(&path))
            {
                Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
                Err(e) => reply.error(e.errno()),
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn read(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.read(&path, offset.max(0) as u64, size as usize) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.errno()),
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn write(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.write(&path, data, offset.max(0) as u64) {
                Ok(written) => reply.written(written as u32),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn flush(&mut self, _req: &Request, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.flush(&path) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn release(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.release(&path) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.fsync(&path) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let names = match self.fs.readdir(&path) {
                Ok(names) => names,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };
            debug!(%path, entries = names.len(), "readdir");

            if offset == 0 {
                if reply.add(ino, 1, FileType::Directory, ".") {
                    reply.ok();
                    return;
                }
                if reply.add(1, 2, FileType::Directory, "..") {
                    reply.ok();
                    return;
                }
            }

            let skip = if offset > 2 { (offset - 2) as usize } else { 0 };
            for (i, name) in names.iter().enumerate().skip(skip) {
                let Some(child) = child_path(&path, OsStr::new(name)) else {
                    continue;
                };
                let (child_ino, kind) = match self.attr_for(&child) {
                    Ok(attr) => (attr.ino, attr.kind),
                    Err(_) => continue,
                };
                if reply.add(child_ino, (i + 3) as i64, kind, name) {
                    break;
                }
            }
            reply.ok();
        }

        fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.statfs(&path) {
                Ok(s) => reply.statfs(
                    s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
                ),
                Err(e) => reply.error(e.errno()),
            }
        }

        fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
            let Some(path) = self.inodes.path(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.fs.access(&path) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        }
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use std::path::Path;
    use std::sync::Arc;

    use crate::core::FreyaFs;

    /// Stub session for platforms without kernel FUSE support.
    pub struct FreyaSession {
        _fs: Arc<FreyaFs>,
    }

    impl FreyaSession {
        pub fn new(fs: Arc<FreyaFs>) -> Self {
            Self { _fs: fs }
        }

        pub fn mount(self, _mountpoint: &Path) -> anyhow::Result<()> {
            #[cfg(not(target_os = "linux"))]
            anyhow::bail!(
                "kernel mounts are only available on Linux (current: {})",
                std::env::consts::OS
            );
            #[cfg(target_os = "linux")]
            anyhow::bail!("kernel mounts are disabled; rebuild with --features fuse")
        }
    }
}

pub use imp::FreyaSession;
