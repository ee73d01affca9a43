//! End-to-end scenarios over the core filesystem value.
//!
//! These exercise full mount → operate → unmount → re-mount cycles with
//! a tempdir data root and the local disk block store; no kernel mount
//! is involved.

use std::sync::Arc;

use freya_cache::EvictionPolicy;
use freya_fuse::{FreyaFs, FsError};
use freya_manifest::persist::PersistError;
use freya_store::DiskBlockStore;
use tempfile::TempDir;

fn try_mount(dir: &TempDir, password: &str, cap: u64) -> Result<FreyaFs, FsError> {
    let store = Arc::new(DiskBlockStore::new(dir.path().join("blocks")).unwrap());
    FreyaFs::new(
        dir.path().to_path_buf(),
        store,
        password,
        cap,
        EvictionPolicy::Lru,
    )
}

fn mount(dir: &TempDir, password: &str) -> FreyaFs {
    try_mount(dir, password, u64::MAX).unwrap()
}

/// Sidecar files sit directly under the data root, named by their
/// 10-char path id.
fn sidecar_names(dir: &TempDir) -> Vec<String> {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.len() == 10 && n.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()))
        .collect()
}

#[test]
fn write_flush_remount_read() {
    let dir = TempDir::new().unwrap();
    {
        let fs = mount(&dir, "swordfish");
        fs.mkdir("/a", 0o755).unwrap();
        fs.create("/a/f", 0o644).unwrap();
        assert_eq!(fs.write("/a/f", b"hello", 0).unwrap(), 5);
        fs.flush("/a/f").unwrap();
        fs.release("/a/f").unwrap();
        fs.dump().unwrap();
    }

    let fs = mount(&dir, "swordfish");
    fs.open("/a/f").unwrap();
    assert_eq!(fs.read("/a/f", 0, 64).unwrap(), b"hello");
    assert_eq!(fs.getattr("/a/f").unwrap().st_size, 5);
}

#[test]
fn empty_file_survives_remount() {
    let dir = TempDir::new().unwrap();
    {
        let fs = mount(&dir, "pw");
        fs.create("/e", 0o644).unwrap();
        fs.flush("/e").unwrap();
        fs.release("/e").unwrap();
        fs.dump().unwrap();
    }

    let fs = mount(&dir, "pw");
    fs.open("/e").unwrap();
    assert_eq!(fs.read("/e", 0, 64).unwrap(), b"");
    assert_eq!(fs.getattr("/e").unwrap().st_size, 0);

    // One all-padding macroblock behind the scenes.
    let names = sidecar_names(&dir);
    assert_eq!(names.len(), 1);
    let sidecar = dir.path().join(&names[0]);
    assert_eq!(std::fs::metadata(sidecar).unwrap().len(), 1024);
}

#[test]
fn hard_links_share_one_object() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir, "pw");

    fs.create("/x", 0o644).unwrap();
    fs.write("/x", b"abc", 0).unwrap();
    fs.flush("/x").unwrap();
    fs.release("/x").unwrap();

    fs.link("/y", "/x").unwrap();
    assert_eq!(fs.getattr("/x").unwrap().st_nlink, 2);
    assert_eq!(fs.getattr("/y").unwrap().st_nlink, 2);

    fs.unlink("/x").unwrap();
    assert!(matches!(fs.getattr("/x"), Err(FsError::NotFound)));
    assert_eq!(fs.getattr("/y").unwrap().st_nlink, 1);
    assert_eq!(sidecar_names(&dir).len(), 1);

    fs.open("/y").unwrap();
    assert_eq!(fs.read("/y", 0, 16).unwrap(), b"abc");
    fs.release("/y").unwrap();

    fs.unlink("/y").unwrap();
    assert!(sidecar_names(&dir).is_empty());
}

#[test]
fn symlinks_read_through_to_their_target() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir, "pw");

    fs.create("/t", 0o644).unwrap();
    fs.write("/t", b"data", 0).unwrap();
    fs.flush("/t").unwrap();
    fs.release("/t").unwrap();

    fs.symlink("/s", "/t").unwrap();
    fs.open("/s").unwrap();
    assert_eq!(fs.read("/s", 0, 64).unwrap(), b"data");

    // The link target is also persisted as the link's own content.
    assert_eq!(fs.getattr("/s").unwrap().st_size, 2);

    // Relative targets come back from readlink verbatim.
    fs.symlink("/u", "t").unwrap();
    assert_eq!(fs.readlink("/u").unwrap(), "t");
    fs.open("/u").unwrap();
    assert_eq!(fs.read("/u", 0, 64).unwrap(), b"data");
}

#[test]
fn rename_moves_names_not_sidecars() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir, "pw");

    fs.mkdir("/d", 0o755).unwrap();
    fs.create("/d/a", 0o644).unwrap();
    fs.write("/d/a", b"v", 0).unwrap();
    fs.flush("/d/a").unwrap();
    fs.release("/d/a").unwrap();

    let before = sidecar_names(&dir);
    fs.rename("/d/a", "/d/b").unwrap();
    assert_eq!(sidecar_names(&dir), before);

    fs.open("/d/b").unwrap();
    assert_eq!(fs.read("/d/b", 0, 8).unwrap(), b"v");
    assert!(matches!(fs.getattr("/d/a"), Err(FsError::NotFound)));
}

#[test]
fn wrong_password_aborts_and_leaves_disk_untouched() {
    let dir = TempDir::new().unwrap();
    {
        let fs = mount(&dir, "right horse battery");
        fs.create("/f", 0o644).unwrap();
        fs.write("/f", b"staple", 0).unwrap();
        fs.flush("/f").unwrap();
        fs.release("/f").unwrap();
        fs.dump().unwrap();
    }

    match try_mount(&dir, "wrong horse", u64::MAX) {
        Err(FsError::Persist(PersistError::Auth)) => {}
        other => panic!("expected an auth failure, got {other:?}"),
    }

    // The failed attempt changed nothing on disk.
    let fs = mount(&dir, "right horse battery");
    fs.open("/f").unwrap();
    assert_eq!(fs.read("/f", 0, 64).unwrap(), b"staple");
}

#[test]
fn write_beyond_eof_and_truncate_extend_zero_fill() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir, "pw");

    fs.create("/gap", 0o644).unwrap();
    fs.write("/gap", b"end", 5).unwrap();
    assert_eq!(fs.getattr("/gap").unwrap().st_size, 8);
    assert_eq!(fs.read("/gap", 0, 8).unwrap(), b"\0\0\0\0\0end");

    fs.truncate("/gap", 12).unwrap();
    assert_eq!(fs.getattr("/gap").unwrap().st_size, 12);
    assert_eq!(fs.read("/gap", 8, 8).unwrap(), b"\0\0\0\0");
}

#[test]
fn readdir_and_rmdir_behave() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir, "pw");

    fs.mkdir("/d", 0o755).unwrap();
    fs.create("/d/one", 0o644).unwrap();
    fs.release("/d/one").unwrap();

    let mut names = fs.readdir("/d").unwrap();
    names.sort();
    assert_eq!(names, vec!["one"]);

    assert!(matches!(fs.rmdir("/d"), Err(FsError::NotEmpty)));
    fs.unlink("/d/one").unwrap();
    fs.rmdir("/d").unwrap();
    assert!(matches!(fs.getattr("/d"), Err(FsError::NotFound)));
}

#[test]
fn unmount_dump_persists_unflushed_writes() {
    let dir = TempDir::new().unwrap();
    {
        let fs = mount(&dir, "pw");
        fs.create("/lazy", 0o644).unwrap();
        fs.write("/lazy", b"not flushed by hand", 0).unwrap();
        // No explicit flush: dump() sweeps dirty entries.
        fs.dump().unwrap();
    }

    let fs = mount(&dir, "pw");
    fs.open("/lazy").unwrap();
    assert_eq!(fs.read("/lazy", 0, 64).unwrap(), b"not flushed by hand");
}

#[test]
fn access_mirrors_structure_membership() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir, "pw");
    assert!(fs.access("/").is_ok());
    assert!(matches!(fs.access("/ghost"), Err(FsError::AccessDenied)));
}
