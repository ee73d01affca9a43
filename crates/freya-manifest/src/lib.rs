//! # freya-manifest
//!
//! The name→identity→attributes model of FreyaFS, plus its persistence.
//!
//! - [`PathInfo`]: stable per-object identity and key material.
//! - [`PathStructure`]: the trie mapping path strings to identities.
//! - [`Metadata`]: POSIX stat records keyed by path id.
//! - [`Manifest`]: the `{structure, metadata, cids}` document, sealed
//!   with a password-derived key into the `.freyafs` envelope file.
//!
//! Losing the manifest makes the on-disk ciphertext unreachable (it is
//! the only name→id map), so the envelope is written atomically.

mod metadata;
mod pathinfo;
pub mod persist;
mod structure;

pub use metadata::{Metadata, PathMetadata, PathType, DEFAULT_MODE};
pub use pathinfo::{PathInfo, KEY_LEN, PATH_ID_LEN};
pub use structure::{PathStructure, StructureError};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the sealed manifest file under the data root.
pub const MANIFEST_FILE_NAME: &str = ".freyafs";

/// Ordered CID lists keyed by path id, one CID per macroblock.
pub type CidMap = HashMap<String, Vec<String>>;

/// The persistent document: everything needed to re-mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub structure: PathStructure,
    pub metadata: Metadata,
    pub cids: CidMap,
}

impl Manifest {
    /// A fresh manifest: empty maps, a root directory entry in both the
    /// structure and the metadata.
    pub fn new() -> Self {
        let structure = PathStructure::new();
        let mut metadata = Metadata::new();
        let root = structure
            .get("/", false)
            .expect("fresh structure always has a root");
        metadata.add_dir(&root, DEFAULT_MODE);
        Self {
            structure,
            metadata,
            cids: CidMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_manifest_has_root_metadata() {
        let m = Manifest::new();
        let root = m.structure.get("/", true).unwrap();
        assert!(m.metadata.get(&root).unwrap().is_dir());
        assert!(m.cids.is_empty());
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let mut m = Manifest::new();
        let info = PathInfo::make();
        m.structure.add("/a/f", info.clone());
        m.metadata.add_file(&info, DEFAULT_MODE);
        m.cids
            .insert(info.path_id.clone(), vec!["cid-one".into(), "cid-two".into()]);

        let json = serde_json::to_string(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.structure.get("/a/f", true).unwrap(), info);
        assert_eq!(back.cids[&info.path_id], vec!["cid-one", "cid-two"]);
        assert_eq!(back.metadata.get(&info), m.metadata.get(&info));
    }

    #[test]
    fn manifest_json_has_the_three_top_level_keys() {
        let value = serde_json::to_value(Manifest::new()).unwrap();
        assert!(value.get("structure").is_some());
        assert!(value.get("metadata").is_some());
        assert!(value.get("cids").is_some());
    }
}
