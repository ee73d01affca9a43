//! Stable per-object identity.
//!
//! A `PathInfo` names a file-system object independently of where it sits
//! in the tree: renames move it, hard links alias it, and the sidecar on
//! disk is named after it. Regular files carry per-object AES key
//! material; directories and id-only handles carry none.

use std::hash::{Hash, Hasher};

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// Length of a path id: 10 chars over `[a-z0-9]`.
pub const PATH_ID_LEN: usize = 10;

/// Per-object key and IV length in bytes.
pub const KEY_LEN: usize = 16;

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .take(PATH_ID_LEN)
        .collect()
}

fn random_bytes() -> Vec<u8> {
    let mut buf = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Identity plus key material for one file-system object.
///
/// Equality and hashing go by `path_id` alone: two paths resolving to the
/// same id are hard links to one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathInfo {
    pub path_id: String,
    pub link_to_path: Option<String>,
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
}

impl PathInfo {
    /// A regular file: fresh id plus fresh key material.
    pub fn make() -> Self {
        Self {
            path_id: random_id(),
            link_to_path: None,
            key: random_bytes(),
            iv: random_bytes(),
        }
    }

    /// A symbolic link to `target`. Carries key material because the
    /// link target is also persisted as encrypted file content.
    pub fn make_symlink(target: impl Into<String>) -> Self {
        Self {
            link_to_path: Some(target.into()),
            ..Self::make()
        }
    }

    /// A directory or other id-only handle: no key material.
    pub fn make_only_id() -> Self {
        Self {
            path_id: random_id(),
            link_to_path: None,
            key: Vec::new(),
            iv: Vec::new(),
        }
    }

    /// A lookup handle for an existing id.
    pub fn for_id(path_id: impl Into<String>) -> Self {
        Self {
            path_id: path_id.into(),
            link_to_path: None,
            key: Vec::new(),
            iv: Vec::new(),
        }
    }

    /// Whether this object has per-file key material (and therefore a
    /// sidecar and CID list). Directories and id-only handles do not.
    pub fn has_key_material(&self) -> bool {
        !self.key.is_empty() && !self.iv.is_empty()
    }

    pub fn is_symlink(&self) -> bool {
        self.link_to_path.is_some()
    }
}

impl PartialEq for PathInfo {
    fn eq(&self, other: &Self) -> bool {
        self.path_id == other.path_id
    }
}

impl Eq for PathInfo {}

impl Hash for PathInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path_id.hash(state);
    }
}

/// Base64 (standard alphabet) encoding for the key/iv fields, matching
/// the manifest schema.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
