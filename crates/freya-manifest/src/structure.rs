//! The name→identity map: a trie keyed by path components.
//!
//! The root node is valueless; its single interesting child is keyed by
//! the literal `"/"`, under which the mounted tree hangs. Intermediate
//! nodes created implicitly by an insert carry no value. Hard links
//! install a `PathInfo` with the same id at a second path; since identity
//! is the id, the copies are interchangeable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pathinfo::PathInfo;

/// Hop limit when chasing symlink chains.
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StructureError {
    #[error("path not found")]
    NotFound,

    #[error("too many levels of symbolic links")]
    TooManyLinks,
}

/// One trie node: an optional object identity plus named children.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub value: Option<PathInfo>,
    pub children: BTreeMap<String, Node>,
}

impl Node {
    fn new(value: Option<PathInfo>) -> Self {
        Self {
            value,
            children: BTreeMap::new(),
        }
    }
}

/// Split a path string into trie keys. Absolute paths start with the
/// literal `"/"` component, matching the root child key.
fn parts(path: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if path.starts_with('/') {
        keys.push("/".to_string());
    }
    for component in path.split('/') {
        if !component.is_empty() {
            keys.push(component.to_string());
        }
    }
    keys
}

/// Lexically resolve `.` and `..` in an absolute path.
fn normalize(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    format!("/{}", stack.join("/"))
}

/// Parent of an absolute path (`/` is its own parent).
fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// The directory tree keyed by path components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathStructure {
    root: Node,
}

impl Default for PathStructure {
    fn default() -> Self {
        Self::new()
    }
}

impl PathStructure {
    /// A fresh structure with an id-only handle installed at `/`.
    pub fn new() -> Self {
        let mut root = Node::new(None);
        root.children
            .insert("/".to_string(), Node::new(Some(PathInfo::make_only_id())));
        Self { root }
    }

    fn node(&self, keys: &[String]) -> Option<&Node> {
        let mut node = &self.root;
        for key in keys {
            node = node.children.get(key)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, keys: &[String]) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for key in keys {
            node = node.children.get_mut(key)?;
        }
        Some(node)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.node(&parts(path)).is_some()
    }

    /// The object at `path` without following a symlink at the leaf.
    pub fn get_no_follow(&self, path: &str) -> Result<PathInfo, StructureError> {
        self.node(&parts(path))
            .and_then(|n| n.value.clone())
            .ok_or(StructureError::NotFound)
    }

    /// The object at `path`, chasing symlink targets. Each hop re-anchors
    /// the lookup at the link's parent directory; chains longer than the
    /// hop limit fail.
    pub fn get(&self, path: &str, follow_symlinks: bool) -> Result<PathInfo, StructureError> {
        let mut current = path.to_string();
        let mut item = self.get_no_follow(&current)?;

        if !follow_symlinks {
            return Ok(item);
        }

        let mut hops = 0;
        while let Some(target) = item.link_to_path.clone() {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(StructureError::TooManyLinks);
            }
            current = if target.starts_with('/') {
                normalize(&target)
            } else {
                normalize(&format!("{}/{}", parent(&current), target))
            };
            item = self.get_no_follow(&current)?;
        }

        Ok(item)
    }

    /// Names of the immediate children of `path`.
    pub fn contents(&self, path: &str) -> Result<Vec<String>, StructureError> {
        let node = self.node(&parts(path)).ok_or(StructureError::NotFound)?;
        Ok(node.children.keys().cloned().collect())
    }

    /// Install `info` at `path`, creating valueless intermediate nodes
    /// along the way. Idempotent along the prefix; replaces any node
    /// already at the leaf.
    pub fn add(&mut self, path: &str, info: PathInfo) {
        self.insert_node(&parts(path), Node::new(Some(info)));
    }

    fn insert_node(&mut self, keys: &[String], new_node: Node) {
        debug_assert!(!keys.is_empty());
        let mut node = &mut self.root;
        let last = keys.len() - 1;
        for (i, key) in keys.iter().enumerate() {
            if i == last {
                node.children.insert(key.clone(), new_node);
                return;
            }
            node = node
                .children
                .entry(key.clone())
                .or_insert_with(|| Node::new(None));
        }
    }

    /// Install the object already at `to` under the additional name
    /// `from`, returning the shared identity.
    pub fn add_hard_link(&mut self, from: &str, to: &str) -> Result<PathInfo, StructureError> {
        let target = self.get(to, true)?;
        self.add(from, target.clone());
        Ok(target)
    }

    /// Remove the node at `path` (and its subtree). Missing paths are a
    /// no-op; siblings are never touched.
    pub fn delete(&mut self, path: &str) {
        let keys = parts(path);
        if keys.is_empty() {
            return;
        }
        let (leaf, prefix) = keys.split_last().unwrap();
        if let Some(node) = self.node_mut(prefix) {
            node.children.remove(leaf);
        }
    }

    /// Relocate the subtree at `old` to `new`. A missing source is a
    /// no-op; an existing destination is replaced.
    pub fn rename(&mut self, old: &str, new: &str) {
        let old_keys = parts(old);
        let Some(node) = self.node(&old_keys).cloned() else {
            return;
        };
        self.delete(new);
        self.insert_node(&parts(new), node);
        self.delete(old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure_with(paths: &[&str]) -> PathStructure {
        let mut s = PathStructure::new();
        for p in paths {
            s.add(p, PathInfo::make());
        }
        s
    }

    #[test]
    fn root_exists_with_id_only_value() {
        let s = PathStructure::new();
        assert!(s.contains("/"));
        let root = s.get("/", true).unwrap();
        assert!(!root.has_key_material());
    }

    #[test]
    fn add_creates_implicit_intermediate_nodes() {
        let s = structure_with(&["/a/b/c"]);
        assert!(s.contains("/a"));
        assert!(s.contains("/a/b"));
        assert!(s.get_no_follow("/a").is_err());
        assert!(s.get("/a/b/c", true).is_ok());
    }

    #[test]
    fn missing_path_is_not_found() {
        let s = PathStructure::new();
        assert!(!s.contains("/nope"));
        assert_eq!(s.get("/nope", true), Err(StructureError::NotFound));
    }

    #[test]
    fn delete_removes_only_the_named_node() {
        let mut s = structure_with(&["/d/x", "/d/y"]);
        s.delete("/d/x");
        assert!(!s.contains("/d/x"));
        assert!(s.contains("/d/y"));
        // Deleting a missing path changes nothing.
        s.delete("/d/ghost");
        assert!(s.contains("/d/y"));
    }

    #[test]
    fn rename_moves_the_whole_subtree() {
        let mut s = structure_with(&["/d/a", "/d/a/inner"]);
        let id = s.get("/d/a", true).unwrap().path_id.clone();
        s.rename("/d/a", "/d/b");
        assert!(!s.contains("/d/a"));
        assert_eq!(s.get("/d/b", true).unwrap().path_id, id);
        assert!(s.contains("/d/b/inner"));
    }

    #[test]
    fn contents_lists_immediate_children() {
        let s = structure_with(&["/dir/one", "/dir/two"]);
        let mut names = s.contents("/dir").unwrap();
        names.sort();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[test]
    fn hard_link_shares_identity() {
        let mut s = structure_with(&["/x"]);
        let shared = s.add_hard_link("/y", "/x").unwrap();
        assert_eq!(s.get("/x", true).unwrap(), shared);
        assert_eq!(s.get("/y", true).unwrap(), shared);
        s.delete("/x");
        assert_eq!(s.get("/y", true).unwrap(), shared);
    }

    #[test]
    fn symlinks_resolve_relative_to_their_parent() {
        let mut s = structure_with(&["/t/file"]);
        s.add("/t/link", PathInfo::make_symlink("file"));
        let direct = s.get("/t/file", true).unwrap();
        assert_eq!(s.get("/t/link", true).unwrap(), direct);
        // No-follow sees the link object itself.
        assert!(s.get("/t/link", false).unwrap().is_symlink());
    }

    #[test]
    fn absolute_symlink_targets_resolve_from_root() {
        let mut s = structure_with(&["/data/file"]);
        s.add("/elsewhere/link", PathInfo::make_symlink("/data/file"));
        let direct = s.get("/data/file", true).unwrap();
        assert_eq!(s.get("/elsewhere/link", true).unwrap(), direct);
    }

    #[test]
    fn symlink_cycles_hit_the_hop_limit() {
        let mut s = PathStructure::new();
        s.add("/a", PathInfo::make_symlink("b"));
        s.add("/b", PathInfo::make_symlink("a"));
        assert_eq!(s.get("/a", true), Err(StructureError::TooManyLinks));
    }

    #[test]
    fn serde_round_trip() {
        let mut s = structure_with(&["/a/b", "/c"]);
        s.add("/l", PathInfo::make_symlink("/c"));
        let json = serde_json::to_string(&s).unwrap();
        let back: PathStructure = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.get("/a/b", true).unwrap(),
            s.get("/a/b", true).unwrap()
        );
        assert_eq!(back.get("/l", true).unwrap(), s.get("/c", true).unwrap());
    }

    #[test]
    fn json_shape_matches_manifest_schema() {
        let s = PathStructure::new();
        let value: serde_json::Value = serde_json::to_value(&s).unwrap();
        assert!(value.get("value").unwrap().is_null());
        assert!(value
            .get("children")
            .unwrap()
            .get("/")
            .unwrap()
            .get("value")
            .is_some());
    }
}
