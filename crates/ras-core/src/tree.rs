//! The synthetic directory tree behind a run's artifacts.
//!
//! Artifact-index documents only know flat attachment keys such as
//! `/framework/cps_record.properties`. [`ArtifactTree`] registers each key
//! as a leaf owned by its document and synthesizes every ancestor
//! directory exactly once, so the keys can be walked like a filesystem.

use std::collections::BTreeMap;

use crate::error::{RasError, Result};
use crate::path::ArtifactPath;

/// Metadata for one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactAttributes {
    pub content_type: String,
    pub length: u64,
}

/// A known position in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactNode {
    /// Synthesized from descendants; no owning document.
    Directory,
    Artifact {
        /// Id of the artifact-index document holding the attachment.
        record_id: String,
        attributes: ArtifactAttributes,
    },
}

impl ArtifactNode {
    pub fn record_id(&self) -> Option<&str> {
        match self {
            ArtifactNode::Directory => None,
            ArtifactNode::Artifact { record_id, .. } => Some(record_id),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.record_id().is_none()
    }
}

/// An immediate child returned by [`ArtifactTree::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: ArtifactPath,
    pub is_directory: bool,
}

impl DirEntry {
    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or("/")
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactTree {
    nodes: BTreeMap<ArtifactPath, ArtifactNode>,
}

impl Default for ArtifactTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ArtifactPath::root(), ArtifactNode::Directory);
        Self { nodes }
    }

    /// Whether `path` can become a leaf without breaking the tree.
    ///
    /// Fails when `path` is the root, an existing directory, or lies below
    /// an existing artifact. Re-registering an existing leaf is allowed.
    pub fn check_can_register(&self, path: &ArtifactPath) -> Result<()> {
        if path.is_root() {
            return Err(RasError::InvalidPath {
                path: path.to_string(),
                reason: "the root cannot be an artifact".to_string(),
            });
        }
        for ancestor in path.ancestors() {
            if let Some(ArtifactNode::Artifact { .. }) = self.nodes.get(&ancestor) {
                return Err(RasError::InvalidPath {
                    path: path.to_string(),
                    reason: format!("ancestor {} is an artifact", ancestor),
                });
            }
        }
        if let Some(ArtifactNode::Directory) = self.nodes.get(path) {
            return Err(RasError::InvalidPath {
                path: path.to_string(),
                reason: "already a directory".to_string(),
            });
        }
        Ok(())
    }

    /// Register a leaf owned by `record_id`, synthesizing missing ancestors.
    ///
    /// Re-registering a leaf replaces its owner and attributes. A rejected
    /// path leaves the tree unchanged.
    pub fn add_known_path(
        &mut self,
        path: &ArtifactPath,
        record_id: &str,
        attributes: ArtifactAttributes,
    ) -> Result<()> {
        self.check_can_register(path)?;
        for ancestor in path.ancestors() {
            self.nodes.entry(ancestor).or_insert(ArtifactNode::Directory);
        }
        self.nodes.insert(
            path.clone(),
            ArtifactNode::Artifact {
                record_id: record_id.to_string(),
                attributes,
            },
        );
        Ok(())
    }

    pub fn get(&self, path: &ArtifactPath) -> Option<&ArtifactNode> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &ArtifactPath) -> bool {
        self.nodes.contains_key(path)
    }

    /// Immediate children of `directory`, in path order.
    pub fn list(&self, directory: &ArtifactPath) -> Result<Vec<DirEntry>> {
        match self.nodes.get(directory) {
            None => return Err(RasError::NotFound(directory.to_string())),
            Some(ArtifactNode::Artifact { .. }) => {
                return Err(RasError::InvalidPath {
                    path: directory.to_string(),
                    reason: "not a directory".to_string(),
                })
            }
            Some(ArtifactNode::Directory) => {}
        }

        let depth = directory.segments().len() + 1;
        Ok(self
            .nodes
            .range(directory.clone()..)
            .skip(1)
            .take_while(|(path, _)| path.starts_with(directory))
            .filter(|(path, _)| path.segments().len() == depth)
            .map(|(path, node)| DirEntry {
                path: path.clone(),
                is_directory: node.is_directory(),
            })
            .collect())
    }

    pub fn attributes(&self, path: &ArtifactPath) -> Result<&ArtifactAttributes> {
        match self.nodes.get(path) {
            Some(ArtifactNode::Artifact { attributes, .. }) => Ok(attributes),
            Some(ArtifactNode::Directory) => Err(RasError::InvalidPath {
                path: path.to_string(),
                reason: "is a directory".to_string(),
            }),
            None => Err(RasError::NotFound(path.to_string())),
        }
    }

    /// Every leaf artifact, in path order.
    pub fn artifacts(&self) -> impl Iterator<Item = (&ArtifactPath, &ArtifactNode)> {
        self.nodes.iter().filter(|(_, node)| !node.is_directory())
    }

    /// Number of known paths, including the root and synthesized directories.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ArtifactPath {
        ArtifactPath::parse(s).unwrap()
    }

    fn attrs(len: u64) -> ArtifactAttributes {
        ArtifactAttributes {
            content_type: "text/plain".to_string(),
            length: len,
        }
    }

    fn names(entries: &[DirEntry]) -> Vec<(&str, bool)> {
        entries.iter().map(|e| (e.name(), e.is_directory)).collect()
    }

    #[test]
    fn test_shared_ancestor_synthesized_once() {
        let mut tree = ArtifactTree::new();
        tree.add_known_path(&p("/a/b/c.txt"), "rec1", attrs(3)).unwrap();
        tree.add_known_path(&p("/a/d.txt"), "rec1", attrs(4)).unwrap();

        assert_eq!(names(&tree.list(&ArtifactPath::root()).unwrap()), vec![("a", true)]);
        assert_eq!(
            names(&tree.list(&p("/a")).unwrap()),
            vec![("b", true), ("d.txt", false)]
        );
        assert_eq!(names(&tree.list(&p("/a/b")).unwrap()), vec![("c.txt", false)]);
        // root, /a, /a/b, /a/b/c.txt, /a/d.txt
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_directories_have_no_record_id() {
        let mut tree = ArtifactTree::new();
        tree.add_known_path(&p("/x/y.bin"), "rec9", attrs(1)).unwrap();
        assert_eq!(tree.get(&p("/x")).unwrap().record_id(), None);
        assert_eq!(tree.get(&p("/x/y.bin")).unwrap().record_id(), Some("rec9"));
    }

    #[test]
    fn test_list_does_not_leak_sibling_prefixes() {
        let mut tree = ArtifactTree::new();
        tree.add_known_path(&p("/a/one"), "r", attrs(1)).unwrap();
        tree.add_known_path(&p("/a-b/two"), "r", attrs(1)).unwrap();
        tree.add_known_path(&p("/ab/three"), "r", attrs(1)).unwrap();
        assert_eq!(names(&tree.list(&p("/a")).unwrap()), vec![("one", false)]);
    }

    #[test]
    fn test_list_missing_and_leaf() {
        let mut tree = ArtifactTree::new();
        tree.add_known_path(&p("/run.log"), "r", attrs(10)).unwrap();
        assert!(tree.list(&p("/nope")).unwrap_err().is_not_found());
        assert!(matches!(
            tree.list(&p("/run.log")).unwrap_err(),
            RasError::InvalidPath { .. }
        ));
    }

    #[test]
    fn test_attributes_from_registration() {
        let mut tree = ArtifactTree::new();
        tree.add_known_path(&p("/d/f.json"), "r", ArtifactAttributes {
            content_type: "application/json".into(),
            length: 42,
        })
        .unwrap();
        let a = tree.attributes(&p("/d/f.json")).unwrap();
        assert_eq!(a.content_type, "application/json");
        assert_eq!(a.length, 42);
        assert!(tree.attributes(&p("/d")).is_err());
    }

    #[test]
    fn test_leaf_cannot_become_directory() {
        let mut tree = ArtifactTree::new();
        tree.add_known_path(&p("/f"), "r", attrs(1)).unwrap();
        assert!(tree.add_known_path(&p("/f/g"), "r", attrs(1)).is_err());
        tree.add_known_path(&p("/d/e"), "r", attrs(1)).unwrap();
        assert!(tree.add_known_path(&p("/d"), "r", attrs(1)).is_err());
    }

    #[test]
    fn test_reregistration_replaces_owner() {
        let mut tree = ArtifactTree::new();
        tree.add_known_path(&p("/f"), "old", attrs(1)).unwrap();
        tree.add_known_path(&p("/f"), "new", attrs(2)).unwrap();
        assert_eq!(tree.get(&p("/f")).unwrap().record_id(), Some("new"));
        assert_eq!(tree.artifacts().count(), 1);
    }

    #[test]
    fn test_check_can_register_does_not_modify_tree() {
        let mut tree = ArtifactTree::new();
        tree.add_known_path(&p("/a"), "r", attrs(1)).unwrap();
        tree.add_known_path(&p("/d/e"), "r", attrs(1)).unwrap();
        let before = tree.len();

        assert!(tree.check_can_register(&p("/a")).is_ok());
        assert!(tree.check_can_register(&p("/d/f")).is_ok());
        assert!(tree.check_can_register(&p("/a/b")).is_err());
        assert!(tree.check_can_register(&p("/d")).is_err());
        assert!(tree.check_can_register(&ArtifactPath::root()).is_err());

        assert!(tree.add_known_path(&p("/a/b/c"), "r", attrs(1)).is_err());
        assert_eq!(tree.len(), before);
        assert!(!tree.contains(&p("/a/b")));
    }
}
