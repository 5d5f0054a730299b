// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use super::node::ConfigNode;

/// Owner of a configuration tree. Holds the root node; all other nodes are
/// reached through slash-delimited absolute paths.
pub struct ConfigTree {
    root: Arc<ConfigNode>,
}

impl ConfigTree {
    pub fn new() -> Arc<ConfigTree> {
        Arc::new(ConfigTree {
            root: ConfigNode::new_root(),
        })
    }

    pub fn root(&self) -> &Arc<ConfigNode> {
        &self.root
    }

    /// Resolve an absolute path, creating missing nodes along the way.
    /// `/` resolves to the root; a trailing slash is optional.
    ///
    /// # Panics
    ///
    /// Panics if the path is not absolute.
    pub fn node(&self, path: &str) -> Arc<ConfigNode> {
        let mut current = Arc::clone(&self.root);

        for component in Self::components(path) {
            current = current.add_child(component);
        }

        current
    }

    /// Read-only path lookup. Returns `None` if any component is missing.
    pub fn get_node(&self, path: &str) -> Option<Arc<ConfigNode>> {
        let mut current = Arc::clone(&self.root);

        for component in Self::components(path) {
            current = current.child(component)?;
        }

        Some(current)
    }

    /// Whether a node exists at the given path.
    pub fn node_exists(&self, path: &str) -> bool {
        self.get_node(path).is_some()
    }

    fn components(path: &str) -> impl Iterator<Item = &str> {
        assert!(
            path.starts_with('/'),
            "configuration paths must be absolute, got '{path}'"
        );

        path.split('/').filter(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_path() {
        let tree = ConfigTree::new();
        assert_eq!(tree.root().path(), "/");
        assert!(Arc::ptr_eq(&tree.node("/"), tree.root()));
    }

    #[test]
    fn test_node_creates_path() {
        let tree = ConfigTree::new();
        let node = tree.node("/system/modules/");
        assert_eq!(node.path(), "/system/modules/");
        assert_eq!(node.parent().unwrap().path(), "/system/");
    }

    #[test]
    fn test_relative_node() {
        let tree = ConfigTree::new();
        let cam = tree.node("/cam/");

        let info = cam.relative_node("sourceInfo/");
        assert_eq!(info.path(), "/cam/sourceInfo/");
        assert!(Arc::ptr_eq(&info, &cam.relative_node("sourceInfo")));
    }

    #[test]
    fn test_get_node_does_not_create() {
        let tree = ConfigTree::new();
        assert!(tree.get_node("/missing/").is_none());
        assert!(!tree.node_exists("/missing"));

        tree.node("/present/");
        assert!(tree.node_exists("/present/"));
        assert!(tree.node_exists("/present")); // trailing slash optional
    }
}
