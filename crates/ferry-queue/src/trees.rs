//! Tree metadata storage.

use dashmap::DashMap;
use ferry_files::{ContentId, TreeHash};
use std::sync::Arc;

/// Full hash trees keyed by content id
///
/// Fed by the protocol layer as peers deliver leaf lists; consulted when
/// blocks arrive and during recheck.
pub trait TreeStore: Send + Sync {
    /// Tree for `id`
    fn get(&self, id: &ContentId) -> Option<Arc<TreeHash>>;

    /// Store a tree under its root
    fn insert(&self, tree: TreeHash) -> Arc<TreeHash>;

    /// Drop the tree for `id`
    fn remove(&self, id: &ContentId);

    /// Whether a tree for `id` is stored
    fn contains(&self, id: &ContentId) -> bool {
        self.get(id).is_some()
    }
}

/// In-memory tree store
#[derive(Debug, Default)]
pub struct MemoryTreeStore {
    trees: DashMap<ContentId, Arc<TreeHash>>,
}

impl MemoryTreeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored trees
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}

impl TreeStore for MemoryTreeStore {
    fn get(&self, id: &ContentId) -> Option<Arc<TreeHash>> {
        self.trees.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn insert(&self, tree: TreeHash) -> Arc<TreeHash> {
        let tree = Arc::new(tree);
        self.trees.insert(tree.content_id(), Arc::clone(&tree));
        tree
    }

    fn remove(&self, id: &ContentId) {
        self.trees.remove(id);
    }
}
