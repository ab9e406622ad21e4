//! BLAKE3 tree hashing for file integrity verification.
//!
//! Each file is divided into fixed-size blocks whose size depends only on the
//! file size. Every block is hashed individually; the block hashes form the leaf
//! nodes of a binary tree, with parent nodes computed by hashing the
//! concatenation of their children. The root is the file's content id, and any
//! aligned block can be checked against its leaf without rehashing the file.

use crate::error::TreeHashError;
use crate::{ContentId, READ_BUFFER_SIZE};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// A leaf, internal node or root hash
pub type LeafHash = [u8; 32];

/// Smallest block size ever chosen (64 KiB)
pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;

/// Starting point of the block size search (1 KiB)
const BASE_BLOCK_SIZE: u64 = 1024;

/// Default tree depth used for block size selection
///
/// A tree of depth 10 has at most 512 leaves.
pub const DEFAULT_MAX_LEVELS: u32 = 10;

/// Choose the block size for a file
///
/// Picks the smallest power of two (at least 1 KiB) for which the file fits in
/// a tree of `max_levels` levels, then floors the result at [`MIN_BLOCK_SIZE`].
/// The result depends only on `file_size` and never decreases as it grows.
///
/// # Example
///
/// ```
/// use ferry_files::tree_hash::{DEFAULT_MAX_LEVELS, MIN_BLOCK_SIZE, choose_block_size};
///
/// assert_eq!(choose_block_size(0, DEFAULT_MAX_LEVELS), MIN_BLOCK_SIZE);
/// assert_eq!(choose_block_size(1024 * 1024 * 1024, DEFAULT_MAX_LEVELS), 2 * 1024 * 1024);
/// ```
#[must_use]
pub fn choose_block_size(file_size: u64, max_levels: u32) -> u64 {
    let max_leaves = 1u64 << (max_levels.clamp(1, 32) - 1);
    let mut block_size = BASE_BLOCK_SIZE;

    while max_leaves.saturating_mul(block_size) < file_size {
        match block_size.checked_mul(2) {
            Some(next) => block_size = next,
            None => break,
        }
    }

    block_size.max(MIN_BLOCK_SIZE)
}

/// Hash a single block of file content
#[must_use]
pub fn leaf_hash(data: &[u8]) -> LeafHash {
    *blake3::hash(data).as_bytes()
}

fn node_hash(left: &LeafHash, right: &LeafHash) -> LeafHash {
    let mut hasher = Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Verify one block of data against an expected leaf hash
///
/// `index` only identifies the block in diagnostics.
#[must_use]
pub fn verify_leaf(index: u64, data: &[u8], expected: &LeafHash) -> bool {
    let ok = leaf_hash(data) == *expected;
    if !ok {
        tracing::trace!(index, len = data.len(), "leaf hash mismatch");
    }
    ok
}

/// Sealed tree hash of a complete file
///
/// Contains the root hash (the content id) and all leaf hashes (for selective
/// verification of individual blocks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeHash {
    /// Block size the leaves were computed with
    pub block_size: u64,
    /// Total number of bytes covered by the leaves
    pub file_size: u64,
    /// Merkle root hash
    pub root: LeafHash,
    /// Leaf hashes in file order
    pub leaves: Vec<LeafHash>,
}

impl TreeHash {
    /// Build a tree from leaf hashes, computing the root
    #[must_use]
    pub fn from_leaves(block_size: u64, file_size: u64, leaves: Vec<LeafHash>) -> Self {
        let root = compute_merkle_root(&leaves);
        Self {
            block_size,
            file_size,
            root,
            leaves,
        }
    }

    /// Get number of leaves
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Get a leaf hash
    #[must_use]
    pub fn leaf(&self, index: u64) -> Option<&LeafHash> {
        usize::try_from(index).ok().and_then(|i| self.leaves.get(i))
    }

    /// Verify a block against its expected leaf
    ///
    /// Returns false for an index outside the tree.
    #[must_use]
    pub fn verify_leaf(&self, index: u64, data: &[u8]) -> bool {
        match self.leaf(index) {
            Some(expected) => verify_leaf(index, data, expected),
            None => false,
        }
    }

    /// Check that the leaves reduce to the stored root
    #[must_use]
    pub fn validate(&self) -> bool {
        !self.leaves.is_empty() && compute_merkle_root(&self.leaves) == self.root
    }

    /// Root as a content id
    #[must_use]
    pub fn content_id(&self) -> ContentId {
        ContentId::from_bytes(self.root)
    }
}

/// Compute Merkle root from leaf hashes
///
/// Parent nodes are the hash of the concatenation of their two children. If a
/// level has an odd number of nodes, the last one is promoted unchanged. A
/// single leaf is its own root; no leaves at all hash like one empty block.
///
/// # Example
///
/// ```
/// use ferry_files::tree_hash::compute_merkle_root;
///
/// let leaves = vec![[1u8; 32], [2u8; 32], [3u8; 32], [4u8; 32]];
/// let root = compute_merkle_root(&leaves);
/// assert_ne!(root, leaves[0]);
/// ```
#[must_use]
pub fn compute_merkle_root(leaves: &[LeafHash]) -> LeafHash {
    match leaves {
        [] => leaf_hash(&[]),
        [only] => *only,
        _ => {
            let mut level = leaves.to_vec();
            while level.len() > 1 {
                let mut next = Vec::with_capacity(level.len().div_ceil(2));
                for pair in level.chunks(2) {
                    next.push(match pair {
                        [left, right] => node_hash(left, right),
                        [odd] => *odd,
                        _ => unreachable!("chunks(2) yields one or two nodes"),
                    });
                }
                level = next;
            }
            level[0]
        }
    }
}

/// Incremental tree hasher for streaming data
///
/// Bytes must arrive strictly in file order. A leaf hash is emitted every
/// `block_size` bytes; [`finalize`](Self::finalize) flushes the trailing short
/// leaf and seals the tree.
///
/// # Example
///
/// ```
/// use ferry_files::HashTree;
///
/// let mut tree = HashTree::new(64 * 1024)?;
/// tree.update(&[0xAA; 1024])?;
/// tree.update(&[0xBB; 1024])?;
///
/// let root = tree.finalize();
/// assert_eq!(tree.finalize(), root);
/// assert!(tree.update(&[0xCC]).is_err());
/// # Ok::<(), ferry_files::TreeHashError>(())
/// ```
#[derive(Debug, Clone)]
pub struct HashTree {
    block_size: u64,
    leaves: Vec<LeafHash>,
    current: Hasher,
    current_len: u64,
    bytes_hashed: u64,
    root: Option<LeafHash>,
}

impl HashTree {
    /// Begin a new tree
    ///
    /// # Errors
    ///
    /// Returns [`TreeHashError::InvalidBlockSize`] if `block_size` is zero.
    pub fn new(block_size: u64) -> Result<Self, TreeHashError> {
        if block_size == 0 {
            return Err(TreeHashError::InvalidBlockSize(block_size));
        }

        Ok(Self {
            block_size,
            leaves: Vec::new(),
            current: Hasher::new(),
            current_len: 0,
            bytes_hashed: 0,
            root: None,
        })
    }

    /// Begin a tree with the block size chosen for `file_size`
    #[must_use]
    pub fn for_file_size(file_size: u64) -> Self {
        let block_size = choose_block_size(file_size, DEFAULT_MAX_LEVELS);
        let leaf_estimate = usize::try_from(file_size.div_ceil(block_size)).unwrap_or(0);

        Self {
            block_size,
            leaves: Vec::with_capacity(leaf_estimate),
            current: Hasher::new(),
            current_len: 0,
            bytes_hashed: 0,
            root: None,
        }
    }

    /// Append the next bytes of the file
    ///
    /// Returns the number of leaves completed by this call.
    ///
    /// # Errors
    ///
    /// Returns [`TreeHashError::Sealed`] once the tree has been finalized.
    pub fn update(&mut self, mut data: &[u8]) -> Result<usize, TreeHashError> {
        if self.root.is_some() {
            return Err(TreeHashError::Sealed);
        }

        let before = self.leaves.len();

        while !data.is_empty() {
            let room = usize::try_from(self.block_size - self.current_len).unwrap_or(usize::MAX);
            let take = room.min(data.len());

            self.current.update(&data[..take]);
            self.current_len += take as u64;
            self.bytes_hashed += take as u64;
            data = &data[take..];

            if self.current_len == self.block_size {
                self.flush_leaf();
            }
        }

        Ok(self.leaves.len() - before)
    }

    fn flush_leaf(&mut self) {
        self.leaves.push(*self.current.finalize().as_bytes());
        self.current.reset();
        self.current_len = 0;
    }

    /// Seal the tree and return its root
    ///
    /// Hashes the remaining partial block (an empty file yields one empty
    /// leaf). Calling it again returns the same root.
    pub fn finalize(&mut self) -> LeafHash {
        if let Some(root) = self.root {
            return root;
        }

        if self.current_len > 0 || self.leaves.is_empty() {
            self.flush_leaf();
        }

        let root = compute_merkle_root(&self.leaves);
        self.root = Some(root);
        root
    }

    /// Seal the tree and convert it into a [`TreeHash`]
    #[must_use]
    pub fn into_tree_hash(mut self) -> TreeHash {
        let root = self.finalize();
        TreeHash {
            block_size: self.block_size,
            file_size: self.bytes_hashed,
            root,
            leaves: self.leaves,
        }
    }

    /// Get block size
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Completed leaves so far
    #[must_use]
    pub fn leaves(&self) -> &[LeafHash] {
        &self.leaves
    }

    /// Get buffered byte count (not yet part of a leaf)
    #[must_use]
    pub fn buffered_bytes(&self) -> u64 {
        self.current_len
    }

    /// Total bytes fed so far
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Whether [`finalize`](Self::finalize) has been called
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.root.is_some()
    }
}

/// Compute tree hash for a file
///
/// The block size is given explicitly so a file on disk can be compared with a
/// tree negotiated for it.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read, or if `block_size`
/// is zero.
///
/// # Example
///
/// ```no_run
/// use ferry_files::tree_hash::compute_tree_hash;
///
/// let tree = compute_tree_hash("/path/to/file", 64 * 1024)?;
/// println!("Root: {}", tree.content_id());
/// # Ok::<(), std::io::Error>(())
/// ```
pub fn compute_tree_hash<P: AsRef<Path>>(path: P, block_size: u64) -> io::Result<TreeHash> {
    let mut file = File::open(path)?;
    let mut tree = HashTree::new(block_size)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        tree.update(&buffer[..bytes_read])
            .map_err(io::Error::other)?;
    }

    Ok(tree.into_tree_hash())
}

/// Compute tree hash from in-memory data
///
/// # Errors
///
/// Returns [`TreeHashError::InvalidBlockSize`] if `block_size` is zero.
///
/// # Example
///
/// ```
/// use ferry_files::tree_hash::compute_tree_hash_from_data;
///
/// let data = vec![0xAA; 1024 * 1024];
/// let tree = compute_tree_hash_from_data(&data, 256 * 1024)?;
/// assert_eq!(tree.leaf_count(), 4);
/// # Ok::<(), ferry_files::TreeHashError>(())
/// ```
pub fn compute_tree_hash_from_data(data: &[u8], block_size: u64) -> Result<TreeHash, TreeHashError> {
    let mut tree = HashTree::new(block_size)?;
    tree.update(data)?;
    Ok(tree.into_tree_hash())
}
