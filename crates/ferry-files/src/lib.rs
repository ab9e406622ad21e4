//! # FERRY Files
//!
//! Hash-tree engine for the FERRY transfer queue.
//!
//! This crate provides:
//! - Size-dependent block size selection
//! - Incremental BLAKE3 Merkle trees fed in file order
//! - Independent verification of any aligned block
//! - Base-32 content id encoding for file lists and magnet links

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod content_id;
pub mod error;
pub mod tree_hash;

pub use chunker::BlockLayout;
pub use content_id::{ContentId, decode_base32, encode_base32};
pub use error::{ContentIdError, TreeHashError};
pub use tree_hash::{
    DEFAULT_MAX_LEVELS, HashTree, LeafHash, MIN_BLOCK_SIZE, TreeHash, choose_block_size,
    verify_leaf,
};

/// Size of a leaf or root hash in bytes
pub const HASH_SIZE: usize = 32;

/// Read buffer used when hashing files from disk (64 KiB)
pub const READ_BUFFER_SIZE: usize = 64 * 1024;
