//! Error types for hash trees and content ids.

use thiserror::Error;

/// Hash tree construction errors
///
/// Verification outcomes are never errors; these only cover misuse.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TreeHashError {
    /// Block size must be positive
    #[error("invalid block size: {0}")]
    InvalidBlockSize(u64),

    /// The tree was already finalized
    #[error("hash tree is sealed, no further updates accepted")]
    Sealed,
}

/// Content id parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentIdError {
    /// Text is not valid unpadded base-32
    #[error("invalid base32 encoding: {0}")]
    InvalidEncoding(String),

    /// Decoded value has the wrong length
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },
}
