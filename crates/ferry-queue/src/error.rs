//! Error types for the download queue
//!
//! # Error Categories
//!
//! - **Recoverable**: failures local to one (item, source) pair. The item
//!   returns to waiting and may be retried through another source.
//! - **Permanent**: failures that need a different request or user action.
//!
//! # Example
//!
//! ```
//! use ferry_queue::QueueError;
//!
//! let err = QueueError::conflict("A file with a different size already exists in the queue");
//! assert!(!err.is_recoverable());
//! ```

use crate::source::{SourceFailure, UserId};
use ferry_files::TreeHashError;
use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in queue operations
#[derive(Debug, Error, Clone)]
pub enum QueueError {
    // ============ Identity Errors ============
    /// An existing item has a different size or content id
    #[error("{0}")]
    ContentConflict(Cow<'static, str>),

    /// The item is already finished
    #[error("This file has already finished downloading")]
    AlreadyFinished(PathBuf),

    // ============ Verification Errors ============
    /// A block or the whole file did not match its expected hash
    #[error("Verification failed for {}: {reason}", .target.display())]
    VerificationFailed {
        /// Affected item
        target: PathBuf,
        /// Failure classification recorded for the source
        reason: SourceFailure,
    },

    /// Hash tree misuse
    #[error("Hash tree error: {0}")]
    Tree(#[from] TreeHashError),

    // ============ Source Errors ============
    /// A source failed with a classified reason
    #[error("Source {user} failed: {reason}")]
    SourceFailed {
        /// Failing source
        user: UserId,
        /// Classification
        reason: SourceFailure,
    },

    /// The source is already known for this item
    #[error("Duplicate source: {0}")]
    DuplicateSource(UserId),

    // ============ Item Errors ============
    /// No item for the target
    #[error("Item not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Target path rejected
    #[error("{0}")]
    InvalidTarget(Cow<'static, str>),

    /// Operation not allowed while the item is running
    #[error("Item is running: {}", .0.display())]
    Running(PathBuf),

    /// The download was aborted by removal or pausing
    #[error("Download aborted")]
    Aborted,

    // ============ Local Errors ============
    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl QueueError {
    /// Returns true if the failure is local to one source and the item may
    /// be retried
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QueueError::VerificationFailed { .. }
                | QueueError::SourceFailed { .. }
                | QueueError::Aborted
                | QueueError::Running(_)
        )
    }

    /// Returns true if the failure needs user action
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }

    /// Create a content conflict error with static context (zero allocation)
    #[must_use]
    pub const fn conflict(context: &'static str) -> Self {
        QueueError::ContentConflict(Cow::Borrowed(context))
    }

    /// Create an invalid target error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_target(context: &'static str) -> Self {
        QueueError::InvalidTarget(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        QueueError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io(Cow::Owned(err.to_string()))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let err = QueueError::VerificationFailed {
            target: PathBuf::from("/a"),
            reason: SourceFailure::BadTree,
        };
        assert!(err.is_recoverable());
        assert!(QueueError::Aborted.is_recoverable());

        assert!(QueueError::conflict("x").is_permanent());
        assert!(QueueError::from(std::io::Error::other("disk full")).is_permanent());
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::conflict("A file with a different size already exists in the queue");
        assert_eq!(
            err.to_string(),
            "A file with a different size already exists in the queue"
        );

        let err = QueueError::VerificationFailed {
            target: PathBuf::from("/d/f.bin"),
            reason: SourceFailure::ChecksumMismatch,
        };
        assert!(err.to_string().contains("/d/f.bin"));
        assert!(err.to_string().contains("Checksum inconsistency"));
    }
}
