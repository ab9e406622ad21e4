//! Queue change notifications.
//!
//! Events are owned value snapshots delivered over a broadcast channel, so
//! publishing never blocks a transfer task. Slow subscribers lose the oldest
//! events rather than stalling the queue.

use crate::item::{QueueItem, QueueStatus};
use crate::priority::Priority;
use crate::recheck::RecheckOutcome;
use crate::source::SourceList;
use ferry_files::ContentId;
use std::path::PathBuf;

/// Changed fields of an item (unchanged ones are `None`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    /// New status
    pub status: Option<QueueStatus>,
    /// New priority
    pub priority: Option<Priority>,
    /// Bytes stored
    pub downloaded: Option<u64>,
    /// Current speed in bytes/second
    pub speed: Option<f64>,
    /// Local error that suspended the item
    pub last_error: Option<String>,
}

impl ItemUpdate {
    /// Status change
    #[must_use]
    pub fn status(status: QueueStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Priority change
    #[must_use]
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }

    /// Progress change
    #[must_use]
    pub fn progress(downloaded: u64, speed: f64) -> Self {
        Self {
            downloaded: Some(downloaded),
            speed: Some(speed),
            ..Self::default()
        }
    }
}

/// One queue mutation
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Item added
    Added(Box<QueueItem>),

    /// Item fields changed
    Updated {
        /// Item target
        target: PathBuf,
        /// Changed fields
        update: ItemUpdate,
    },

    /// Item removed
    Removed {
        /// Item target
        target: PathBuf,
    },

    /// Item relocated
    Moved {
        /// Old target
        from: PathBuf,
        /// New target
        to: PathBuf,
    },

    /// Source lists changed
    SourcesUpdated {
        /// Item target
        target: PathBuf,
        /// Current source lists
        sources: SourceList,
    },

    /// Item downloaded and verified
    Finished {
        /// Item target
        target: PathBuf,
        /// Final size
        size: u64,
        /// Verified content id
        content_id: Option<ContentId>,
    },

    /// Recheck progress
    Recheck {
        /// Item target
        target: PathBuf,
        /// Outcome reached
        outcome: RecheckOutcome,
    },
}

impl QueueEvent {
    /// Target the event concerns
    #[must_use]
    pub fn target(&self) -> &PathBuf {
        match self {
            QueueEvent::Added(item) => &item.target,
            QueueEvent::Updated { target, .. }
            | QueueEvent::Removed { target }
            | QueueEvent::SourcesUpdated { target, .. }
            | QueueEvent::Finished { target, .. }
            | QueueEvent::Recheck { target, .. } => target,
            QueueEvent::Moved { to, .. } => to,
        }
    }
}
