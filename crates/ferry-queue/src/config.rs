//! Queue configuration

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Extension appended to temporary download files
pub const TEMP_EXTENSION: &str = "part";

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory for unfinished files (`None` keeps them next to the target)
    pub temp_dir: Option<PathBuf>,

    /// Directory where file lists are stored
    pub list_dir: PathBuf,

    /// Persisted queue file
    pub queue_file: PathBuf,

    /// Files up to this size (KiB) default to highest priority
    pub prio_highest_size: u64,

    /// Files up to this size (KiB) default to high priority
    pub prio_high_size: u64,

    /// Files up to this size (KiB) default to normal priority
    pub prio_normal_size: u64,

    /// Files up to this size (KiB) default to low priority
    pub prio_low_size: u64,

    /// Larger files default to lowest instead of normal
    pub prio_lowest: bool,

    /// Files below this size (bytes) may be fetched without tree metadata
    pub max_size_without_tree: u64,

    /// Keep finished items in the queue
    pub keep_finished: bool,

    /// Skip zero-byte files instead of creating them
    pub skip_zero_byte: bool,

    /// Delay between a change and the next automatic save
    pub autosave_interval_secs: u64,

    /// Buffered events per subscriber before the oldest are dropped
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("ferry");
        Self {
            temp_dir: None,
            list_dir: base.join("lists"),
            queue_file: base.join("queue.json"),
            prio_highest_size: 64,
            prio_high_size: 0,
            prio_normal_size: 0,
            prio_low_size: 0,
            prio_lowest: false,
            max_size_without_tree: 20 * 1024 * 1024,
            keep_finished: false,
            skip_zero_byte: false,
            autosave_interval_secs: 10,
            event_capacity: 1024,
        }
    }
}

impl QueueConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`] for a zero event capacity or
    /// priority size thresholds that decrease.
    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(QueueError::invalid_config("event_capacity must be positive"));
        }

        // Zero disables a threshold
        let thresholds = [
            self.prio_highest_size,
            self.prio_high_size,
            self.prio_normal_size,
            self.prio_low_size,
        ];
        let enabled: Vec<u64> = thresholds.into_iter().filter(|&t| t > 0).collect();
        if enabled.windows(2).any(|w| w[0] > w[1]) {
            return Err(QueueError::invalid_config(
                "priority size thresholds must not decrease",
            ));
        }

        Ok(())
    }

    /// Autosave delay
    #[must_use]
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs.max(1))
    }

    /// Temporary file path for `target`
    ///
    /// With a temp directory the file name also carries the content id, so
    /// two targets with the same name do not collide.
    #[must_use]
    pub fn temp_target(&self, target: &Path, content_id: Option<&str>) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match (&self.temp_dir, content_id) {
            (Some(dir), Some(id)) => dir.join(format!("{name}.{id}.{TEMP_EXTENSION}")),
            (Some(dir), None) => dir.join(format!("{name}.{TEMP_EXTENSION}")),
            (None, _) => target.with_file_name(format!("{name}.{TEMP_EXTENSION}")),
        }
    }
}
