//! Item priorities.

use crate::config::QueueConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Download priority, in ascending order
///
/// `Paused` is a priority rather than a status: a paused item is never picked
/// for transfer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Never auto-selected
    Paused,
    /// Lowest
    Lowest,
    /// Low
    Low,
    /// Normal
    #[default]
    Normal,
    /// High
    High,
    /// Highest
    Highest,
}

impl Priority {
    /// All priorities, ascending
    pub const ALL: [Priority; 6] = [
        Priority::Paused,
        Priority::Lowest,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Highest,
    ];

    /// One step up, clamped at `Highest`
    #[must_use]
    pub fn increment(self) -> Self {
        match self {
            Priority::Paused => Priority::Lowest,
            Priority::Lowest => Priority::Low,
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Highest => Priority::Highest,
        }
    }

    /// One step down, clamped at `Paused`
    #[must_use]
    pub fn decrement(self) -> Self {
        match self {
            Priority::Paused | Priority::Lowest => Priority::Paused,
            Priority::Low => Priority::Lowest,
            Priority::Normal => Priority::Low,
            Priority::High => Priority::Normal,
            Priority::Highest => Priority::High,
        }
    }

    /// Default priority for a newly added file of the given size
    ///
    /// Size thresholds are in KiB. An unknown size is treated as zero.
    #[must_use]
    pub fn for_size(size: Option<u64>, config: &QueueConfig) -> Self {
        let size = size.unwrap_or(0);
        if size <= config.prio_highest_size.saturating_mul(1024) {
            Priority::Highest
        } else if size <= config.prio_high_size.saturating_mul(1024) {
            Priority::High
        } else if size <= config.prio_normal_size.saturating_mul(1024) {
            Priority::Normal
        } else if size <= config.prio_low_size.saturating_mul(1024) {
            Priority::Low
        } else if config.prio_lowest {
            Priority::Lowest
        } else {
            Priority::Normal
        }
    }

    /// Lower-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Paused => "paused",
            Priority::Lowest => "lowest",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Highest => "highest",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown priority: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Priority::Paused < Priority::Lowest);
        assert!(Priority::Lowest < Priority::Low);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Highest);
    }

    #[test]
    fn test_clamping() {
        assert_eq!(Priority::Lowest.decrement(), Priority::Paused);
        assert_eq!(Priority::Paused.increment(), Priority::Lowest);
        assert_eq!(Priority::Highest.increment(), Priority::Highest);
        assert_eq!(Priority::Paused.decrement(), Priority::Paused);
    }

    #[test]
    fn test_default_by_size() {
        let config = QueueConfig {
            prio_highest_size: 64,
            prio_high_size: 1024,
            prio_normal_size: 0,
            prio_low_size: 0,
            prio_lowest: true,
            ..QueueConfig::default()
        };

        assert_eq!(Priority::for_size(Some(10 * 1024), &config), Priority::Highest);
        assert_eq!(Priority::for_size(Some(512 * 1024), &config), Priority::High);
        assert_eq!(Priority::for_size(Some(10 * 1024 * 1024), &config), Priority::Lowest);

        let config = QueueConfig {
            prio_lowest: false,
            ..config
        };
        assert_eq!(Priority::for_size(Some(10 * 1024 * 1024), &config), Priority::Normal);
    }

    #[test]
    fn test_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("paused".parse::<Priority>().unwrap(), Priority::Paused);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
