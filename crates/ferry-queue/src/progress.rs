//! Download progress tracking
//!
//! Speed is averaged over the current connection; ETA follows from the bytes
//! still missing.

use std::time::{Duration, Instant};

/// Progress of one download connection
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes already stored when the connection started
    pub bytes_at_start: u64,

    /// Bytes stored or buffered so far
    pub bytes_done: u64,

    /// Total file size, if known
    pub bytes_total: Option<u64>,

    /// Current speed in bytes/second
    pub speed_bytes_per_sec: f64,

    /// Estimated time remaining
    pub eta: Option<Duration>,

    started_at: Instant,
}

impl DownloadProgress {
    /// Start tracking a connection
    pub fn new(bytes_at_start: u64, bytes_total: Option<u64>) -> Self {
        Self {
            bytes_at_start,
            bytes_done: bytes_at_start,
            bytes_total,
            speed_bytes_per_sec: 0.0,
            eta: None,
            started_at: Instant::now(),
        }
    }

    /// Record `bytes_done` and recompute speed and ETA
    pub fn update(&mut self, bytes_done: u64) {
        self.update_at(bytes_done, Instant::now());
    }

    fn update_at(&mut self, bytes_done: u64, now: Instant) {
        self.bytes_done = bytes_done;

        let elapsed = now.duration_since(self.started_at).as_secs_f64();
        let session_bytes = bytes_done.saturating_sub(self.bytes_at_start);
        if elapsed > 0.0 {
            self.speed_bytes_per_sec = session_bytes as f64 / elapsed;
        }

        self.eta = match self.bytes_total {
            Some(total) if self.speed_bytes_per_sec > 0.0 && bytes_done < total => {
                let remaining = (total - bytes_done) as f64;
                Some(Duration::from_secs_f64(remaining / self.speed_bytes_per_sec))
            }
            _ => None,
        };
    }

    /// Progress percentage (0.0 to 100.0)
    pub fn percent(&self) -> f64 {
        match self.bytes_total {
            Some(0) => 100.0,
            Some(total) => (self.bytes_done as f64 / total as f64) * 100.0,
            None => 0.0,
        }
    }

    /// Get human-readable ETA string
    pub fn eta_string(&self) -> String {
        match self.eta {
            Some(duration) => {
                let seconds = duration.as_secs();
                if seconds < 60 {
                    format!("{seconds}s")
                } else if seconds < 3600 {
                    format!("{}m {}s", seconds / 60, seconds % 60)
                } else {
                    format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
                }
            }
            None => "Unknown".to_string(),
        }
    }

    /// Get human-readable speed string
    pub fn speed_string(&self) -> String {
        let speed = self.speed_bytes_per_sec;
        if speed < 1024.0 {
            format!("{speed:.0} B/s")
        } else if speed < 1024.0 * 1024.0 {
            format!("{:.1} KiB/s", speed / 1024.0)
        } else {
            format!("{:.1} MiB/s", speed / (1024.0 * 1024.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_and_eta() {
        let mut progress = DownloadProgress::new(0, Some(10_000));
        let later = progress.started_at + Duration::from_secs(2);

        progress.update_at(2_000, later);
        assert!((progress.speed_bytes_per_sec - 1_000.0).abs() < f64::EPSILON);
        assert_eq!(progress.eta, Some(Duration::from_secs(8)));
        assert_eq!(progress.eta_string(), "8s");
        assert!((progress.percent() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resumed_bytes_excluded_from_speed() {
        let mut progress = DownloadProgress::new(5_000, Some(10_000));
        let later = progress.started_at + Duration::from_secs(1);

        progress.update_at(6_000, later);
        assert!((progress.speed_bytes_per_sec - 1_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_size() {
        let mut progress = DownloadProgress::new(0, None);
        progress.update(100);
        assert_eq!(progress.eta, None);
        assert_eq!(progress.eta_string(), "Unknown");
        assert_eq!(progress.percent(), 0.0);
    }

    #[test]
    fn test_speed_string() {
        let mut progress = DownloadProgress::new(0, None);
        progress.speed_bytes_per_sec = 2.5 * 1024.0 * 1024.0;
        assert_eq!(progress.speed_string(), "2.5 MiB/s");
    }
}
