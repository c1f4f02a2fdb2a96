//! Download progress, rate gating, and ETA smoothing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Integer percentage, floored and clamped to 100. Zero when `total` is zero.
pub fn percent(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (u128::from(downloaded) * 100) / u128::from(total);
    pct.min(100) as u8
}

/// Download progress information.
///
/// Provides information about the current state of a download,
/// including bytes downloaded, total size, and the smoothed ETA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes to download.
    pub total: u64,
    /// Estimated seconds remaining; `None` while throughput is unknown.
    pub eta_seconds: Option<u64>,
}

impl DownloadProgress {
    /// Create a new progress instance.
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self {
            downloaded,
            total,
            eta_seconds: None,
        }
    }

    /// Download progress as a floored integer percentage.
    pub fn percent(&self) -> u8 {
        percent(self.downloaded, self.total)
    }

    /// Check if the download is complete.
    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.total && self.total > 0
    }

    /// Get remaining bytes to download.
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.downloaded)
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} bytes ({}%)",
            self.downloaded,
            self.total,
            self.percent()
        )?;
        if let Some(eta) = self.eta_seconds {
            write!(f, ", {}s left", eta)?;
        }
        Ok(())
    }
}

/// Throughput estimate over a trailing window of byte-count samples.
///
/// The rate is the byte delta between the oldest and newest sample divided
/// by the time between them, which smooths out bursty chunk delivery.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl ThroughputEstimator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            window,
            max_samples: max_samples.max(2),
        }
    }

    /// Record the cumulative byte count observed at `at`.
    pub fn record(&mut self, at: Instant, downloaded: u64) {
        // A restart from zero (server ignored the range) invalidates history
        if self.samples.back().is_some_and(|&(_, last)| downloaded < last) {
            self.samples.clear();
        }
        self.samples.push_back((at, downloaded));

        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(&(t, _)) if at.saturating_duration_since(t) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Bytes per second over the window, `None` when not measurable.
    pub fn bytes_per_second(&self) -> Option<f64> {
        let (first_at, first_bytes) = *self.samples.front()?;
        let (last_at, last_bytes) = *self.samples.back()?;
        let elapsed = last_at.saturating_duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 || last_bytes <= first_bytes {
            return None;
        }
        Some((last_bytes - first_bytes) as f64 / elapsed)
    }

    /// Seconds left for `remaining` bytes, rounded up.
    pub fn eta_seconds(&self, remaining: u64) -> Option<u64> {
        if remaining == 0 {
            return Some(0);
        }
        let rate = self.bytes_per_second()?;
        Some((remaining as f64 / rate).ceil() as u64)
    }
}

/// Time gate for progress notifications.
///
/// The first report and the final one always pass; everything in between is
/// limited to one per `interval`.
#[derive(Debug, Clone)]
pub struct ProgressGate {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Whether a report at `now` should be delivered.
    pub fn should_emit(&mut self, now: Instant, is_final: bool) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => is_final || now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_emit = Some(now);
        }
        due
    }
}
