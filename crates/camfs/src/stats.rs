//! Transfer and protocol statistics for monitoring.
//!
//! All counters sit behind one mutex so a snapshot is internally consistent and `reset` zeroes
//! everything at once. Rolling averages are exponential moving averages with weight 1/8.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ignore_poison::IgnorePoison;

/// Weight of a new sample in the moving averages.
const EMA_WEIGHT: f64 = 1.0 / 8.0;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub files_read: u64,
    pub files_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub ptp_operations: u64,
    pub ptp_errors: u64,
    /// Time of the most recent protocol exchange.
    pub last_operation: Option<DateTime<Utc>>,
    /// KiB/s over device reads (cache misses).
    pub avg_read_speed: f64,
    /// KiB/s over uploads.
    pub avg_write_speed: f64,
    /// Microseconds per protocol exchange.
    pub avg_response_time: f64,
}

#[derive(Debug, Default)]
pub struct StorageStats {
    inner: Mutex<StatsSnapshot>,
}

impl StorageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock_ignore_poison().clone()
    }

    pub fn reset(&self) {
        *self.inner.lock_ignore_poison() = StatsSnapshot::default();
    }

    pub(crate) fn record_exchange(&self, latency: Duration, succeeded: bool) {
        let mut stats = self.inner.lock_ignore_poison();
        stats.ptp_operations += 1;
        if !succeeded {
            stats.ptp_errors += 1;
        }
        stats.last_operation = Some(Utc::now());
        stats.avg_response_time = blend(stats.avg_response_time, latency.as_secs_f64() * 1_000_000.0);
    }

    pub(crate) fn record_cache_hit(&self, bytes: usize) {
        let mut stats = self.inner.lock_ignore_poison();
        stats.cache_hits += 1;
        stats.bytes_read += bytes as u64;
    }

    pub(crate) fn record_cache_miss(&self, bytes: usize, elapsed: Duration) {
        let mut stats = self.inner.lock_ignore_poison();
        stats.cache_misses += 1;
        stats.bytes_read += bytes as u64;
        if let Some(speed) = kib_per_sec(bytes, elapsed) {
            stats.avg_read_speed = blend(stats.avg_read_speed, speed);
        }
    }

    pub(crate) fn record_file_read(&self) {
        self.inner.lock_ignore_poison().files_read += 1;
    }

    pub(crate) fn record_write(&self, bytes: usize, elapsed: Duration) {
        let mut stats = self.inner.lock_ignore_poison();
        stats.files_written += 1;
        stats.bytes_written += bytes as u64;
        if let Some(speed) = kib_per_sec(bytes, elapsed) {
            stats.avg_write_speed = blend(stats.avg_write_speed, speed);
        }
    }
}

/// The first sample seeds the average instead of being diluted against zero.
fn blend(current: f64, sample: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        current + (sample - current) * EMA_WEIGHT
    }
}

fn kib_per_sec(bytes: usize, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return None;
    }
    Some(bytes as f64 / 1024.0 / secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_counts_failures() {
        let stats = StorageStats::new();
        stats.record_exchange(Duration::from_micros(800), true);
        stats.record_exchange(Duration::from_micros(800), false);

        let snap = stats.snapshot();
        assert_eq!(snap.ptp_operations, 2);
        assert_eq!(snap.ptp_errors, 1);
        assert!(snap.last_operation.is_some());
        assert!((snap.avg_response_time - 800.0).abs() < 1.0);
    }

    #[test]
    fn test_moving_average_moves_toward_sample() {
        let stats = StorageStats::new();
        stats.record_write(1024, Duration::from_secs(1));
        stats.record_write(9 * 1024, Duration::from_secs(1));

        let snap = stats.snapshot();
        assert_eq!(snap.files_written, 2);
        assert_eq!(snap.bytes_written, 10 * 1024);
        assert!((snap.avg_write_speed - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_counters() {
        let stats = StorageStats::new();
        stats.record_cache_hit(100);
        stats.record_cache_miss(50, Duration::from_millis(10));
        stats.record_file_read();

        let snap = stats.snapshot();
        assert_eq!((snap.cache_hits, snap.cache_misses), (1, 1));
        assert_eq!(snap.bytes_read, 150);
        assert_eq!(snap.files_read, 1);
        assert!(snap.avg_read_speed > 0.0);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let stats = StorageStats::new();
        stats.record_exchange(Duration::from_millis(1), false);
        stats.record_write(10, Duration::from_millis(1));
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(StorageStats::new().snapshot()).unwrap();
        assert!(json.get("cacheHits").is_some());
        assert!(json.get("avgResponseTime").is_some());
    }
}
