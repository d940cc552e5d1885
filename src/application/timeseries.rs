//! Day-partitioned samples and counters on the shared store.
//!
//! Keys:
//! - `metrics:<name>:<YYYY-MM-DD>` sorted set of samples scored by timestamp
//! - `metrics:current:<name>` latest sample, kept for an hour
//! - `metrics:counter:<name>` integer counter
//!
//! Partitions and counters expire after the retention window.

use crate::application::ports::{Clock, KeyValueStore, KeyValueStoreExt, StoreError};
use crate::domain::sample::MetricSample;
use chrono::{DateTime, Days, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const PREFIX: &str = "metrics:";
const CURRENT_PREFIX: &str = "metrics:current:";
const COUNTER_PREFIX: &str = "metrics:counter:";
const CURRENT_TTL: Duration = Duration::from_secs(3600);

pub const DEFAULT_RETENTION_DAYS: u32 = 7;

pub(crate) fn unix_secs(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

/// Calendar days from `from` to `to`, inclusive.
pub(crate) fn days_between(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> impl Iterator<Item = NaiveDate> {
    let last = to.date_naive();
    from.date_naive().iter_days().take_while(move |day| *day <= last)
}

#[derive(Debug, Clone)]
pub struct TimeSeriesStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
}

impl TimeSeriesStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days.max(1);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 86_400)
    }

    fn partition_key(name: &str, day: NaiveDate) -> String {
        format!("{PREFIX}{name}:{}", day.format("%Y-%m-%d"))
    }

    /// Append a sample stamped with the current time.
    pub fn record(&self, name: &str, data: serde_json::Value) -> Result<MetricSample, StoreError> {
        let now = self.clock.now();
        let sample = MetricSample {
            id: Uuid::new_v4(),
            name: name.to_string(),
            timestamp: unix_secs(now),
            data,
        };
        let encoded = serde_json::to_string(&sample)?;

        self.store.append(
            &Self::partition_key(name, now.date_naive()),
            sample.timestamp,
            encoded.clone(),
            Some(self.retention()),
        )?;
        self.store
            .set_raw(&format!("{CURRENT_PREFIX}{name}"), encoded, Some(CURRENT_TTL))?;
        Ok(sample)
    }

    pub fn increment(&self, name: &str, by: i64) -> Result<i64, StoreError> {
        self.store
            .increment(&format!("{COUNTER_PREFIX}{name}"), by, Some(self.retention()))
    }

    pub fn counter(&self, name: &str) -> Result<i64, StoreError> {
        self.store.counter(&format!("{COUNTER_PREFIX}{name}"))
    }

    /// Latest sample recorded under `name` within the last hour.
    pub fn current(&self, name: &str) -> Result<Option<MetricSample>, StoreError> {
        self.store.load(&format!("{CURRENT_PREFIX}{name}"))
    }

    /// Samples with `from <= timestamp <= to`, oldest first.
    ///
    /// Only the day partitions overlapping the window are read.
    pub fn range(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let (min, max) = (unix_secs(from), unix_secs(to));
        let mut samples = Vec::new();

        for day in days_between(from, to) {
            for raw in self.store.range_by_score(&Self::partition_key(name, day), min, max)? {
                match serde_json::from_str::<MetricSample>(&raw) {
                    Ok(sample) => samples.push(sample),
                    Err(e) => {
                        tracing::warn!(error = %e, metric = %name, "Skipping undecodable sample");
                    }
                }
            }
        }
        Ok(samples)
    }

    /// Samples from the last `minutes` minutes.
    pub fn recent(&self, name: &str, minutes: u32) -> Result<Vec<MetricSample>, StoreError> {
        let now = self.clock.now();
        self.range(name, now - chrono::Duration::minutes(i64::from(minutes)), now)
    }

    /// Delete day partitions older than the retention window.
    ///
    /// Returns how many partitions were removed.
    pub fn cleanup(&self) -> Result<usize, StoreError> {
        let today = self.clock.now().date_naive();
        let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(self.retention_days))) else {
            return Ok(0);
        };

        let mut removed = 0;
        for key in self.store.keys_with_prefix(PREFIX)? {
            if key.starts_with(CURRENT_PREFIX) || key.starts_with(COUNTER_PREFIX) {
                continue;
            }
            let Some((_, date)) = key.rsplit_once(':') else {
                continue;
            };
            let Ok(day) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
                continue;
            };
            if day < cutoff && self.store.remove(&key)? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Removed expired metric partitions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use crate::infrastructure::storage::ShardedStorage;
    use serde_json::json;

    fn series() -> (TimeSeriesStore, Arc<ShardedStorage>, MockClock) {
        let clock = MockClock::default();
        let storage = Arc::new(ShardedStorage::with_clock(Arc::new(clock.clone())));
        let series = TimeSeriesStore::new(storage.clone(), Arc::new(clock.clone()));
        (series, storage, clock)
    }

    #[test]
    fn test_record_and_current() {
        let (series, _, _) = series();
        series.record("request", json!({ "duration": 0.2 })).unwrap();
        let latest = series.record("request", json!({ "duration": 0.4 })).unwrap();

        assert_eq!(series.current("request").unwrap(), Some(latest));
        assert_eq!(series.current("error").unwrap(), None);
    }

    #[test]
    fn test_range_spans_midnight() {
        let (series, _, clock) = series();
        let start = clock.now();
        clock.advance(Duration::from_secs(11 * 3600 + 59 * 60));
        series.record("request", json!({ "n": 1 })).unwrap();
        clock.advance(Duration::from_secs(2 * 60));
        series.record("request", json!({ "n": 2 })).unwrap();

        let all = series.range("request", start, clock.now()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].data["n"], 1);

        let last_minute = series.recent("request", 1).unwrap();
        assert_eq!(last_minute.len(), 1);
        assert_eq!(last_minute[0].data["n"], 2);
    }

    #[test]
    fn test_range_reads_only_overlapping_partitions() {
        let (series, storage, clock) = series();
        let now = clock.now();
        // A stray sample in yesterday's partition but scored inside the window
        storage
            .append(
                &TimeSeriesStore::partition_key("request", now.date_naive() - Days::new(1)),
                unix_secs(now),
                serde_json::to_string(&MetricSample {
                    id: Uuid::new_v4(),
                    name: "request".into(),
                    timestamp: unix_secs(now),
                    data: json!({}),
                })
                .unwrap(),
                None,
            )
            .unwrap();

        assert!(series.recent("request", 5).unwrap().is_empty());
    }

    #[test]
    fn test_identical_samples_at_same_instant_are_kept() {
        let (series, _, _) = series();
        for _ in 0..5 {
            series.record("request", json!({ "duration": 0.02, "status_code": 200 })).unwrap();
        }

        assert_eq!(series.recent("request", 1).unwrap().len(), 5);
    }

    #[test]
    fn test_counters() {
        let (series, _, _) = series();
        assert_eq!(series.counter("request_total").unwrap(), 0);
        series.increment("request_total", 1).unwrap();
        assert_eq!(series.increment("request_total", 2).unwrap(), 3);
    }

    #[test]
    fn test_cleanup_drops_old_partitions() {
        let (series, storage, clock) = series();
        series.record("request", json!({})).unwrap();
        series.increment("request_total", 1).unwrap();

        let today = clock.now().date_naive();
        let stale = TimeSeriesStore::partition_key("request", today - Days::new(30));
        storage.append(&stale, 0.0, "{}".into(), None).unwrap();

        assert_eq!(series.cleanup().unwrap(), 1);
        assert!(storage.range_by_score(&stale, f64::MIN, f64::MAX).unwrap().is_empty());
        assert_eq!(series.recent("request", 1).unwrap().len(), 1);
        assert_eq!(series.counter("request_total").unwrap(), 1);
    }
}
