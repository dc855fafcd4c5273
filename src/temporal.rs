//! # Temporal Store
//!
//! In-process time-series buffers backing the temporal condition functions
//! (`recent_avg`, `sustained_above`, `ttl_fact`, ...).
//!
//! Each string key owns a bounded, time-ordered sequence of
//! `(timestamp_ms, value)` samples. Bounds are a retention horizon (samples
//! older than the horizon are dropped relative to the newest sample) and a
//! per-key count cap. A separate table holds single-value TTL facts with an
//! explicit expiration.
//!
//! The store is the engine's only shared mutable resource: `record` takes
//! the write lock, aggregations take the read lock. All timestamps are Unix
//! milliseconds; callers pass the `now` frozen at the start of their
//! `reason` call so every temporal function in one evaluation observes the
//! same instant.

use crate::value::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Retention and capacity bounds for the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
    /// Samples older than this horizon (relative to the newest sample in
    /// the same series) are evicted. Milliseconds.
    pub retention_ms: i64,

    /// Hard cap on samples per key; the oldest are evicted first.
    pub max_samples_per_key: usize,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        TemporalConfig {
            retention_ms: 24 * 60 * 60 * 1000,
            max_samples_per_key: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct Series {
    samples: VecDeque<(i64, f64)>,
}

impl Series {
    /// Insert keeping time order; out-of-order arrivals are placed by
    /// timestamp rather than rejected.
    fn insert(&mut self, at_ms: i64, value: f64) {
        match self.samples.back() {
            Some(&(last, _)) if last > at_ms => {
                let idx = self.samples.partition_point(|&(t, _)| t <= at_ms);
                self.samples.insert(idx, (at_ms, value));
            }
            _ => self.samples.push_back((at_ms, value)),
        }
    }

    fn evict(&mut self, retention_ms: i64, cap: usize) {
        if let Some(&(newest, _)) = self.samples.back() {
            let horizon = newest.saturating_sub(retention_ms);
            while matches!(self.samples.front(), Some(&(t, _)) if t < horizon) {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > cap {
            self.samples.pop_front();
        }
    }

    /// Samples with `now - window <= t <= now`.
    fn window(&self, window_ms: i64, now_ms: i64) -> impl Iterator<Item = (i64, f64)> + '_ {
        let start = now_ms.saturating_sub(window_ms);
        self.samples
            .iter()
            .copied()
            .filter(move |&(t, _)| t >= start && t <= now_ms)
    }
}

#[derive(Debug, Clone)]
struct TtlEntry {
    value: Value,
    expires_at_ms: i64,
}

/// Keyed in-memory time-series store with TTL facts.
#[derive(Debug, Default)]
pub struct TemporalStore {
    config: TemporalConfig,
    series: RwLock<HashMap<String, Series>>,
    ttl_facts: RwLock<HashMap<String, TtlEntry>>,
}

impl TemporalStore {
    pub fn new(config: TemporalConfig) -> Self {
        TemporalStore {
            config,
            series: RwLock::new(HashMap::new()),
            ttl_facts: RwLock::new(HashMap::new()),
        }
    }

    /// Append a sample for `key` at the given timestamp, then evict
    /// anything past the retention horizon or the count cap.
    pub fn record(&self, key: &str, value: f64, at_ms: i64) {
        let mut series = self.series.write();
        let entry = series.entry(key.to_string()).or_default();
        entry.insert(at_ms, value);
        entry.evict(self.config.retention_ms, self.config.max_samples_per_key);
    }

    /// Number of samples in the window. Zero for an unknown key.
    pub fn recent_count(&self, key: &str, window_ms: i64, now_ms: i64) -> usize {
        let series = self.series.read();
        series
            .get(key)
            .map_or(0, |s| s.window(window_ms, now_ms).count())
    }

    /// Arithmetic mean over the window; `None` when the window is empty so
    /// callers can distinguish "no data" from "data equals 0".
    pub fn recent_avg(&self, key: &str, window_ms: i64, now_ms: i64) -> Option<f64> {
        let series = self.series.read();
        let s = series.get(key)?;
        let mut sum = 0.0;
        let mut count = 0usize;
        for (_, v) in s.window(window_ms, now_ms) {
            sum += v;
            count += 1;
        }
        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }

    pub fn recent_max(&self, key: &str, window_ms: i64, now_ms: i64) -> Option<f64> {
        let series = self.series.read();
        series
            .get(key)?
            .window(window_ms, now_ms)
            .map(|(_, v)| v)
            .fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            })
    }

    pub fn recent_min(&self, key: &str, window_ms: i64, now_ms: i64) -> Option<f64> {
        let series = self.series.read();
        series
            .get(key)?
            .window(window_ms, now_ms)
            .map(|(_, v)| v)
            .fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.min(v)))
            })
    }

    /// True iff the window is non-empty, every sample in it is strictly
    /// above `threshold`, and the samples actually span the window (the
    /// earliest one is at or before `now - window`).
    pub fn sustained_above(
        &self,
        key: &str,
        threshold: f64,
        window_ms: i64,
        now_ms: i64,
    ) -> bool {
        self.sustained(key, window_ms, now_ms, |v| v > threshold)
    }

    /// Dual of [`sustained_above`](Self::sustained_above).
    pub fn sustained_below(
        &self,
        key: &str,
        threshold: f64,
        window_ms: i64,
        now_ms: i64,
    ) -> bool {
        self.sustained(key, window_ms, now_ms, |v| v < threshold)
    }

    fn sustained(
        &self,
        key: &str,
        window_ms: i64,
        now_ms: i64,
        satisfies: impl Fn(f64) -> bool,
    ) -> bool {
        let series = self.series.read();
        let Some(s) = series.get(key) else {
            return false;
        };
        let mut first_ts: Option<i64> = None;
        for (t, v) in s.window(window_ms, now_ms) {
            if !satisfies(v) {
                return false;
            }
            if first_ts.is_none() {
                first_ts = Some(t);
            }
        }
        match first_ts {
            None => false,
            Some(first) => first <= now_ms.saturating_sub(window_ms),
        }
    }

    /// Store a single-value fact that expires `ttl_ms` after `now_ms`.
    pub fn set_ttl_fact(&self, key: &str, value: Value, ttl_ms: i64, now_ms: i64) {
        let mut facts = self.ttl_facts.write();
        facts.insert(
            key.to_string(),
            TtlEntry {
                value,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
            },
        );
    }

    /// The fact's value, or `Null` when missing or expired.
    pub fn ttl_fact(&self, key: &str, now_ms: i64) -> Value {
        let facts = self.ttl_facts.read();
        match facts.get(key) {
            Some(entry) if now_ms < entry.expires_at_ms => entry.value.clone(),
            _ => Value::Null,
        }
    }

    pub fn has_ttl_fact(&self, key: &str, now_ms: i64) -> bool {
        let facts = self.ttl_facts.read();
        matches!(facts.get(key), Some(entry) if now_ms < entry.expires_at_ms)
    }

    /// Number of live series (test and introspection helper).
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    pub fn sample_count(&self, key: &str) -> usize {
        self.series.read().get(key).map_or(0, |s| s.samples.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TemporalStore {
        TemporalStore::new(TemporalConfig::default())
    }

    #[test]
    fn test_recent_count_matches_window() {
        let s = store();
        let now = 1_700_000_000_000;
        for i in 0..10 {
            s.record("cpu", 50.0, now - i * 1_000);
        }
        assert_eq!(s.recent_count("cpu", 5_000, now), 6); // t in [now-5s, now]
        assert_eq!(s.recent_count("cpu", 100_000, now), 10);
        assert_eq!(s.recent_count("cpu", 0, now), 1);
        assert_eq!(s.recent_count("missing", 5_000, now), 0);
    }

    #[test]
    fn test_recent_avg_empty_window_is_none() {
        let s = store();
        let now = 1_700_000_000_000;
        assert_eq!(s.recent_avg("cpu", 1_000, now), None);

        s.record("cpu", 0.0, now - 10_000);
        // Sample exists but falls outside the window
        assert_eq!(s.recent_avg("cpu", 1_000, now), None);
        assert_eq!(s.recent_avg("cpu", 60_000, now), Some(0.0));
    }

    #[test]
    fn test_recent_aggregates() {
        let s = store();
        let now = 1_700_000_000_000;
        for (i, v) in [10.0, 20.0, 30.0].iter().enumerate() {
            s.record("load", *v, now - (i as i64) * 1_000);
        }
        assert_eq!(s.recent_avg("load", 10_000, now), Some(20.0));
        assert_eq!(s.recent_max("load", 10_000, now), Some(30.0));
        assert_eq!(s.recent_min("load", 10_000, now), Some(10.0));
    }

    #[test]
    fn test_sustained_above_requires_full_span() {
        let s = store();
        let now = 1_700_000_000_000;

        // 20 samples at 95, spaced 30s apart: spans 570s, all above 90
        for i in 0..20 {
            s.record("cpu", 95.0, now - i * 30_000);
        }
        // Oldest sample is at now - 570s, which does not cover a 600s window
        assert!(!s.sustained_above("cpu", 90.0, 600_000, now));
        // It does cover 570s
        assert!(s.sustained_above("cpu", 90.0, 570_000, now));
    }

    #[test]
    fn test_sustained_above_rejects_dip() {
        let s = store();
        let now = 1_700_000_000_000;
        for i in 0..5 {
            s.record("cpu", 95.0, now - i * 1_000);
        }
        s.record("cpu", 80.0, now - 2_500);
        assert!(!s.sustained_above("cpu", 90.0, 4_000, now));
        assert!(s.sustained_below("cpu", 100.0, 4_000, now));
    }

    #[test]
    fn test_sustained_empty_window_is_false() {
        let s = store();
        assert!(!s.sustained_above("cpu", 0.0, 1_000, 1_700_000_000_000));
    }

    #[test]
    fn test_count_cap_evicts_oldest() {
        let s = TemporalStore::new(TemporalConfig {
            retention_ms: i64::MAX / 2,
            max_samples_per_key: 3,
        });
        let now = 1_700_000_000_000;
        for i in 0..5 {
            s.record("k", i as f64, now + i * 1_000);
        }
        assert_eq!(s.sample_count("k"), 3);
        // Oldest two (values 0, 1) are gone
        assert_eq!(s.recent_min("k", i64::MAX / 2, now + 10_000), Some(2.0));
    }

    #[test]
    fn test_retention_horizon_evicts() {
        let s = TemporalStore::new(TemporalConfig {
            retention_ms: 10_000,
            max_samples_per_key: 10_000,
        });
        let now = 1_700_000_000_000;
        s.record("k", 1.0, now - 60_000);
        s.record("k", 2.0, now);
        assert_eq!(s.sample_count("k"), 1);
    }

    #[test]
    fn test_out_of_order_record_keeps_time_order() {
        let s = store();
        let now = 1_700_000_000_000;
        s.record("k", 2.0, now);
        s.record("k", 1.0, now - 5_000);
        assert_eq!(s.recent_count("k", 10_000, now), 2);
        // min over the trailing 1s window only sees the newest sample
        assert_eq!(s.recent_min("k", 1_000, now), Some(2.0));
    }

    #[test]
    fn test_ttl_fact_lifecycle() {
        let s = store();
        let now = 1_700_000_000_000;
        s.set_ttl_fact("deploy_freeze", Value::Bool(true), 60_000, now);

        assert!(s.has_ttl_fact("deploy_freeze", now));
        assert_eq!(s.ttl_fact("deploy_freeze", now + 59_999), Value::Bool(true));

        // Expired exactly at the deadline
        assert!(!s.has_ttl_fact("deploy_freeze", now + 60_000));
        assert_eq!(s.ttl_fact("deploy_freeze", now + 60_000), Value::Null);
        assert_eq!(s.ttl_fact("never_set", now), Value::Null);
    }
}
