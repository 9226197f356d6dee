//! Metrics aggregation and statistics.
//!
//! Observations stream in concurrently from every virtual user and land in
//! per-series state keyed by `(metric name, tag set)`. The hot path takes the
//! registry read lock plus one per-series mutex, so writers to different
//! series never contend on a single global lock. A [`Snapshot`] taken after
//! all units have exited reflects every recorded observation exactly once.
//!
//! Duration distributions use an hdrhistogram with 3 significant digits over
//! whole microseconds; percentiles come from `value_at_percentile` and are
//! reported in milliseconds. Given the same multiset of samples the result is
//! identical regardless of recording order, since histogram merge is bucket
//! addition.

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Tag set attached to a series, ordered for stable keys and output.
pub type Tags = BTreeMap<String, String>;

/// Build a single-tag set, the common case.
pub fn tag(key: &str, value: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(key.to_string(), value.to_string());
    tags
}

/// Metric families supported by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Rate,
    Duration,
}

/// Identity of one series: metric name plus tag set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: String,
    pub tags: Tags,
}

impl SeriesKey {
    pub fn new(name: impl Into<String>, tags: Tags) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.tags.is_empty() {
            let inner: Vec<String> = self
                .tags
                .iter()
                .map(|(k, v)| format!("{}:{}", k, v))
                .collect();
            write!(f, "{{{}}}", inner.join(","))?;
        }
        Ok(())
    }
}

/// One raw sample emitted by a scenario step, consumed by [`MetricsAggregator::record`].
#[derive(Debug, Clone)]
pub struct Observation {
    pub name: String,
    pub tags: Tags,
    pub value: ObservedValue,
}

#[derive(Debug, Clone, Copy)]
pub enum ObservedValue {
    Count(f64),
    Flag(bool),
    Elapsed(Duration),
}

impl Observation {
    pub fn counter(name: impl Into<String>, tags: Tags, value: f64) -> Self {
        Self {
            name: name.into(),
            tags,
            value: ObservedValue::Count(value),
        }
    }

    /// Rate sample; `true` counts toward the tracked fraction.
    pub fn rate(name: impl Into<String>, tags: Tags, flag: bool) -> Self {
        Self {
            name: name.into(),
            tags,
            value: ObservedValue::Flag(flag),
        }
    }

    pub fn duration(name: impl Into<String>, tags: Tags, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            tags,
            value: ObservedValue::Elapsed(elapsed),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self.value {
            ObservedValue::Count(_) => MetricKind::Counter,
            ObservedValue::Flag(_) => MetricKind::Rate,
            ObservedValue::Elapsed(_) => MetricKind::Duration,
        }
    }
}

/// Mutable per-series state, owned by the aggregator.
enum SeriesData {
    Counter {
        count: u64,
        sum: f64,
    },
    Rate {
        trues: u64,
        total: u64,
    },
    Duration {
        histogram: Histogram<u64>,
        sum_us: u64,
    },
}

impl SeriesData {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => SeriesData::Counter { count: 0, sum: 0.0 },
            MetricKind::Rate => SeriesData::Rate { trues: 0, total: 0 },
            MetricKind::Duration => SeriesData::Duration {
                histogram: Histogram::new(3).expect("Failed to create histogram"),
                sum_us: 0,
            },
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            SeriesData::Counter { .. } => MetricKind::Counter,
            SeriesData::Rate { .. } => MetricKind::Rate,
            SeriesData::Duration { .. } => MetricKind::Duration,
        }
    }

    fn record(&mut self, value: ObservedValue) -> bool {
        match (self, value) {
            (SeriesData::Counter { count, sum }, ObservedValue::Count(v)) => {
                *count += 1;
                *sum += v;
                true
            }
            (SeriesData::Rate { trues, total }, ObservedValue::Flag(flag)) => {
                *total += 1;
                if flag {
                    *trues += 1;
                }
                true
            }
            (SeriesData::Duration { histogram, sum_us }, ObservedValue::Elapsed(elapsed)) => {
                let us = elapsed.as_micros() as u64;
                histogram.record(us).ok();
                *sum_us += us;
                true
            }
            _ => false,
        }
    }

    fn snapshot(&self) -> SeriesSnapshot {
        match self {
            SeriesData::Counter { count, sum } => SeriesSnapshot::Counter {
                count: *count,
                sum: *sum,
            },
            SeriesData::Rate { trues, total } => SeriesSnapshot::Rate {
                trues: *trues,
                total: *total,
            },
            SeriesData::Duration { histogram, sum_us } => SeriesSnapshot::Duration {
                histogram: histogram.clone(),
                sum_us: *sum_us,
            },
        }
    }
}

/// Concurrent-safe collector of counters, rates and duration distributions.
pub struct MetricsAggregator {
    series: RwLock<HashMap<SeriesKey, Arc<Mutex<SeriesData>>>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Record one observation. Safe to call concurrently from any task.
    pub fn record(&self, observation: Observation) {
        let kind = observation.kind();
        let Observation { name, tags, value } = observation;
        let key = SeriesKey::new(name, tags);

        let slot = {
            let map = self.series.read();
            map.get(&key).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut map = self.series.write();
                map.entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(SeriesData::empty(kind))))
                    .clone()
            }
        };

        let mut data = slot.lock();
        if !data.record(value) {
            tracing::warn!(
                series = %key,
                expected = ?data.kind(),
                got = ?kind,
                "dropping observation with mismatched metric kind"
            );
        }
    }

    /// Point-in-time, internally consistent copy of every series.
    ///
    /// `elapsed` is the wall time the samples were collected over; it feeds
    /// per-second rate aggregates for counter series.
    pub fn snapshot(&self, elapsed: Duration) -> Snapshot {
        let map = self.series.read();
        let series = map
            .iter()
            .map(|(key, slot)| (key.clone(), slot.lock().snapshot()))
            .collect();
        Snapshot { elapsed, series }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of one series at snapshot time.
#[derive(Debug, Clone)]
pub enum SeriesSnapshot {
    Counter {
        count: u64,
        sum: f64,
    },
    Rate {
        trues: u64,
        total: u64,
    },
    Duration {
        histogram: Histogram<u64>,
        sum_us: u64,
    },
}

impl SeriesSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            SeriesSnapshot::Counter { .. } => MetricKind::Counter,
            SeriesSnapshot::Rate { .. } => MetricKind::Rate,
            SeriesSnapshot::Duration { .. } => MetricKind::Duration,
        }
    }

    /// Number of recorded samples.
    pub fn count(&self) -> u64 {
        match self {
            SeriesSnapshot::Counter { count, .. } => *count,
            SeriesSnapshot::Rate { total, .. } => *total,
            SeriesSnapshot::Duration { histogram, .. } => histogram.len(),
        }
    }

    /// Fraction of `true` samples in a rate series.
    pub fn rate_fraction(&self) -> Option<f64> {
        match self {
            SeriesSnapshot::Rate { trues, total } if *total > 0 => {
                Some(*trues as f64 / *total as f64)
            }
            SeriesSnapshot::Rate { .. } => Some(0.0),
            _ => None,
        }
    }

    /// Number of `true` samples in a rate series.
    pub fn true_count(&self) -> Option<u64> {
        match self {
            SeriesSnapshot::Rate { trues, .. } => Some(*trues),
            _ => None,
        }
    }

    /// Samples per second over the collection window.
    pub fn per_second(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.count() as f64 / secs
        } else {
            0.0
        }
    }

    /// Mean value: duration series in milliseconds, counter series as sum/count.
    pub fn mean(&self) -> Option<f64> {
        match self {
            SeriesSnapshot::Counter { count, sum } if *count > 0 => Some(*sum / *count as f64),
            SeriesSnapshot::Duration { histogram, sum_us } if histogram.len() > 0 => {
                Some(*sum_us as f64 / histogram.len() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Percentile of a duration series, in milliseconds.
    pub fn percentile_ms(&self, percentile: f64) -> Option<f64> {
        match self {
            SeriesSnapshot::Duration { histogram, .. } if histogram.len() > 0 => {
                Some(histogram.value_at_percentile(percentile) as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Smallest recorded duration, in milliseconds.
    pub fn min_ms(&self) -> Option<f64> {
        match self {
            SeriesSnapshot::Duration { histogram, .. } if histogram.len() > 0 => {
                Some(histogram.min() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Largest recorded duration, in milliseconds.
    pub fn max_ms(&self) -> Option<f64> {
        match self {
            SeriesSnapshot::Duration { histogram, .. } if histogram.len() > 0 => {
                Some(histogram.max() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    fn merge(&mut self, other: &SeriesSnapshot) -> Result<(), String> {
        match (self, other) {
            (
                SeriesSnapshot::Counter { count, sum },
                SeriesSnapshot::Counter {
                    count: c2,
                    sum: s2,
                },
            ) => {
                *count += c2;
                *sum += s2;
                Ok(())
            }
            (
                SeriesSnapshot::Rate { trues, total },
                SeriesSnapshot::Rate {
                    trues: t2,
                    total: n2,
                },
            ) => {
                *trues += t2;
                *total += n2;
                Ok(())
            }
            (
                SeriesSnapshot::Duration { histogram, sum_us },
                SeriesSnapshot::Duration {
                    histogram: h2,
                    sum_us: s2,
                },
            ) => {
                histogram
                    .add(h2)
                    .map_err(|e| format!("histogram merge failed: {}", e))?;
                *sum_us += s2;
                Ok(())
            }
            (a, b) => Err(format!(
                "cannot merge series of kind {:?} with {:?}",
                a.kind(),
                b.kind()
            )),
        }
    }
}

/// Point-in-time view of all series, sufficient for threshold evaluation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    elapsed: Duration,
    series: BTreeMap<SeriesKey, SeriesSnapshot>,
}

impl Snapshot {
    /// Wall time the samples were collected over.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn series(&self) -> impl Iterator<Item = (&SeriesKey, &SeriesSnapshot)> {
        self.series.iter()
    }

    pub fn get(&self, name: &str, tags: &Tags) -> Option<&SeriesSnapshot> {
        self.series.get(&SeriesKey {
            name: name.to_string(),
            tags: tags.clone(),
        })
    }

    /// Merge every series with the given metric name whose tag set passes the
    /// filter. Returns `Ok(None)` when nothing matched.
    pub fn merge_matching<F>(
        &self,
        name: &str,
        mut tag_filter: F,
    ) -> Result<Option<SeriesSnapshot>, String>
    where
        F: FnMut(&Tags) -> bool,
    {
        let mut merged: Option<SeriesSnapshot> = None;
        for (key, data) in &self.series {
            if key.name != name || !tag_filter(&key.tags) {
                continue;
            }
            match &mut merged {
                None => merged = Some(data.clone()),
                Some(acc) => acc.merge(data)?,
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_counter_count_and_sum() {
        let agg = MetricsAggregator::new();
        agg.record(Observation::counter("http_reqs", Tags::new(), 1.0));
        agg.record(Observation::counter("http_reqs", Tags::new(), 1.0));
        agg.record(Observation::counter("http_reqs", Tags::new(), 3.0));

        let snap = agg.snapshot(Duration::from_secs(10));
        let series = snap.get("http_reqs", &Tags::new()).unwrap();
        assert_eq!(series.count(), 3);
        assert_eq!(series.per_second(snap.elapsed()), 0.3);
    }

    #[test]
    fn test_rate_fraction() {
        let agg = MetricsAggregator::new();
        for _ in 0..499 {
            agg.record(Observation::rate("errors", Tags::new(), false));
        }
        agg.record(Observation::rate("errors", Tags::new(), true));

        let snap = agg.snapshot(ms(1));
        let series = snap.get("errors", &Tags::new()).unwrap();
        assert_eq!(series.count(), 500);
        assert_eq!(series.rate_fraction(), Some(0.002));
    }

    #[test]
    fn test_percentile_deterministic_and_idempotent() {
        let agg = MetricsAggregator::new();
        for v in 1..=1000u64 {
            agg.record(Observation::duration("http_req_duration", Tags::new(), ms(v)));
        }

        let snap = agg.snapshot(ms(1));
        let series = snap.get("http_req_duration", &Tags::new()).unwrap();
        let first = series.percentile_ms(99.0).unwrap();
        let second = series.percentile_ms(99.0).unwrap();
        assert_eq!(first, second);
        // 990th of 1000 uniform 1..=1000ms samples, within histogram precision.
        assert!((first - 990.0).abs() < 2.0, "p99 was {}", first);
    }

    #[test]
    fn test_snapshot_order_independent() {
        let values: Vec<u64> = (1..=200).collect();

        let forward = MetricsAggregator::new();
        for &v in &values {
            forward.record(Observation::duration("d", Tags::new(), ms(v)));
            forward.record(Observation::rate("r", Tags::new(), v % 7 == 0));
        }

        let reversed = MetricsAggregator::new();
        for &v in values.iter().rev() {
            reversed.record(Observation::rate("r", Tags::new(), v % 7 == 0));
            reversed.record(Observation::duration("d", Tags::new(), ms(v)));
        }

        let a = forward.snapshot(ms(5));
        let b = reversed.snapshot(ms(5));
        let (da, db) = (
            a.get("d", &Tags::new()).unwrap(),
            b.get("d", &Tags::new()).unwrap(),
        );
        assert_eq!(da.count(), db.count());
        for p in [50.0, 95.0, 99.0] {
            assert_eq!(da.percentile_ms(p), db.percentile_ms(p));
        }
        assert_eq!(da.mean(), db.mean());
        assert_eq!(
            a.get("r", &Tags::new()).unwrap().rate_fraction(),
            b.get("r", &Tags::new()).unwrap().rate_fraction()
        );
    }

    #[test]
    fn test_concurrent_record_loses_nothing() {
        let agg = std::sync::Arc::new(MetricsAggregator::new());
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let agg = agg.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u64 {
                    agg.record(Observation::counter("iterations", Tags::new(), 1.0));
                    agg.record(Observation::duration(
                        "http_req_duration",
                        tag("name", "health"),
                        ms(worker * 1000 + i + 1),
                    ));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = agg.snapshot(ms(1));
        assert_eq!(snap.get("iterations", &Tags::new()).unwrap().count(), 8000);
        assert_eq!(
            snap.get("http_req_duration", &tag("name", "health"))
                .unwrap()
                .count(),
            8000
        );
    }

    #[test]
    fn test_merge_matching_with_tag_exclusion() {
        let agg = MetricsAggregator::new();
        for _ in 0..10 {
            agg.record(Observation::rate(
                "http_req_failed",
                tag("name", "health"),
                false,
            ));
        }
        for _ in 0..10 {
            agg.record(Observation::rate(
                "http_req_failed",
                tag("name", "setup_create_team"),
                true,
            ));
        }

        let snap = agg.snapshot(ms(1));

        let all = snap
            .merge_matching("http_req_failed", |_| true)
            .unwrap()
            .unwrap();
        assert_eq!(all.count(), 20);
        assert_eq!(all.rate_fraction(), Some(0.5));

        let filtered = snap
            .merge_matching("http_req_failed", |tags| {
                tags.get("name").map(String::as_str) != Some("setup_create_team")
            })
            .unwrap()
            .unwrap();
        assert_eq!(filtered.count(), 10);
        assert_eq!(filtered.rate_fraction(), Some(0.0));
    }

    #[test]
    fn test_merge_matching_no_samples() {
        let snap = MetricsAggregator::new().snapshot(ms(1));
        assert!(snap.merge_matching("missing", |_| true).unwrap().is_none());
    }

    #[test]
    fn test_kind_mismatch_dropped() {
        let agg = MetricsAggregator::new();
        agg.record(Observation::counter("m", Tags::new(), 1.0));
        agg.record(Observation::rate("m", Tags::new(), true));

        let snap = agg.snapshot(ms(1));
        let series = snap.get("m", &Tags::new()).unwrap();
        assert_eq!(series.kind(), MetricKind::Counter);
        assert_eq!(series.count(), 1);
    }

    #[test]
    fn test_series_key_display() {
        assert_eq!(SeriesKey::new("errors", Tags::new()).to_string(), "errors");
        assert_eq!(
            SeriesKey::new("http_req_failed", tag("name", "health")).to_string(),
            "http_req_failed{name:health}"
        );
    }
}
