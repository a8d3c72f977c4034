//! Multi-resolution time series per (key, metric).
//!
//! Each series is a set of fixed-capacity rings, one per configured tier.
//! The raw tier takes samples as they arrive; coarser tiers consolidate the
//! raw samples of each completed bucket with their declared function, so
//! storage stays bounded whatever the retention horizon.

mod persist;
mod series;
mod tier;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::{LayoutError, StoreConfig};
use crate::key::{DeviceId, Metric, StatsKey};
use crate::snapshot::RateSample;

pub use series::{Placement, Series};
pub use tier::{Point, Tier};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sample for {key} {metric} at {timestamp} is older than the open bucket")]
    StaleSample {
        key: StatsKey,
        metric: Metric,
        timestamp: DateTime<Utc>,
    },
    #[error("no series for {key}")]
    UnknownSeries { key: StatsKey },
    /// Ingestion for a key nobody created a series for; a pipeline defect.
    #[error("series for {key} {metric} was never created")]
    SeriesNotCreated { key: StatsKey, metric: Metric },
    #[error("metric {metric} does not apply to {key}")]
    MetricMismatch { key: StatsKey, metric: Metric },
    #[error("invalid tier layout: {0}")]
    InvalidLayout(#[from] LayoutError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    key: StatsKey,
    metric: Metric,
}

impl SeriesKey {
    fn new(key: &StatsKey, metric: Metric) -> Self {
        Self {
            key: key.clone(),
            metric,
        }
    }
}

type SharedSeries = Arc<RwLock<Series>>;

/// Concurrent store of every series.
///
/// Series live in a sharded map; each one sits behind its own lock so
/// ingestion on one key never waits on another, and a reader always sees a
/// series between two complete writes.
pub struct TimeSeriesStore {
    config: StoreConfig,
    series: DashMap<SeriesKey, SharedSeries>,
}

impl TimeSeriesStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            config,
            series: DashMap::new(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create every metric series for `key`. Returns `true` if any was new.
    pub fn ensure_series(&self, key: &StatsKey) -> bool {
        let mut created = false;
        for metric in Metric::for_kind(key.kind()) {
            self.series.entry(SeriesKey::new(key, *metric)).or_insert_with(|| {
                created = true;
                Arc::new(RwLock::new(Series::new(*metric, &self.config)))
            });
        }
        if created {
            debug!(key = %key, "series created");
        }
        created
    }

    pub fn contains(&self, key: &StatsKey) -> bool {
        Metric::for_kind(key.kind())
            .iter()
            .any(|metric| self.series.contains_key(&SeriesKey::new(key, *metric)))
    }

    fn get(&self, key: &StatsKey, metric: Metric) -> Option<SharedSeries> {
        self.series
            .get(&SeriesKey::new(key, metric))
            .map(|entry| Arc::clone(entry.value()))
    }

    fn lookup(&self, key: &StatsKey, metric: Metric) -> Result<SharedSeries, StoreError> {
        if metric.kind() != key.kind() {
            return Err(StoreError::MetricMismatch {
                key: key.clone(),
                metric,
            });
        }
        self.get(key, metric).ok_or_else(|| StoreError::UnknownSeries { key: key.clone() })
    }

    pub fn ingest(&self, key: &StatsKey, metric: Metric, sample: &Arc<RateSample>) -> Result<(), StoreError> {
        let Some(series) = self.get(key, metric) else {
            error!(key = %key, metric = %metric, "ingest into a series that was never created");
            return Err(StoreError::SeriesNotCreated {
                key: key.clone(),
                metric,
            });
        };

        let mut series = series.write().unwrap_or_else(PoisonError::into_inner);
        match series.record(sample) {
            Ok(Some(Placement::OpenBucket)) => {
                debug!(key = %key, metric = %metric, ts = %sample.timestamp, "late sample folded into open bucket");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(rejected) => {
                debug!(
                    key = %key,
                    metric = %metric,
                    ts = %sample.timestamp,
                    open_since = ?rejected.open_since,
                    "stale sample dropped"
                );
                Err(StoreError::StaleSample {
                    key: key.clone(),
                    metric,
                    timestamp: sample.timestamp,
                })
            }
        }
    }

    /// Ingest one sample into every metric series of `key`.
    pub fn ingest_sample(&self, key: &StatsKey, sample: RateSample) -> Result<(), StoreError> {
        let sample = Arc::new(sample);
        for metric in Metric::for_kind(key.kind()) {
            self.ingest(key, *metric, &sample)?;
        }
        Ok(())
    }

    /// Points in `[from, to]` for one metric, oldest first. An empty vector
    /// means the series exists but holds nothing in range.
    pub fn query(
        &self,
        key: &StatsKey,
        metric: Metric,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        resolution: Option<Duration>,
    ) -> Result<Vec<Point>, StoreError> {
        let series = self.lookup(key, metric)?;
        let series = series.read().unwrap_or_else(PoisonError::into_inner);
        Ok(series.query(from, to, resolution))
    }

    pub fn instant(&self, key: &StatsKey, metric: Metric) -> Result<Option<Arc<RateSample>>, StoreError> {
        let series = self.lookup(key, metric)?;
        let series = series.read().unwrap_or_else(PoisonError::into_inner);
        Ok(series.latest().cloned())
    }

    /// Copy of the points stored in one tier, oldest first.
    pub fn tier_points(&self, key: &StatsKey, metric: Metric, tier: usize) -> Result<Vec<Point>, StoreError> {
        let series = self.lookup(key, metric)?;
        let series = series.read().unwrap_or_else(PoisonError::into_inner);
        Ok(series
            .tiers()
            .get(tier)
            .map(|tier| tier.points().copied().collect())
            .unwrap_or_default())
    }

    /// Every key with at least one series, sorted.
    pub fn keys(&self) -> Vec<StatsKey> {
        let mut keys: Vec<StatsKey> = self.series.iter().map(|entry| entry.key().key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn keys_for_device(&self, device: &DeviceId) -> Vec<StatsKey> {
        let mut keys = self.keys();
        keys.retain(|key| &key.device == device);
        keys
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Consolidation, TierConfig};
    use crate::key::StatsKind;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn store() -> TimeSeriesStore {
        TimeSeriesStore::new(
            StoreConfig::new(vec![
                TierConfig::new(10, 4, Consolidation::Average),
                TierConfig::new(60, 10, Consolidation::Maximum),
            ])
            .expect("valid layout"),
        )
        .expect("store")
    }

    fn sample(secs: i64, rx_bytes: f64) -> RateSample {
        let mut rates = BTreeMap::new();
        rates.insert(Metric::RxBytes, rx_bytes);
        rates.insert(Metric::TxBytes, 0.0);
        RateSample {
            timestamp: at(secs),
            interval_secs: 10.0,
            rates,
            rx_utilization: None,
            tx_utilization: None,
            speed: None,
            reset: false,
        }
    }

    #[test]
    fn ingest_without_series_is_a_defect() {
        let store = store();
        let key = StatsKey::port("s1", 1);
        let err = store
            .ingest(&key, Metric::RxBytes, &Arc::new(sample(10, 1.0)))
            .expect_err("no series");
        assert!(matches!(err, StoreError::SeriesNotCreated { .. }));
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let store = store();
        let key = StatsKey::port("s1", 1);
        assert!(store.ensure_series(&key));
        assert!(!store.ensure_series(&key));

        for i in 1..=9 {
            store.ingest_sample(&key, sample(i * 10, i as f64)).expect("ingest");
        }
        let raw = store.tier_points(&key, Metric::RxBytes, 0).expect("series");
        let values: Vec<f64> = raw.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![6.0, 7.0, 8.0, 9.0]);

        let minute = store.tier_points(&key, Metric::RxBytes, 1).expect("series");
        assert_eq!(minute, vec![Point::new(at(60), 6.0)]);
    }

    #[test]
    fn missing_utilization_leaves_a_gap_but_updates_latest() {
        let store = store();
        let key = StatsKey::port("s1", 1);
        store.ensure_series(&key);
        store.ingest_sample(&key, sample(10, 5.0)).expect("ingest");

        assert!(store
            .tier_points(&key, Metric::RxUtilization, 0)
            .expect("series")
            .is_empty());
        let latest = store.instant(&key, Metric::RxUtilization).expect("series").expect("latest");
        assert_eq!(latest.value(Metric::RxUtilization), None);
        assert_eq!(latest.value(Metric::RxBytes), Some(5.0));
    }

    #[test]
    fn stale_sample_is_reported() {
        let store = store();
        let key = StatsKey::port("s1", 1);
        store.ensure_series(&key);
        for secs in [50, 60, 70] {
            store.ingest_sample(&key, sample(secs, 1.0)).expect("ingest");
        }
        let err = store.ingest_sample(&key, sample(40, 1.0)).expect_err("stale");
        assert!(matches!(err, StoreError::StaleSample { .. }));
    }

    #[test]
    fn queries_distinguish_unknown_from_empty() {
        let store = store();
        let key = StatsKey::port("s1", 1);
        let err = store
            .query(&key, Metric::RxBytes, at(0), at(100), None)
            .expect_err("unknown");
        assert!(matches!(err, StoreError::UnknownSeries { .. }));

        store.ensure_series(&key);
        let points = store.query(&key, Metric::RxBytes, at(0), at(100), None).expect("known");
        assert!(points.is_empty());

        let err = store
            .query(&key, Metric::PacketCount, at(0), at(100), None)
            .expect_err("flow metric on a port");
        assert!(matches!(err, StoreError::MetricMismatch { .. }));
    }

    #[test]
    fn keys_are_listed_once_per_item() {
        let store = store();
        store.ensure_series(&StatsKey::port("s2", 1));
        store.ensure_series(&StatsKey::port("s1", 2));
        store.ensure_series(&StatsKey::flow("s1", "f1"));

        assert_eq!(store.keys().len(), 3);
        assert_eq!(
            store.keys_for_device(&DeviceId::new("s1")),
            vec![StatsKey::port("s1", 2), StatsKey::flow("s1", "f1")]
        );
        let per_port = Metric::for_kind(StatsKind::Port).len();
        let per_flow = Metric::for_kind(StatsKind::Flow).len();
        assert_eq!(store.series_count(), 2 * per_port + per_flow);
        assert_eq!(store.series_count(), 22);
    }
}
