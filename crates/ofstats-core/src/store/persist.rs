use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Consolidation, StoreConfig};
use crate::key::{ItemKey, Metric, StatsKey};
use crate::snapshot::RateSample;

use super::series::Series;
use super::tier::{Bucket, Point, Tier};
use super::{SeriesKey, StoreError, TimeSeriesStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TierRecord {
    pub spacing_secs: u64,
    pub capacity: usize,
    pub consolidation: Consolidation,
    pub cursor: usize,
    pub points: Vec<Point>,
    #[serde(default)]
    pub open: Option<Bucket>,
    #[serde(default)]
    pub closed_through: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeriesRecord {
    key: StatsKey,
    metric: Metric,
    tiers: Vec<TierRecord>,
    #[serde(default)]
    latest: Option<RateSample>,
}

impl TimeSeriesStore {
    /// Write every series to `<dir>/<ports|flows>/<device>/<item>/<metric>.json`.
    /// Each file is replaced atomically. Returns the number of files written.
    pub fn save(&self, dir: &Path) -> Result<usize, StoreError> {
        let entries: Vec<(SeriesKey, Arc<RwLock<Series>>)> = self
            .series
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (id, series) in &entries {
            let record = {
                let series = series.read().unwrap_or_else(PoisonError::into_inner);
                SeriesRecord {
                    key: id.key.clone(),
                    metric: id.metric,
                    tiers: series.tiers().iter().map(Tier::to_record).collect(),
                    latest: series.latest().map(|sample| sample.as_ref().clone()),
                }
            };
            let path = series_path(dir, &id.key, id.metric);
            write_atomic(&path, &serde_json::to_vec(&record)?)?;
        }

        debug!(dir = %dir.display(), series = entries.len(), "store saved");
        Ok(entries.len())
    }

    /// Rebuild a store from `dir` under the given layout. A missing directory
    /// yields an empty store; unreadable records are skipped.
    pub fn load(dir: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(config)?;

        let mut files = Vec::new();
        for kind_dir in ["ports", "flows"] {
            collect_json(&dir.join(kind_dir), &mut files)?;
        }

        let series = DashMap::new();
        for path in files {
            let record: SeriesRecord = match fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
            {
                Ok(record) => record,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable series record");
                    continue;
                }
            };
            if record.metric.kind() != record.key.kind() {
                warn!(path = %path.display(), "skipping series record with mismatched metric");
                continue;
            }

            let mut stored = record.tiers;
            let tiers = store
                .config
                .tiers
                .iter()
                .map(|tier| match stored.iter().position(|r| r.spacing_secs == tier.spacing_secs) {
                    Some(idx) => Tier::from_record(*tier, stored.swap_remove(idx)),
                    None => Tier::new(*tier),
                })
                .collect();
            if !stored.is_empty() {
                warn!(
                    key = %record.key,
                    metric = %record.metric,
                    dropped = stored.len(),
                    "stored tiers no longer in the layout were dropped"
                );
            }

            let restored = Series::from_parts(record.metric, tiers, record.latest.map(Arc::new));
            series.insert(
                SeriesKey {
                    key: record.key,
                    metric: record.metric,
                },
                Arc::new(RwLock::new(restored)),
            );
        }

        info!(dir = %dir.display(), series = series.len(), "store loaded");
        Ok(Self {
            config: store.config,
            series,
        })
    }
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

fn series_path(dir: &Path, key: &StatsKey, metric: Metric) -> PathBuf {
    let item = match &key.item {
        ItemKey::Port(no) => no.to_string(),
        ItemKey::Flow(id) => sanitize(id.as_str()),
    };
    dir.join(key.kind().dir_name())
        .join(sanitize(key.device.as_str()))
        .join(item)
        .join(format!("{}.json", metric.as_str()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn collect_json(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_json(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::env;
    use std::time::SystemTime;

    fn make_temp_dir(name: &str) -> PathBuf {
        let mut path = env::temp_dir();
        let uniq = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("unix epoch")
            .as_nanos();
        path.push(format!("ofstats-store-{name}-{uniq}"));
        path
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn layout(raw_capacity: usize) -> StoreConfig {
        StoreConfig::new(vec![
            TierConfig::new(10, raw_capacity, Consolidation::Average),
            TierConfig::new(60, 10, Consolidation::Average),
        ])
        .expect("valid layout")
    }

    fn flow_sample(secs: i64, bytes: f64) -> RateSample {
        let mut rates = BTreeMap::new();
        rates.insert(Metric::ByteCount, bytes);
        rates.insert(Metric::PacketCount, bytes / 100.0);
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
    fn missing_directory_loads_empty() {
        let dir = make_temp_dir("missing");
        let store = TimeSeriesStore::load(&dir, layout(6)).expect("load");
        assert_eq!(store.series_count(), 0);
    }

    #[test]
    fn saved_store_restores_points_open_bucket_and_latest() {
        let dir = make_temp_dir("round-trip");
        let key = StatsKey::flow("00:00:00:00:00:00:00:01", "cookie/7");

        let store = TimeSeriesStore::new(layout(6)).expect("store");
        store.ensure_series(&key);
        for secs in (10..=90).step_by(10) {
            store.ingest_sample(&key, flow_sample(secs, secs as f64)).expect("ingest");
        }
        assert_eq!(store.save(&dir).expect("save"), 2);
        assert!(dir.join("flows/00_00_00_00_00_00_00_01/cookie_7/byte_count.json").exists());

        let restored = TimeSeriesStore::load(&dir, layout(6)).expect("load");
        assert!(restored.contains(&key));
        assert_eq!(
            restored.tier_points(&key, Metric::ByteCount, 0).expect("series"),
            store.tier_points(&key, Metric::ByteCount, 0).expect("series")
        );
        let latest = restored.instant(&key, Metric::ByteCount).expect("series").expect("latest");
        assert_eq!(latest.timestamp, at(90));

        // The open (60, 120] bucket survived: closing it averages 70, 80, 90 and 120.
        restored.ingest_sample(&key, flow_sample(120, 120.0)).expect("ingest");
        let minute = restored.tier_points(&key, Metric::ByteCount, 1).expect("series");
        assert_eq!(minute.last(), Some(&Point::new(at(120), 90.0)));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn layout_change_keeps_what_still_fits() {
        let dir = make_temp_dir("relayout");
        let key = StatsKey::port("s1", 3);

        let store = TimeSeriesStore::new(layout(6)).expect("store");
        store.ensure_series(&key);
        let series = store.get(&key, Metric::RxBytes).expect("series");
        for secs in (10..=60).step_by(10) {
            series
                .write()
                .expect("lock")
                .insert(at(secs), secs as f64)
                .expect("in order");
        }
        store.save(&dir).expect("save");

        let smaller = StoreConfig::new(vec![
            TierConfig::new(10, 3, Consolidation::Average),
            TierConfig::new(300, 10, Consolidation::Average),
        ])
        .expect("valid layout");
        let restored = TimeSeriesStore::load(&dir, smaller).expect("load");

        let raw: Vec<f64> = restored
            .tier_points(&key, Metric::RxBytes, 0)
            .expect("series")
            .iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(raw, vec![40.0, 50.0, 60.0]);
        assert!(restored
            .tier_points(&key, Metric::RxBytes, 1)
            .expect("series")
            .is_empty());

        let _ = fs::remove_dir_all(dir);
    }
}
