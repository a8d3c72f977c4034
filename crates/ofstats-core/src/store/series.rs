use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::StoreConfig;
use crate::key::Metric;
use crate::snapshot::RateSample;

use super::tier::{Point, Tier};

/// Where an accepted value ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Appended to the raw tier and folded into every coarse bucket.
    InOrder,
    /// Older than the newest raw point but still inside an open bucket.
    OpenBucket,
}

/// The value is older than every bucket still accepting data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub open_since: Option<DateTime<Utc>>,
}

/// All resolution tiers for one (key, metric) pair.
#[derive(Debug, Clone)]
pub struct Series {
    metric: Metric,
    tiers: Vec<Tier>,
    latest: Option<Arc<RateSample>>,
}

impl Series {
    pub fn new(metric: Metric, config: &StoreConfig) -> Self {
        Self {
            metric,
            tiers: config.tiers.iter().copied().map(Tier::new).collect(),
            latest: None,
        }
    }

    pub(crate) fn from_parts(metric: Metric, tiers: Vec<Tier>, latest: Option<Arc<RateSample>>) -> Self {
        Self { metric, tiers, latest }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn latest(&self) -> Option<&Arc<RateSample>> {
        self.latest.as_ref()
    }

    fn newest_raw(&self) -> Option<DateTime<Utc>> {
        self.tiers.first().and_then(Tier::newest)
    }

    /// Record a sample. The value for this series' metric may be absent
    /// (utilization with no known speed); the sample still becomes the
    /// latest one, leaving a gap in the tiers.
    pub fn record(&mut self, sample: &Arc<RateSample>) -> Result<Option<Placement>, Rejected> {
        let placement = match sample.value(self.metric) {
            Some(value) => Some(self.insert(sample.timestamp, value)?),
            None => None,
        };
        let newer = self
            .latest
            .as_ref()
            .map_or(true, |latest| latest.timestamp < sample.timestamp);
        if newer {
            self.latest = Some(Arc::clone(sample));
        }
        Ok(placement)
    }

    pub fn insert(&mut self, timestamp: DateTime<Utc>, value: f64) -> Result<Placement, Rejected> {
        let newest = self.newest_raw();
        let in_order = newest.map_or(true, |newest| timestamp > newest);
        let Some((raw, coarse)) = self.tiers.split_first_mut() else {
            return Err(Rejected { open_since: None });
        };

        if in_order {
            raw.push(Point::new(timestamp, value));
            for tier in coarse.iter_mut() {
                // A tier can only be ahead of raw after a layout change on reload.
                let _ = tier.accumulate(timestamp, value);
            }
            return Ok(Placement::InOrder);
        }

        let Some(finest) = coarse.first() else {
            return Err(Rejected { open_since: None });
        };
        // Already folded into every open bucket when it was appended.
        if newest == Some(timestamp) {
            return Err(Rejected {
                open_since: finest.open_bucket_start(),
            });
        }
        if !finest.open_bucket_contains(timestamp) {
            return Err(Rejected {
                open_since: finest.open_bucket_start(),
            });
        }
        for tier in coarse.iter_mut().filter(|tier| tier.open_bucket_contains(timestamp)) {
            let _ = tier.accumulate(timestamp, value);
        }
        Ok(Placement::OpenBucket)
    }

    /// Points in `[from, to]`, oldest first.
    ///
    /// Uses the finest tier no coarser than `resolution` whose retention
    /// reaches back to `from`. When none does, recent data comes from finer
    /// tiers and older data from coarser ones, each coarser segment strictly
    /// older than the finer one so no timestamp repeats. Stitching starts at
    /// the coarsest tier still within `resolution`.
    pub fn query(&self, from: DateTime<Utc>, to: DateTime<Utc>, resolution: Option<Duration>) -> Vec<Point> {
        if from > to {
            return Vec::new();
        }

        let primary = self
            .tiers
            .iter()
            .filter(|tier| resolution.map_or(true, |hint| tier.config().spacing_secs <= hint.as_secs()))
            .find(|tier| tier.covers(from));
        if let Some(tier) = primary {
            return tier.range(from, to);
        }

        let start = resolution
            .and_then(|hint| {
                self.tiers
                    .iter()
                    .rposition(|tier| tier.config().spacing_secs <= hint.as_secs())
            })
            .unwrap_or(0);

        let mut segments: Vec<Vec<Point>> = Vec::new();
        let mut boundary: Option<DateTime<Utc>> = None;
        for tier in &self.tiers[start..] {
            let segment: Vec<Point> = tier
                .range(from, to)
                .into_iter()
                .filter(|p| boundary.map_or(true, |b| p.timestamp < b))
                .collect();
            segments.push(segment);

            if let Some(oldest) = tier.oldest() {
                boundary = Some(boundary.map_or(oldest, |b| b.min(oldest)));
            }
            if tier.covers(from) {
                break;
            }
        }

        segments.into_iter().rev().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Consolidation, TierConfig};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn layout() -> StoreConfig {
        StoreConfig::new(vec![
            TierConfig::new(10, 6, Consolidation::Average),
            TierConfig::new(60, 10, Consolidation::Average),
            TierConfig::new(300, 10, Consolidation::Maximum),
        ])
        .expect("valid layout")
    }

    fn filled(until: i64) -> Series {
        let mut series = Series::new(Metric::RxBytes, &layout());
        for secs in (10..=until).step_by(10) {
            series.insert(at(secs), secs as f64).expect("in order");
        }
        series
    }

    #[test]
    fn raw_spacing_fills_one_coarse_bucket() {
        let series = filled(60);
        let minute: Vec<Point> = series.tiers()[1].points().copied().collect();
        assert_eq!(minute, vec![Point::new(at(60), 35.0)]);
        assert!(series.tiers()[2].is_empty());
    }

    #[test]
    fn late_sample_joins_the_open_bucket() {
        let mut series = filled(90);
        // raw newest is 90; the minute bucket (60, 120] is open.
        assert_eq!(series.insert(at(65), 1.0), Ok(Placement::OpenBucket));
        assert_eq!(series.tiers()[0].len(), 6);

        let err = series.insert(at(55), 1.0).expect_err("bucket already closed");
        assert_eq!(err.open_since, Some(at(60)));
    }

    #[test]
    fn repeated_newest_timestamp_is_not_folded_twice() {
        let mut series = filled(90);
        let err = series.insert(at(90), 5.0).expect_err("duplicate of newest raw point");
        assert_eq!(err.open_since, Some(at(60)));

        for secs in [100, 110, 120] {
            series.insert(at(secs), secs as f64).expect("in order");
        }
        let minute: Vec<Point> = series.tiers()[1].points().copied().collect();
        assert_eq!(minute, vec![Point::new(at(60), 35.0), Point::new(at(120), 95.0)]);
    }

    #[test]
    fn single_tier_refuses_late_samples() {
        let config = StoreConfig::new(vec![TierConfig::new(10, 4, Consolidation::Average)]).expect("valid");
        let mut series = Series::new(Metric::RxBytes, &config);
        series.insert(at(20), 1.0).expect("in order");
        assert!(series.insert(at(20), 2.0).is_err());
        assert!(series.insert(at(10), 2.0).is_err());
    }

    #[test]
    fn covered_range_comes_from_the_finest_tier() {
        let series = filled(120);
        let points = series.query(at(70), at(120), None);
        let stamps: Vec<i64> = points.iter().map(|p| p.timestamp.timestamp()).collect();
        assert_eq!(stamps, vec![70, 80, 90, 100, 110, 120]);
    }

    #[test]
    fn resolution_hint_skips_finer_tiers() {
        let series = filled(600);
        let points = series.query(at(120), at(300), Some(Duration::from_secs(60)));
        // raw retains only 550..=600, so the minute tier answers.
        let stamps: Vec<i64> = points.iter().map(|p| p.timestamp.timestamp()).collect();
        assert_eq!(stamps, vec![120, 180, 240, 300]);
    }

    #[test]
    fn uncovered_range_is_stitched_without_duplicates() {
        let series = filled(900);
        let points = series.query(at(0), at(900), None);

        let stamps: Vec<i64> = points.iter().map(|p| p.timestamp.timestamp()).collect();
        let mut sorted = stamps.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(stamps, sorted, "points must be ordered and unique");

        // Five-minute max for the oldest part, minutes in the middle, raw at the end.
        assert_eq!(stamps.first(), Some(&300));
        assert_eq!(&stamps[stamps.len() - 6..], &[850, 860, 870, 880, 890, 900]);
        assert!(stamps.contains(&360));
    }

    #[test]
    fn stitching_starts_at_the_hinted_resolution() {
        let series = filled(900);
        let points = series.query(at(0), at(900), Some(Duration::from_secs(60)));

        let stamps: Vec<i64> = points.iter().map(|p| p.timestamp.timestamp()).collect();
        let expected: Vec<i64> = std::iter::once(300).chain((360..=900).step_by(60)).collect();
        assert_eq!(stamps, expected);
    }

    #[test]
    fn range_before_retained_data_is_empty() {
        let series = filled(60);
        assert!(series.query(at(-1000), at(-500), None).is_empty());
        assert!(series.query(at(100), at(50), None).is_empty());
    }
}
