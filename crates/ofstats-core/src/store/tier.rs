use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{Consolidation, TierConfig};

use super::persist::TierRecord;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Point {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Consolidation bucket in progress, covering `(end - spacing, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct Bucket {
    pub end: DateTime<Utc>,
    pub sum: f64,
    pub max: f64,
    pub count: u32,
}

impl Bucket {
    fn open(end: DateTime<Utc>, value: f64) -> Self {
        Self {
            end,
            sum: value,
            max: value,
            count: 1,
        }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.max = self.max.max(value);
        self.count += 1;
    }

    fn consolidate(&self, consolidation: Consolidation) -> Option<Point> {
        if self.count == 0 {
            return None;
        }
        let value = match consolidation {
            Consolidation::Average => self.sum / f64::from(self.count),
            Consolidation::Maximum => self.max,
        };
        Some(Point::new(self.end, value))
    }
}

/// The sample falls before the tier's open bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Behind;

/// Fixed-capacity ring of points at one resolution.
///
/// `slots` grows until it reaches `capacity`; after that `cursor` marks the
/// oldest slot, which the next point overwrites.
#[derive(Debug, Clone)]
pub struct Tier {
    config: TierConfig,
    slots: Vec<Point>,
    cursor: usize,
    open: Option<Bucket>,
    closed_through: Option<DateTime<Utc>>,
}

impl Tier {
    pub fn new(config: TierConfig) -> Self {
        Self {
            config,
            slots: Vec::with_capacity(config.capacity.min(1024)),
            cursor: 0,
            open: None,
            closed_through: None,
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stored points, oldest first.
    pub fn points(&self) -> impl Iterator<Item = &Point> + '_ {
        let (newer, older) = self.slots.split_at(self.cursor);
        older.iter().chain(newer.iter())
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.points().next().map(|p| p.timestamp)
    }

    pub fn newest(&self) -> Option<DateTime<Utc>> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = if self.cursor == 0 {
            self.slots.len() - 1
        } else {
            self.cursor - 1
        };
        self.slots.get(idx).map(|p| p.timestamp)
    }

    pub fn covers(&self, from: DateTime<Utc>) -> bool {
        self.oldest().is_some_and(|oldest| oldest <= from)
    }

    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Point> {
        self.points()
            .filter(|p| p.timestamp >= from && p.timestamp <= to)
            .copied()
            .collect()
    }

    pub(crate) fn push(&mut self, point: Point) {
        if self.slots.len() < self.config.capacity {
            self.slots.push(point);
            self.cursor = self.slots.len() % self.config.capacity;
            return;
        }
        if let Some(slot) = self.slots.get_mut(self.cursor) {
            *slot = point;
        }
        self.cursor = (self.cursor + 1) % self.config.capacity;
    }

    fn spacing_ms(&self) -> i64 {
        i64::try_from(self.config.spacing_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    /// End of the bucket that `t` falls into; a timestamp on a boundary
    /// closes the bucket ending there.
    fn bucket_end(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let spacing = self.spacing_ms();
        let ms = t.timestamp_millis();
        let mut end = ms.div_euclid(spacing) * spacing;
        if end < ms {
            end += spacing;
        }
        DateTime::from_timestamp_millis(end).unwrap_or(t)
    }

    pub(crate) fn open_bucket_contains(&self, t: DateTime<Utc>) -> bool {
        self.open.is_some_and(|bucket| bucket.end == self.bucket_end(t))
    }

    pub(crate) fn open_bucket_start(&self) -> Option<DateTime<Utc>> {
        self.open
            .map(|bucket| bucket.end - chrono::Duration::milliseconds(self.spacing_ms()))
    }

    /// Add a sub-sample to the bucket it belongs to, closing buckets as time
    /// moves past them. Returns the number of points written.
    pub(crate) fn accumulate(&mut self, t: DateTime<Utc>, value: f64) -> Result<usize, Behind> {
        let end = self.bucket_end(t);
        if self.closed_through.is_some_and(|closed| end <= closed) {
            return Err(Behind);
        }

        let mut written = 0;
        match self.open.as_mut() {
            Some(bucket) if bucket.end == end => bucket.add(value),
            Some(bucket) if bucket.end > end => return Err(Behind),
            Some(_) => {
                written += self.close_open();
                self.open = Some(Bucket::open(end, value));
            }
            None => self.open = Some(Bucket::open(end, value)),
        }

        if t == end {
            written += self.close_open();
        }
        Ok(written)
    }

    fn close_open(&mut self) -> usize {
        let Some(bucket) = self.open.take() else {
            return 0;
        };
        self.closed_through = Some(bucket.end);
        match bucket.consolidate(self.config.consolidation) {
            Some(point) => {
                self.push(point);
                1
            }
            None => 0,
        }
    }

    pub(crate) fn to_record(&self) -> TierRecord {
        TierRecord {
            spacing_secs: self.config.spacing_secs,
            capacity: self.config.capacity,
            consolidation: self.config.consolidation,
            cursor: self.cursor,
            points: self.slots.clone(),
            open: self.open,
            closed_through: self.closed_through,
        }
    }

    /// Rebuild a tier from a persisted record under the current layout.
    ///
    /// A record with a different spacing cannot be reinterpreted and yields
    /// an empty tier. A different capacity keeps the newest points that fit.
    pub(crate) fn from_record(config: TierConfig, record: TierRecord) -> Self {
        if record.spacing_secs != config.spacing_secs {
            warn!(
                stored = record.spacing_secs,
                configured = config.spacing_secs,
                "tier spacing changed, starting tier empty"
            );
            return Self::new(config);
        }

        let filled = record.points.len();
        let consistent = if filled < config.capacity {
            record.cursor == filled
        } else {
            filled == config.capacity && record.cursor < config.capacity
        };
        let exact = record.capacity == config.capacity && consistent;
        if exact {
            return Self {
                config,
                slots: record.points,
                cursor: record.cursor,
                open: if record.consolidation == config.consolidation { record.open } else { None },
                closed_through: record.closed_through,
            };
        }

        let mut tier = Self::new(config);
        let cursor = record.cursor.min(record.points.len());
        let (newer, older) = record.points.split_at(cursor);
        let ordered: Vec<Point> = older.iter().chain(newer.iter()).copied().collect();
        let skip = ordered.len().saturating_sub(config.capacity);
        for point in ordered.into_iter().skip(skip) {
            tier.push(point);
        }
        if record.consolidation == config.consolidation {
            tier.open = record.open;
        }
        tier.closed_through = record.closed_through;
        tier
    }
}
