use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::key::{DeviceId, FlowId, ItemKey, Metric, StatsKey};
use crate::registry::{DeviceRegistry, DeviceState};
use crate::snapshot::RateSample;
use crate::speed::{SpeedResolver, SpeedSource};
use crate::store::{Point, StoreError, TimeSeriesStore};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown key {0}")]
    KeyNotFound(StatsKey),
    #[error("unknown device {0}")]
    DeviceNotFound(DeviceId),
    #[error("invalid range: {from} is after {to}")]
    InvalidRange { from: DateTime<Utc>, to: DateTime<Utc> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeRequest {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Coarsest acceptable point spacing.
    pub resolution: Option<Duration>,
}

impl RangeRequest {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            resolution: None,
        }
    }

    pub fn resolution(mut self, resolution: Duration) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Ask for roughly `points` points across the range.
    pub fn with_points(mut self, points: u32) -> Self {
        if points > 0 {
            let span = (self.to - self.from).to_std().unwrap_or_default();
            self.resolution = Some(span / points);
        }
        self
    }
}

/// Range answer. `Empty` is a valid result, distinct from an unknown key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "points", rename_all = "snake_case")]
pub enum RangeResult {
    Empty,
    Points(Vec<Point>),
}

impl RangeResult {
    pub fn points(&self) -> &[Point] {
        match self {
            RangeResult::Empty => &[],
            RangeResult::Points(points) => points,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RangeResult::Empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstantValue {
    pub key: StatsKey,
    pub metric: Metric,
    pub timestamp: DateTime<Utc>,
    /// Absent for utilization when the speed was unknown at ingest time.
    pub value: Option<f64>,
    pub interval_secs: f64,
    pub reset: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortSummary {
    pub port_no: u32,
    pub name: Option<String>,
    pub hw_addr: Option<String>,
    /// Speed resolved now, bytes/s.
    pub speed: Option<f64>,
    pub speed_source: SpeedSource,
    pub timestamp: Option<DateTime<Utc>>,
    pub rates: BTreeMap<Metric, f64>,
    /// Utilization stored with the latest sample.
    pub rx_util: Option<f64>,
    pub tx_util: Option<f64>,
    pub reset: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSummary {
    pub flow_id: FlowId,
    pub match_fields: BTreeMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub bytes_per_sec: Option<f64>,
    pub packets_per_sec: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    /// `None` when the device is only known from persisted series.
    pub state: Option<DeviceState>,
    pub ports: usize,
    pub flows: usize,
}

/// Read-side facade over the registry, the store and the speed resolver.
///
/// Utilization comes from the stored samples, i.e. the speed in effect when
/// each sample was ingested; listings also show the speed resolved now.
pub struct QueryService {
    registry: Arc<DeviceRegistry>,
    store: Arc<TimeSeriesStore>,
    resolver: Arc<SpeedResolver>,
}

impl QueryService {
    pub fn new(registry: Arc<DeviceRegistry>, store: Arc<TimeSeriesStore>, resolver: Arc<SpeedResolver>) -> Self {
        Self {
            registry,
            store,
            resolver,
        }
    }

    fn is_known(&self, key: &StatsKey) -> bool {
        self.registry.contains_key(key) || self.store.contains(key)
    }

    fn latest(&self, key: &StatsKey, metric: Metric) -> Result<Option<Arc<RateSample>>, QueryError> {
        match self.store.instant(key, metric) {
            Ok(sample) => Ok(sample),
            Err(StoreError::UnknownSeries { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Latest value of one metric; `Ok(None)` for a known key with no sample yet.
    pub fn get_instant(&self, key: &StatsKey, metric: Metric) -> Result<Option<InstantValue>, QueryError> {
        if !self.is_known(key) {
            return Err(QueryError::KeyNotFound(key.clone()));
        }
        Ok(self.latest(key, metric)?.map(|sample| InstantValue {
            key: key.clone(),
            metric,
            timestamp: sample.timestamp,
            value: sample.value(metric),
            interval_secs: sample.interval_secs,
            reset: sample.reset,
        }))
    }

    pub fn get_range(&self, key: &StatsKey, metric: Metric, request: RangeRequest) -> Result<RangeResult, QueryError> {
        if request.from > request.to {
            return Err(QueryError::InvalidRange {
                from: request.from,
                to: request.to,
            });
        }
        if !self.is_known(key) {
            return Err(QueryError::KeyNotFound(key.clone()));
        }

        let points = match self
            .store
            .query(key, metric, request.from, request.to, request.resolution)
        {
            Ok(points) => points,
            Err(StoreError::UnknownSeries { .. }) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        if points.is_empty() {
            return Ok(RangeResult::Empty);
        }
        Ok(RangeResult::Points(points))
    }

    fn device_keys(&self, device: &DeviceId) -> Result<BTreeSet<StatsKey>, QueryError> {
        let mut keys: BTreeSet<StatsKey> = self.store.keys_for_device(device).into_iter().collect();
        let registered = self.registry.get(device);
        if registered.is_none() && keys.is_empty() {
            return Err(QueryError::DeviceNotFound(device.clone()));
        }
        if let Some(registered) = registered {
            keys.extend(registered.keys());
        }
        Ok(keys)
    }

    /// Every port of `device` with its latest rates and stored utilization.
    pub fn port_summaries(&self, device: &DeviceId) -> Result<Vec<PortSummary>, QueryError> {
        let mut summaries = Vec::new();
        for key in self.device_keys(device)? {
            let ItemKey::Port(port_no) = key.item else {
                continue;
            };
            let port = self.registry.port(device, port_no);
            let reported = port.as_ref().and_then(|p| p.reported_speed);
            let speed = self.resolver.resolve(device, port_no, reported);
            if !speed.is_known() {
                warn!(device = %device.short(), port = port_no, "no speed for port, utilization unavailable");
            }

            let latest = self.latest(&key, Metric::RxBytes)?;
            summaries.push(PortSummary {
                port_no,
                name: port.as_ref().and_then(|p| p.name.clone()),
                hw_addr: port.as_ref().and_then(|p| p.hw_addr.clone()),
                speed: speed.known(),
                speed_source: speed.source,
                timestamp: latest.as_ref().map(|s| s.timestamp),
                rates: latest.as_ref().map(|s| s.rates.clone()).unwrap_or_default(),
                rx_util: latest.as_ref().and_then(|s| s.rx_utilization),
                tx_util: latest.as_ref().and_then(|s| s.tx_utilization),
                reset: latest.as_ref().is_some_and(|s| s.reset),
            });
        }
        Ok(summaries)
    }

    /// Every flow of `device` with its latest byte and packet rates.
    pub fn flow_summaries(&self, device: &DeviceId) -> Result<Vec<FlowSummary>, QueryError> {
        let registered = self.registry.get(device);
        let mut summaries = Vec::new();
        for key in self.device_keys(device)? {
            let ItemKey::Flow(flow_id) = &key.item else {
                continue;
            };
            let match_fields = registered
                .as_ref()
                .and_then(|d| d.flows.get(flow_id))
                .map(|flow| flow.match_fields.clone())
                .unwrap_or_default();
            let latest = self.latest(&key, Metric::ByteCount)?;
            summaries.push(FlowSummary {
                flow_id: flow_id.clone(),
                match_fields,
                timestamp: latest.as_ref().map(|s| s.timestamp),
                bytes_per_sec: latest.as_ref().and_then(|s| s.value(Metric::ByteCount)),
                packets_per_sec: latest.as_ref().and_then(|s| s.value(Metric::PacketCount)),
            });
        }
        Ok(summaries)
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        let mut ids: BTreeSet<DeviceId> = self.registry.ids().into_iter().collect();
        ids.extend(self.store.keys().into_iter().map(|key| key.device));

        ids.into_iter()
            .filter_map(|id| {
                let keys = self.device_keys(&id).ok()?;
                let ports = keys.iter().filter(|k| matches!(k.item, ItemKey::Port(_))).count();
                Some(DeviceSummary {
                    state: self.registry.state(&id),
                    flows: keys.len() - ports,
                    ports,
                    id,
                })
            })
            .collect()
    }
}
