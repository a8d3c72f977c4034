use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::{DeviceId, FlowId, Metric, StatsKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCounters {
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Counters {
    Port(PortCounters),
    Flow(FlowCounters),
}

impl Counters {
    pub fn kind(&self) -> StatsKind {
        match self {
            Counters::Port(_) => StatsKind::Port,
            Counters::Flow(_) => StatsKind::Flow,
        }
    }

    /// Cumulative value of one counter field, `None` for derived metrics or
    /// fields the other kind carries.
    pub fn get(&self, metric: Metric) -> Option<u64> {
        match (self, metric) {
            (Counters::Port(c), Metric::RxBytes) => Some(c.rx_bytes),
            (Counters::Port(c), Metric::TxBytes) => Some(c.tx_bytes),
            (Counters::Port(c), Metric::RxPackets) => Some(c.rx_packets),
            (Counters::Port(c), Metric::TxPackets) => Some(c.tx_packets),
            (Counters::Port(c), Metric::RxDropped) => Some(c.rx_dropped),
            (Counters::Port(c), Metric::TxDropped) => Some(c.tx_dropped),
            (Counters::Port(c), Metric::RxErrors) => Some(c.rx_errors),
            (Counters::Port(c), Metric::TxErrors) => Some(c.tx_errors),
            (Counters::Flow(c), Metric::PacketCount) => Some(c.packet_count),
            (Counters::Flow(c), Metric::ByteCount) => Some(c.byte_count),
            _ => None,
        }
    }
}

/// Point-in-time reading of cumulative counters for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub counters: Counters,
}

impl Snapshot {
    pub fn port(timestamp: DateTime<Utc>, counters: PortCounters) -> Self {
        Self {
            timestamp,
            counters: Counters::Port(counters),
        }
    }

    pub fn flow(timestamp: DateTime<Utc>, counters: FlowCounters) -> Self {
        Self {
            timestamp,
            counters: Counters::Flow(counters),
        }
    }

    pub fn kind(&self) -> StatsKind {
        self.counters.kind()
    }
}

/// Per-second rates derived from two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub timestamp: DateTime<Utc>,
    pub interval_secs: f64,
    pub rates: BTreeMap<Metric, f64>,
    /// Fraction of the resolved link speed; ports with a known speed only.
    pub rx_utilization: Option<f64>,
    pub tx_utilization: Option<f64>,
    /// Speed in bytes/s that the utilization was computed against.
    pub speed: Option<f64>,
    /// At least one counter went backwards during the interval.
    pub reset: bool,
}

impl RateSample {
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::RxUtilization => self.rx_utilization,
            Metric::TxUtilization => self.tx_utilization,
            other => self.rates.get(&other).copied(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPortStats {
    pub port_no: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hw_addr: Option<String>,
    /// Link speed reported by the device, bytes/s. Zero means unknown.
    #[serde(default)]
    pub speed: Option<u64>,
    pub counters: PortCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFlowStats {
    pub flow_id: FlowId,
    #[serde(default)]
    pub match_fields: BTreeMap<String, String>,
    pub counters: FlowCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entries", rename_all = "snake_case")]
pub enum ReplyBody {
    Ports(Vec<RawPortStats>),
    Flows(Vec<RawFlowStats>),
}

/// Counter reply delivered by the protocol layer for one device.
///
/// A reply may cover only some of the device's known ports or flows, and may
/// introduce keys never seen before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReply {
    pub device: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub body: ReplyBody,
}

impl StatsReply {
    pub fn kind(&self) -> StatsKind {
        match self.body {
            ReplyBody::Ports(_) => StatsKind::Port,
            ReplyBody::Flows(_) => StatsKind::Flow,
        }
    }

    pub fn len(&self) -> usize {
        match &self.body {
            ReplyBody::Ports(entries) => entries.len(),
            ReplyBody::Flows(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
