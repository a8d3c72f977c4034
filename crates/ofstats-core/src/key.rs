use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Network-wide switch identifier (dpid).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Long dpids are shortened to `abc...xyz` in log lines.
    pub fn short(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() < 22 {
            return self.0.clone();
        }
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 3..].iter().collect();
        format!("{head}...{tail}")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Flow hash as reported by the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsKind {
    Port,
    Flow,
}

impl StatsKind {
    pub const ALL: [StatsKind; 2] = [StatsKind::Port, StatsKind::Flow];

    pub fn as_str(self) -> &'static str {
        match self {
            StatsKind::Port => "port",
            StatsKind::Flow => "flow",
        }
    }

    /// Directory name used by the persisted layout.
    pub fn dir_name(self) -> &'static str {
        match self {
            StatsKind::Port => "ports",
            StatsKind::Flow => "flows",
        }
    }
}

impl fmt::Display for StatsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port or a flow within one device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKey {
    Port(u32),
    Flow(FlowId),
}

impl ItemKey {
    pub fn kind(&self) -> StatsKind {
        match self {
            ItemKey::Port(_) => StatsKind::Port,
            ItemKey::Flow(_) => StatsKind::Flow,
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Port(no) => write!(f, "port/{no}"),
            ItemKey::Flow(id) => write!(f, "flow/{id}"),
        }
    }
}

/// Identifies one counter source: a device plus one of its ports or flows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatsKey {
    pub device: DeviceId,
    pub item: ItemKey,
}

impl StatsKey {
    pub fn port(device: impl Into<DeviceId>, port_no: u32) -> Self {
        Self {
            device: device.into(),
            item: ItemKey::Port(port_no),
        }
    }

    pub fn flow(device: impl Into<DeviceId>, flow: impl Into<FlowId>) -> Self {
        Self {
            device: device.into(),
            item: ItemKey::Flow(flow.into()),
        }
    }

    pub fn kind(&self) -> StatsKind {
        self.item.kind()
    }
}

impl fmt::Display for StatsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.item)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<String> for FlowId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Every per-key quantity the store keeps a series for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    RxBytes,
    TxBytes,
    RxPackets,
    TxPackets,
    RxDropped,
    TxDropped,
    RxErrors,
    TxErrors,
    #[serde(rename = "rx_util")]
    RxUtilization,
    #[serde(rename = "tx_util")]
    TxUtilization,
    PacketCount,
    ByteCount,
}

const PORT_COUNTERS: [Metric; 8] = [
    Metric::RxBytes,
    Metric::TxBytes,
    Metric::RxPackets,
    Metric::TxPackets,
    Metric::RxDropped,
    Metric::TxDropped,
    Metric::RxErrors,
    Metric::TxErrors,
];

const PORT_METRICS: [Metric; 10] = [
    Metric::RxBytes,
    Metric::TxBytes,
    Metric::RxPackets,
    Metric::TxPackets,
    Metric::RxDropped,
    Metric::TxDropped,
    Metric::RxErrors,
    Metric::TxErrors,
    Metric::RxUtilization,
    Metric::TxUtilization,
];

const FLOW_METRICS: [Metric; 2] = [Metric::PacketCount, Metric::ByteCount];

impl Metric {
    /// Cumulative counter fields carried by snapshots of `kind`.
    pub fn counters(kind: StatsKind) -> &'static [Metric] {
        match kind {
            StatsKind::Port => &PORT_COUNTERS,
            StatsKind::Flow => &FLOW_METRICS,
        }
    }

    /// Every metric a series is created for, counters and derived.
    pub fn for_kind(kind: StatsKind) -> &'static [Metric] {
        match kind {
            StatsKind::Port => &PORT_METRICS,
            StatsKind::Flow => &FLOW_METRICS,
        }
    }

    pub fn kind(self) -> StatsKind {
        match self {
            Metric::PacketCount | Metric::ByteCount => StatsKind::Flow,
            _ => StatsKind::Port,
        }
    }

    pub fn is_utilization(self) -> bool {
        matches!(self, Metric::RxUtilization | Metric::TxUtilization)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::RxBytes => "rx_bytes",
            Metric::TxBytes => "tx_bytes",
            Metric::RxPackets => "rx_packets",
            Metric::TxPackets => "tx_packets",
            Metric::RxDropped => "rx_dropped",
            Metric::TxDropped => "tx_dropped",
            Metric::RxErrors => "rx_errors",
            Metric::TxErrors => "tx_errors",
            Metric::RxUtilization => "rx_util",
            Metric::TxUtilization => "tx_util",
            Metric::PacketCount => "packet_count",
            Metric::ByteCount => "byte_count",
        }
    }

    /// Unit label for rendering.
    pub fn unit(self) -> &'static str {
        match self {
            Metric::RxBytes | Metric::TxBytes | Metric::ByteCount => "B/s",
            Metric::RxPackets | Metric::TxPackets | Metric::PacketCount => "pkt/s",
            Metric::RxDropped | Metric::TxDropped | Metric::RxErrors | Metric::TxErrors => "/s",
            Metric::RxUtilization | Metric::TxUtilization => "ratio",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric '{0}'")]
pub struct UnknownMetric(pub String);

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PORT_METRICS
            .iter()
            .chain(FLOW_METRICS.iter())
            .copied()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}
