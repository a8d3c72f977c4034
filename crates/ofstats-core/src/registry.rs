use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::key::{DeviceId, FlowId, ItemKey, StatsKey};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Unknown,
    Active,
    AwaitingReply,
    Stale,
    Disconnected,
    Retired,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Active => "active",
            DeviceState::AwaitingReply => "awaiting_reply",
            DeviceState::Stale => "stale",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Retired => "retired",
        }
    }

    /// Connected states in which the device is polled.
    pub fn is_polled(self) -> bool {
        matches!(self, DeviceState::Active | DeviceState::AwaitingReply | DeviceState::Stale)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Port {
    pub port_no: u32,
    pub name: Option<String>,
    pub hw_addr: Option<String>,
    /// Speed last reported by the device, bytes/s.
    pub reported_speed: Option<u64>,
    pub last_snapshot: Option<Snapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Flow {
    pub id: FlowId,
    pub match_fields: BTreeMap<String, String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_snapshot: Option<Snapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub state: DeviceState,
    pub ports: BTreeMap<u32, Port>,
    pub flows: BTreeMap<FlowId, Flow>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_reply_at: Option<DateTime<Utc>>,
}

impl Device {
    fn new(id: DeviceId) -> Self {
        Self {
            id,
            state: DeviceState::Unknown,
            ports: BTreeMap::new(),
            flows: BTreeMap::new(),
            connected_at: None,
            disconnected_at: None,
            last_reply_at: None,
        }
    }

    pub fn keys(&self) -> Vec<StatsKey> {
        let ports = self.ports.keys().map(|no| StatsKey::port(self.id.clone(), *no));
        let flows = self.flows.keys().map(|id| StatsKey::flow(self.id.clone(), id.clone()));
        ports.chain(flows).collect()
    }
}

/// Port details that arrive alongside its counters.
#[derive(Debug, Clone, Default)]
pub struct PortInfo {
    pub name: Option<String>,
    pub hw_addr: Option<String>,
    pub reported_speed: Option<u64>,
}

/// Devices with their known ports and flows and each key's last snapshot.
///
/// Records are never deleted: disconnected devices are eventually retired,
/// keeping their keys resolvable for queries.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or revive a device. Known ports and flows are kept across
    /// reconnects so their next snapshot still pairs with the last one.
    pub fn connect(&self, id: &DeviceId, now: DateTime<Utc>) {
        let mut device = self
            .devices
            .entry(id.clone())
            .or_insert_with(|| Device::new(id.clone()));
        let reconnect = device.connected_at.is_some();
        device.state = DeviceState::Active;
        device.connected_at = Some(now);
        device.disconnected_at = None;
        info!(device = %id.short(), reconnect, "device connected");
    }

    /// Returns `false` for a device never seen.
    pub fn disconnect(&self, id: &DeviceId, now: DateTime<Utc>) -> bool {
        let Some(mut device) = self.devices.get_mut(id) else {
            return false;
        };
        device.state = DeviceState::Disconnected;
        device.disconnected_at = Some(now);
        info!(device = %id.short(), "device disconnected");
        true
    }

    /// Mirror a poll-cycle state. Ignored once the device has disconnected,
    /// so a poll task finishing late cannot revive it.
    pub fn set_poll_state(&self, id: &DeviceId, state: DeviceState) {
        if let Some(mut device) = self.devices.get_mut(id) {
            if device.state.is_polled() {
                device.state = state;
            }
        }
    }

    pub fn state(&self, id: &DeviceId) -> Option<DeviceState> {
        self.devices.get(id).map(|device| device.state)
    }

    /// Retire devices disconnected for longer than `grace`; returns their ids.
    pub fn retire_expired(&self, now: DateTime<Utc>, grace: Duration) -> Vec<DeviceId> {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        let mut retired = Vec::new();
        for mut device in self.devices.iter_mut() {
            if device.state != DeviceState::Disconnected {
                continue;
            }
            let expired = device
                .disconnected_at
                .is_some_and(|since| now.signed_duration_since(since) >= grace);
            if expired {
                device.state = DeviceState::Retired;
                retired.push(device.id.clone());
            }
        }
        for id in &retired {
            info!(device = %id.short(), "device retired");
        }
        retired
    }

    pub fn mark_reply(&self, id: &DeviceId, at: DateTime<Utc>) {
        if let Some(mut device) = self.devices.get_mut(id) {
            device.last_reply_at = Some(at);
        }
    }

    /// Record a port snapshot and return the one it replaces. The flag is
    /// `false` when the snapshot is no newer than the stored one and was
    /// ignored.
    pub fn observe_port(
        &self,
        id: &DeviceId,
        port_no: u32,
        info: PortInfo,
        snapshot: Snapshot,
    ) -> (Option<Snapshot>, bool) {
        let mut device = self
            .devices
            .entry(id.clone())
            .or_insert_with(|| Device::new(id.clone()));
        let port = device.ports.entry(port_no).or_insert_with(|| Port {
            port_no,
            name: None,
            hw_addr: None,
            reported_speed: None,
            last_snapshot: None,
        });
        if info.name.is_some() {
            port.name = info.name;
        }
        if info.hw_addr.is_some() {
            port.hw_addr = info.hw_addr;
        }
        port.reported_speed = info.reported_speed;
        replace_if_newer(&mut port.last_snapshot, snapshot)
    }

    pub fn observe_flow(
        &self,
        id: &DeviceId,
        flow: &FlowId,
        match_fields: BTreeMap<String, String>,
        snapshot: Snapshot,
    ) -> (Option<Snapshot>, bool) {
        let mut device = self
            .devices
            .entry(id.clone())
            .or_insert_with(|| Device::new(id.clone()));
        let entry = device.flows.entry(flow.clone()).or_insert_with(|| Flow {
            id: flow.clone(),
            match_fields: BTreeMap::new(),
            last_seen: None,
            last_snapshot: None,
        });
        if !match_fields.is_empty() {
            entry.match_fields = match_fields;
        }
        entry.last_seen = Some(snapshot.timestamp);
        replace_if_newer(&mut entry.last_snapshot, snapshot)
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id).map(|device| device.clone())
    }

    pub fn port(&self, id: &DeviceId, port_no: u32) -> Option<Port> {
        self.devices.get(id).and_then(|device| device.ports.get(&port_no).cloned())
    }

    pub fn contains_device(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn contains_key(&self, key: &StatsKey) -> bool {
        self.devices.get(&key.device).is_some_and(|device| match &key.item {
            ItemKey::Port(no) => device.ports.contains_key(no),
            ItemKey::Flow(id) => device.flows.contains_key(id),
        })
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.iter().map(|device| device.id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn replace_if_newer(slot: &mut Option<Snapshot>, snapshot: Snapshot) -> (Option<Snapshot>, bool) {
    if slot
        .as_ref()
        .is_some_and(|previous| previous.timestamp >= snapshot.timestamp)
    {
        return (None, false);
    }
    (slot.replace(snapshot), true)
}
