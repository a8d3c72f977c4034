use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ofstats_core::{
    ChannelTransport, DeviceId, FlowCounters, FlowId, OutboundRequest, PollingScheduler, PortCounters,
    RawFlowStats, RawPortStats, ReplyBody, StatsKind, StatsReply,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 1 Gbps in bytes/s.
const GIGABIT: u64 = 125_000_000;

#[derive(Debug, Clone, Copy)]
pub struct FabricLayout {
    pub devices: usize,
    pub ports: u32,
    pub flows: usize,
    /// Zero a switch's counters every N port polls, as a reboot would.
    pub restart_every: Option<u64>,
}

#[derive(Debug)]
struct SimPort {
    port_no: u32,
    /// Peak rate in bytes/s; actual traffic follows a slow triangle wave.
    peak: f64,
    counters: PortCounters,
    carry_rx: f64,
    carry_tx: f64,
}

#[derive(Debug)]
struct SimFlow {
    id: FlowId,
    in_port: u32,
    counters: FlowCounters,
}

#[derive(Debug)]
struct SimSwitch {
    id: DeviceId,
    index: usize,
    ports: Vec<SimPort>,
    flows: Vec<SimFlow>,
    last_answer: Option<DateTime<Utc>>,
    port_polls: u64,
    flow_polls: u64,
}

/// Deterministic stand-in for a set of switches behind the protocol layer.
#[derive(Debug)]
pub struct SimulatedFabric {
    layout: FabricLayout,
    switches: BTreeMap<DeviceId, SimSwitch>,
    started: DateTime<Utc>,
}

pub fn dpid(index: usize) -> DeviceId {
    let n = index as u64 + 1;
    let bytes = n.to_be_bytes();
    let parts: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
    DeviceId::new(parts.join(":"))
}

impl SimulatedFabric {
    pub fn new(layout: FabricLayout, now: DateTime<Utc>) -> Self {
        let switches = (0..layout.devices)
            .map(|index| {
                let id = dpid(index);
                let ports = (1..=layout.ports)
                    .map(|port_no| SimPort {
                        port_no,
                        peak: GIGABIT as f64 * (0.05 + 0.15 * f64::from(port_no % 5)),
                        counters: PortCounters::default(),
                        carry_rx: 0.0,
                        carry_tx: 0.0,
                    })
                    .collect();
                let flows = (0..layout.flows)
                    .map(|n| SimFlow {
                        id: FlowId::new(format!("{:016x}", ((index as u64 + 1) << 32) | n as u64)),
                        in_port: (n as u32 % layout.ports.max(1)) + 1,
                        counters: FlowCounters::default(),
                    })
                    .collect();
                let switch = SimSwitch {
                    id: id.clone(),
                    index,
                    ports,
                    flows,
                    last_answer: None,
                    port_polls: 0,
                    flow_polls: 0,
                };
                (id, switch)
            })
            .collect();

        Self {
            layout,
            switches,
            started: now,
        }
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.switches.keys().cloned().collect()
    }

    /// Build the reply a switch would send for `request` at `now`.
    pub fn answer(&mut self, request: &OutboundRequest, now: DateTime<Utc>) -> Option<StatsReply> {
        let restart_every = self.layout.restart_every;
        let started = self.started;
        let switch = self.switches.get_mut(&request.device)?;
        switch.advance(now, started);

        let body = match request.kind {
            StatsKind::Port => {
                switch.port_polls += 1;
                if restart_every.is_some_and(|n| n > 0 && switch.port_polls % n == 0) {
                    info!(device = %switch.id.short(), "simulated switch restart, counters zeroed");
                    for port in &mut switch.ports {
                        port.counters = PortCounters::default();
                    }
                }
                ReplyBody::Ports(switch.ports.iter().map(port_stats).collect())
            }
            StatsKind::Flow => {
                switch.flow_polls += 1;
                let polls = switch.flow_polls;
                let installed = switch
                    .flows
                    .iter()
                    .enumerate()
                    // Each flow is removed for a stretch now and then.
                    .filter(|(n, _)| (polls / 6 + *n as u64) % 4 != 0)
                    .map(|(_, flow)| flow_stats(flow))
                    .collect();
                ReplyBody::Flows(installed)
            }
        };

        Some(StatsReply {
            device: switch.id.clone(),
            timestamp: now,
            body,
        })
    }
}

impl SimSwitch {
    fn advance(&mut self, now: DateTime<Utc>, started: DateTime<Utc>) {
        let Some(last) = self.last_answer.replace(now) else {
            return;
        };
        let dt = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
        let phase = ((now - started).num_seconds() as f64 / 60.0 + self.index as f64 * 0.25).fract();
        let wave = 1.0 - (2.0 * phase - 1.0).abs();

        for port in &mut self.ports {
            let rx = port.peak * (0.2 + 0.8 * wave) * dt + port.carry_rx;
            let tx = port.peak * (0.1 + 0.5 * (1.0 - wave)) * dt + port.carry_tx;
            port.carry_rx = rx.fract();
            port.carry_tx = tx.fract();
            let (rx, tx) = (rx as u64, tx as u64);

            let c = &mut port.counters;
            c.rx_bytes = c.rx_bytes.wrapping_add(rx);
            c.tx_bytes = c.tx_bytes.wrapping_add(tx);
            c.rx_packets = c.rx_packets.wrapping_add(rx / 1000);
            c.tx_packets = c.tx_packets.wrapping_add(tx / 1000);
            c.rx_dropped = c.rx_dropped.wrapping_add(rx / 5_000_000);
            c.tx_errors = c.tx_errors.wrapping_add(tx / 50_000_000);
        }

        for flow in &mut self.flows {
            let share = self
                .ports
                .iter()
                .find(|port| port.port_no == flow.in_port)
                .map_or(0.0, |port| port.peak * wave * dt / 4.0) as u64;
            flow.counters.byte_count = flow.counters.byte_count.wrapping_add(share);
            flow.counters.packet_count = flow.counters.packet_count.wrapping_add(share / 1000);
        }
    }
}

fn port_stats(port: &SimPort) -> RawPortStats {
    RawPortStats {
        port_no: port.port_no,
        name: Some(format!("eth{}", port.port_no)),
        hw_addr: Some(format!("02:00:00:00:{:02x}:{:02x}", port.port_no >> 8, port.port_no & 0xff)),
        // Every fourth port reports no speed.
        speed: (port.port_no % 4 != 0).then_some(GIGABIT),
        counters: port.counters,
    }
}

fn flow_stats(flow: &SimFlow) -> RawFlowStats {
    let mut match_fields = BTreeMap::new();
    match_fields.insert("in_port".to_string(), flow.in_port.to_string());
    RawFlowStats {
        flow_id: flow.id.clone(),
        match_fields,
        counters: flow.counters,
    }
}

/// Answer every request until the request channel closes.
pub async fn serve(
    mut fabric: SimulatedFabric,
    mut requests: mpsc::UnboundedReceiver<OutboundRequest>,
    scheduler: Arc<PollingScheduler<ChannelTransport>>,
) {
    while let Some(request) = requests.recv().await {
        let Some(reply) = fabric.answer(&request, Utc::now()) else {
            debug!(device = %request.device.short(), "request for unknown switch");
            continue;
        };
        if let Err(err) = scheduler.on_stats_reply(reply).await {
            warn!(error = %err, "reply not delivered");
        }
    }
}
