use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::key::StatsKey;
use crate::rate::{RateEngine, RateError};
use crate::registry::{DeviceRegistry, DeviceState, PortInfo};
use crate::snapshot::{RateSample, ReplyBody, Snapshot, StatsReply};
use crate::store::{StoreError, TimeSeriesStore};

/// What one reply produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyOutcome {
    /// Rate samples ingested into the store.
    pub samples: usize,
    /// Keys seen for the first time; their snapshot is only a baseline.
    pub first_seen: usize,
    /// Entries that produced no sample (stale, discarded or rejected).
    pub dropped: usize,
    /// Samples flagged with a counter reset.
    pub resets: usize,
}

/// Reply → snapshot pairing → rate → store.
///
/// Callers must hand over the replies of one device in arrival order; the
/// scheduler does so by routing each device through its own task.
pub struct StatsPipeline {
    registry: Arc<DeviceRegistry>,
    engine: RateEngine,
    store: Arc<TimeSeriesStore>,
}

impl StatsPipeline {
    pub fn new(registry: Arc<DeviceRegistry>, engine: RateEngine, store: Arc<TimeSeriesStore>) -> Self {
        Self {
            registry,
            engine,
            store,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    pub fn engine(&self) -> &RateEngine {
        &self.engine
    }

    pub fn handle_reply(&self, reply: &StatsReply) -> ReplyOutcome {
        let mut outcome = ReplyOutcome::default();
        let device = &reply.device;

        // Retired devices keep their history but are no longer extended.
        if matches!(
            self.registry.state(device),
            Some(DeviceState::Disconnected | DeviceState::Retired)
        ) {
            debug!(device = %device.short(), "ignoring reply from a disconnected device");
            outcome.dropped = reply.len();
            return outcome;
        }
        self.registry.mark_reply(device, reply.timestamp);

        match &reply.body {
            ReplyBody::Ports(entries) => {
                for entry in entries {
                    let key = StatsKey::port(device.clone(), entry.port_no);
                    let snapshot = Snapshot::port(reply.timestamp, entry.counters);
                    let info = PortInfo {
                        name: entry.name.clone(),
                        hw_addr: entry.hw_addr.clone(),
                        reported_speed: entry.speed,
                    };
                    let (previous, stored) = self.registry.observe_port(device, entry.port_no, info, snapshot);
                    let Some(previous) = self.baseline(&key, previous, stored, &mut outcome) else {
                        continue;
                    };
                    let result = self
                        .engine
                        .port_sample(device, entry.port_no, entry.speed, &previous, &snapshot);
                    self.record(&key, result, &mut outcome);
                }
            }
            ReplyBody::Flows(entries) => {
                for entry in entries {
                    let key = StatsKey::flow(device.clone(), entry.flow_id.clone());
                    let snapshot = Snapshot::flow(reply.timestamp, entry.counters);
                    let (previous, stored) =
                        self.registry
                            .observe_flow(device, &entry.flow_id, entry.match_fields.clone(), snapshot);
                    let Some(previous) = self.baseline(&key, previous, stored, &mut outcome) else {
                        continue;
                    };
                    let result = self.engine.flow_sample(&previous, &snapshot);
                    self.record(&key, result, &mut outcome);
                }
            }
        }

        debug!(
            device = %device.short(),
            kind = %reply.kind(),
            entries = reply.len(),
            samples = outcome.samples,
            first_seen = outcome.first_seen,
            dropped = outcome.dropped,
            "reply processed"
        );
        outcome
    }

    /// The snapshot to pair with, or `None` when this entry yields no sample.
    fn baseline(
        &self,
        key: &StatsKey,
        previous: Option<Snapshot>,
        stored: bool,
        outcome: &mut ReplyOutcome,
    ) -> Option<Snapshot> {
        if !stored {
            debug!(key = %key, "snapshot not newer than the last one, skipped");
            outcome.dropped += 1;
            return None;
        }
        if previous.is_none() {
            self.store.ensure_series(key);
            outcome.first_seen += 1;
        }
        previous
    }

    fn record(&self, key: &StatsKey, result: Result<RateSample, RateError>, outcome: &mut ReplyOutcome) {
        let sample = match result {
            Ok(sample) => sample,
            Err(RateError::CounterReset { metric }) => {
                info!(key = %key, metric = %metric, "counter reset, interval discarded");
                outcome.dropped += 1;
                return;
            }
            Err(err) => {
                warn!(key = %key, error = %err, "no rate sample");
                outcome.dropped += 1;
                return;
            }
        };

        let reset = sample.reset;
        match self.store.ingest_sample(key, sample) {
            Ok(()) => {
                outcome.samples += 1;
                if reset {
                    outcome.resets += 1;
                    info!(key = %key, "counter reset, rate taken from current value");
                }
            }
            Err(err @ StoreError::StaleSample { .. }) => {
                debug!(key = %key, error = %err, "sample dropped");
                outcome.dropped += 1;
            }
            Err(err) => {
                warn!(key = %key, error = %err, "sample not stored");
                outcome.dropped += 1;
            }
        }
    }
}
