use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::error;

use crate::config::{RateConfig, ResetPolicy};
use crate::key::{DeviceId, Metric, StatsKind};
use crate::snapshot::{RateSample, Snapshot};
use crate::speed::SpeedResolver;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateError {
    #[error("non-positive interval of {interval_ns}ns between snapshots")]
    InvalidInterval { interval_ns: i64 },
    #[error("counter {metric} reset, interval discarded")]
    CounterReset { metric: Metric },
    /// Two snapshots of different kinds were paired; the caller mixed keys.
    #[error("snapshot kinds do not match: previous {previous}, current {current}")]
    KindMismatch { previous: StatsKind, current: StatsKind },
}

/// Converts consecutive cumulative snapshots into per-second rates.
///
/// `rate = (current - previous) / interval`. A counter that decreased is
/// treated as reset: the current value alone is the delta and the sample is
/// flagged with `reset = true`.
pub fn compute_rates(
    previous: &Snapshot,
    current: &Snapshot,
    speed: Option<f64>,
    policy: ResetPolicy,
) -> Result<RateSample, RateError> {
    if previous.kind() != current.kind() {
        error!(
            previous = %previous.kind(),
            current = %current.kind(),
            "rate engine received snapshots of different kinds"
        );
        return Err(RateError::KindMismatch {
            previous: previous.kind(),
            current: current.kind(),
        });
    }

    let elapsed = current.timestamp - previous.timestamp;
    // Nanoseconds overflow i64 only past ~292 years.
    let interval_ns = elapsed
        .num_nanoseconds()
        .unwrap_or_else(|| elapsed.num_milliseconds().saturating_mul(1_000_000));
    if interval_ns <= 0 {
        return Err(RateError::InvalidInterval { interval_ns });
    }
    let interval_secs = interval_ns as f64 / 1e9;

    let mut rates = BTreeMap::new();
    let mut reset = false;
    for metric in Metric::counters(current.kind()) {
        let (Some(before), Some(now)) = (previous.counters.get(*metric), current.counters.get(*metric))
        else {
            continue;
        };
        let delta = if now >= before {
            now - before
        } else {
            if policy == ResetPolicy::Discard {
                return Err(RateError::CounterReset { metric: *metric });
            }
            reset = true;
            now
        };
        rates.insert(*metric, delta as f64 / interval_secs);
    }

    let speed = speed.filter(|s| *s > 0.0);
    let utilization = |metric: Metric| match (speed, rates.get(&metric)) {
        (Some(speed), Some(rate)) => Some(rate / speed),
        _ => None,
    };
    let rx_utilization = utilization(Metric::RxBytes);
    let tx_utilization = utilization(Metric::TxBytes);

    Ok(RateSample {
        timestamp: current.timestamp,
        interval_secs,
        rates,
        rx_utilization,
        tx_utilization,
        speed,
        reset,
    })
}

/// Rate computation bound to the live speed overrides.
///
/// The speed is resolved for every port sample, so an override reload takes
/// effect on the next sample.
pub struct RateEngine {
    resolver: Arc<SpeedResolver>,
    config: RateConfig,
}

impl RateEngine {
    pub fn new(resolver: Arc<SpeedResolver>, config: RateConfig) -> Self {
        Self { resolver, config }
    }

    pub fn resolver(&self) -> &Arc<SpeedResolver> {
        &self.resolver
    }

    pub fn port_sample(
        &self,
        device: &DeviceId,
        port_no: u32,
        reported_speed: Option<u64>,
        previous: &Snapshot,
        current: &Snapshot,
    ) -> Result<RateSample, RateError> {
        let speed = self.resolver.resolve(device, port_no, reported_speed);
        compute_rates(previous, current, speed.known(), self.config.reset_policy)
    }

    pub fn flow_sample(&self, previous: &Snapshot, current: &Snapshot) -> Result<RateSample, RateError> {
        compute_rates(previous, current, None, self.config.reset_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeedUnit;
    use crate::snapshot::{FlowCounters, PortCounters};
    use crate::speed::OverrideTree;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid timestamp")
    }

    fn port(secs: i64, rx_bytes: u64, tx_bytes: u64) -> Snapshot {
        Snapshot::port(
            at(secs),
            PortCounters {
                rx_bytes,
                tx_bytes,
                rx_packets: rx_bytes / 100,
                tx_packets: tx_bytes / 100,
                ..PortCounters::default()
            },
        )
    }

    #[test]
    fn rate_is_delta_over_interval() {
        let sample = compute_rates(&port(0, 1000, 500), &port(10, 3000, 1500), None, ResetPolicy::AssumeZero)
            .expect("valid interval");

        assert_eq!(sample.interval_secs, 10.0);
        assert_eq!(sample.value(Metric::RxBytes), Some(200.0));
        assert_eq!(sample.value(Metric::TxBytes), Some(100.0));
        assert_eq!(sample.value(Metric::RxPackets), Some(2.0));
        assert_eq!(sample.value(Metric::RxDropped), Some(0.0));
        assert!(!sample.reset);
        assert_eq!(sample.rx_utilization, None);
    }

    #[test]
    fn irregular_intervals_are_respected() {
        let previous = port(0, 0, 0);
        let mut current = port(0, 999, 0);
        current.timestamp = at(0) + chrono::Duration::milliseconds(2500);

        let sample = compute_rates(&previous, &current, None, ResetPolicy::AssumeZero).expect("valid");
        assert_eq!(sample.interval_secs, 2.5);
        assert_eq!(sample.value(Metric::RxBytes), Some(999.0 / 2.5));
    }

    #[test]
    fn decreasing_counter_is_a_reset_not_negative_traffic() {
        let sample = compute_rates(&port(0, 500_000, 800), &port(10, 50, 900), None, ResetPolicy::AssumeZero)
            .expect("valid interval");

        assert!(sample.reset);
        assert_eq!(sample.value(Metric::RxBytes), Some(5.0));
        assert_eq!(sample.value(Metric::TxBytes), Some(10.0));
        assert!(sample.rates.values().all(|rate| *rate >= 0.0));
    }

    #[test]
    fn discard_policy_drops_the_interval() {
        let err = compute_rates(&port(0, 500_000, 0), &port(10, 50, 0), None, ResetPolicy::Discard)
            .expect_err("reset discarded");
        assert_eq!(err, RateError::CounterReset { metric: Metric::RxBytes });
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let err = compute_rates(&port(10, 0, 0), &port(10, 5, 5), None, ResetPolicy::AssumeZero)
            .expect_err("zero interval");
        assert_eq!(err, RateError::InvalidInterval { interval_ns: 0 });

        let err = compute_rates(&port(10, 0, 0), &port(5, 5, 5), None, ResetPolicy::AssumeZero)
            .expect_err("negative interval");
        assert_eq!(err, RateError::InvalidInterval { interval_ns: -5_000_000_000 });
    }

    #[test]
    fn sub_millisecond_interval_is_still_positive() {
        let previous = port(0, 0, 0);
        let mut current = port(0, 10, 0);
        current.timestamp = at(0) + chrono::Duration::microseconds(500);

        let sample = compute_rates(&previous, &current, None, ResetPolicy::AssumeZero).expect("positive interval");
        assert_eq!(sample.interval_secs, 0.0005);
        assert_eq!(sample.value(Metric::RxBytes), Some(10.0 / 0.0005));
    }

    #[test]
    fn nanosecond_offsets_are_not_truncated() {
        let previous = port(0, 0, 0);
        let mut current = port(0, 1_000_000_000, 0);
        current.timestamp = at(0) + chrono::Duration::nanoseconds(10_000_456_789);

        let sample = compute_rates(&previous, &current, None, ResetPolicy::AssumeZero).expect("valid");
        let interval = 10_000_456_789.0 / 1e9;
        assert_eq!(sample.interval_secs, interval);
        assert_eq!(sample.value(Metric::RxBytes), Some(1e9 / interval));
        assert!((sample.value(Metric::RxBytes).unwrap_or_default() - 99_995_432.3186).abs() < 1e-3);
    }

    #[test]
    fn mixed_kinds_are_refused() {
        let flow = Snapshot::flow(at(10), FlowCounters::default());
        let err = compute_rates(&port(0, 0, 0), &flow, None, ResetPolicy::AssumeZero).expect_err("mismatch");
        assert!(matches!(err, RateError::KindMismatch { .. }));
    }

    #[test]
    fn utilization_uses_resolved_speed() {
        let resolver = Arc::new(SpeedResolver::with_tree(
            OverrideTree::from_json(&json!({"D1": {"4": 1_250_000_000u64}}), SpeedUnit::BytesPerSec)
                .expect("valid"),
            SpeedUnit::BytesPerSec,
        ));
        let engine = RateEngine::new(resolver, RateConfig::default());
        let device = DeviceId::new("D1");

        let sample = engine
            .port_sample(&device, 4, None, &port(0, 1000, 0), &port(10, 3000, 0))
            .expect("valid");
        assert_eq!(sample.value(Metric::RxBytes), Some(200.0));
        assert_eq!(sample.rx_utilization, Some(200.0 / 1_250_000_000.0));
        assert_eq!(sample.tx_utilization, Some(0.0));

        let unknown = engine
            .port_sample(&device, 5, Some(0), &port(0, 1000, 0), &port(10, 3000, 0))
            .expect("valid");
        assert_eq!(unknown.rx_utilization, None);
        assert_eq!(unknown.speed, None);
    }

    #[test]
    fn override_reload_applies_to_next_sample() {
        let resolver = Arc::new(SpeedResolver::new(SpeedUnit::BytesPerSec));
        let engine = RateEngine::new(Arc::clone(&resolver), RateConfig::default());
        let device = DeviceId::new("D1");

        let before = engine
            .port_sample(&device, 1, Some(1000), &port(0, 0, 0), &port(10, 1000, 0))
            .expect("valid");
        assert_eq!(before.rx_utilization, Some(0.1));

        resolver.reload_json(&json!({"D1": {"default": 100}})).expect("valid");
        let after = engine
            .port_sample(&device, 1, Some(1000), &port(10, 1000, 0), &port(20, 2000, 0))
            .expect("valid");
        assert_eq!(after.rx_utilization, Some(1.0));
    }

    #[test]
    fn flow_samples_carry_no_utilization() {
        let engine = RateEngine::new(Arc::new(SpeedResolver::new(SpeedUnit::Gbps)), RateConfig::default());
        let previous = Snapshot::flow(at(0), FlowCounters { packet_count: 10, byte_count: 1000 });
        let current = Snapshot::flow(at(4), FlowCounters { packet_count: 30, byte_count: 5000 });

        let sample = engine.flow_sample(&previous, &current).expect("valid");
        assert_eq!(sample.value(Metric::PacketCount), Some(5.0));
        assert_eq!(sample.value(Metric::ByteCount), Some(1000.0));
        assert_eq!(sample.value(Metric::RxUtilization), None);
    }
}
