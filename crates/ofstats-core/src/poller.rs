use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::key::{DeviceId, StatsKind};
use crate::registry::DeviceState;
use crate::scheduler::SchedulerError;

/// Poll cadence and reply bookkeeping for one device.
///
/// `Active`/`Stale` devices are polled once their interval elapses; a poll
/// requests every configured kind and waits in `AwaitingReply` until each
/// kind has answered or the reply timeout passes. A lost reply is not
/// retried: the device goes `Stale` and the next interval polls again.
#[derive(Debug)]
pub struct DevicePoller {
    device: DeviceId,
    state: DeviceState,
    interval: Duration,
    reply_timeout: Duration,
    kinds: Vec<StatsKind>,
    next_poll: Instant,
    awaiting_since: Option<Instant>,
    pending: BTreeSet<StatsKind>,
    polls: u64,
    timeouts: u64,
}

impl DevicePoller {
    /// A freshly connected device is polled right away.
    pub fn new(device: DeviceId, config: &SchedulerConfig, now: Instant) -> Self {
        Self {
            device,
            state: DeviceState::Active,
            interval: config.poll_interval,
            reply_timeout: config.reply_timeout,
            kinds: config.kinds.clone(),
            next_poll: now,
            awaiting_since: None,
            pending: BTreeSet::new(),
            polls: 0,
            timeouts: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    fn deadline(&self) -> Option<Instant> {
        self.awaiting_since.map(|since| since + self.reply_timeout)
    }

    /// Next instant at which `tick` or `check_timeout` has work to do.
    pub fn next_wake(&self) -> Instant {
        match (self.state, self.deadline()) {
            (DeviceState::AwaitingReply, Some(deadline)) => deadline,
            _ => self.next_poll,
        }
    }

    /// Kinds to request now. Empty unless the device is pollable and its
    /// interval has elapsed.
    pub fn tick(&mut self, now: Instant) -> Vec<StatsKind> {
        if !matches!(self.state, DeviceState::Active | DeviceState::Stale) || now < self.next_poll {
            return Vec::new();
        }
        if self.kinds.is_empty() {
            self.next_poll = now + self.interval;
            return Vec::new();
        }

        self.next_poll = now + self.interval;
        self.pending = self.kinds.iter().copied().collect();
        self.awaiting_since = Some(now);
        self.state = DeviceState::AwaitingReply;
        self.polls += 1;
        self.kinds.clone()
    }

    /// Returns `true` when this reply completes the cycle. A late reply to a
    /// stale device also brings it back to `Active`.
    pub fn on_reply(&mut self, kind: StatsKind) -> bool {
        match self.state {
            DeviceState::AwaitingReply => {
                self.pending.remove(&kind);
                if self.pending.is_empty() {
                    self.state = DeviceState::Active;
                    self.awaiting_since = None;
                    return true;
                }
                false
            }
            DeviceState::Stale => {
                self.state = DeviceState::Active;
                true
            }
            _ => false,
        }
    }

    pub fn check_timeout(&mut self, now: Instant) -> Result<(), SchedulerError> {
        let (Some(since), Some(deadline)) = (self.awaiting_since, self.deadline()) else {
            return Ok(());
        };
        if self.state != DeviceState::AwaitingReply || now < deadline {
            return Ok(());
        }

        self.state = DeviceState::Stale;
        self.awaiting_since = None;
        let missing = std::mem::take(&mut self.pending).into_iter().collect();
        self.timeouts += 1;
        Err(SchedulerError::DeviceTimeout {
            device: self.device.clone(),
            waited_ms: now.duration_since(since).as_millis() as u64,
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(3),
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn polls_immediately_then_on_interval() {
        let start = Instant::now();
        let mut poller = DevicePoller::new(DeviceId::new("s1"), &config(), start);

        assert_eq!(poller.tick(start), vec![StatsKind::Port, StatsKind::Flow]);
        assert_eq!(poller.state(), DeviceState::AwaitingReply);
        assert!(poller.tick(start + Duration::from_secs(1)).is_empty());

        assert!(!poller.on_reply(StatsKind::Port));
        assert!(poller.on_reply(StatsKind::Flow));
        assert_eq!(poller.state(), DeviceState::Active);

        assert!(poller.tick(start + Duration::from_secs(9)).is_empty());
        assert_eq!(poller.next_wake(), start + Duration::from_secs(10));
        assert_eq!(poller.tick(start + Duration::from_secs(10)).len(), 2);
        assert_eq!(poller.polls(), 2);
    }

    #[test]
    fn missing_reply_goes_stale_without_retry() {
        let start = Instant::now();
        let mut poller = DevicePoller::new(DeviceId::new("s1"), &config(), start);
        poller.tick(start);
        poller.on_reply(StatsKind::Port);

        assert_eq!(poller.next_wake(), start + Duration::from_secs(3));
        assert!(poller.check_timeout(start + Duration::from_secs(2)).is_ok());
        let err = poller
            .check_timeout(start + Duration::from_secs(3))
            .expect_err("timed out");
        match err {
            SchedulerError::DeviceTimeout { waited_ms, missing, .. } => {
                assert_eq!(waited_ms, 3000);
                assert_eq!(missing, vec![StatsKind::Flow]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(poller.state(), DeviceState::Stale);

        // Stale waits for the next interval rather than re-requesting now.
        assert!(poller.tick(start + Duration::from_secs(4)).is_empty());
        assert_eq!(poller.tick(start + Duration::from_secs(10)).len(), 2);
        assert_eq!(poller.timeouts(), 1);
    }

    #[test]
    fn late_reply_revives_a_stale_device() {
        let start = Instant::now();
        let mut poller = DevicePoller::new(DeviceId::new("s1"), &config(), start);
        poller.tick(start);
        let _ = poller.check_timeout(start + Duration::from_secs(5));
        assert_eq!(poller.state(), DeviceState::Stale);

        assert!(poller.on_reply(StatsKind::Port));
        assert_eq!(poller.state(), DeviceState::Active);
    }
}
