use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::key::{DeviceId, StatsKind};
use crate::pipeline::StatsPipeline;
use crate::poller::DevicePoller;
use crate::snapshot::StatsReply;
use crate::transport::StatsTransport;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("device {device} sent no {missing:?} reply within {waited_ms}ms")]
    DeviceTimeout {
        device: DeviceId,
        waited_ms: u64,
        missing: Vec<StatsKind>,
    },
    #[error("device {0} is not connected")]
    DeviceNotConnected(DeviceId),
    #[error("inbox for device {0} is closed")]
    InboxClosed(DeviceId),
}

struct DeviceTask {
    inbox: mpsc::Sender<StatsReply>,
    handle: JoinHandle<()>,
}

/// Drives one polling task per connected device.
///
/// Each task owns its device's [`DevicePoller`] and inbox, so replies for a
/// device are processed one at a time in arrival order while devices run
/// independently of each other.
pub struct PollingScheduler<T: StatsTransport + 'static> {
    config: SchedulerConfig,
    transport: Arc<T>,
    pipeline: Arc<StatsPipeline>,
    tasks: DashMap<DeviceId, DeviceTask>,
}

impl<T: StatsTransport + 'static> PollingScheduler<T> {
    pub fn new(config: SchedulerConfig, transport: Arc<T>, pipeline: Arc<StatsPipeline>) -> Self {
        Self {
            config,
            transport,
            pipeline,
            tasks: DashMap::new(),
        }
    }

    pub fn pipeline(&self) -> &Arc<StatsPipeline> {
        &self.pipeline
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start polling `device`. A reconnect replaces the previous task.
    pub fn on_device_connected(&self, device: DeviceId) {
        self.pipeline.registry().connect(&device, Utc::now());
        if let Some((_, previous)) = self.tasks.remove(&device) {
            previous.handle.abort();
        }

        let (inbox, rx) = mpsc::channel(self.config.inbox_capacity.max(1));
        let handle = tokio::spawn(run_device(
            device.clone(),
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.pipeline),
            rx,
        ));
        self.tasks.insert(device, DeviceTask { inbox, handle });
    }

    /// Stop polling `device`, dropping any outstanding wait. Its series stay
    /// queryable. Returns `false` for a device never seen.
    pub fn on_device_disconnected(&self, device: &DeviceId) -> bool {
        if let Some((_, task)) = self.tasks.remove(device) {
            task.handle.abort();
        }
        self.pipeline.registry().disconnect(device, Utc::now())
    }

    /// Route a reply to its device's task.
    pub async fn on_stats_reply(&self, reply: StatsReply) -> Result<(), SchedulerError> {
        let inbox = self
            .tasks
            .get(&reply.device)
            .map(|task| task.inbox.clone())
            .ok_or_else(|| SchedulerError::DeviceNotConnected(reply.device.clone()))?;
        let device = reply.device.clone();
        inbox.send(reply).await.map_err(|_| SchedulerError::InboxClosed(device))
    }

    /// Retire devices disconnected for longer than the configured grace period.
    pub fn retire_expired(&self, now: DateTime<Utc>) -> Vec<DeviceId> {
        self.pipeline
            .registry()
            .retire_expired(now, self.config.retire_after)
    }

    pub fn connected(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.tasks.iter().map(|task| task.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) {
        let ids = self.connected();
        for id in &ids {
            if let Some((_, task)) = self.tasks.remove(id) {
                task.handle.abort();
            }
        }
        info!(devices = ids.len(), "scheduler stopped");
    }
}

impl<T: StatsTransport + 'static> Drop for PollingScheduler<T> {
    fn drop(&mut self) {
        for task in self.tasks.iter() {
            task.handle.abort();
        }
    }
}

async fn run_device<T: StatsTransport>(
    device: DeviceId,
    config: SchedulerConfig,
    transport: Arc<T>,
    pipeline: Arc<StatsPipeline>,
    mut inbox: mpsc::Receiver<StatsReply>,
) {
    let registry = Arc::clone(pipeline.registry());
    let mut poller = DevicePoller::new(device.clone(), &config, Instant::now());
    debug!(device = %device.short(), "poll task started");

    loop {
        tokio::select! {
            _ = sleep_until(poller.next_wake()) => {
                let now = Instant::now();
                if let Err(err) = poller.check_timeout(now) {
                    warn!(device = %device.short(), error = %err, "reply timed out, device stale");
                }
                let kinds = poller.tick(now);
                registry.set_poll_state(&device, poller.state());
                for kind in kinds {
                    if let Err(err) = transport.request(&device, kind).await {
                        warn!(device = %device.short(), kind = %kind, error = %err, "stats request failed");
                    }
                }
            }
            reply = inbox.recv() => {
                let Some(reply) = reply else { break };
                let kind = reply.kind();
                pipeline.handle_reply(&reply);
                poller.on_reply(kind);
                registry.set_poll_state(&device, poller.state());
            }
        }
    }

    debug!(device = %device.short(), "poll task finished");
}
