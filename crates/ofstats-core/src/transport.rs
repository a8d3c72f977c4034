use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::key::{DeviceId, StatsKind};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request channel closed")]
    Closed,
}

/// "Request counters of `kind` from `device`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub device: DeviceId,
    pub kind: StatsKind,
}

/// Outbound side of the protocol layer.
///
/// Requests are fire-and-forget: the matching reply arrives later through
/// [`crate::PollingScheduler::on_stats_reply`], correlated by device and kind.
#[async_trait]
pub trait StatsTransport: Send + Sync {
    async fn request(&self, device: &DeviceId, kind: StatsKind) -> Result<(), TransportError>;
}

/// Hands requests to whoever holds the receiving end.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundRequest>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatsTransport for ChannelTransport {
    async fn request(&self, device: &DeviceId, kind: StatsKind) -> Result<(), TransportError> {
        self.tx
            .send(OutboundRequest {
                device: device.clone(),
                kind,
            })
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_fail_once_the_receiver_is_gone() {
        let (transport, mut rx) = ChannelTransport::new();
        let device = DeviceId::new("s1");

        transport.request(&device, StatsKind::Port).await.expect("receiver alive");
        let request = rx.recv().await.expect("request delivered");
        assert_eq!(request, OutboundRequest { device: device.clone(), kind: StatsKind::Port });

        drop(rx);
        let err = transport.request(&device, StatsKind::Flow).await.expect_err("receiver dropped");
        assert!(matches!(err, TransportError::Closed));
    }
}
