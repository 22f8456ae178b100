//! [`ClientLink`] over an in-process channel. The WebSocket handler drains the channel into
//! the socket and feeds `ack` frames back through [`ChannelLink::resolve_ack`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use soulbrowser_core_types::ConnectionId;
use soulbrowser_registry::{ClientLink, LinkError};

pub struct ChannelLink {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Value>,
    acks: DashMap<String, oneshot::Sender<Value>>,
    closed: CancellationToken,
}

impl ChannelLink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            id: ConnectionId::new(),
            outbound,
            acks: DashMap::new(),
            closed: CancellationToken::new(),
        });
        (link, rx)
    }

    /// Hand an agent's ack to whoever is waiting on `ack_id`.
    pub fn resolve_ack(&self, ack_id: &str, data: Value) -> bool {
        match self.acks.remove(ack_id) {
            Some((_, waiter)) => waiter.send(data).is_ok(),
            None => {
                debug!(target: "ws", connection = %self.id, ack_id, "ack nobody waits for");
                false
            }
        }
    }

    /// Fires once the link has been told to disconnect.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl ClientLink for ChannelLink {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, frame: Value) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.outbound.send(frame).map_err(|_| LinkError::Closed)
    }

    async fn send_with_ack(&self, frame: Value, timeout: Duration) -> Result<Value, LinkError> {
        let ack_id = frame
            .get("ackId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LinkError::Send("frame carries no ackId".to_string()))?;
        let (tx, rx) = oneshot::channel();
        self.acks.insert(ack_id.clone(), tx);
        if let Err(err) = self.send(frame).await {
            self.acks.remove(&ack_id);
            return Err(err);
        }

        let outcome = tokio::select! {
            _ = self.closed.cancelled() => Err(LinkError::Closed),
            acked = tokio::time::timeout(timeout, rx) => match acked {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(_)) => Err(LinkError::Closed),
                Err(_) => Err(LinkError::AckTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        };
        if outcome.is_err() {
            self.acks.remove(&ack_id);
        }
        outcome
    }

    async fn disconnect(&self, reason: &str) {
        if !self.closed.is_cancelled() {
            info!(target: "ws", connection = %self.id, reason, "closing agent link");
        }
        self.closed.cancel();
        self.acks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn ack_resolves_the_waiting_send() {
        let (link, mut rx) = ChannelLink::new();
        let waiter = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                link.send_with_ack(json!({"ackId": "a1"}), Duration::from_secs(1))
                    .await
            })
        };
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame["ackId"], "a1");
        assert!(link.resolve_ack("a1", json!({"received": true})));
        assert_eq!(waiter.await.unwrap().unwrap(), json!({"received": true}));
        assert!(!link.resolve_ack("a1", Value::Null));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out_and_disconnect_fails_fast() {
        let (link, _rx) = ChannelLink::new();
        let err = link
            .send_with_ack(json!({"ackId": "a1"}), Duration::from_millis(1_500))
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::AckTimeout { timeout_ms: 1_500 });

        link.disconnect("test").await;
        assert!(link.is_closed());
        assert_eq!(link.send(json!({})).await.unwrap_err(), LinkError::Closed);
    }
}
