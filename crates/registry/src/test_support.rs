use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use soulbrowser_core_types::ConnectionId;

use crate::{api::ClientLink, errors::LinkError};

pub struct RecordingLink {
    id: ConnectionId,
    pub frames: Mutex<Vec<Value>>,
    disconnected: AtomicBool,
}

impl RecordingLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            frames: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn was_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientLink for RecordingLink {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, frame: Value) -> Result<(), LinkError> {
        if self.was_disconnected() {
            return Err(LinkError::Closed);
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn send_with_ack(&self, frame: Value, _timeout: Duration) -> Result<Value, LinkError> {
        self.send(frame).await?;
        Ok(Value::Null)
    }

    async fn disconnect(&self, _reason: &str) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}
