//! Broker-backed event dispatcher
//!
//! `dispatch` is called from shard receive loops and must not block them,
//! so envelopes are queued and published in order by a single task.

use crate::events::{serialize_event, EventDispatcher, GatewayEvent};
use crate::nats::publisher::NatsPublisher;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct NatsDispatcher {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl NatsDispatcher {
    /// Dispatcher plus the queue it feeds
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Dispatcher wired to a publisher task
    pub fn spawn(publisher: Arc<NatsPublisher>) -> (Arc<Self>, JoinHandle<()>) {
        let (dispatcher, rx) = Self::channel();
        let task = tokio::spawn(publish_loop(publisher, rx));
        (Arc::new(dispatcher), task)
    }
}

impl EventDispatcher for NatsDispatcher {
    fn dispatch(&self, event: &str, payload: &Value) {
        let Some(envelope) = serialize_event(event, payload) else {
            return;
        };
        if self.tx.send(envelope).is_err() {
            warn!(event, "Publisher task gone, dropping event");
        }
    }
}

async fn publish_loop(publisher: Arc<NatsPublisher>, mut rx: mpsc::UnboundedReceiver<GatewayEvent>) {
    while let Some(event) = rx.recv().await {
        // failures are counted and logged by the publisher
        let _ = publisher.publish_event(&event).await;
    }
    debug!("Event publisher stopped");
}
