//! Topic-keyed broadcast channels for pushing job events to live observers.
//!
//! Topics are plain strings; the [`NotificationGateway`](crate::gateway::NotificationGateway)
//! publishes every forwarded event to [`ALL_JOBS_TOPIC`] and to the
//! [`pipeline_topic`] of the event's manager.
//!
//! ```text
//! hub.publish("job:0191…", json!({"type": "job_log", …})).await;
//! let rx = hub.subscribe("job:0191…").await;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::job::JobId;

/// Topic carrying events of every job.
pub const ALL_JOBS_TOPIC: &str = "jobs";

/// Topic carrying events of one pipeline and everything under it.
pub fn pipeline_topic(manager_id: JobId) -> String {
    format!("job:{manager_id}")
}

/// Cloneable pub/sub hub. Payloads are JSON so transports stay agnostic of
/// event types.
#[derive(Clone)]
pub struct StreamHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Value>>>>,
    capacity: usize,
}

impl StreamHub {
    /// 256 messages per topic.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Sends `value` to current subscribers of `topic`. Returns how many
    /// received it; zero when nobody listens.
    pub async fn publish(&self, topic: &str, value: Value) -> usize {
        let channels = self.channels.read().await;
        match channels.get(topic) {
            Some(tx) => tx.send(value).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribes to a topic, creating its channel on first use.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        let mut channels = self.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub async fn topic_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Drops channels nobody listens to.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHub")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
