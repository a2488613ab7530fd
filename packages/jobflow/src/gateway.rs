//! Forwards job events to live observers.
//!
//! The gateway is an [`EventHandler`]: it serializes each event once and
//! publishes it to the [`StreamHub`] under [`ALL_JOBS_TOPIC`] and, when the
//! event belongs to a pipeline, under that pipeline's topic. Log events below
//! `info` are not forwarded.

use anyhow::Result;
use async_trait::async_trait;
use tracing::trace;

use crate::bus::EventHandler;
use crate::events::{JobEvent, JobEventKind};
use crate::hub::{pipeline_topic, StreamHub, ALL_JOBS_TOPIC};

#[derive(Debug, Clone)]
pub struct NotificationGateway {
    hub: StreamHub,
}

impl NotificationGateway {
    pub fn new(hub: StreamHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    /// Whether `event` is meant for external observers.
    pub fn should_forward(event: &JobEvent) -> bool {
        match (event.kind, event.level) {
            (JobEventKind::JobLog, Some(level)) => level.should_forward(),
            (JobEventKind::JobLog, None) => false,
            _ => true,
        }
    }
}

#[async_trait]
impl EventHandler for NotificationGateway {
    fn name(&self) -> &'static str {
        "notification_gateway"
    }

    async fn handle(&self, event: &JobEvent) -> Result<()> {
        if !Self::should_forward(event) {
            return Ok(());
        }

        let value = serde_json::to_value(event)?;
        let mut delivered = self.hub.publish(ALL_JOBS_TOPIC, value.clone()).await;
        if let Some(manager_id) = event.manager_id {
            delivered += self.hub.publish(&pipeline_topic(manager_id), value).await;
        }
        trace!(kind = event.kind.as_str(), delivered, "event forwarded");
        Ok(())
    }
}
