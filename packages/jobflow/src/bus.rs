//! In-process event bus.
//!
//! Two ways to observe events:
//!
//! - **Handlers** ([`EventHandler`]) are registered once and invoked in their
//!   own spawned task for every event, so a slow or failing handler never
//!   blocks the publisher or other handlers. Errors are logged and dropped.
//! - **Streams** ([`EventBus::stream`]) are broadcast receivers that see events
//!   in publish order. Slow receivers lag and miss events.
//!
//! # Guarantees
//!
//! - **Best effort**: nothing is persisted, nothing is replayed
//! - **Snapshot dispatch**: a handler registered during a publish sees only
//!   later events
//!
//! ```text
//! publish(event)
//!     ├─► broadcast::Sender ──► stream() receivers (ordered)
//!     └─► snapshot of handlers
//!             ├─► tokio::spawn(handler_a.handle(event))
//!             └─► tokio::spawn(handler_b.handle(event))
//! ```

use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::events::JobEvent;

/// Default channel capacity for event streams.
const DEFAULT_CAPACITY: usize = 10000;

/// A subscriber invoked for every published event.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Name used in logs when the handler fails.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, event: &JobEvent) -> Result<()>;
}

#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// The capacity bounds how far a stream receiver may fall behind.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            sender,
        }
    }

    /// Registers a handler for all subsequent events.
    pub fn subscribe<H: EventHandler>(&self, handler: H) {
        self.subscribe_arc(Arc::new(handler));
    }

    pub fn subscribe_arc(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push(handler);
    }

    /// Ordered receiver for events published after this call.
    pub fn stream(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Publishes an event without waiting for any subscriber.
    ///
    /// Returns the number of handlers and stream receivers the event was
    /// handed to.
    pub fn publish(&self, event: JobEvent) -> usize {
        let streamed = self.sender.send(event.clone()).unwrap_or(0);

        let snapshot: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if snapshot.is_empty() {
            return streamed;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(kind = event.kind.as_str(), "no runtime, event handlers skipped");
            return streamed;
        };

        let event = Arc::new(event);
        for handler in &snapshot {
            let handler = handler.clone();
            let event = event.clone();
            runtime.spawn(async move {
                if let Err(e) = handler.handle(&event).await {
                    warn!(
                        handler = handler.name(),
                        kind = event.kind.as_str(),
                        job_id = %event.job_id,
                        error = %e,
                        "event handler failed"
                    );
                }
            });
        }

        streamed + snapshot.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handler_count", &self.handler_count())
            .field("stream_count", &self.sender.receiver_count())
            .finish()
    }
}
