//! Work queue feeding the dispatcher.
//!
//! The queue only carries job ids; the job record itself lives in the store.
//! A dequeued id whose job has meanwhile become terminal (e.g. cancelled while
//! queued) is skipped by the dispatcher.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::job::JobId;

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn enqueue(&self, id: JobId) -> Result<()>;

    /// Next id, waiting up to `wait` for one to arrive.
    async fn dequeue(&self, wait: Duration) -> Result<Option<JobId>>;

    async fn len(&self) -> usize;
}

/// FIFO queue shared by all dispatcher loops.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    items: Mutex<VecDeque<JobId>>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop(&self) -> Option<JobId> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, id: JobId) -> Result<()> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(id);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<JobId>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(id) = self.pop() {
                return Ok(Some(id));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(self.pop());
            }
        }
    }

    async fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
