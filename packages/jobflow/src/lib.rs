//! Job orchestration engine.
//!
//! A [`JobDefinition`] describes named steps and their dependencies. Triggering
//! it creates a three-level job tree and runs it:
//!
//! ```text
//! manager job (the pipeline)
//!   ├── step job "crawl"      ── StepManager enqueues children
//!   │     ├── worker job      ── executed by a Worker from the queue
//!   │     └── worker job
//!   └── step job "summarize"  (starts once "crawl" is terminal)
//!         └── worker job
//! ```
//!
//! Steps run one at a time in dependency order. A step finishes when its
//! [`StepMonitor`](monitor::StepMonitor) sees every child terminal, and its
//! outcome is recorded in the manager's `step_stats`. Every state change is
//! published on the [`EventBus`] and forwarded to live observers through the
//! [`StreamHub`].
//!
//! Start with [`Engine::builder`].

pub mod bus;
pub mod config;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod hub;
mod id;
pub mod job;
pub mod log;
pub mod monitor;
pub mod orchestrator;
pub mod queue;
pub mod status;
pub mod step;
pub mod store;

pub use bus::{EventBus, EventHandler};
pub use config::EngineConfig;
pub use definition::{ErrorTolerance, FailureAction, JobDefinition, OnError, StepDefinition};
pub use dispatcher::{Dispatcher, Worker, WorkerContext};
pub use engine::{Engine, EngineBuilder};
pub use error::{DefinitionError, JobflowError, Result, StoreError};
pub use events::{JobEvent, JobEventKind};
pub use gateway::NotificationGateway;
pub use hub::StreamHub;
pub use job::{
    ChildStats, Job, JobFilter, JobId, JobKind, JobMetadata, JobStatus, ParentFilter, StepStat,
};
pub use log::{LogEntry, LogLevel};
pub use orchestrator::Orchestrator;
pub use queue::{InMemoryJobQueue, JobQueue};
pub use status::JobStatusManager;
pub use step::{FanOutStepManager, StepContext, StepManager, StepManagerRegistry};
pub use store::{InMemoryJobStore, JobStore};
