//! Background watchers that decide when work is actually finished.
//!
//! - [`StepMonitor`]: one per waiting step; finalizes the step job and its
//!   `step_stats` entry once its children settle, time out, or never appear.
//! - [`JobMonitor`]: pipeline-level progress events, and completion of worker
//!   jobs that spawned their own children.
//! - [`StaleJobDetector`]: fails running jobs whose heartbeat went silent.
//!
//! All three poll. Child populations can be large, so one re-count per tick
//! is cheaper than reacting to every child transition.

mod job;
mod stale;
mod step;

pub use job::JobMonitor;
pub use stale::StaleJobDetector;
pub use step::{StepMonitor, StepMonitorConfig, StepWatch};
