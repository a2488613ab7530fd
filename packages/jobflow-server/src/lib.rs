// jobflow server - HTTP API and live event streams over the job engine.
//
// Pipelines are submitted as JSON job definitions; progress is observed by
// polling /api/jobs or by subscribing to /api/streams/:topic.

pub mod config;
pub mod echo;
pub mod routes;

pub use config::ServerConfig;
pub use routes::{build_router, AppState};
