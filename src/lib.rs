//! # workgate
//!
//! In-process coordinator for deferred background work.
//!
//! Producers dispatch named work requests; per-work-id workers resolve
//! conflicts, wait out delays, network conditions and shared sliding-window
//! rate limits, run the caller's async handler and retry failures with
//! backoff. A grace period manager keeps work alive briefly while the host
//! is being backgrounded.

pub mod background;
pub mod conditions;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod model;
pub mod rate_limit;
pub mod telemetry;
pub mod worker;

pub use coordinator::{WorkCoordinator, WorkerHandle};
pub use model::{ConflictPolicy, ExecutionMode, WorkRequest, WorkResult};
