//! Core data model.
//!
//! A work request names the worker(s) that should handle it, when it becomes
//! eligible, what it needs from the environment and how it resolves against
//! work already queued under the same id.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Request
// ---------------------------------------------------------------------------

/// One unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Which registered worker(s) handle this request. Never empty.
    pub work_id: String,

    /// Minimum time after enqueue before the request may run.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Whether connectivity is required before running.
    pub requires_network: bool,

    /// How this request resolves against pending work for the same id.
    pub conflict_policy: ConflictPolicy,

    /// Rate-limit keys this request must respect.
    pub rate_limit_ids: BTreeSet<String>,

    /// Opaque caller payload. The coordinator never interprets it.
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl WorkRequest {
    pub fn new(work_id: impl Into<String>) -> Result<Self> {
        let work_id = work_id.into();
        if work_id.is_empty() {
            return Err(Error::InvalidRequest("work id must not be empty".to_string()));
        }
        Ok(Self {
            work_id,
            initial_delay: Duration::ZERO,
            requires_network: false,
            conflict_policy: ConflictPolicy::default(),
            rate_limit_ids: BTreeSet::new(),
            extras: serde_json::Map::new(),
        })
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn requires_network(mut self, required: bool) -> Self {
        self.requires_network = required;
        self
    }

    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn rate_limit_id(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_ids.insert(key.into());
        self
    }

    pub fn rate_limit_ids<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rate_limit_ids.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

/// Resolution when a request arrives for a work id that already has work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Drop pending requests and install this one. Executing work finishes.
    Replace,
    /// Queue behind existing work.
    #[default]
    Append,
    /// Drop this request if anything is pending or running.
    KeepExisting,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictPolicy::Replace => "replace",
            ConflictPolicy::Append => "append",
            ConflictPolicy::KeepExisting => "keep_existing",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Work Result
// ---------------------------------------------------------------------------

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkResult {
    /// Done. The request is dropped.
    Success,
    /// Transient failure. Retried with backoff.
    Failure,
    /// Permanent failure. Dropped without retry.
    Fatal,
}

impl std::fmt::Display for WorkResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkResult::Success => "success",
            WorkResult::Failure => "failure",
            WorkResult::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Execution Mode
// ---------------------------------------------------------------------------

/// How a worker runs its queued requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One request at a time, in queue order.
    #[default]
    Serial,
    /// Up to `n` requests overlap. Zero is treated as one.
    Concurrent(usize),
}

impl ExecutionMode {
    pub fn max_in_flight(self) -> usize {
        match self {
            ExecutionMode::Serial => 1,
            ExecutionMode::Concurrent(n) => n.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// App lifecycle
// ---------------------------------------------------------------------------

/// Where the host process is in its foreground/background lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppPhase {
    #[default]
    Foreground,
    /// Backgrounded with a grace period running.
    Background,
    /// Backgrounded with no grace period left. No new executions start.
    Suspended,
}

impl std::fmt::Display for AppPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AppPhase::Foreground => "foreground",
            AppPhase::Background => "background",
            AppPhase::Suspended => "suspended",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle notifications delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    DidEnterBackground,
    DidBecomeActive,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
