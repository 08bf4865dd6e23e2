//! Error types for workgate.
//!
//! Only configuration-time failures are errors. Per-request outcomes
//! (unmet conditions, rate limiting, failed or fatal work) are handled
//! inside the worker loop and never reach callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid rate limit rule for {key:?}: {reason}")]
    InvalidRule { key: String, reason: String },

    #[error("invalid work request: {0}")]
    InvalidRequest(String),

    #[error("background grace period denied: {0}")]
    GracePeriodDenied(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
