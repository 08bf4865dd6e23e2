//! Metric instrument factories for workgate.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider installed these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workgate")
}

/// Counter: requests accepted by `dispatch`.
/// Labels: `work_id`.
pub fn work_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("workgate.work.dispatched")
        .with_description("Number of work requests dispatched")
        .build()
}

/// Counter: execution attempts.
/// Labels: `work_id`, `result` ("success" | "failure" | "fatal").
pub fn work_attempts() -> Counter<u64> {
    meter()
        .u64_counter("workgate.work.attempts")
        .with_description("Number of work execution attempts")
        .build()
}

/// Counter: requests dropped without running to success.
/// Labels: `reason` ("replaced" | "kept_existing" | "fatal" | "buffer_overflow").
pub fn work_dropped() -> Counter<u64> {
    meter()
        .u64_counter("workgate.work.dropped")
        .with_description("Number of work requests dropped")
        .build()
}

/// Counter: admissions refused by the rate limiter.
/// Labels: `work_id`.
pub fn rate_limit_denied() -> Counter<u64> {
    meter()
        .u64_counter("workgate.rate_limit.denied")
        .with_description("Number of rate limiter admissions refused")
        .build()
}

/// Counter: grace period lifecycle.
/// Labels: `outcome` ("granted" | "denied" | "ended" | "expired").
pub fn grace_period_events() -> Counter<u64> {
    meter()
        .u64_counter("workgate.grace_period.events")
        .with_description("Background grace period lifecycle events")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `work_id`.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workgate.work.duration_ms")
        .with_description("Work handler execution time in milliseconds")
        .with_unit("ms")
        .build()
}
