//! Work attempt span helpers.

use tracing::Span;

/// Start a span for one execution attempt of a request.
///
/// The `work.state` field starts empty; transitions are recorded with
/// [`record_state_transition`].
pub fn start_attempt_span(work_id: &str, request_id: u64, attempt: u32) -> Span {
    tracing::info_span!(
        "work.attempt",
        "work.id" = work_id,
        "work.request" = request_id,
        "work.attempt" = attempt,
        "work.state" = tracing::field::Empty,
    )
}

/// Emit a state transition event inside `span` and record the new state.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
