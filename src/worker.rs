//! Per-work-id worker: queue, conflict resolution and the execution loop.
//!
//! A worker owns every request enqueued for its work id. Each request is
//! driven through the same pipeline until it succeeds, turns fatal or is
//! superseded:
//!
//! 1. hold while the app is suspended
//! 2. wait out the failure backoff, if any
//! 3. wait out the initial delay (measured from enqueue)
//! 4. wait for the conditions gate
//! 5. wait for rate-limit admission
//! 6. run the handler inside its own background task
//! 7. on failure, record the backoff and start over at 1
//!
//! Every wait is interruptible. Shutdown and supersession (a `replace`)
//! abandon the request; an app phase change makes the loop re-evaluate.
//! Leaving the foreground drops the pending backoff so failed work gets
//! one more try before the host suspends. Execution itself is never
//! interrupted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, trace, warn};
use uuid::Uuid;

use crate::background::GracePeriodManager;
use crate::conditions::ConditionsGate;
use crate::config::CoordinatorConfig;
use crate::handler::SharedHandler;
use crate::model::{AppPhase, ConflictPolicy, ExecutionMode, WorkRequest, WorkResult};
use crate::rate_limit::RateLimiter;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_attempt_span};

/// Shared collaborators handed to every worker by the coordinator.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub rate_limiter: Arc<RateLimiter>,
    pub gate: Arc<ConditionsGate>,
    pub grace: GracePeriodManager,
    pub phase: watch::Receiver<AppPhase>,
    pub shutdown: CancellationToken,
    pub config: CoordinatorConfig,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    id: u64,
    request: WorkRequest,
    enqueued_at: Instant,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Entry {
    pending: PendingRequest,
    started: bool,
    executing: bool,
}

/// Per-request progress carried across attempts.
#[derive(Debug)]
struct Progress {
    attempt: u32,
    /// Failure backoff: when it started and how long it lasts.
    retry: Option<(Instant, Duration)>,
    /// Last app phase this request observed.
    seen: AppPhase,
}

impl Progress {
    fn remaining_backoff(&self) -> Option<Duration> {
        let (since, backoff) = self.retry?;
        let remaining = backoff.saturating_sub(since.elapsed());
        (!remaining.is_zero()).then_some(remaining)
    }
}

#[derive(Debug, Default)]
struct Queue {
    entries: VecDeque<Entry>,
    next_id: u64,
}

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Elapsed,
    /// App phase changed; re-evaluate.
    Interrupted,
    /// The request was replaced.
    Superseded,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum Wait {
    For(Duration),
    /// Like `For`, but also wakes on a connectivity change.
    Connectivity(Duration),
    /// Until interrupted.
    Indefinitely,
}

/// Runs all work for one work id.
pub struct Worker {
    id: Uuid,
    work_id: String,
    mode: ExecutionMode,
    handler: SharedHandler,
    ctx: WorkerContext,
    queue: Mutex<Queue>,
    ready: Notify,
}

impl Worker {
    pub(crate) fn new(
        work_id: String,
        mode: ExecutionMode,
        handler: SharedHandler,
        ctx: WorkerContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            work_id,
            mode,
            handler,
            ctx,
            queue: Mutex::new(Queue::default()),
            ready: Notify::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn work_id(&self) -> &str {
        &self.work_id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Requests queued, backing off or executing.
    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether a handler call is in progress.
    pub fn is_running(&self) -> bool {
        self.lock().entries.iter().any(|e| e.executing)
    }

    /// How long the head request still needs before it can run, if that
    /// wait is only the rate limit and fits within `max`. Zero otherwise.
    pub fn background_wait_time(&self, max: Duration) -> Duration {
        let head = self
            .lock()
            .entries
            .front()
            .map(|e| (e.pending.request.requires_network, e.pending.request.rate_limit_ids.clone()));
        let Some((requires_network, keys)) = head else {
            return Duration::ZERO;
        };
        if keys.is_empty() || !self.ctx.gate.satisfied(requires_network) {
            return Duration::ZERO;
        }
        let wait = self.ctx.rate_limiter.next_available(&keys);
        if wait > max { Duration::ZERO } else { wait }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a request, resolving it against existing work by its conflict
    /// policy. Returns `false` if the request was dropped.
    pub fn enqueue(&self, request: WorkRequest) -> bool {
        if request.work_id != self.work_id {
            error!(
                worker = %self.work_id,
                work_id = %request.work_id,
                "request routed to the wrong worker"
            );
            return false;
        }

        let mut queue = self.lock();
        match request.conflict_policy {
            ConflictPolicy::Append => {}
            ConflictPolicy::KeepExisting => {
                if !queue.entries.is_empty() {
                    trace!(work_id = %self.work_id, "request already scheduled, keeping existing");
                    metrics::work_dropped().add(1, &[KeyValue::new("reason", "kept_existing")]);
                    return false;
                }
            }
            ConflictPolicy::Replace => {
                for entry in queue.entries.drain(..) {
                    trace!(
                        work_id = %self.work_id,
                        request_id = entry.pending.id,
                        executing = entry.executing,
                        "replacing scheduled request"
                    );
                    entry.pending.cancel.cancel();
                    metrics::work_dropped().add(1, &[KeyValue::new("reason", "replaced")]);
                }
            }
        }

        let id = queue.next_id;
        queue.next_id += 1;
        queue.entries.push_back(Entry {
            pending: PendingRequest {
                id,
                request,
                enqueued_at: Instant::now(),
                cancel: self.ctx.shutdown.child_token(),
            },
            started: false,
            executing: false,
        });
        drop(queue);

        debug!(work_id = %self.work_id, request_id = id, "request enqueued");
        self.ready.notify_one();
        true
    }

    /// The execution loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>) {
        let slots = Arc::new(Semaphore::new(self.mode.max_in_flight()));
        info!(work_id = %self.work_id, mode = ?self.mode, "worker started");

        loop {
            let permit = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let next = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                next = self.next_request() => next,
            };

            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.drive(next).await;
                drop(permit);
            });
        }

        info!(work_id = %self.work_id, "worker stopped");
    }

    async fn next_request(&self) -> PendingRequest {
        loop {
            if let Some(next) = self.take_unstarted() {
                return next;
            }
            self.ready.notified().await;
        }
    }

    fn take_unstarted(&self) -> Option<PendingRequest> {
        let mut queue = self.lock();
        let entry = queue.entries.iter_mut().find(|e| !e.started)?;
        entry.started = true;
        Some(entry.pending.clone())
    }

    /// Mark the request as executing. Fails if it was replaced.
    fn begin_execution(&self, id: u64) -> bool {
        let mut queue = self.lock();
        match queue.entries.iter_mut().find(|e| e.pending.id == id) {
            Some(entry) => {
                entry.executing = true;
                true
            }
            None => false,
        }
    }

    /// Clear the executing flag. Returns whether the request is still queued.
    fn end_execution(&self, id: u64) -> bool {
        let mut queue = self.lock();
        match queue.entries.iter_mut().find(|e| e.pending.id == id) {
            Some(entry) => {
                entry.executing = false;
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: u64) {
        self.lock().entries.retain(|e| e.pending.id != id);
    }

    /// Drive one request until it finishes or is abandoned.
    async fn drive(&self, pending: PendingRequest) {
        let mut phase = self.ctx.phase.clone();
        let mut progress = Progress {
            attempt: 0,
            retry: None,
            seen: *phase.borrow_and_update(),
        };

        loop {
            match self.prepare(&pending, &mut phase, &mut progress).await {
                Wake::Elapsed | Wake::Interrupted => {}
                Wake::Superseded => {
                    debug!(work_id = %self.work_id, request_id = pending.id, "request superseded");
                    return;
                }
                Wake::Shutdown => return,
            }

            progress.attempt += 1;
            let attempt = progress.attempt;
            match self.execute(&pending, attempt).await {
                WorkResult::Success => {
                    self.remove(pending.id);
                    trace!(work_id = %self.work_id, request_id = pending.id, attempt, "work finished");
                    return;
                }
                WorkResult::Fatal => {
                    self.remove(pending.id);
                    warn!(work_id = %self.work_id, request_id = pending.id, attempt, "work failed fatally, dropping");
                    metrics::work_dropped().add(1, &[KeyValue::new("reason", "fatal")]);
                    return;
                }
                WorkResult::Failure => {
                    if !self.end_execution(pending.id) {
                        debug!(
                            work_id = %self.work_id,
                            request_id = pending.id,
                            "request replaced while executing, not retrying"
                        );
                        return;
                    }
                    let backoff = self.ctx.config.backoff_for(attempt);
                    debug!(
                        work_id = %self.work_id,
                        request_id = pending.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "work failed, backing off"
                    );
                    progress.retry = Some((Instant::now(), backoff));
                }
            }
        }
    }

    /// Wait until the request may execute, then mark it executing.
    ///
    /// Returns `Wake::Elapsed` when ready to run.
    async fn prepare(
        &self,
        pending: &PendingRequest,
        phase: &mut watch::Receiver<AppPhase>,
        progress: &mut Progress,
    ) -> Wake {
        let request = &pending.request;
        loop {
            if self.ctx.shutdown.is_cancelled() {
                return Wake::Shutdown;
            }
            if pending.cancel.is_cancelled() {
                return Wake::Superseded;
            }

            let current = *phase.borrow_and_update();
            if progress.seen == AppPhase::Foreground
                && current != AppPhase::Foreground
                && progress.retry.take().is_some()
            {
                debug!(work_id = %self.work_id, request_id = pending.id, "left foreground, skipping backoff");
            }
            progress.seen = current;

            let wake = if current == AppPhase::Suspended {
                debug!(work_id = %self.work_id, request_id = pending.id, "suspended, holding request");
                self.pause(Wait::Indefinitely, pending, phase).await
            } else if let Some(remaining) = progress.remaining_backoff() {
                self.pause(Wait::For(remaining), pending, phase).await
            } else if let Some(remaining) = remaining_delay(pending) {
                self.pause(Wait::For(remaining), pending, phase).await
            } else if !self.ctx.gate.satisfied(request.requires_network) {
                trace!(work_id = %self.work_id, request_id = pending.id, "conditions unmet");
                let retry = self.ctx.config.gate_retry_interval();
                self.pause(Wait::Connectivity(retry), pending, phase).await
            } else if !request.rate_limit_ids.is_empty()
                && !self.ctx.rate_limiter.try_admit(&request.rate_limit_ids)
            {
                let wait = self
                    .ctx
                    .rate_limiter
                    .next_available(&request.rate_limit_ids)
                    .max(self.ctx.config.min_rate_limit_wait());
                debug!(
                    work_id = %self.work_id,
                    request_id = pending.id,
                    wait_ms = wait.as_millis() as u64,
                    "rate limited"
                );
                metrics::rate_limit_denied()
                    .add(1, &[KeyValue::new("work_id", self.work_id.clone())]);
                self.pause(Wait::For(wait), pending, phase).await
            } else if self.begin_execution(pending.id) {
                progress.retry = None;
                return Wake::Elapsed;
            } else {
                return Wake::Superseded;
            };

            match wake {
                Wake::Elapsed | Wake::Interrupted => continue,
                other => return other,
            }
        }
    }

    async fn execute(&self, pending: &PendingRequest, attempt: u32) -> WorkResult {
        let span = start_attempt_span(&self.work_id, pending.id, attempt);
        record_state_transition(&span, "pending", "running");

        // Keep the attempt alive if the host backgrounds mid-call. Expiry
        // only gets logged; the call itself runs to completion.
        let task_name = format!("workgate: {}({}/{})", self.work_id, self.id.simple(), pending.id);
        let expired_name = task_name.clone();
        let background = match self.ctx.grace.begin(&task_name, self.ctx.config.grace_period(), move || {
            warn!(task = %expired_name, "background time ran out mid-attempt");
        }) {
            Ok(token) => Some(token),
            Err(e) => {
                span.in_scope(|| debug!(error = %e, "attempt runs without background time"));
                None
            }
        };

        let started = Instant::now();
        let call = self.handler.call(pending.request.clone()).instrument(span.clone());
        let result = match tokio::spawn(call).await {
            Ok(result) => result,
            Err(e) => {
                span.in_scope(|| error!(error = %e, "work handler panicked"));
                WorkResult::Failure
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Some(token) = background {
            self.ctx.grace.end(&token);
        }

        record_state_transition(&span, "running", &result.to_string());
        metrics::work_attempts().add(
            1,
            &[
                KeyValue::new("work_id", self.work_id.clone()),
                KeyValue::new("result", result.to_string()),
            ],
        );
        metrics::work_duration_ms().record(elapsed_ms, &[KeyValue::new("work_id", self.work_id.clone())]);
        result
    }

    /// Cancellable wait. Interrupted by shutdown, supersession and any app
    /// phase change.
    async fn pause(
        &self,
        wait: Wait,
        pending: &PendingRequest,
        phase: &mut watch::Receiver<AppPhase>,
    ) -> Wake {
        let (duration, on_connectivity) = match wait {
            Wait::For(d) => (Some(d), false),
            Wait::Connectivity(d) => (Some(d), true),
            Wait::Indefinitely => (None, false),
        };

        let timer = async {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        let connectivity = async {
            if on_connectivity {
                self.ctx.gate.changed().await;
            } else {
                std::future::pending::<()>().await;
            }
        };
        let phase_change = async {
            // A closed channel means the coordinator is gone; never wake on it.
            if phase.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            biased;
            _ = self.ctx.shutdown.cancelled() => Wake::Shutdown,
            _ = pending.cancel.cancelled() => Wake::Superseded,
            _ = phase_change => Wake::Interrupted,
            _ = connectivity => Wake::Interrupted,
            _ = timer => Wake::Elapsed,
        }
    }
}

fn remaining_delay(pending: &PendingRequest) -> Option<Duration> {
    let remaining = match pending.enqueued_at.checked_add(pending.request.initial_delay) {
        Some(eligible_at) => eligible_at.saturating_duration_since(Instant::now()),
        None => Duration::MAX,
    };
    (!remaining.is_zero()).then_some(remaining)
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("work_id", &self.work_id)
            .field("mode", &self.mode)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}
