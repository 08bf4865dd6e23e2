//! Work coordinator. The public entry point for producers.
//!
//! The coordinator owns the worker registry, the shared rate limiter and
//! conditions gate, and the app lifecycle. Producers call
//! [`WorkCoordinator::dispatch`]; requests fan out to every worker
//! registered under the request's work id. Requests for work ids with no
//! worker yet are buffered (bounded, oldest dropped) and handed over when a
//! matching worker registers.
//!
//! Entering the background begins a grace period. While it runs the app
//! phase is [`AppPhase::Background`]; when it expires (or is denied) the
//! phase becomes [`AppPhase::Suspended`] and workers stop starting new
//! executions until the app is active again.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::background::{BackgroundTaskProvider, GracePeriodManager, GraceToken, UnboundedBackgroundTasks};
use crate::conditions::{AlwaysReachable, ConditionsGate, ReachabilityProbe};
use crate::config::{CoordinatorConfig, RateLimitConfig};
use crate::error::Result;
use crate::handler::WorkHandler;
use crate::model::{AppPhase, ExecutionMode, LifecycleEvent, WorkRequest};
use crate::rate_limit::RateLimiter;
use crate::telemetry::metrics;
use crate::worker::{Worker, WorkerContext};

/// Name of the grace period requested on entering the background.
pub const BACKGROUND_GRACE_PERIOD: &str = "workgate.background";

#[derive(Default)]
struct Registry {
    workers: HashMap<String, Vec<Arc<Worker>>>,
    unrouted: VecDeque<WorkRequest>,
}

struct Inner {
    config: CoordinatorConfig,
    rate_limiter: Arc<RateLimiter>,
    gate: Arc<ConditionsGate>,
    grace: GracePeriodManager,
    phase: watch::Sender<AppPhase>,
    shutdown: CancellationToken,
    registry: Mutex<Registry>,
    grace_token: Mutex<Option<GraceToken>>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn grace_token(&self) -> MutexGuard<'_, Option<GraceToken>> {
        self.grace_token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, next: AppPhase) {
        let changed = self.phase.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(phase = %next, "app phase changed");
        }
    }
}

/// Handle to a registered worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    worker: Arc<Worker>,
}

impl WorkerHandle {
    pub fn id(&self) -> Uuid {
        self.worker.id()
    }

    pub fn work_id(&self) -> &str {
        self.worker.work_id()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.worker.mode()
    }

    pub fn pending_count(&self) -> usize {
        self.worker.pending_count()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}

/// Builder for plugging host collaborators into a coordinator.
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    probe: Arc<dyn ReachabilityProbe>,
    background_tasks: Arc<dyn BackgroundTaskProvider>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reachability(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn background_tasks(mut self, provider: Arc<dyn BackgroundTaskProvider>) -> Self {
        self.background_tasks = provider;
        self
    }

    pub fn build(self) -> WorkCoordinator {
        let (phase, _) = watch::channel(AppPhase::Foreground);
        WorkCoordinator {
            inner: Arc::new(Inner {
                config: self.config,
                rate_limiter: Arc::new(RateLimiter::new()),
                gate: Arc::new(ConditionsGate::new(self.probe)),
                grace: GracePeriodManager::new(self.background_tasks),
                phase,
                shutdown: CancellationToken::new(),
                registry: Mutex::new(Registry::default()),
                grace_token: Mutex::new(None),
            }),
        }
    }
}

/// Routes work requests to workers and drives their shared environment.
#[derive(Clone)]
pub struct WorkCoordinator {
    inner: Arc<Inner>,
}

impl WorkCoordinator {
    /// Coordinator for an always-online, never-suspended host.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder {
            config: CoordinatorConfig::default(),
            probe: Arc::new(AlwaysReachable),
            background_tasks: Arc::new(UnboundedBackgroundTasks::default()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.rate_limiter
    }

    pub fn grace_periods(&self) -> &GracePeriodManager {
        &self.inner.grace
    }

    pub fn phase(&self) -> AppPhase {
        *self.inner.phase.borrow()
    }

    /// Register and start a worker for `work_id`.
    ///
    /// Several workers may share a work id; dispatch reaches all of them.
    /// Requests buffered for `work_id` before any worker existed are handed
    /// to this one. Must be called within a Tokio runtime.
    pub fn register_worker<H>(
        &self,
        work_id: impl Into<String>,
        mode: ExecutionMode,
        handler: H,
    ) -> WorkerHandle
    where
        H: WorkHandler,
    {
        let work_id = work_id.into();
        let ctx = WorkerContext {
            rate_limiter: Arc::clone(&self.inner.rate_limiter),
            gate: Arc::clone(&self.inner.gate),
            grace: self.inner.grace.clone(),
            phase: self.inner.phase.subscribe(),
            shutdown: self.inner.shutdown.clone(),
            config: self.inner.config.clone(),
        };
        let worker = Arc::new(Worker::new(work_id.clone(), mode, Arc::new(handler), ctx));
        tokio::spawn(Arc::clone(&worker).run());

        let mut registry = self.inner.registry();
        registry
            .workers
            .entry(work_id.clone())
            .or_default()
            .push(Arc::clone(&worker));

        let mut handed_over = 0usize;
        let mut kept = VecDeque::with_capacity(registry.unrouted.len());
        for request in registry.unrouted.drain(..) {
            if request.work_id == work_id {
                worker.enqueue(request);
                handed_over += 1;
            } else {
                kept.push_back(request);
            }
        }
        registry.unrouted = kept;
        drop(registry);

        info!(work_id = %work_id, mode = ?mode, buffered = handed_over, "worker registered");
        WorkerHandle { worker }
    }

    /// Fire-and-forget: hand `request` to every worker for its work id.
    pub fn dispatch(&self, request: WorkRequest) {
        if request.work_id.is_empty() {
            warn!("dropping request with an empty work id");
            metrics::work_dropped().add(1, &[KeyValue::new("reason", "invalid")]);
            return;
        }
        metrics::work_dispatched().add(1, &[KeyValue::new("work_id", request.work_id.clone())]);

        let mut registry = self.inner.registry();
        if let Some(workers) = registry.workers.get(&request.work_id) {
            for worker in workers {
                worker.enqueue(request.clone());
            }
            return;
        }

        debug!(work_id = %request.work_id, "no worker registered, buffering request");
        registry.unrouted.push_back(request);
        while registry.unrouted.len() > self.inner.config.unrouted_capacity {
            if let Some(dropped) = registry.unrouted.pop_front() {
                warn!(work_id = %dropped.work_id, "unrouted buffer full, dropping oldest request");
                metrics::work_dropped().add(1, &[KeyValue::new("reason", "buffer_overflow")]);
            }
        }
    }

    /// Requests waiting for a worker to register.
    pub fn unrouted_count(&self) -> usize {
        self.inner.registry().unrouted.len()
    }

    /// Workers registered under `work_id`.
    pub fn worker_count(&self, work_id: &str) -> usize {
        self.inner
            .registry()
            .workers
            .get(work_id)
            .map_or(0, Vec::len)
    }

    /// Install or replace a shared rate limit.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::InvalidRule`] if `rate` or `interval` is zero.
    pub fn set_rate_limit(&self, key: impl Into<String>, rate: u32, interval: Duration) -> Result<()> {
        self.inner.rate_limiter.set_rule(key, rate, interval)
    }

    /// Install every rate limit from a config file.
    pub fn apply_rate_limits(&self, limits: &[RateLimitConfig]) -> Result<()> {
        for limit in limits {
            self.set_rate_limit(limit.key.clone(), limit.rate, limit.interval())?;
        }
        Ok(())
    }

    /// Longest rate-limit wait among the workers' next requests, capped at
    /// the grace period. Zero when nothing is only waiting on a rate limit.
    pub fn background_wait_time(&self) -> Duration {
        let max = self.inner.config.grace_period();
        self.inner
            .registry()
            .workers
            .values()
            .flatten()
            .map(|worker| worker.background_wait_time(max))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Tell waiting workers that connectivity may have changed.
    pub fn connectivity_changed(&self) {
        self.inner.gate.connectivity_changed();
    }

    /// React to a host lifecycle notification.
    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::DidEnterBackground => self.enter_background(),
            LifecycleEvent::DidBecomeActive => self.become_active(),
        }
    }

    fn enter_background(&self) {
        self.inner.set_phase(AppPhase::Background);
        info!(
            rate_limit_wait_ms = self.background_wait_time().as_millis() as u64,
            "entered background"
        );

        let weak = Arc::downgrade(&self.inner);
        let begun = self.inner.grace.begin(
            BACKGROUND_GRACE_PERIOD,
            self.inner.config.grace_period(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.set_phase(AppPhase::Suspended);
                }
            },
        );

        match begun {
            Ok(token) => {
                *self.inner.grace_token() = Some(token);
            }
            Err(e) => {
                warn!(error = %e, "no background time granted, in-flight work may be suspended");
                *self.inner.grace_token() = None;
                self.inner.set_phase(AppPhase::Suspended);
            }
        }
    }

    fn become_active(&self) {
        if let Some(token) = self.inner.grace_token().take() {
            self.inner.grace.end(&token);
        }
        self.inner.set_phase(AppPhase::Foreground);
    }

    /// Forward lifecycle events from `events` until shutdown or the sender closes.
    pub fn observe_lifecycle(&self, mut events: mpsc::Receiver<LifecycleEvent>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator.inner.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => coordinator.handle_lifecycle(event),
                        None => break,
                    },
                }
            }
            debug!("lifecycle observer stopped");
        })
    }

    /// Stop every worker loop and release any grace period.
    pub fn shutdown(&self) {
        info!("coordinator shutting down");
        self.inner.shutdown.cancel();
        if let Some(token) = self.inner.grace_token().take() {
            self.inner.grace.end(&token);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for WorkCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkCoordinator")
            .field("phase", &self.phase())
            .field("unrouted", &self.unrouted_count())
            .finish_non_exhaustive()
    }
}
