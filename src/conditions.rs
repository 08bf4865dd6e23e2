//! Environmental preconditions for running work.
//!
//! Today the only condition is network reachability. The probe is supplied
//! by the host; an unavailable probe counts as "not connected".

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

/// Host-provided reachability probe.
pub trait ReachabilityProbe: Send + Sync + 'static {
    /// Current connectivity, or `None` when the probe cannot answer.
    fn is_connected(&self) -> Option<bool>;
}

/// Probe for hosts that are always online.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReachable;

impl ReachabilityProbe for AlwaysReachable {
    fn is_connected(&self) -> Option<bool> {
        Some(true)
    }
}

/// Probe whose answer is set by the host, e.g. from a platform callback.
#[derive(Debug, Default)]
pub struct ManualReachability {
    // 0 = unknown, 1 = offline, 2 = online
    state: AtomicU8,
}

impl ManualReachability {
    pub fn new(connected: Option<bool>) -> Self {
        let probe = Self::default();
        probe.set(connected);
        probe
    }

    pub fn set(&self, connected: Option<bool>) {
        let value = match connected {
            None => 0,
            Some(false) => 1,
            Some(true) => 2,
        };
        self.state.store(value, Ordering::SeqCst);
    }
}

impl ReachabilityProbe for ManualReachability {
    fn is_connected(&self) -> Option<bool> {
        match self.state.load(Ordering::SeqCst) {
            1 => Some(false),
            2 => Some(true),
            _ => None,
        }
    }
}

/// Answers whether a request's preconditions hold right now.
pub struct ConditionsGate {
    probe: Arc<dyn ReachabilityProbe>,
    changed: Notify,
}

impl ConditionsGate {
    pub fn new(probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self {
            probe,
            changed: Notify::new(),
        }
    }

    pub fn satisfied(&self, requires_network: bool) -> bool {
        if !requires_network {
            return true;
        }
        self.probe.is_connected().unwrap_or(false)
    }

    /// Tell waiters connectivity may have changed.
    pub fn connectivity_changed(&self) {
        self.changed.notify_waiters();
    }

    /// Resolves on the next [`connectivity_changed`](Self::connectivity_changed).
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

impl std::fmt::Debug for ConditionsGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionsGate").finish_non_exhaustive()
    }
}
