//! Background grace periods.
//!
//! When the host is about to suspend, a grace period asks the platform for a
//! bounded amount of extra execution time. Each period is keyed by a name;
//! beginning a new one under a name that is still active ends the old one
//! first. A period finishes exactly one way: `end` is called, or it expires
//! (the manager's own deadline or the platform's expiry callback, whichever
//! comes first). `on_expire` runs only in the second case and only once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Callback run when a grace period runs out.
pub type ExpireCallback = Box<dyn FnOnce() + Send + 'static>;

/// Platform primitive that grants background execution time.
pub trait BackgroundTaskProvider: Send + Sync + 'static {
    /// Request an extension. `on_expire` is invoked by the platform if it
    /// reclaims the time. Returns `None` when the request is denied.
    fn begin(&self, name: &str, on_expire: ExpireCallback) -> Option<u64>;

    /// Release an extension previously granted by `begin`.
    fn end(&self, id: u64);
}

/// Provider for hosts that are never suspended. Always grants.
#[derive(Debug, Default)]
pub struct UnboundedBackgroundTasks {
    next_id: std::sync::atomic::AtomicU64,
}

impl BackgroundTaskProvider for UnboundedBackgroundTasks {
    fn begin(&self, _name: &str, _on_expire: ExpireCallback) -> Option<u64> {
        Some(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        )
    }

    fn end(&self, _id: u64) {}
}

/// Handle for an active grace period. Pass it to [`GracePeriodManager::end`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraceToken {
    pub name: String,
    pub id: Uuid,
}

struct Extension {
    id: Uuid,
    os_id: u64,
    on_expire: Option<ExpireCallback>,
    deadline: CancellationToken,
}

struct Inner {
    provider: Arc<dyn BackgroundTaskProvider>,
    active: Mutex<HashMap<String, Extension>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Extension>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove the extension if `id` still owns `name`.
    fn take(&self, name: &str, id: Uuid) -> Option<Extension> {
        let mut active = self.lock();
        if active.get(name).is_some_and(|ext| ext.id == id) {
            active.remove(name)
        } else {
            None
        }
    }

    /// Stop the deadline and hand the extension back to the platform.
    /// Never called with the `active` lock held.
    fn release(&self, ext: Extension) {
        ext.deadline.cancel();
        self.provider.end(ext.os_id);
    }

    fn expire(&self, name: &str, id: Uuid) {
        let Some(mut ext) = self.take(name, id) else {
            return;
        };
        ext.deadline.cancel();
        self.provider.end(ext.os_id);
        info!(name, "grace period expired");
        metrics::grace_period_events().add(1, &[opentelemetry::KeyValue::new("outcome", "expired")]);
        if let Some(on_expire) = ext.on_expire.take() {
            on_expire();
        }
    }
}

/// Grants and tracks named background grace periods.
#[derive(Clone)]
pub struct GracePeriodManager {
    inner: Arc<Inner>,
}

impl GracePeriodManager {
    pub fn new(provider: Arc<dyn BackgroundTaskProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Begin a grace period of at most `max_duration` under `name`.
    ///
    /// Must be called within a Tokio runtime; the deadline runs as a task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GracePeriodDenied`] if the platform refuses.
    pub fn begin<F>(&self, name: &str, max_duration: Duration, on_expire: F) -> Result<GraceToken>
    where
        F: FnOnce() + Send + 'static,
    {
        let previous = self.inner.lock().remove(name);
        if let Some(previous) = previous {
            debug!(name, "replacing active grace period");
            self.inner.release(previous);
        }

        let id = Uuid::new_v4();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let os_name = name.to_string();
        let os_expire: ExpireCallback = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire(&os_name, id);
            }
        });

        let Some(os_id) = self.inner.provider.begin(name, os_expire) else {
            warn!(name, "grace period denied");
            metrics::grace_period_events().add(1, &[opentelemetry::KeyValue::new("outcome", "denied")]);
            return Err(Error::GracePeriodDenied(name.to_string()));
        };

        let deadline = CancellationToken::new();
        // A concurrent begin for the same name may have inserted since the
        // removal above; whichever extension loses the slot is released.
        let displaced = self.inner.lock().insert(
            name.to_string(),
            Extension {
                id,
                os_id,
                on_expire: Some(Box::new(on_expire)),
                deadline: deadline.clone(),
            },
        );
        if let Some(displaced) = displaced {
            debug!(name, "replacing concurrently started grace period");
            self.inner.release(displaced);
        }

        let weak = Arc::downgrade(&self.inner);
        let timer_name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                _ = tokio::time::sleep(max_duration) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(&timer_name, id);
                    }
                }
            }
        });

        info!(name, max_duration_ms = max_duration.as_millis() as u64, "grace period started");
        metrics::grace_period_events().add(1, &[opentelemetry::KeyValue::new("outcome", "granted")]);

        Ok(GraceToken {
            name: name.to_string(),
            id,
        })
    }

    /// End a grace period early. No-op if it already ended or expired.
    pub fn end(&self, token: &GraceToken) {
        let Some(ext) = self.inner.take(&token.name, token.id) else {
            return;
        };
        self.inner.release(ext);
        debug!(name = %token.name, "grace period ended");
        metrics::grace_period_events().add(1, &[opentelemetry::KeyValue::new("outcome", "ended")]);
    }

    /// Whether a grace period is active under `name`.
    pub fn is_active(&self, name: &str) -> bool {
        self.inner.lock().contains_key(name)
    }
}

impl std::fmt::Debug for GracePeriodManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracePeriodManager")
            .field("active", &self.inner.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}
