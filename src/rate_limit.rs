//! Sliding-window rate limiter shared by every worker.
//!
//! Each key has a rule `(rate, interval)` and a list of hit timestamps.
//! A key admits another hit while fewer than `rate` hits fall inside the
//! trailing `interval`. Hits outside the window are pruned lazily.
//!
//! All state sits behind one mutex so check-and-record is a single step:
//! two admissions over overlapping keys can never both pass when together
//! they would break a rule.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Quota for one rate-limit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub rate: u32,
    pub interval: Duration,
}

#[derive(Debug, Default)]
struct LimiterState {
    rules: HashMap<String, RateLimitRule>,
    hits: HashMap<String, VecDeque<Instant>>,
}

impl LimiterState {
    /// Drop hits older than the key's window. Returns the remaining hits.
    fn prune(&mut self, key: &str, rule: RateLimitRule, now: Instant) -> &VecDeque<Instant> {
        let hits = self.hits.entry(key.to_string()).or_default();
        while let Some(&oldest) = hits.front() {
            if now.saturating_duration_since(oldest) >= rule.interval {
                hits.pop_front();
            } else {
                break;
            }
        }
        hits
    }

    /// Time until `key` admits one more hit. Zero when it already does.
    fn wait_for(&mut self, key: &str, now: Instant) -> Duration {
        let Some(rule) = self.rules.get(key).copied() else {
            return Duration::ZERO;
        };
        let hits = self.prune(key, rule, now);
        let rate = rule.rate as usize;
        if hits.len() < rate {
            return Duration::ZERO;
        }
        let blocking = hits[hits.len() - rate];
        rule.interval
            .saturating_sub(now.saturating_duration_since(blocking))
    }
}

/// Tracks hits per key and answers admission and backoff queries.
#[derive(Debug, Default)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        // Nothing inside the critical sections can leave the maps half-updated,
        // so a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install or replace the rule for `key`. Replacing resets its hits.
    pub fn set_rule(&self, key: impl Into<String>, rate: u32, interval: Duration) -> Result<()> {
        let key = key.into();
        if rate == 0 {
            return Err(Error::InvalidRule {
                key,
                reason: "rate must be greater than zero".to_string(),
            });
        }
        if interval.is_zero() {
            return Err(Error::InvalidRule {
                key,
                reason: "interval must be greater than zero".to_string(),
            });
        }

        let mut state = self.lock();
        state.hits.remove(&key);
        debug!(key = %key, rate, interval_ms = interval.as_millis() as u64, "rate limit rule set");
        state.rules.insert(key, RateLimitRule { rate, interval });
        Ok(())
    }

    /// The rule installed for `key`, if any.
    pub fn rule(&self, key: &str) -> Option<RateLimitRule> {
        self.lock().rules.get(key).copied()
    }

    /// Admit one hit against every key, or none.
    ///
    /// Keys without a rule are unconstrained. Returns `false` and records
    /// nothing if any constrained key is at its limit.
    pub fn try_admit(&self, keys: &BTreeSet<String>) -> bool {
        let now = Instant::now();
        let mut state = self.lock();

        for key in keys {
            if !state.wait_for(key, now).is_zero() {
                debug!(key = %key, "rate limit reached");
                return false;
            }
        }

        for key in keys {
            if state.rules.contains_key(key.as_str()) {
                state.hits.entry(key.clone()).or_default().push_back(now);
            }
        }
        true
    }

    /// Longest wait across `keys` until all of them admit one more hit.
    pub fn next_available(&self, keys: &BTreeSet<String>) -> Duration {
        let now = Instant::now();
        let mut state = self.lock();
        keys.iter()
            .map(|key| state.wait_for(key, now))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Hits currently inside the window for `key`.
    pub fn hit_count(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(rule) = state.rules.get(key).copied() else {
            return 0;
        };
        state.prune(key, rule, now).len()
    }
}
