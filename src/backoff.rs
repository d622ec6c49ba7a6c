//! Per-repository network-failure tracking and exponential backoff.
//!
//! This is the single source of truth about retry eligibility: no other
//! component decides to retry. Failure state lives in memory only and does
//! not survive a process restart.

use crate::error::FetchError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Base delay after the first failure.
const BASE_DELAY: Duration = Duration::from_secs(20);

/// Upper bound on any backoff interval.
const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// Consecutive failures stop counting past this.
const MAX_FAILURES: u32 = 6;

/// Identical "backoff active" notices are logged at most this often per
/// repository.
const NOTICE_INTERVAL: Duration = Duration::from_secs(15);

/// Backoff delay after `consecutive_failures` failures:
/// `min(2^(n-1) · 20 s, 15 min)`.
#[must_use]
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let n = consecutive_failures.min(MAX_FAILURES);
    let factor = 1u64 << (n - 1);
    (BASE_DELAY * u32::try_from(factor).unwrap_or(u32::MAX)).min(MAX_DELAY)
}

#[derive(Debug)]
struct FailureState {
    consecutive_failures: u32,
    next_retry_at: Instant,
    last_error: String,
    last_notice_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    states: HashMap<String, FailureState>,
    repairs: HashMap<String, tokio::task::AbortHandle>,
}

/// Tracks network failures per repository and gates retry attempts.
///
/// All operations are atomic with respect to each other; none of them
/// suspends. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct NetworkFailureManager {
    inner: Arc<Mutex<Inner>>,
}

impl NetworkFailureManager {
    /// Create a manager with no recorded failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear a repository's failure state and cancel any pending deferred
    /// repair for it.
    pub fn record_success(&self, hub_id: &str) {
        let mut inner = self.lock();
        if inner.states.remove(hub_id).is_some() {
            info!(hub_id, "network failure state cleared");
        }
        if let Some(handle) = inner.repairs.remove(hub_id) {
            handle.abort();
            debug!(hub_id, "pending deferred repair cancelled");
        }
    }

    /// Record a failure for a repository.
    ///
    /// No-op unless the error is network-class (see
    /// [`FetchError::is_network_related`]). Otherwise increments the
    /// consecutive-failure count (capped) and pushes out the next retry
    /// time exponentially.
    pub fn record_failure(&self, hub_id: &str, context: &str, err: &FetchError) {
        if !err.is_network_related() {
            debug!(hub_id, context, error = %err, "non-network error; backoff unchanged");
            return;
        }

        let mut inner = self.lock();
        let now = Instant::now();
        let state = inner.states.entry(hub_id.to_owned()).or_insert(FailureState {
            consecutive_failures: 0,
            next_retry_at: now,
            last_error: String::new(),
            last_notice_at: None,
        });
        state.consecutive_failures = (state.consecutive_failures + 1).min(MAX_FAILURES);
        let delay = backoff_delay(state.consecutive_failures);
        state.next_retry_at = now + delay;
        state.last_error = err.to_string();

        warn!(
            hub_id,
            context,
            failures = state.consecutive_failures,
            retry_in_secs = delay.as_secs(),
            error = %err,
            "network failure recorded"
        );
    }

    /// Whether a repository is eligible for a network attempt.
    ///
    /// True when no failure state exists or the backoff window has passed
    /// (the state is cleared in that case). While in backoff, identical
    /// notices are rate-limited to one per 15 s per repository.
    pub fn is_network_ready(&self, hub_id: &str, context: &str) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();

        let elapsed = match inner.states.get(hub_id) {
            None => return true,
            Some(state) => now >= state.next_retry_at,
        };
        if elapsed {
            inner.states.remove(hub_id);
            info!(hub_id, context, "backoff window elapsed; repository eligible again");
            return true;
        }

        if let Some(state) = inner.states.get_mut(hub_id) {
            let remaining = state.next_retry_at.saturating_duration_since(now);
            let should_log = state
                .last_notice_at
                .is_none_or(|at| now.saturating_duration_since(at) >= NOTICE_INTERVAL);
            if should_log {
                state.last_notice_at = Some(now);
                info!(
                    hub_id,
                    context,
                    retry_in_secs = remaining.as_secs(),
                    last_error = %state.last_error,
                    "backoff active; skipping network attempt"
                );
            }
        }
        false
    }

    /// Seconds remaining in the current backoff window, for display.
    /// `None` when the repository is not in backoff.
    #[must_use]
    pub fn pending_backoff(&self, hub_id: &str) -> Option<u64> {
        let inner = self.lock();
        let state = inner.states.get(hub_id)?;
        let remaining = state.next_retry_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            None
        } else {
            Some(remaining.as_secs().max(1))
        }
    }

    /// Consecutive failure count for a repository (0 when clear).
    #[must_use]
    pub fn failure_count(&self, hub_id: &str) -> u32 {
        self.lock()
            .states
            .get(hub_id)
            .map_or(0, |s| s.consecutive_failures)
    }

    /// Install at most one deferred repair task for a repository.
    ///
    /// The task sleeps out the current backoff window, then runs `action`.
    /// If the repository is back in backoff at fire time it logs and does
    /// nothing. [`record_success`] cancels the task.
    ///
    /// Returns `false` when a task is already pending for this repository.
    ///
    /// [`record_success`]: NetworkFailureManager::record_success
    pub fn schedule_deferred_repair<F>(&self, hub_id: &str, action: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        let pending = inner.repairs.get(hub_id).map(tokio::task::AbortHandle::is_finished);
        match pending {
            Some(false) => {
                debug!(hub_id, "deferred repair already pending");
                return false;
            }
            Some(true) => {
                inner.repairs.remove(hub_id);
            }
            None => {}
        }

        let delay = inner
            .states
            .get(hub_id)
            .map(|s| s.next_retry_at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO);

        let manager = self.clone();
        let id = hub_id.to_owned();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !manager.is_network_ready(&id, "deferred repair") {
                info!(hub_id = %id, "still in backoff at repair time; deferring");
                return;
            }
            info!(hub_id = %id, "running deferred repair");
            action.await;
            manager.lock().repairs.remove(&id);
        });

        inner.repairs.insert(hub_id.to_owned(), handle.abort_handle());
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
