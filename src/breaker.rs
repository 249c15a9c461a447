// =============================================================================
// Circuit Breaker Registry — per-endpoint CLOSED / OPEN / HALF_OPEN guards
// =============================================================================
//
// Each named endpoint gets a breaker with three states:
//
//   CLOSED    calls pass through; consecutive failures are counted and a
//             success resets the counter.
//   OPEN      calls are rejected immediately without invoking the wrapped
//             function; the entry time is recorded.
//   HALF_OPEN exactly one probe call is permitted. Success → CLOSED,
//             failure → OPEN with a fresh entry time.
//
// Leaving OPEN always goes through HALF_OPEN; no transition skips the probe.
//
// Time is injected via `_at` suffixed methods for deterministic testing.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BreakerParams;

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Error wrapper returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error> {
    /// The breaker rejected the call without invoking the wrapped function.
    #[error("circuit open; next probe in {retry_in:?}")]
    Open { retry_in: Duration },
    /// The wrapped function ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Serialisable per-breaker snapshot for the status export.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// Seconds until the next probe is permitted; `None` unless OPEN.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_until_probe: Option<u64>,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// A single endpoint breaker.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

/// Outcome of asking the breaker for permission to call.
enum Acquire {
    Pass { probe: bool },
    Reject { retry_in: Duration },
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, params: BreakerParams) -> Self {
        Self {
            name: name.into(),
            failure_threshold: params.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(params.recovery_timeout_sec),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Run `fut` through the breaker. Rejected calls never poll the future.
    pub async fn call<T, E, Fut>(&self, fut: Fut) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        match self.try_acquire_at(Instant::now()) {
            Acquire::Reject { retry_in } => Err(BreakerError::Open { retry_in }),
            Acquire::Pass { probe } => match fut.await {
                Ok(value) => {
                    self.on_success();
                    Ok(value)
                }
                Err(e) => {
                    self.on_failure_at(Instant::now());
                    if probe {
                        warn!(breaker = %self.name, "probe failed — breaker re-opened");
                    }
                    Err(BreakerError::Inner(e))
                }
            },
        }
    }

    fn try_acquire_at(&self, now: Instant) -> Acquire {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Acquire::Pass { probe: false },
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "recovery timeout elapsed — probing (HALF_OPEN)");
                    Acquire::Pass { probe: true }
                } else {
                    Acquire::Reject { retry_in: self.recovery_timeout - elapsed }
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    // A probe is already out; reject everyone else.
                    Acquire::Reject { retry_in: Duration::ZERO }
                } else {
                    inner.probe_in_flight = true;
                    Acquire::Pass { probe: true }
                }
            }
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                info!(breaker = %self.name, "probe succeeded — breaker CLOSED");
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            // A success while OPEN is a late result from before the trip;
            // the breaker state is not rewound.
            BreakerState::Open => {}
        }
    }

    /// Record a failed call at `now`.
    pub fn on_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        threshold = self.failure_threshold,
                        "failure threshold reached — breaker OPEN"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                inner.consecutive_failures += 1;
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Force the breaker back to CLOSED with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn status(&self) -> BreakerStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> BreakerStatus {
        let inner = self.inner.lock();
        let seconds_until_probe = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened)) => {
                let elapsed = now.duration_since(opened);
                Some(self.recovery_timeout.saturating_sub(elapsed).as_secs())
            }
            _ => None,
        };
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            seconds_until_probe,
        }
    }

    #[cfg(test)]
    fn acquire_for_test(&self, now: Instant) -> Result<bool, Duration> {
        match self.try_acquire_at(now) {
            Acquire::Pass { probe } => Ok(probe),
            Acquire::Reject { retry_in } => Err(retry_in),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Process-wide collection of breakers, initialise-on-first-use.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_params: BreakerParams,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_params: BreakerParams { failure_threshold: 5, recovery_timeout_sec: 60 },
        }
    }

    /// Fetch the breaker for `name`, creating it with `params` on first use.
    pub fn get_or_register(&self, name: &str, params: BreakerParams) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return existing.clone();
        }
        let mut map = self.breakers.write();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, params)))
            .clone()
    }

    /// Fetch the breaker for `name`, creating it with registry defaults.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_register(name, self.default_params)
    }

    pub fn open_names(&self) -> Vec<String> {
        self.names_in(BreakerState::Open)
    }

    pub fn half_open_names(&self) -> Vec<String> {
        self.names_in(BreakerState::HalfOpen)
    }

    pub fn closed_names(&self) -> Vec<String> {
        self.names_in(BreakerState::Closed)
    }

    fn names_in(&self, state: BreakerState) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .iter()
            .filter(|(_, b)| b.state() == state)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    /// Status snapshot of every registered breaker, name-sorted.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> = self
            .breakers
            .read()
            .values()
            .map(|b| b.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
