//! Circuit Breaker
//!
//! A three-state guard around calls to one destination. When the destination
//! fails repeatedly the breaker "opens" and later calls are rejected without
//! being attempted. After a cooldown the breaker lets a limited number of
//! probe calls through to decide whether to close again.
//!
//! # State Transitions
//!
//! ```text
//! ┌────────┐    max_failures     ┌────────┐
//! │ Closed │ ──────────────────► │  Open  │ ◄─────────┐
//! └────────┘   (consecutive)     └────────┘           │
//!     ▲                              │                │
//!     │                              │ open_timeout   │ probe
//!     │ probe                        ▼                │ failure
//!     │ success                 ┌──────────┐          │
//!     └──────────────────────── │ HalfOpen │ ─────────┘
//!                               └──────────┘
//! ```
//!
//! A call is admitted by taking a [`CallPermit`] and settled by reporting its
//! outcome on the permit. A permit dropped without an outcome (the call future
//! was cancelled, for instance by a deadline) counts as a failure.
//!
//! Each transition bumps a generation number. Outcomes reported on a permit
//! taken in an earlier generation are ignored, so a slow call admitted while
//! Closed cannot close a breaker that has since opened.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation, calls flow through.
    Closed,
    /// Destination unhealthy, calls are rejected.
    Open,
    /// Cooldown elapsed, a limited number of probe calls are let through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// Time spent Open before the next call is admitted as a probe.
    pub open_timeout: Duration,
    /// Concurrent calls admitted while HalfOpen.
    pub max_half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout: Duration::from_secs(60),
            max_half_open_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Replaces zero values with the defaults.
    fn sanitized(self) -> Self {
        let defaults = Self::default();
        Self {
            max_failures: if self.max_failures == 0 { defaults.max_failures } else { self.max_failures },
            open_timeout: if self.open_timeout.is_zero() { defaults.open_timeout } else { self.open_timeout },
            max_half_open_probes: if self.max_half_open_probes == 0 {
                defaults.max_half_open_probes
            } else {
                self.max_half_open_probes
            },
        }
    }
}

/// Callback invoked on every state transition with `(breaker, from, to)`.
pub type StateObserver = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Open,
    TooManyRequests,
}

/// Outcome of a guarded call.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// Circuit is open, the call was not attempted
    #[error("circuit breaker {0} is open")]
    Open(String),
    /// Circuit is half-open and its probe slots are taken
    #[error("circuit breaker {0} is half-open with no free probe slot")]
    TooManyRequests(String),
    /// The call itself failed
    #[error("{0}")]
    Inner(E),
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_state_change: Instant,
    half_open_in_flight: u32,
    generation: u64,
}

type Transition = (CircuitState, CircuitState);

impl BreakerState {
    fn transition(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        debug_assert_legal_transition!(from, to);

        self.state = to;
        self.last_state_change = Instant::now();
        self.half_open_in_flight = 0;
        self.generation += 1;
        if to == CircuitState::Closed {
            self.consecutive_failures = 0;
        }
        (from, to)
    }
}

/// Three-state circuit breaker for one destination.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observer: Option<StateObserver>,
    times_opened: AtomicU64,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: config.sanitized(),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_state_change: Instant::now(),
                half_open_in_flight: 0,
                generation: 0,
            }),
            observer: None,
            times_opened: AtomicU64::new(0),
        }
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An Open breaker whose timeout has elapsed still reports
    /// Open until the next call is admitted.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// How many times the circuit has opened.
    pub fn times_opened(&self) -> u64 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Admits a call or rejects it without side effects on the destination.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, Rejection> {
        let (permit, transition) = {
            let mut state = self.lock();
            match state.state {
                CircuitState::Closed => (self.permit(state.generation), None),
                CircuitState::Open => {
                    if state.last_state_change.elapsed() < self.config.open_timeout {
                        return Err(Rejection::Open);
                    }
                    let transition = state.transition(CircuitState::HalfOpen);
                    state.half_open_in_flight = 1;
                    (self.permit(state.generation), Some(transition))
                }
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight >= self.config.max_half_open_probes {
                        return Err(Rejection::TooManyRequests);
                    }
                    state.half_open_in_flight += 1;
                    debug_assert_probe_bound!(state.half_open_in_flight, self.config.max_half_open_probes);
                    (self.permit(state.generation), None)
                }
            }
        };
        self.notify(transition);
        Ok(permit)
    }

    /// Runs `call` if the breaker admits it and records its outcome.
    pub async fn call<T, E, F>(&self, call: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(|rejection| match rejection {
            Rejection::Open => CallError::Open(self.name.clone()),
            Rejection::TooManyRequests => CallError::TooManyRequests(self.name.clone()),
        })?;

        match call.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CallError::Inner(e))
            }
        }
    }

    /// Forces the breaker back to Closed.
    pub fn reset(&self) {
        let transitions = {
            let mut state = self.lock();
            match state.state {
                CircuitState::Closed => {
                    state.consecutive_failures = 0;
                    Vec::new()
                }
                // Open -> Closed is not a regular edge, go through HalfOpen.
                CircuitState::Open => vec![
                    state.transition(CircuitState::HalfOpen),
                    state.transition(CircuitState::Closed),
                ],
                CircuitState::HalfOpen => vec![state.transition(CircuitState::Closed)],
            }
        };
        for transition in transitions {
            self.notify(Some(transition));
        }
    }

    fn permit(&self, generation: u64) -> CallPermit<'_> {
        CallPermit {
            breaker: self,
            generation,
            settled: false,
        }
    }

    fn settle(&self, generation: u64, success: bool) {
        let transition = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            match (state.state, success) {
                (CircuitState::Closed, true) => {
                    state.consecutive_failures = 0;
                    None
                }
                (CircuitState::Closed, false) => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.max_failures {
                        self.times_opened.fetch_add(1, Ordering::Relaxed);
                        Some(state.transition(CircuitState::Open))
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, true) => Some(state.transition(CircuitState::Closed)),
                (CircuitState::HalfOpen, false) => {
                    state.consecutive_failures += 1;
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                    Some(state.transition(CircuitState::Open))
                }
                // Permits are never handed out while Open within one generation.
                (CircuitState::Open, _) => None,
            }
        };
        self.notify(transition);
    }

    fn notify(&self, transition: Option<Transition>) {
        if let (Some((from, to)), Some(observer)) = (transition, &self.observer) {
            observer(&self.name, from, to);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission ticket for one call. Report the outcome with [`success`] or
/// [`failure`]; dropping it unsettled records a failure.
///
/// [`success`]: CallPermit::success
/// [`failure`]: CallPermit::failure
#[must_use = "an unsettled permit records a failure when dropped"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, false);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.generation, false);
        }
    }
}

/// Snapshot of one breaker for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub times_opened: u64,
}

/// One circuit breaker per destination key, created on first use.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    observer: Option<StateObserver>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            observer: None,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry whose breakers log every state change.
    pub fn with_logging(config: CircuitBreakerConfig) -> Self {
        Self::new(config).with_observer(Arc::new(|name, from, to| {
            tracing::info!(
                circuit_breaker = name,
                from = %from,
                to = %to,
                "OTLP exporter circuit breaker state changed"
            );
        }))
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Returns the breaker for `key`, creating it if needed.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check: another caller may have created it between the two locks.
        Arc::clone(breakers.entry(key.to_owned()).or_insert_with(|| {
            let mut breaker = CircuitBreaker::new(key, self.config);
            if let Some(observer) = &self.observer {
                breaker = breaker.with_observer(Arc::clone(observer));
            }
            Arc::new(breaker)
        }))
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every breaker, sorted by name.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut stats: Vec<BreakerStats> = breakers
            .iter()
            .map(|b| {
                let state = b.lock();
                BreakerStats {
                    name: b.name.clone(),
                    state: state.state,
                    failures: state.consecutive_failures,
                    times_opened: b.times_opened(),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
