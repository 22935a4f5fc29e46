//! Circuit Breaker Implementation
//!
//! One breaker exists per service instance. It is written to by two independent
//! callers, the health monitor and the dispatcher's outcome path, and both go through
//! the same [`CircuitBreaker::report`] entry point so every transition is applied
//! under one lock.
//!
//! ## States:
//! - **Closed**: Normal operation; consecutive failures are counted
//! - **Open**: Calls are rejected locally until `next_attempt`
//! - **HalfOpen**: A limited number of concurrent trial calls test recovery
//!
//! Within one episode the only edges are
//! `Closed -> Open -> HalfOpen -> {Closed | Open}`.
//!
//! ## Key Rust Concepts:
//! - `Arc<Inner>` lets an admission permit outlive the borrow of the breaker
//! - `parking_lot::Mutex` guards the state machine (no lock poisoning to handle)
//! - `Drop` on [`CallPermit`] returns a half-open trial slot if the call is abandoned
//! - `AtomicU64` counters are read without taking the state lock

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker specific errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open")]
    CircuitOpen,
    #[error("Circuit breaker is half-open and all trial slots are taken")]
    TrialsExhausted,
}

/// Result of one call, as seen by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Circuit breaker state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerState {
    /// Normal operation, tracking consecutive failures
    Closed { failure_count: u32 },

    /// Calls rejected until `next_attempt`
    Open { next_attempt: Instant },

    /// Testing recovery with a bounded number of concurrent trials
    HalfOpen { success_count: u32, trials_in_flight: u32 },
}

impl CircuitBreakerState {
    /// Upper-case state name used in logs and the discovery endpoint
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "CLOSED",
            Self::Open { .. } => "OPEN",
            Self::HalfOpen { .. } => "HALF_OPEN",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial is allowed
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,

    /// Number of trial successes needed in HalfOpen to close the circuit
    pub success_threshold: u32,

    /// Maximum number of concurrent trial calls in HalfOpen
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            success_threshold: 3,
            half_open_max_trials: 1,
        }
    }
}

/// Counters collected by the circuit breaker
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    /// Calls admitted by `try_acquire`
    pub admitted: AtomicU64,

    /// Admissions refused while open or out of trial slots
    pub rejected: AtomicU64,

    /// Success signals received (probe or dispatch)
    pub successes: AtomicU64,

    /// Failure signals received (probe or dispatch)
    pub failures: AtomicU64,

    /// Number of times the circuit has opened
    pub opened: AtomicU64,

    /// Number of times the circuit has closed again
    pub closed: AtomicU64,
}

/// Serializable view of a breaker for the discovery endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub trial_successes: u32,
    pub trials_in_flight: u32,
    pub next_attempt_in_ms: Option<u64>,
    pub opened_count: u64,
    pub rejected_count: u64,
}

struct BreakerCore {
    state: CircuitBreakerState,
    /// Bumped each time the circuit opens; permits from an older episode no longer
    /// own a slot and their outcomes are discarded.
    episode: u64,
    /// Consecutive failures that opened the current episode
    failures_at_open: u32,
}

struct Inner {
    name: String,
    config: CircuitBreakerConfig,
    metrics: CircuitBreakerMetrics,
    core: Mutex<BreakerCore>,
}

/// Per-instance circuit breaker
///
/// Cloning is cheap and every clone drives the same state machine.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the `Closed` state
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                metrics: CircuitBreakerMetrics::default(),
                core: Mutex::new(BreakerCore {
                    state: CircuitBreakerState::Closed { failure_count: 0 },
                    episode: 0,
                    failures_at_open: 0,
                }),
            }),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Whether a call could be admitted right now, without taking a trial slot
    ///
    /// This is an evaluation: an open circuit whose timeout has elapsed moves to
    /// `HalfOpen` here.
    pub fn is_available(&self) -> bool {
        self.is_available_at(Instant::now())
    }

    pub fn is_available_at(&self, now: Instant) -> bool {
        let mut core = self.inner.core.lock();
        self.inner.refresh(&mut core, now);

        match core.state {
            CircuitBreakerState::Closed { .. } => true,
            CircuitBreakerState::Open { .. } => false,
            CircuitBreakerState::HalfOpen { trials_in_flight, .. } => {
                trials_in_flight < self.inner.config.half_open_max_trials
            }
        }
    }

    /// Admit a call, returning a permit that must be completed with its outcome
    pub fn try_acquire(&self) -> Result<CallPermit, CircuitBreakerError> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<CallPermit, CircuitBreakerError> {
        let mut guard = self.inner.core.lock();
        let core = &mut *guard;
        self.inner.refresh(core, now);

        let trial = match &mut core.state {
            CircuitBreakerState::Closed { .. } => false,
            CircuitBreakerState::Open { .. } => {
                self.inner.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(CircuitBreakerError::CircuitOpen);
            }
            CircuitBreakerState::HalfOpen { trials_in_flight, .. } => {
                if *trials_in_flight >= self.inner.config.half_open_max_trials {
                    self.inner.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(CircuitBreakerError::TrialsExhausted);
                }
                *trials_in_flight += 1;
                true
            }
        };

        self.inner.metrics.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(CallPermit {
            inner: Arc::clone(&self.inner),
            episode: core.episode,
            trial,
            settled: false,
        })
    }

    /// Feed a success or failure signal into the state machine
    ///
    /// Used directly by the health monitor; dispatch outcomes arrive through
    /// [`CallPermit::complete`], which ends up here as well.
    pub fn report(&self, outcome: Outcome) {
        self.report_at(outcome, Instant::now());
    }

    pub fn report_at(&self, outcome: Outcome, now: Instant) {
        let mut core = self.inner.core.lock();
        self.inner.apply(&mut core, outcome, now);
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.core.lock().state.clone()
    }

    /// Get the name/identifier of this circuit breaker
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Get counters
    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.inner.metrics
    }

    /// Consistent view of state and counters
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let (state, failures_at_open) = {
            let core = self.inner.core.lock();
            (core.state.clone(), core.failures_at_open)
        };

        let (consecutive_failures, trial_successes, trials_in_flight, next_attempt_in_ms) =
            match state {
                CircuitBreakerState::Closed { failure_count } => (failure_count, 0, 0, None),
                CircuitBreakerState::Open { next_attempt } => (
                    failures_at_open,
                    0,
                    0,
                    Some(next_attempt.saturating_duration_since(now).as_millis() as u64),
                ),
                CircuitBreakerState::HalfOpen {
                    success_count,
                    trials_in_flight,
                } => (0, success_count, trials_in_flight, None),
            };

        CircuitBreakerSnapshot {
            state: state.name(),
            consecutive_failures,
            trial_successes,
            trials_in_flight,
            next_attempt_in_ms,
            opened_count: self.inner.metrics.opened.load(Ordering::Relaxed),
            rejected_count: self.inner.metrics.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    /// Open -> HalfOpen once the open window has passed
    fn refresh(&self, core: &mut BreakerCore, now: Instant) {
        if let CircuitBreakerState::Open { next_attempt } = core.state {
            if now >= next_attempt {
                core.state = CircuitBreakerState::HalfOpen {
                    success_count: 0,
                    trials_in_flight: 0,
                };
                info!(breaker = %self.name, "Circuit breaker half-open, admitting trial calls");
                metrics::counter!("gateway_circuit_breaker_transitions_total", "to" => "half_open")
                    .increment(1);
            }
        }
    }

    fn apply(&self, core: &mut BreakerCore, outcome: Outcome, now: Instant) {
        match outcome {
            Outcome::Success => {
                self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                match core.state {
                    CircuitBreakerState::Closed { .. } => {
                        core.state = CircuitBreakerState::Closed { failure_count: 0 };
                    }
                    // No edge leads from Open straight to Closed
                    CircuitBreakerState::Open { .. } => {}
                    CircuitBreakerState::HalfOpen {
                        success_count,
                        trials_in_flight,
                    } => {
                        let success_count = success_count + 1;
                        if success_count >= self.config.success_threshold {
                            core.state = CircuitBreakerState::Closed { failure_count: 0 };
                            self.metrics.closed.fetch_add(1, Ordering::Relaxed);
                            info!(breaker = %self.name, "Circuit breaker closed after successful trials");
                            metrics::counter!("gateway_circuit_breaker_transitions_total", "to" => "closed")
                                .increment(1);
                        } else {
                            core.state = CircuitBreakerState::HalfOpen {
                                success_count,
                                trials_in_flight,
                            };
                        }
                    }
                }
            }
            Outcome::Failure => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                match core.state {
                    CircuitBreakerState::Closed { failure_count } => {
                        let failure_count = failure_count + 1;
                        if failure_count >= self.config.failure_threshold {
                            self.open(core, failure_count, now);
                        } else {
                            core.state = CircuitBreakerState::Closed { failure_count };
                        }
                    }
                    CircuitBreakerState::Open { .. } => {}
                    CircuitBreakerState::HalfOpen { .. } => self.open(core, 1, now),
                }
            }
        }
    }

    fn open(&self, core: &mut BreakerCore, failures: u32, now: Instant) {
        core.state = CircuitBreakerState::Open {
            next_attempt: now + self.config.open_timeout,
        };
        core.episode += 1;
        core.failures_at_open = failures;
        self.metrics.opened.fetch_add(1, Ordering::Relaxed);
        warn!(
            breaker = %self.name,
            open_timeout_ms = self.config.open_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
        metrics::counter!("gateway_circuit_breaker_transitions_total", "to" => "open").increment(1);
    }

    fn release_trial(&self, core: &mut BreakerCore, episode: u64) {
        if core.episode != episode {
            return;
        }
        if let CircuitBreakerState::HalfOpen { trials_in_flight, .. } = &mut core.state {
            *trials_in_flight = trials_in_flight.saturating_sub(1);
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`]
///
/// Completing the permit reports the call's outcome, unless the circuit has opened
/// again since admission. Dropping it without completing (the inbound request was
/// cancelled) only returns the trial slot it may hold.
#[must_use = "a permit must be completed with the call outcome"]
pub struct CallPermit {
    inner: Arc<Inner>,
    episode: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    /// Whether this permit holds a half-open trial slot
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report the outcome of the admitted call
    pub fn complete(self, outcome: Outcome) {
        self.complete_at(outcome, Instant::now());
    }

    pub fn complete_at(mut self, outcome: Outcome, now: Instant) {
        let mut core = self.inner.core.lock();
        if self.trial {
            self.inner.release_trial(&mut core, self.episode);
        }
        if core.episode == self.episode {
            self.inner.apply(&mut core, outcome, now);
        } else {
            debug!(breaker = %self.inner.name, ?outcome, "Discarding outcome from an earlier episode");
        }
        drop(core);
        self.settled = true;
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.trial {
            let mut core = self.inner.core.lock();
            self.inner.release_trial(&mut core, self.episode);
        }
    }
}
