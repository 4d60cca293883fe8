//! Circuit breaker for outbound calls.
//!
//! States:
//! - Closed: calls pass; failures are timestamped in a rolling window
//! - Open: calls are rejected without running until the cooldown elapses
//! - HalfOpen: a bounded number of trial calls decide whether to close or reopen
//!
//! Every breaker is configured explicitly through [`BreakerSettings`]. The internal mutex
//! only guards state transitions and is never held while the wrapped call runs.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Label used in logs and errors.
    pub name: String,
    /// Failures inside `window` that trip the breaker.
    pub failure_threshold: u32,
    pub window: Duration,
    /// Time spent open before trial calls are admitted.
    pub cooldown: Duration,
    /// Trial calls allowed in flight while half-open.
    pub half_open_max_calls: u32,
}

impl BreakerSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.window.is_zero() {
            return Err("window must be positive".to_string());
        }
        if self.half_open_max_calls == 0 {
            return Err("half_open_max_calls must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            name: "outbound".to_string(),
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open")]
    Open { name: String },

    #[error("circuit '{name}' is half-open and its trial slots are taken")]
    TrialsExhausted { name: String },

    #[error("call failed: {0}")]
    Call(E),
}

impl<E> BreakerError<E> {
    /// Whether the breaker refused to run the call at all.
    pub fn is_rejected(&self) -> bool {
        !matches!(self, BreakerError::Call(_))
    }
}

#[derive(Debug)]
enum State {
    Closed { failures: VecDeque<Instant> },
    Open { since: Instant },
    HalfOpen { in_flight: u32 },
}

#[derive(Debug)]
struct Inner {
    state: State,
    // Bumped on every transition so late results from an older state are ignored.
    generation: u64,
}

#[derive(Debug, Copy, Clone)]
struct Admission {
    generation: u64,
    trial: bool,
}

/// Records the outcome of an admitted call exactly once.
///
/// A call that unwinds before reporting counts as a failure, so its half-open trial
/// slot is always handed back.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
}

impl TrialGuard<'_> {
    fn finish(mut self, success: bool) {
        if let Some(admission) = self.admission.take() {
            self.breaker.record(admission, success);
        }
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.record(admission, false);
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner {
                state: State::Closed {
                    failures: VecDeque::new(),
                },
                generation: 0,
            }),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is updated in single assignments, so a poisoned guard is still coherent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { since } if since.elapsed() >= self.settings.cooldown => {
                CircuitState::HalfOpen
            }
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn transition(&self, inner: &mut Inner, state: State) {
        inner.state = state;
        inner.generation += 1;
    }

    fn admit<E>(&self) -> Result<Admission, BreakerError<E>> {
        let mut inner = self.lock();

        if let State::Open { since } = inner.state {
            if since.elapsed() < self.settings.cooldown {
                debug!(breaker = %self.settings.name, "call rejected: circuit open");
                return Err(BreakerError::Open {
                    name: self.settings.name.clone(),
                });
            }
            info!(breaker = %self.settings.name, "circuit half-open, admitting trial calls");
            self.transition(&mut inner, State::HalfOpen { in_flight: 0 });
        }

        let generation = inner.generation;
        match &mut inner.state {
            State::Closed { .. } => Ok(Admission {
                generation,
                trial: false,
            }),
            State::HalfOpen { in_flight } => {
                if *in_flight >= self.settings.half_open_max_calls {
                    return Err(BreakerError::TrialsExhausted {
                        name: self.settings.name.clone(),
                    });
                }
                *in_flight += 1;
                Ok(Admission {
                    generation,
                    trial: true,
                })
            }
            State::Open { .. } => Err(BreakerError::Open {
                name: self.settings.name.clone(),
            }),
        }
    }

    fn record(&self, admission: Admission, success: bool) {
        let mut inner = self.lock();
        if inner.generation != admission.generation {
            return;
        }
        let now = Instant::now();

        match (&mut inner.state, success) {
            (State::Closed { failures }, true) => failures.clear(),
            (State::Closed { failures }, false) => {
                failures.push_back(now);
                while failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > self.settings.window)
                {
                    failures.pop_front();
                }
                if failures.len() as u32 >= self.settings.failure_threshold {
                    warn!(
                        breaker = %self.settings.name,
                        failures = failures.len(),
                        "circuit opened"
                    );
                    self.transition(&mut inner, State::Open { since: now });
                }
            }
            (State::HalfOpen { .. }, true) if admission.trial => {
                info!(breaker = %self.settings.name, "circuit closed after successful trial");
                self.transition(
                    &mut inner,
                    State::Closed {
                        failures: VecDeque::new(),
                    },
                );
            }
            (State::HalfOpen { .. }, false) if admission.trial => {
                warn!(breaker = %self.settings.name, "circuit reopened after failed trial");
                self.transition(&mut inner, State::Open { since: now });
            }
            _ => {}
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Rejected calls return without invoking `f`. Any `Err` from `f` counts as a failure.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let guard = TrialGuard {
            breaker: self,
            admission: Some(self.admit()?),
        };
        let result = f();
        guard.finish(result.is_ok());
        result.map_err(BreakerError::Call)
    }

    /// Send a blocking HTTP request through the breaker and return the response body.
    ///
    /// Transport errors and non-2xx responses both count as failures.
    pub fn call_http(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<Vec<u8>, BreakerError<OutboundError>> {
        self.call(|| {
            let response = request
                .send()
                .map_err(|e| OutboundError::Transport(e.to_string()))?;
            let status = response.status();
            let body = response
                .bytes()
                .map_err(|e| OutboundError::Transport(e.to_string()))?;
            if !status.is_success() {
                return Err(OutboundError::Status {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }
            Ok(body.to_vec())
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboundError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}
