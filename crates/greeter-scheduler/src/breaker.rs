//! Circuit breaker around the Sender.
//!
//! CLOSED → OPEN after `failure_threshold` consecutive failures, or when the
//! failure rate in the rolling window reaches `error_rate_threshold` with at
//! least `min_calls_in_window` calls. OPEN rejects instantly with
//! `SendError::CircuitOpen` until `reset_timeout` elapses, then a single trial
//! call is let through (HALF_OPEN). Only the trial's own result decides: success
//! closes the circuit, failure re-opens it. Results of calls admitted before
//! the circuit opened are dropped.
//!
//! Every call is bounded by `send_timeout`; a timeout counts as a failure.
//! Permanent errors are a healthy vendor saying "no" and do not count.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use greeter_core::config::BreakerConfig;
use greeter_core::error::SendError;
use greeter_core::traits::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub window_calls: usize,
    pub window_failures: usize,
    pub opened_at: Option<DateTime<Utc>>,
    pub rejected_total: u64,
}

/// How `try_acquire` let a call through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    /// The half-open trial, identified by its start time.
    Trial(DateTime<Utc>),
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    /// Set while the half-open trial call is running.
    trial_started_at: Option<DateTime<Utc>>,
    /// (finished_at, failed) per call inside the rolling window.
    window: VecDeque<(DateTime<Utc>, bool)>,
    rejected_total: u64,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    error_rate_threshold: f64,
    min_calls_in_window: usize,
    window: Duration,
    reset_timeout: Duration,
    send_timeout: std::time::Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: &str,
        config: &BreakerConfig,
        send_timeout: std::time::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: config.failure_threshold.max(1),
            error_rate_threshold: config.error_rate_threshold,
            min_calls_in_window: config.min_calls_in_window as usize,
            window: Duration::seconds(config.window_secs as i64),
            reset_timeout: Duration::seconds(config.reset_timeout_secs as i64),
            send_timeout,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started_at: None,
                window: VecDeque::new(),
                rejected_total: 0,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state. An OPEN circuit whose reset timeout has passed reports
    /// HALF_OPEN even before the trial call is admitted.
    pub fn state(&self) -> BreakerState {
        let inner = self.inner();
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened)) if self.clock.now() - opened >= self.reset_timeout => {
                BreakerState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.inner();
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            window_calls: inner.window.len(),
            window_failures: inner.window.iter().filter(|(_, failed)| *failed).count(),
            opened_at: inner.opened_at,
            rejected_total: inner.rejected_total,
        }
    }

    /// Run `call` through the breaker.
    ///
    /// Returns `CircuitOpen` without invoking `call` when the circuit rejects.
    pub async fn call<F, Fut>(&self, call: F) -> Result<(), SendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), SendError>>,
    {
        let admission = self.try_acquire()?;

        let outcome = match tokio::time::timeout(self.send_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(self.send_timeout.as_secs())),
        };

        match &outcome {
            Ok(()) | Err(SendError::Permanent(_)) => self.on_success(admission),
            Err(_) => self.on_failure(admission),
        }
        outcome
    }

    fn try_acquire(&self) -> Result<Admission, SendError> {
        let now = self.clock.now();
        let mut inner = self.inner();
        match inner.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| now - t).unwrap_or(self.reset_timeout);
                if elapsed >= self.reset_timeout {
                    tracing::info!(breaker = %self.name, "🔌 Circuit half-open, admitting trial call");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_started_at = Some(now);
                    Ok(Admission::Trial(now))
                } else {
                    inner.rejected_total += 1;
                    Err(SendError::CircuitOpen)
                }
            }
            BreakerState::HalfOpen => match inner.trial_started_at {
                // A trial that never reported back (cancelled) frees the slot
                // after another reset timeout.
                Some(started) if now - started < self.reset_timeout => {
                    inner.rejected_total += 1;
                    Err(SendError::CircuitOpen)
                }
                _ => {
                    inner.trial_started_at = Some(now);
                    Ok(Admission::Trial(now))
                }
            },
        }
    }

    /// Whether `admission` is the trial currently holding the half-open slot.
    fn is_current_trial(inner: &Inner, admission: Admission) -> bool {
        inner.state == BreakerState::HalfOpen
            && matches!(admission, Admission::Trial(started) if inner.trial_started_at == Some(started))
    }

    fn on_success(&self, admission: Admission) {
        let now = self.clock.now();
        let mut inner = self.inner();
        if Self::is_current_trial(&inner, admission) {
            tracing::info!(breaker = %self.name, "✅ Circuit closed after successful trial");
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.trial_started_at = None;
            inner.window.clear();
        } else if inner.state != BreakerState::Closed {
            tracing::debug!(breaker = %self.name, "Ignoring late success while circuit is not closed");
            return;
        }
        inner.consecutive_failures = 0;
        inner.window.push_back((now, false));
        self.prune(&mut inner, now);
    }

    fn on_failure(&self, admission: Admission) {
        let now = self.clock.now();
        let mut inner = self.inner();
        match inner.state {
            BreakerState::HalfOpen if Self::is_current_trial(&inner, admission) => {
                tracing::warn!(breaker = %self.name, "⚡ Trial call failed, circuit re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.trial_started_at = None;
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                inner.window.push_back((now, true));
                self.prune(&mut inner, now);

                let calls = inner.window.len();
                let failures = inner.window.iter().filter(|(_, failed)| *failed).count();
                let rate_tripped = calls >= self.min_calls_in_window
                    && calls > 0
                    && failures as f64 / calls as f64 >= self.error_rate_threshold;
                if inner.consecutive_failures >= self.failure_threshold || rate_tripped {
                    tracing::warn!(
                        breaker = %self.name,
                        consecutive = inner.consecutive_failures,
                        window_failures = failures,
                        window_calls = calls,
                        "⚡ Circuit opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
            }
            // Late result from a call admitted before the circuit opened, or
            // from a trial whose slot has since been handed to another.
            BreakerState::Open | BreakerState::HalfOpen => {}
        }
    }

    fn prune(&self, inner: &mut Inner, now: DateTime<Utc>) {
        while let Some((at, _)) = inner.window.front() {
            if now - *at > self.window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }
}
