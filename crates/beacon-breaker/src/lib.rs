// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Generic circuit breaker protecting outbound calls."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Closed / open / half-open breaker parameterised by a clock and a failure
//! predicate.
//!
//! - **Closed**: failures are counted; at `max_failures` the breaker opens.
//! - **Open**: calls are rejected without being attempted until
//!   `open_timeout` elapses, then the breaker half-opens.
//! - **Half-open**: up to `half_open_max_requests` probes are admitted;
//!   `success_threshold` consecutive successes close the breaker, any
//!   counted failure reopens it.

use beacon_core::Clock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub max_failures: u32,
    /// How long the breaker stays open before admitting probes.
    pub open_timeout: Duration,
    /// Probes admitted while half-open.
    pub half_open_max_requests: u32,
    /// Consecutive probe successes required to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
            success_threshold: 1,
        }
    }
}

/// Current breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow; failures are counted.
    Closed,
    /// Calls are rejected outright.
    Open,
    /// A bounded number of probe calls is admitted.
    HalfOpen,
}

/// Point-in-time view of a breaker, exposed on the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: BreakerState,
    /// Failure count in the current closed period.
    pub failure_count: u32,
    /// When the most recent counted failure happened.
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the call was not attempted.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Breaker name.
        name: String,
    },
    /// The wrapped call ran and returned this error.
    #[error(transparent)]
    Inner(E),
}

struct Inner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

/// A named circuit breaker over calls failing with `E`.
pub struct CircuitBreaker<E> {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    is_failure: Box<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> CircuitBreaker<E> {
    /// Breaker where every error counts as a failure.
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_failure_predicate(name, config, clock, |_| true)
    }

    /// Breaker counting only errors matching the predicate.
    pub fn with_failure_predicate(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        is_failure: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                last_failure_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
            is_failure: Box::new(is_failure),
        }
    }

    /// Run `fut` under the breaker.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        let result = fut.await;
        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                if (self.is_failure)(&err) {
                    self.on_failure();
                } else {
                    // Uncounted errors still complete the probe successfully.
                    self.on_success();
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Current stats snapshot.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures,
            last_failure_at: inner.last_failure_at,
        }
    }

    fn admit(&self) -> Result<(), BreakerError<E>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now - at)
                    .unwrap_or_else(chrono::Duration::zero);
                if elapsed
                    >= chrono::Duration::from_std(self.config.open_timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero())
                {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_requests {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                    })
                } else {
                    inner.half_open_in_flight += 1;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.opened_at = None;
                }
            }
            // A success observed while open belongs to a call admitted
            // before the trip; it does not change state.
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure_at = Some(now);
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.max_failures {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    warn!(breaker = %self.name, failures = inner.failures, "circuit breaker opened");
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
                warn!(breaker = %self.name, "circuit breaker reopened from half-open");
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::ManualClock;
    use chrono::TimeZone as _;

    fn breaker(config: BreakerConfig) -> (CircuitBreaker<&'static str>, ManualClock) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        (
            CircuitBreaker::new("kv", config, Arc::new(clock.clone())),
            clock,
        )
    }

    async fn fail(b: &CircuitBreaker<&'static str>) -> Result<(), BreakerError<&'static str>> {
        b.call(async { Err::<(), _>("boom") }).await.map(|_| ())
    }

    async fn succeed(b: &CircuitBreaker<&'static str>) -> Result<(), BreakerError<&'static str>> {
        b.call(async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test]
    async fn fifth_failure_opens() {
        let (b, _) = breaker(BreakerConfig::default());
        for _ in 0..4 {
            let _ = fail(&b).await;
            assert_eq!(b.stats().state, BreakerState::Closed);
        }
        let _ = fail(&b).await;
        assert_eq!(b.stats().state, BreakerState::Open);
        assert_eq!(b.stats().failure_count, 5);
    }

    #[tokio::test]
    async fn open_rejects_without_calling() {
        let (b, _) = breaker(BreakerConfig {
            max_failures: 1,
            ..Default::default()
        });
        let _ = fail(&b).await;
        let outcome = succeed(&b).await;
        assert!(matches!(outcome, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn open_timeout_admits_one_probe() {
        let (b, clock) = breaker(BreakerConfig {
            max_failures: 1,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
            success_threshold: 1,
        });
        let _ = fail(&b).await;
        clock.advance(chrono::Duration::seconds(30));
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.stats().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let (b, clock) = breaker(BreakerConfig {
            max_failures: 1,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
            success_threshold: 2,
        });
        let _ = fail(&b).await;
        clock.advance(chrono::Duration::seconds(31));
        let _ = fail(&b).await;
        assert_eq!(b.stats().state, BreakerState::Open);
        // And it stays open until the timeout elapses again.
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn success_threshold_requires_consecutive_probes() {
        let (b, clock) = breaker(BreakerConfig {
            max_failures: 1,
            open_timeout: Duration::from_secs(1),
            half_open_max_requests: 2,
            success_threshold: 2,
        });
        let _ = fail(&b).await;
        clock.advance(chrono::Duration::seconds(1));
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.stats().state, BreakerState::HalfOpen);
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.stats().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn predicate_filters_uncounted_errors() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let b: CircuitBreaker<&'static str> = CircuitBreaker::with_failure_predicate(
            "kv",
            BreakerConfig {
                max_failures: 1,
                ..Default::default()
            },
            Arc::new(clock),
            |e| *e != "not-found",
        );
        let _ = b.call(async { Err::<(), _>("not-found") }).await;
        assert_eq!(b.stats().state, BreakerState::Closed);
        let _ = b.call(async { Err::<(), _>("timeout") }).await;
        assert_eq!(b.stats().state, BreakerState::Open);
    }
}
