//! Adaptive retry coordination with exponential backoff and circuit breaking
//!
//! One `RetryCoordinator` wraps an arbitrary async unit of work. Recoverable
//! failures are retried under a per-tier `RetryPolicy`; fatal failures abort
//! immediately. A rolling per-class success rate feeds the circuit breaker so
//! a systematically failing source stops being hammered.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::{AcquireError, RetryError, StopReason};

/// How many recent outcomes per task class feed the circuit breaker.
const ROLLING_WINDOW: usize = 20;
/// Minimum recorded outcomes before the breaker is allowed to trip.
const MIN_SAMPLES: usize = 5;

/// Retry behaviour for one task class, overridable per source tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_fraction: f64,
    /// Circuit breaker floor: rolling success rate below this stops retries.
    pub success_rate_floor: f64,
    /// Extra widening applied to the delay after an anti-bot block.
    pub blocked_backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.25,
            success_rate_floor: 0.2,
            blocked_backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Raw backoff delay for the given 1-based attempt, before jitter.
    /// Non-decreasing in the attempt number and capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent as i32);
        let raw = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(raw as u64)
    }
}

/// Per-invocation counters, recorded for one `execute` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrySession {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_failures: u32,
    pub average_latency_ms: f64,
}

impl RetrySession {
    fn record(&mut self, success: bool, latency: Duration) {
        self.attempts += 1;
        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures += 1;
        }
        let total = f64::from(self.attempts);
        self.average_latency_ms +=
            (latency.as_secs_f64() * 1000.0 - self.average_latency_ms) / total;
    }
}

/// Long-lived rolling statistics for one task class.
#[derive(Debug, Default, Clone)]
struct ClassStats {
    window: VecDeque<bool>,
    total_attempts: u64,
    total_successes: u64,
    consecutive_failures: u32,
}

impl ClassStats {
    fn record(&mut self, success: bool) {
        if self.window.len() == ROLLING_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(success);
        self.total_attempts += 1;
        if success {
            self.total_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }

    /// Rolling success rate, once enough samples exist to be meaningful.
    fn success_rate(&self) -> Option<f64> {
        if self.window.len() < MIN_SAMPLES {
            return None;
        }
        let successes = self.window.iter().filter(|s| **s).count();
        Some(successes as f64 / self.window.len() as f64)
    }
}

/// Aggregate view of one task class, exposed for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ClassSnapshot {
    pub total_attempts: u64,
    pub total_successes: u64,
    pub consecutive_failures: u32,
    pub rolling_success_rate: Option<f64>,
}

/// Coordinates retries for every task class in the pipeline.
#[derive(Clone, Default)]
pub struct RetryCoordinator {
    stats: Arc<RwLock<HashMap<String, ClassStats>>>,
}

impl RetryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` under `policy`, retrying recoverable failures.
    ///
    /// The task receives the 1-based attempt number. The returned error
    /// carries the last underlying failure and the reason retries stopped.
    pub async fn execute<T, F, Fut>(
        &self,
        class: &str,
        policy: &RetryPolicy,
        token: &CancellationToken,
        mut task: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AcquireError>>,
    {
        let mut session = RetrySession::default();
        let mut attempt: u32 = 1;

        loop {
            if token.is_cancelled() {
                return Err(self.stop(class, &session, StopReason::Cancelled, AcquireError::Cancelled));
            }

            if let Some(rate) = self.rolling_success_rate(class).await {
                if rate < policy.success_rate_floor {
                    warn!(
                        class,
                        rate, floor = policy.success_rate_floor,
                        "circuit open, refusing attempt"
                    );
                    return Err(self.stop(
                        class,
                        &session,
                        StopReason::CircuitOpen,
                        AcquireError::network(format!(
                            "circuit open for {class}: rolling success rate {rate:.2} below floor {:.2}",
                            policy.success_rate_floor
                        )),
                    ));
                }
            }

            let started = Instant::now();
            let outcome = task(attempt).await;
            let latency = started.elapsed();

            match outcome {
                Ok(value) => {
                    session.record(true, latency);
                    self.record_outcome(class, true).await;
                    debug!(class, attempt, latency_ms = latency.as_millis() as u64, "task succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    session.record(false, latency);
                    self.record_outcome(class, false).await;

                    if !err.is_recoverable() {
                        warn!(class, attempt, error = %err, "fatal error, not retrying");
                        return Err(self.stop(class, &session, StopReason::Fatal, err));
                    }
                    if attempt >= policy.max_attempts {
                        warn!(class, attempt, error = %err, "attempt budget exhausted");
                        return Err(self.stop(class, &session, StopReason::AttemptsExhausted, err));
                    }

                    let mut delay = policy.delay_for_attempt(attempt);
                    if matches!(err, AcquireError::Blocked { .. }) {
                        delay = delay
                            .mul_f64(policy.blocked_backoff_factor.max(1.0))
                            .min(Duration::from_millis(policy.max_delay_ms));
                    }
                    let jittered =
                        delay + delay.mul_f64(policy.jitter_fraction.max(0.0) * fastrand::f64());

                    warn!(
                        class, attempt, error = %err,
                        delay_ms = jittered.as_millis() as u64,
                        "🔄 recoverable failure, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(jittered) => {}
                        _ = token.cancelled() => {
                            return Err(self.stop(class, &session, StopReason::Cancelled, AcquireError::Cancelled));
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn stop(
        &self,
        class: &str,
        session: &RetrySession,
        stop: StopReason,
        source: AcquireError,
    ) -> RetryError {
        RetryError {
            class: class.to_string(),
            attempts: session.attempts,
            stop,
            source,
        }
    }

    async fn rolling_success_rate(&self, class: &str) -> Option<f64> {
        let stats = self.stats.read().await;
        stats.get(class).and_then(ClassStats::success_rate)
    }

    async fn record_outcome(&self, class: &str, success: bool) {
        let mut stats = self.stats.write().await;
        stats.entry(class.to_string()).or_default().record(success);
    }

    /// Snapshot of every task class, for logging and diagnostics.
    pub async fn snapshot(&self) -> HashMap<String, ClassSnapshot> {
        let stats = self.stats.read().await;
        stats
            .iter()
            .map(|(class, s)| {
                (
                    class.clone(),
                    ClassSnapshot {
                        total_attempts: s.total_attempts,
                        total_successes: s.total_successes,
                        consecutive_failures: s.consecutive_failures,
                        rolling_success_rate: s.success_rate(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.0,
            success_rate_floor: 0.0,
            blocked_backoff_factor: 2.0,
        }
    }

    #[tokio::test]
    async fn invokes_task_at_most_max_attempts_times() {
        let coordinator = RetryCoordinator::new();
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<(), RetryError> = coordinator
            .execute("class-a", &fast_policy(3), &token, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AcquireError::network("timeout")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.stop, StopReason::AttemptsExhausted);
    }

    #[tokio::test]
    async fn fatal_error_aborts_without_retry() {
        let coordinator = RetryCoordinator::new();
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<(), RetryError> = coordinator
            .execute("class-fatal", &fast_policy(5), &token, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AcquireError::config("missing credentials")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.stop, StopReason::Fatal);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let coordinator = RetryCoordinator::new();
        let token = CancellationToken::new();

        let result = coordinator
            .execute("class-flaky", &fast_policy(5), &token, |attempt| async move {
                if attempt < 3 {
                    Err(AcquireError::network("connection reset"))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.25,
            success_rate_floor: 0.2,
            blocked_backoff_factor: 2.0,
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            assert!(delay <= Duration::from_millis(policy.max_delay_ms));
            previous = delay;
        }
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_failures() {
        let coordinator = RetryCoordinator::new();
        let token = CancellationToken::new();
        let mut policy = fast_policy(1);
        policy.success_rate_floor = 0.5;

        // Seed the rolling window with enough failures to trip the breaker.
        for _ in 0..MIN_SAMPLES {
            let _ = coordinator
                .execute::<(), _, _>("class-dead", &policy, &token, |_| async {
                    Err(AcquireError::network("timeout"))
                })
                .await;
        }

        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError> = coordinator
            .execute("class-dead", &policy, &token, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.stop, StopReason::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "task must not run while circuit is open");
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let coordinator = RetryCoordinator::new();
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), RetryError> = coordinator
            .execute("class-cancel", &fast_policy(3), &token, |_| async {
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap_err().stop, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn session_latency_average_is_tracked() {
        let mut session = RetrySession::default();
        session.record(false, Duration::from_millis(100));
        session.record(true, Duration::from_millis(300));
        assert_eq!(session.attempts, 2);
        assert_eq!(session.failures, 1);
        assert_eq!(session.successes, 1);
        assert!((session.average_latency_ms - 200.0).abs() < 1.0);
    }
}
