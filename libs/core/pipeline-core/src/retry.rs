//! Exponential backoff, transient-error classification, and a single-flight
//! reconnect guard shared by the broker and store clients.
//!
//! Delays are deterministic — no jitter. Callers of this primitive are
//! internal and uncoordinated enough that jitter buys nothing; if it's ever
//! added it must stay deterministic under test.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Backoff parameters: initial delay, ceiling, and the escalator threshold
/// that doubles the computed delay once consecutive failures pass it.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Consecutive-failure count past which the computed delay is doubled.
    pub escalate_after: u32,
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            escalate_after: 3,
        }
    }

    pub fn with_escalate_after(mut self, threshold: u32) -> Self {
        self.escalate_after = threshold;
        self
    }

    /// Per-attempt delay: `min(D0 * 2^(attempt-1), D_max)`, doubled again
    /// (still capped at `D_max`) once `consecutive_fail` exceeds the
    /// escalator threshold. `attempt` is 1-indexed.
    pub fn next_delay(&self, attempt: u32, consecutive_fail: u32) -> Duration {
        let attempt = attempt.max(1);
        let exp = attempt.saturating_sub(1).min(62);
        let base = self
            .initial_delay
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX).max(1));
        let mut delay = base.min(self.max_delay);

        if consecutive_fail > self.escalate_after {
            delay = delay.saturating_mul(2).min(self.max_delay);
        }

        delay
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

/// Retry `op` under exponential backoff. `transient` classifies each error;
/// non-transient errors propagate immediately without consuming an attempt.
/// Exhausting `config.max_attempts` transient failures yields
/// `RetryError::Exhausted` wrapping the last error.
pub async fn retry<T, E, Op, Fut, Pred>(
    config: &BackoffConfig,
    mut op: Op,
    transient: Pred,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Pred: Fn(&E) -> bool,
{
    let mut consecutive_fail = 0u32;
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !transient(&err) {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                consecutive_fail += 1;
                let delay = config.next_delay(attempt, consecutive_fail);
                last_error = Some(err);
                if attempt < config.max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(RetryError::Exhausted {
        attempts: config.max_attempts,
        last_error: last_error.expect("at least one attempt ran"),
    })
}

/// Outcome of `SingleFlight::run`: whether the caller performed the work or
/// rode an in-flight attempt started by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightOutcome {
    Led,
    Followed,
}

/// Ensures concurrent callers who detect a broken connection share one
/// in-flight reconnect attempt instead of racing independent ones. Later
/// arrivals wait for the mutex, then re-check the caller-supplied
/// `is_done` predicate before attempting their own work — so a caller that
/// arrives after the leader has already reconnected does nothing further.
pub struct SingleFlight {
    lock: Arc<Mutex<()>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run `work` while holding the single-flight lock, but only if
    /// `is_done` (checked both before and after acquiring the lock) says
    /// there's still something to do. Returns `None` if no work was
    /// needed (either before or after acquiring the lock).
    pub async fn run<T, F, Fut, D>(&self, is_done: D, work: F) -> Option<(FlightOutcome, T)>
    where
        D: Fn() -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if is_done() {
            return None;
        }

        let _guard = self.lock.lock().await;

        if is_done() {
            // Someone else's attempt already landed while we waited.
            return None;
        }

        Some((FlightOutcome::Led, work().await))
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn next_delay_matches_vetted_sequence() {
        // D0=3, D_max=30: 3, 6, 12, 24, 30, 30, ...
        let cfg = BackoffConfig::new(Duration::from_secs(3), Duration::from_secs(30), 10);
        let expected = [3, 6, 12, 24, 30, 30, 30];
        for (i, secs) in expected.iter().enumerate() {
            let attempt = (i + 1) as u32;
            assert_eq!(
                cfg.next_delay(attempt, 0),
                Duration::from_secs(*secs),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn next_delay_is_deterministic() {
        let cfg = BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(5), 10);
        let a = cfg.next_delay(3, 0);
        let b = cfg.next_delay(3, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn escalator_doubles_after_threshold() {
        let cfg = BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(30), 10)
            .with_escalate_after(3);
        // consecutive_fail = 4 > 3, so delay should double (still capped)
        assert_eq!(cfg.next_delay(1, 4), Duration::from_secs(2));
        assert_eq!(cfg.next_delay(1, 3), Duration::from_secs(1)); // not yet escalated
        assert_eq!(cfg.next_delay(5, 10), Duration::from_secs(30)); // capped even after doubling
    }

    #[tokio::test]
    async fn retry_propagates_fatal_errors_immediately() {
        let cfg = BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(5), 5);
        let calls = AtomicU32::new(0);

        let result = retry(
            &cfg,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), &str>("fatal") }
            },
            |_| false,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_after_max_attempts() {
        let cfg = BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(5), 3);
        let calls = AtomicU32::new(0);

        let result = retry(
            &cfg,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), &str>("transient") }
            },
            |_| true,
        )
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let cfg = BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(5), 5);
        let calls = AtomicU32::new(0);

        let result = retry(
            &cfg,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_flight_runs_once_for_concurrent_callers() {
        let flight = Arc::new(SingleFlight::new());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let runs = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let done = done.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(
                        || done.load(Ordering::SeqCst),
                        || async {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            done.store(true, Ordering::SeqCst);
                        },
                    )
                    .await;
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_flight_skips_work_when_already_done() {
        let flight = SingleFlight::new();
        let result = flight.run(|| true, || async { 1 }).await;
        assert!(result.is_none());
    }
}
