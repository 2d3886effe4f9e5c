/// Task Runner with Circuit Breaker Pattern
///
/// Runs a background loop at a fixed period with exponential backoff on
/// failure. A loop that keeps failing is reported back to the caller as
/// [`TaskAborted`] instead of degrading silently.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, warn};

/// Circuit breaker configuration for background tasks
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Maximum number of consecutive failures before the task is aborted
    pub max_consecutive_failures: u32,
    /// Initial delay between retries
    pub initial_retry_delay: Duration,
    /// Maximum delay between retries
    pub max_retry_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 20,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

/// A background task gave up after too many consecutive failures
#[derive(Debug, Clone, thiserror::Error)]
#[error("task '{task}' aborted after {failures} consecutive failures: {last_error}")]
pub struct TaskAborted {
    pub task: String,
    pub failures: u32,
    pub last_error: String,
}

/// Internal state for circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl CircuitBreakerState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    /// Delay to wait before the next attempt
    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.consecutive_failures += 1;
        let delay = self.current_retry_delay;
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
        delay
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Run `task_fn` every `period` until it fails `max_consecutive_failures`
/// times in a row.
///
/// A failed iteration is followed by a backoff sleep on top of the regular
/// period. Only returns when the circuit opens.
pub async fn run_with_circuit_breaker<F, Fut, E>(
    task_name: &str,
    period: Duration,
    config: CircuitBreakerConfig,
    mut task_fn: F,
) -> TaskAborted
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut state = CircuitBreakerState::new(config.initial_retry_delay);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
            }
            Err(e) => {
                let delay = state.record_failure(config.max_retry_delay);
                error!(
                    "Task '{}' failed (attempt {}/{}): {}",
                    task_name, state.consecutive_failures, config.max_consecutive_failures, e
                );

                if state.consecutive_failures >= config.max_consecutive_failures {
                    return TaskAborted {
                        task: task_name.to_string(),
                        failures: state.consecutive_failures,
                        last_error: e.to_string(),
                    };
                }

                warn!("Task '{}' will retry in {:?}", task_name, delay);
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_config(max: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_consecutive_failures: max,
            initial_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_resets_on_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = attempt_count.clone();

        let handle = tokio::spawn(async move {
            // Fails twice, then succeeds; never reaches three in a row
            run_with_circuit_breaker("test_task", Duration::from_millis(5), fast_config(3), || {
                let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count % 3 < 2 {
                        Err("Simulated failure")
                    } else {
                        Ok(())
                    }
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());
        handle.abort();

        assert!(attempt_count.load(Ordering::SeqCst) >= 6);
    }

    #[tokio::test]
    async fn test_circuit_breaker_aborts_on_max_failures() {
        let aborted = run_with_circuit_breaker(
            "failing_task",
            Duration::from_millis(1),
            fast_config(3),
            || async { Err::<(), _>("Always fails") },
        )
        .await;

        assert_eq!(aborted.task, "failing_task");
        assert_eq!(aborted.failures, 3);
        assert_eq!(aborted.last_error, "Always fails");
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut state = CircuitBreakerState::new(Duration::from_millis(4));
        assert_eq!(state.record_failure(Duration::from_millis(10)), Duration::from_millis(4));
        assert_eq!(state.record_failure(Duration::from_millis(10)), Duration::from_millis(8));
        assert_eq!(state.record_failure(Duration::from_millis(10)), Duration::from_millis(10));
        state.reset(Duration::from_millis(4));
        assert_eq!(state.consecutive_failures, 0);
    }
}
