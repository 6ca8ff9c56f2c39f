//! Provides backoff timing control for retried host operations such as SSH
//! session setup and unit state polling.
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
    /// Waits the prescribed amount of time (as per `next_duration`).
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// A `BackoffStrategy` in which the durations increase exponentially
/// until hitting a cap.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    /// Gets a backoff strategy tuned for SSH session setup: 250ms doubling up
    /// to 2s.
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(2))
    }
}

impl ExponentialBackoffStrategy {
    /// Creates a strategy starting at `base_duration` and never waiting longer
    /// than `cap`.
    pub fn new(base_duration: Duration, cap: Duration) -> Self {
        Self {
            base_duration,
            cap,
            last_duration: Duration::from_secs(0),
        }
    }

    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration * 2
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn reset(&mut self) {
        self.last_duration = Duration::from_secs(0);
    }

    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        next_duration
    }
}

/// Calls `op` until it succeeds or until `max_elapsed` has passed, sleeping
/// between attempts as directed by `strategy`. The last error is returned once
/// the time budget is spent.
pub async fn retry<S, F, Fut, T, E>(
    strategy: &mut S,
    max_elapsed: Duration,
    mut op: F,
) -> Result<T, E>
where
    S: BackoffStrategy,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => {
                strategy.reset();
                return Ok(v);
            }
            Err(e) => {
                let delay = strategy.next_duration();
                if start.elapsed() + delay > max_elapsed {
                    return Err(e);
                }
                debug!(attempt, ?delay, error = %e, "will retry");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn first_backoff_is_250_millis() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_millis(250));
    }

    #[test]
    fn backoff_doubles_each_time() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_millis(250));
        assert_eq!(backoff.next_duration(), Duration::from_millis(500));
        assert_eq!(backoff.next_duration(), Duration::from_millis(1000));
    }

    #[test]
    fn after_reset_next_backoff_is_base() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_millis(250));
        assert_eq!(backoff.next_duration(), Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.next_duration(), Duration::from_millis(250));
    }

    #[test]
    fn backoff_is_capped_at_2_seconds() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_millis(250));
        assert_eq!(backoff.next_duration(), Duration::from_millis(500));
        assert_eq!(backoff.next_duration(), Duration::from_millis(1000));
        assert_eq!(backoff.next_duration(), Duration::from_millis(2000));
        assert_eq!(backoff.next_duration(), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn retry_stops_on_first_success() {
        let calls = AtomicU32::new(0);
        let mut backoff =
            ExponentialBackoffStrategy::new(Duration::from_millis(1), Duration::from_millis(2));
        let result: Result<u32, String> = retry(&mut backoff, Duration::from_secs(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("attempt {}", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let mut backoff =
            ExponentialBackoffStrategy::new(Duration::from_millis(5), Duration::from_millis(5));
        let result: Result<(), &str> =
            retry(&mut backoff, Duration::from_millis(20), || async { Err("nope") }).await;
        assert_eq!(result, Err("nope"));
    }
}
