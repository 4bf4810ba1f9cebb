use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::errors::ForgeError;

/// Result of one status check against a remote task.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    Pending,
    Ready(T),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {}s ({attempts} checks)", .elapsed.as_secs())]
    TimedOut { elapsed: Duration, attempts: u32 },
    #[error("{0}")]
    RemoteFailed(String),
}

/// Repeatedly checks a remote task until it is ready, has failed, or the
/// deadline passes. At most `timeout / interval + 1` checks are made.
///
/// The waiter never sleeps past the deadline: after a pending check it gives
/// up as soon as the next check would land after `timeout`, so `TimedOut`
/// can report an `elapsed` a little under `timeout` (9s for a 10s timeout
/// polled every 3s).
#[derive(Debug, Clone, Copy)]
pub struct PollingWaiter {
    timeout: Duration,
    interval: Duration,
}

impl PollingWaiter {
    pub fn new(timeout: Duration, interval: Duration) -> Result<Self, ForgeError> {
        if interval.is_zero() {
            return Err(ForgeError::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self { timeout, interval })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `check` immediately, then once per `interval` while it reports
    /// `Pending`.
    pub async fn wait<T, F, Fut>(&self, mut check: F) -> Result<T, WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PollState<T>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match check().await {
                PollState::Ready(value) => return Ok(value),
                PollState::Failed(reason) => return Err(WaitError::RemoteFailed(reason)),
                PollState::Pending => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout || elapsed + self.interval > self.timeout {
                tracing::debug!(
                    "Polling gave up after {} checks ({:?} elapsed)",
                    attempts,
                    elapsed
                );
                return Err(WaitError::TimedOut { elapsed, attempts });
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_zero_interval_rejected() {
        let err = PollingWaiter::new(Duration::from_secs(1), Duration::ZERO).unwrap_err();
        assert!(matches!(err, ForgeError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediately_ready_is_one_call() {
        let waiter = PollingWaiter::new(Duration::from_secs(10), Duration::from_secs(1)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = waiter
            .wait(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    PollState::Ready("model.glb")
                }
            })
            .await;
        assert_eq!(result, Ok("model.glb"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_ready_makes_n_plus_one_calls() {
        let waiter = PollingWaiter::new(Duration::from_secs(300), Duration::from_secs(5)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let started = Instant::now();
        let result = waiter
            .wait(|| {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 2 {
                        PollState::Pending
                    } else {
                        PollState::Ready(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two sleeps of the interval between three calls.
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_pending_times_out_within_bound() {
        let timeout = Duration::from_secs(1);
        let interval = Duration::from_millis(100);
        let waiter = PollingWaiter::new(timeout, interval).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), WaitError> = waiter
            .wait(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    PollState::Pending
                }
            })
            .await;

        let made = calls.load(Ordering::SeqCst);
        match result {
            Err(WaitError::TimedOut { elapsed, attempts }) => {
                assert_eq!(attempts, made);
                assert!(elapsed <= timeout, "elapsed {:?} past timeout", elapsed);
            }
            other => panic!("Expected TimedOut, got: {:?}", other),
        }
        assert!(made <= 11, "made {} calls, bound is 11", made);
        assert!(made >= 2, "made only {} calls", made);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_stops_polling() {
        let waiter = PollingWaiter::new(Duration::from_secs(60), Duration::from_secs(5)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), WaitError> = waiter
            .wait(|| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        PollState::Pending
                    } else {
                        PollState::Failed("out of credits".to_string())
                    }
                }
            })
            .await;
        assert_eq!(
            result,
            Err(WaitError::RemoteFailed("out of credits".to_string()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_shorter_than_interval_checks_once() {
        let waiter = PollingWaiter::new(Duration::from_secs(2), Duration::from_secs(5)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), WaitError> = waiter
            .wait(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    PollState::Pending
                }
            })
            .await;
        assert!(matches!(result, Err(WaitError::TimedOut { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_next_check_would_pass_deadline() {
        let waiter = PollingWaiter::new(Duration::from_secs(10), Duration::from_secs(3)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let started = Instant::now();
        let result: Result<(), WaitError> = waiter
            .wait(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    PollState::Pending
                }
            })
            .await;

        // Checks at 0s, 3s, 6s and 9s; a fifth at 12s would be past 10s.
        assert_eq!(
            result,
            Err(WaitError::TimedOut {
                elapsed: Duration::from_secs(9),
                attempts: 4,
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(9));
    }
}
