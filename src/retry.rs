//! Bounded retry with a fixed delay between attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time};

use serde::{Deserialize, Serialize};

/// Longest uninterrupted sleep before checking for cancellation (milliseconds).
pub const SLEEP_SLICE_MS: u64 = 50;

/// Outcome of a single attempt passed to [RetryPolicy::retry].
#[derive(Clone, Debug, PartialEq)]
pub enum Attempt<T> {
    Done(T),
    Retry,
}

/// Result of a [RetryPolicy::retry] that did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exhausted {
    /// Every attempt was used.
    Attempts(u32),
    /// The cancellation flag was raised.
    Cancelled,
}

/// Bounded-retry-with-delay policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    attempts: u32,
    #[serde(with = "crate::config::duration_ms")]
    delay: time::Duration,
}

impl RetryPolicy {
    /// Creates a new [RetryPolicy].
    pub const fn new(attempts: u32, delay: time::Duration) -> Self {
        Self { attempts, delay }
    }

    /// Gets the maximum number of attempts.
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Gets the delay between attempts.
    pub const fn delay(&self) -> time::Duration {
        self.delay
    }

    /// Whether `retries` has reached the bound.
    pub const fn exhausted(&self, retries: u32) -> bool {
        retries >= self.attempts
    }

    /// Runs `f` until it returns [Attempt::Done], the attempts are used up, or `cancel` is raised.
    ///
    /// `f` receives the zero-based attempt number. On success, returns the value along with the
    /// number of attempts that asked for a retry.
    pub fn retry<T, F>(&self, cancel: Option<&AtomicBool>, mut f: F) -> Result<(T, u32), Exhausted>
    where
        F: FnMut(u32) -> Attempt<T>,
    {
        for attempt in 0..self.attempts {
            if cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false) {
                return Err(Exhausted::Cancelled);
            }

            if let Attempt::Done(val) = f(attempt) {
                return Ok((val, attempt));
            }

            if attempt + 1 < self.attempts && !sleep(self.delay, cancel) {
                return Err(Exhausted::Cancelled);
            }
        }

        Err(Exhausted::Attempts(self.attempts))
    }
}

/// Sleeps for `duration` in short slices, checking `cancel` at every slice boundary.
///
/// Returns `false` if the sleep was cut short by cancellation.
pub fn sleep(duration: time::Duration, cancel: Option<&AtomicBool>) -> bool {
    let slice = time::Duration::from_millis(SLEEP_SLICE_MS);
    let now = time::Instant::now();

    loop {
        if cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false) {
            return false;
        }

        let elapsed = now.elapsed();
        if elapsed >= duration {
            return true;
        }

        thread::sleep(slice.min(duration - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_counts_attempts() {
        let policy = RetryPolicy::new(10, time::Duration::ZERO);

        let res = policy.retry(None, |attempt| {
            if attempt == 5 {
                Attempt::Done("ready")
            } else {
                Attempt::Retry
            }
        });

        assert_eq!(res, Ok(("ready", 5)));
    }

    #[test]
    fn test_retry_exhausted() {
        let policy = RetryPolicy::new(3, time::Duration::ZERO);
        let mut calls = 0;

        let res: Result<((), u32), Exhausted> = policy.retry(None, |_| {
            calls += 1;
            Attempt::Retry
        });

        assert_eq!(res, Err(Exhausted::Attempts(3)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_cancelled() {
        let cancel = AtomicBool::new(true);
        let policy = RetryPolicy::new(3, time::Duration::from_secs(1));

        let res: Result<((), u32), Exhausted> = policy.retry(Some(&cancel), |_| Attempt::Retry);

        assert_eq!(res, Err(Exhausted::Cancelled));
    }

    #[test]
    fn test_sleep_cancelled() {
        let cancel = AtomicBool::new(true);
        let now = time::Instant::now();

        assert!(!sleep(time::Duration::from_secs(5), Some(&cancel)));
        assert!(now.elapsed() < time::Duration::from_secs(1));
        assert!(sleep(time::Duration::ZERO, None));
    }
}
