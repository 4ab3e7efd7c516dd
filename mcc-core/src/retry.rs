//! Bounded fixed-delay retry
//!
//! Every device call goes through this. All errors are retried the same way:
//! no backoff, no jitter, no distinction between transient and permanent
//! failures. The last error is returned once the attempts are used up.

use std::thread;
use std::time::Duration;

use tracing::warn;

/// Fixed delay between attempts and the total number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            max_retries: 20,
        }
    }
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }

    pub fn run<T, E, W>(&self, work: W) -> Result<T, E>
    where
        W: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
    {
        retry(self.delay, self.max_retries, work, |_: &E, _| {})
    }

    pub fn run_with<T, E, W, H>(&self, work: W, on_error: H) -> Result<T, E>
    where
        W: FnMut() -> Result<T, E>,
        H: FnMut(&E, u32),
        E: std::fmt::Display,
    {
        retry(self.delay, self.max_retries, work, on_error)
    }
}

/// Call `work` up to `max_retries` times, sleeping `delay` between attempts.
///
/// `on_error` sees each failure with its 1-based attempt number before the
/// sleep. A `max_retries` of zero still makes one attempt.
pub fn retry<T, E, W, H>(delay: Duration, max_retries: u32, mut work: W, mut on_error: H) -> Result<T, E>
where
    W: FnMut() -> Result<T, E>,
    H: FnMut(&E, u32),
    E: std::fmt::Display,
{
    let max_retries = max_retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match work() {
            Ok(result) => return Ok(result),
            Err(e) => {
                on_error(&e, attempt);

                if attempt >= max_retries {
                    return Err(e);
                }

                warn!(
                    error = %e,
                    delay = ?delay,
                    retry_count = attempt,
                    max_retries,
                    "retrying"
                );
                thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_two_failures() {
        let mut calls = 0;
        let result: Result<&str, String> = retry(Duration::ZERO, 3, || {
            calls += 1;
            if calls < 3 {
                Err(format!("failure {}", calls))
            } else {
                Ok("done")
            }
        }, |_, _| {});

        assert_eq!(result, Ok("done"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut calls = 0;
        let mut seen = Vec::new();
        let result: Result<(), String> = retry(
            Duration::ZERO,
            3,
            || {
                calls += 1;
                Err(format!("failure {}", calls))
            },
            |e, attempt| seen.push((e.clone(), attempt)),
        );

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls, 3);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ("failure 1".to_string(), 1));
    }

    #[test]
    fn test_policy_zero_retries_makes_one_attempt() {
        let policy = RetryPolicy::new(Duration::ZERO, 0);
        let mut calls = 0;
        let result: Result<(), &str> = policy.run(|| {
            calls += 1;
            Err("nope")
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_first_success_is_not_retried() {
        let policy = RetryPolicy::new(Duration::from_secs(60), 5);
        let mut calls = 0;
        let result: Result<u32, &str> = policy.run(|| {
            calls += 1;
            Ok(7)
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 1);
    }
}
