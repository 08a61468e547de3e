use std::cmp;
use std::thread;
use std::time::Duration;
use tracing::warn;

const DEFAULT_STEP_MS: u64 = 50;
const DEFAULT_MAX_DELAY_MS: u64 = 1_000;

/// Linear backoff capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, step: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            step,
            max_delay,
        }
    }

    /// Version allocation: three attempts.
    pub const fn version_allocation() -> Self {
        Self::new(
            3,
            Duration::from_millis(DEFAULT_STEP_MS),
            Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        )
    }

    pub const fn session_persistence() -> Self {
        Self::new(
            5,
            Duration::from_millis(DEFAULT_STEP_MS * 2),
            Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        )
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let backoff = self.step.saturating_mul(attempt.max(1));
        cmp::min(backoff, self.max_delay)
    }

    /// Runs `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent. The last error is returned on exhaustion.
    pub fn run<T, E: std::fmt::Display>(
        &self,
        what: &str,
        mut op: impl FnMut(u32) -> Result<T, E>,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && is_retryable(&err) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        what,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after failure"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::version_allocation()
    }
}
