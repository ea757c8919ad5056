use std::thread;
use std::time::Duration;

use refine_contracts::config::RetrySettings;
use refine_contracts::RateLimitSignal;
use tracing::warn;

type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

/// Details of a retry about to be waited out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryNotice<'a> {
    pub operation: &'a str,
    /// 1-based number of the retry being scheduled.
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
}

/// Retries operations that fail with a rate-limit signal, doubling the wait
/// each time starting from `initial_delay`. Other failures, and the failure
/// after the last permitted retry, are returned unchanged.
///
/// The delay is neither capped nor jittered.
pub struct BackoffExecutor {
    max_retries: u32,
    initial_delay: Duration,
    sleeper: Sleeper,
}

impl Default for BackoffExecutor {
    fn default() -> Self {
        Self::from_settings(RetrySettings::default())
    }
}

impl std::fmt::Debug for BackoffExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffExecutor")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .finish_non_exhaustive()
    }
}

impl BackoffExecutor {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            sleeper: Box::new(thread::sleep),
        }
    }

    pub fn from_settings(settings: RetrySettings) -> Self {
        Self::new(settings.max_retries, settings.initial_delay)
    }

    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn execute<T, E, F>(&self, operation_name: &str, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: RateLimitSignal + std::fmt::Display,
    {
        self.execute_notifying(operation_name, |_| {}, operation)
    }

    /// Like `execute`, calling `on_retry` before each wait.
    pub fn execute_notifying<T, E, F, N>(
        &self,
        operation_name: &str,
        on_retry: N,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        N: Fn(&RetryNotice<'_>),
        E: RateLimitSignal + std::fmt::Display,
    {
        let mut retries = 0u32;
        let mut delay = self.initial_delay;

        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_rate_limited() && retries < self.max_retries => {
                    let notice = RetryNotice {
                        operation: operation_name,
                        attempt: retries + 1,
                        max_retries: self.max_retries,
                        delay,
                    };
                    warn!(
                        operation = operation_name,
                        attempt = notice.attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited ({err}); retrying in {}ms (attempt {}/{})",
                        delay.as_millis(),
                        notice.attempt,
                        self.max_retries
                    );
                    on_retry(&notice);
                    (self.sleeper)(delay);
                    retries += 1;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
