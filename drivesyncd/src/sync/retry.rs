use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use drivesync_core::{DriveError, ErrorClass};
use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    NotFound,
    Fatal,
}

pub fn classify_drive_error(err: &DriveError) -> RetryClass {
    match err.classification() {
        ErrorClass::RateLimit | ErrorClass::Transient => RetryClass::Transient,
        ErrorClass::NotFound => RetryClass::NotFound,
        ErrorClass::Auth | ErrorClass::Permanent => RetryClass::Fatal,
    }
}

/// Doubling delay, capped at `max`, optionally drawn uniformly from
/// `0..=delay` when jitter is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        let capped = base_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(max_ms);
        let delay_ms = if self.jitter && capped > 0 {
            rng.gen_range(0..=capped)
        } else {
            capped
        };
        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            6,
            Backoff::new(Duration::from_secs(1), Duration::from_secs(64), false),
        )
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `call` until it succeeds, fails fatally or the attempt ceiling
    /// is hit. A not-found failure is reported as `Ok(None)`.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        operation: &str,
        classify: C,
        mut call: F,
    ) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryClass,
        E: Display,
    {
        let mut attempt = 0u32;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(Some(value)),
                Err(err) => err,
            };
            match classify(&err) {
                RetryClass::NotFound => {
                    debug!(operation, error = %err, "remote object missing, treating as done");
                    return Ok(None);
                }
                RetryClass::Fatal => return Err(err),
                RetryClass::Transient => {}
            }

            attempt += 1;
            if attempt >= self.max_attempts {
                warn!(operation, attempts = attempt, error = %err, "giving up after retries");
                return Err(err);
            }
            let delay = self.backoff.delay(attempt - 1);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// [`run`](Self::run) with the remote error classifier.
    pub async fn run_remote<T, F, Fut>(
        &self,
        operation: &str,
        call: F,
    ) -> Result<Option<T>, DriveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriveError>>,
    {
        self.run(operation, classify_drive_error, call).await
    }
}
