use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Raised in place of an attempt that outlived `RetryPolicy::attempt_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("attempt timed out after {0:?}")]
pub struct AttemptTimedOut(pub Duration);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay * 2^attempt, max_delay)` for a 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

const TRANSIENT_MARKERS: [&str; 12] = [
    "connection reset",
    "connection refused",
    "connection closed",
    "econnreset",
    "econnrefused",
    "etimedout",
    "enotfound",
    "timed out",
    "timeout",
    "dns",
    "socket hang up",
    "broken pipe",
];

/// Default predicate: transport-level failures recognised by their message.
pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

pub fn default_is_retryable<E: Display>(err: &E) -> bool {
    is_transient_message(&err.to_string())
}

/// Like [`is_transient_message`], but walks the `source()` chain; HTTP
/// clients tend to bury the socket error beneath a generic body error.
pub fn is_transient_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if is_transient_message(&err.to_string()) {
            return true;
        }
        current = err.source();
    }
    false
}

/// Runs `operation` until it succeeds, the predicate rejects the error, or
/// `max_attempts` is spent; the last error is returned in the latter cases.
///
/// The closure receives the 0-indexed attempt number.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: From<AttemptTimedOut> + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let outcome = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(E::from(AttemptTimedOut(limit))),
            },
            None => operation(attempt).await,
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt + 1 >= max_attempts || !is_retryable(&err) {
            return Err(err);
        }
        let delay = policy.delay_for_attempt(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
