//! Retry policy for text-generation calls.
//!
//! Only transport trouble is retried: rate limiting (429), server errors
//! (500, 502, 503, 504) and requests that never got a response. Anything
//! else, including a 4xx caused by a bad request, fails on the first try.
//! When the provider sends `Retry-After` that wait is used as-is; otherwise
//! the delay grows exponentially and is jittered so that concurrent requests
//! hitting the same rate limit do not retry in lockstep.
//!
//! A local Ollama rarely needs any of this, so the context default is
//! [`BackoffConfig::none()`].

use crate::error::AgentError;
use std::time::Duration;

/// Retry budget and delay schedule for one generation call.
///
/// ```
/// use sql_agent::llm::BackoffConfig;
///
/// assert_eq!(BackoffConfig::none().max_retries, 0);
/// assert_eq!(BackoffConfig::standard().max_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Delay grows as `initial_delay * multiplier^attempt`.
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: JitterStrategy,
    /// HTTP statuses treated as transient.
    pub retryable_statuses: Vec<u16>,
    /// Sleep for the provider's `Retry-After` instead of the computed delay.
    pub respect_retry_after: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2` plus uniform in `[0, delay/2]`.
    Equal,
}

impl BackoffConfig {
    /// Never retry. Errors surface to the stage immediately.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// For hosted endpoints with rate limits: 3 retries from 1s, doubling,
    /// capped at 60s.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// 2 quick retries from 500ms, capped at 10s, so a user waiting on an
    /// answer is not left hanging on a struggling provider.
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            ..Self::standard()
        }
    }

    /// Whether `error` is transient under this policy.
    pub fn retries(&self, error: &AgentError) -> bool {
        match error {
            AgentError::HttpError { status, .. } => self.retryable_statuses.contains(status),
            AgentError::Request(_) => true,
            _ => false,
        }
    }

    /// How long to wait after `error` before retry number `attempt + 1`.
    pub fn delay_after(&self, error: &AgentError, attempt: u32) -> Duration {
        match error {
            AgentError::HttpError {
                retry_after: Some(wait),
                ..
            } if self.respect_retry_after => *wait,
            _ => self.delay_for_attempt(attempt),
        }
    }

    /// Delay before retry number `attempt + 1` (0-indexed), jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let secs = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };
        Duration::from_secs_f64(secs)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}
