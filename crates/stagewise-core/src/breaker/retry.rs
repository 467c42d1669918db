//! Backend failure classification and retry backoff

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::BreakerConfig;
use crate::error::Error;

/// Whether a backend failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Timeouts, connection failures, 5xx, 429
    Transient,
    /// Validation failures and other 4xx
    Permanent,
}

/// Failure reported by a stage invoker
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::transient("request timed out")
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::transient(format!("connection failed: {}", message.into()))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::permanent(format!("validation failed: {}", message.into()))
    }

    /// Classify an HTTP-style status code
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = format!("HTTP {}: {}", status, message.into());
        match status {
            429 | 500..=599 => Self::transient(message),
            _ => Self::permanent(message),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }

    /// Convert into the crate error, tagged with the backend id
    pub fn into_error(self, backend: &str) -> Error {
        match self.kind {
            BackendErrorKind::Transient => Error::TransientBackend {
                backend: backend.to_string(),
                message: self.message,
            },
            BackendErrorKind::Permanent => Error::PermanentBackend {
                backend: backend.to_string(),
                message: self.message,
            },
        }
    }
}

/// Bounded exponential backoff with full jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for RetryPolicy {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay after attempt `attempt` (1-based)
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// Delay before the next attempt, uniform in [0, ceiling]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }

    /// Whether another attempt follows `attempt` for this failure
    pub fn should_retry(&self, attempt: u32, error: &BackendError) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(BackendError::from_status(503, "unavailable").is_transient());
        assert!(BackendError::from_status(500, "boom").is_transient());
        assert!(BackendError::from_status(429, "slow down").is_transient());
        assert!(!BackendError::from_status(400, "bad input").is_transient());
        assert!(!BackendError::from_status(404, "missing").is_transient());
        assert!(BackendError::timeout().is_transient());
        assert!(BackendError::connection("reset").is_transient());
        assert!(!BackendError::validation("empty payload").is_transient());
    }

    #[test]
    fn test_into_error_codes() {
        assert_eq!(BackendError::timeout().into_error("gpu-a").code(), "E100");
        assert_eq!(
            BackendError::validation("x").into_error("gpu-a").code(),
            "E101"
        );
    }

    #[test]
    fn test_backoff_ceiling_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(1_000),
        };
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_millis(1_000));

        for attempt in 1..5 {
            assert!(policy.delay_for(attempt) <= policy.backoff_ceiling(attempt));
        }
    }

    #[test]
    fn test_should_retry_only_transient_within_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, &BackendError::timeout()));
        assert!(!policy.should_retry(3, &BackendError::timeout()));
        assert!(!policy.should_retry(1, &BackendError::validation("x")));
    }
}
