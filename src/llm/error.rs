//! Capability error types with retry and fallback classification.
//!
//! Every outbound capability call (text or vision completion) fails with an
//! [`LlmError`]. The kind decides what the caller does next:
//! - overload kinds feed the throttler's delay adaptation and circuit breaker
//! - definitive kinds make the vision pipeline advance to the next tier at once
//! - transient kinds allow a bounded same-tier retry with backoff

use std::time::Duration;

/// Error from a capability call.
///
/// `Clone` because the throttler hands one upstream result to every merged
/// caller.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// The kind of error
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Suggested retry delay (from Retry-After header)
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn with_kind(kind: LlmErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
            retry_after: None,
        }
    }

    /// Create a rate limit error.
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            status_code: Some(429),
            message,
            retry_after,
        }
    }

    /// Create an infrastructure error (5xx / provider unavailable).
    pub fn infra(status_code: u16, message: String) -> Self {
        Self::with_kind(LlmErrorKind::Infra, Some(status_code), message)
    }

    /// Create a client error (bad request, auth, etc.).
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self::with_kind(LlmErrorKind::Client, Some(status_code), message)
    }

    /// Create a network error.
    pub fn network_error(message: String) -> Self {
        Self::with_kind(LlmErrorKind::Network, None, message)
    }

    /// Create a timeout error.
    pub fn timeout(after: Duration) -> Self {
        Self::with_kind(
            LlmErrorKind::Timeout,
            None,
            format!("call timed out after {}ms", after.as_millis()),
        )
    }

    /// Create a parse error.
    pub fn parse_error(message: String) -> Self {
        Self::with_kind(LlmErrorKind::Parse, None, message)
    }

    /// Create a payload-too-large error for oversized vision inputs.
    pub fn payload_too_large(size: usize, limit: usize) -> Self {
        Self::with_kind(
            LlmErrorKind::PayloadTooLarge,
            Some(413),
            format!("image is {} bytes, limit is {} bytes", size, limit),
        )
    }

    /// Create a queue overflow error (throttler backpressure).
    pub fn queue_overflow(queue_len: usize) -> Self {
        Self::with_kind(
            LlmErrorKind::QueueOverflow,
            None,
            format!("admission queue full ({} entries)", queue_len),
        )
    }

    /// Check if this error is transient and may be retried on the same tier.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Check if this error counts as provider overload.
    pub fn is_overload(&self) -> bool {
        self.kind.is_overload()
    }

    /// Get the suggested delay before retry.
    ///
    /// Returns the `retry_after` if set, otherwise exponential backoff from
    /// `base`, capped at `cap`.
    pub fn suggested_delay(&self, attempt: u32, base: Duration, cap: Duration) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after.min(cap);
        }

        let base_ms = match self.kind {
            // Start higher for rate limits
            LlmErrorKind::RateLimited => base.as_millis() as u64 * 2,
            _ => base.as_millis() as u64,
        };

        let multiplier = 2u64.saturating_pow(attempt);
        let delay_ms = base_ms.saturating_mul(multiplier);

        // Deterministic jitter (up to 25%) derived from the attempt number
        let jitter_range = delay_ms / 4;
        let jitter = if jitter_range > 0 {
            (attempt as u64 * 7) % jitter_range
        } else {
            0
        };

        Duration::from_millis(delay_ms.saturating_add(jitter)).min(cap)
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of capability errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Rate limited (429)
    RateLimited,
    /// Provider overloaded or unavailable (5xx)
    Infra,
    /// Client error (400, 401, 403, 404)
    Client,
    /// Connection failed or reset
    Network,
    /// Call exceeded its per-call timeout
    Timeout,
    /// Response could not be parsed
    Parse,
    /// Image exceeded the fixed byte budget
    PayloadTooLarge,
    /// Throttler admission queue is full
    QueueOverflow,
}

impl LlmErrorKind {
    /// Ambiguous errors that may clear within seconds on the same tier.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::Network | LlmErrorKind::QueueOverflow
        )
    }

    /// Errors that signal the provider is struggling. These slow the
    /// throttler down and count toward its circuit breaker.
    pub fn is_overload(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::Infra
                | LlmErrorKind::Timeout
                | LlmErrorKind::RateLimited
                | LlmErrorKind::Network
        )
    }

    /// Errors after which the vision pipeline moves to the next tier without
    /// retrying the current one.
    pub fn should_fallback(&self) -> bool {
        !self.is_transient()
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::Infra => write!(f, "Infrastructure error"),
            LlmErrorKind::Client => write!(f, "Client error"),
            LlmErrorKind::Network => write!(f, "Network error"),
            LlmErrorKind::Timeout => write!(f, "Timeout"),
            LlmErrorKind::Parse => write!(f, "Parse error"),
            LlmErrorKind::PayloadTooLarge => write!(f, "Payload too large"),
            LlmErrorKind::QueueOverflow => write!(f, "Queue overflow"),
        }
    }
}

/// Configuration for same-tier retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of same-tier retries for transient errors
    pub max_retries: u32,
    /// Base backoff delay
    pub base_delay: Duration,
    /// Cap on a single backoff delay
    pub max_delay: Duration,
    /// Whether to retry on rate limit errors
    pub retry_rate_limits: bool,
    /// Whether to retry on network errors
    pub retry_network_errors: bool,
    /// Whether to retry when the throttler queue is full
    pub retry_queue_overflow: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            retry_rate_limits: true,
            retry_network_errors: true,
            retry_queue_overflow: true,
        }
    }
}

impl RetryConfig {
    /// Check if the given error should be retried on the same tier.
    pub fn should_retry(&self, error: &LlmError) -> bool {
        match error.kind {
            LlmErrorKind::RateLimited => self.retry_rate_limits,
            LlmErrorKind::Network => self.retry_network_errors,
            LlmErrorKind::QueueOverflow => self.retry_queue_overflow,
            // Definitive failures advance to the next tier instead
            LlmErrorKind::Infra
            | LlmErrorKind::Timeout
            | LlmErrorKind::Client
            | LlmErrorKind::Parse
            | LlmErrorKind::PayloadTooLarge => false,
        }
    }

    /// Backoff before same-tier retry number `attempt` (0-based).
    pub fn delay_for(&self, error: &LlmError, attempt: u32) -> Duration {
        error.suggested_delay(attempt, self.base_delay, self.max_delay)
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        413 => LlmErrorKind::PayloadTooLarge,
        408 => LlmErrorKind::Timeout,
        400..=499 => LlmErrorKind::Client,
        _ => LlmErrorKind::Infra,
    }
}
