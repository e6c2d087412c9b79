//! Crate-wide error type.
//!
//! Every failure the relay or the stream consumer can hit maps onto one
//! [`RelayError`] variant. The variant decides the HTTP status the relay answers
//! with and the user-facing message a client shows.

use std::time::Duration;

use thiserror::Error;

/// Shown to users when the hosted model rate-limits us.
pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please wait a moment and try again.";
/// Shown to users when the hosted model account is out of credit.
pub const QUOTA_MESSAGE: &str = "Usage limit reached. Please check your account.";
/// Generic message for every other upstream or transport failure.
pub const UNAVAILABLE_MESSAGE: &str = "AI service temporarily unavailable";
/// Returned when the upstream credential is missing from the relay configuration.
pub const MISSING_KEY_MESSAGE: &str = "upstream API key is not configured";

#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay is missing something it needs before it can forward anything.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request body of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),

    /// HTTP 429 from the hosted model. Recoverable by waiting.
    #[error("upstream rate limited (retry after {retry_after_secs:?}s)")]
    UpstreamRateLimited { retry_after_secs: Option<u64> },

    /// HTTP 402 from the hosted model. Needs operator action.
    #[error("upstream quota exhausted")]
    UpstreamQuotaExhausted,

    /// Any other non-success status. `message` is safe to show to users.
    #[error("upstream unavailable: HTTP {status}: {message}")]
    UpstreamUnavailable { status: u16, message: String },

    /// A `data:` line that never decoded before the stream ended.
    #[error("malformed SSE frame: {line}")]
    MalformedFrame { line: String },

    #[error("network failure: {0}")]
    Network(String),

    #[error("no data received within {0:?}")]
    Timeout(Duration),

    #[error("exchange cancelled")]
    Cancelled,

    #[error("an exchange is already in flight")]
    Busy,

    #[error("cooling down after a rate limit, retry in {remaining_secs}s")]
    CoolingDown { remaining_secs: u64 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Network(e.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// HTTP status the relay answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Configuration(_) => 500,
            RelayError::BadRequest(_) | RelayError::Json(_) => 400,
            RelayError::PayloadTooLarge(_) => 413,
            RelayError::UpstreamRateLimited { .. } | RelayError::CoolingDown { .. } => 429,
            RelayError::UpstreamQuotaExhausted => 402,
            RelayError::UpstreamUnavailable { .. } => 500,
            RelayError::MalformedFrame { .. } => 502,
            RelayError::Network(_) | RelayError::Timeout(_) => 503,
            RelayError::Cancelled => 499,
            RelayError::Busy => 409,
            RelayError::Io(_) | RelayError::ConfigFile(_) => 500,
        }
    }

    /// Stable message suitable for a toast or an `{"error": ...}` body.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Configuration(msg) | RelayError::BadRequest(msg) => msg.clone(),
            RelayError::UpstreamRateLimited { .. } => RATE_LIMIT_MESSAGE.to_string(),
            RelayError::UpstreamQuotaExhausted => QUOTA_MESSAGE.to_string(),
            RelayError::UpstreamUnavailable { message, .. } if !message.is_empty() => {
                message.clone()
            }
            RelayError::UpstreamUnavailable { .. }
            | RelayError::MalformedFrame { .. }
            | RelayError::Network(_)
            | RelayError::Timeout(_) => UNAVAILABLE_MESSAGE.to_string(),
            RelayError::CoolingDown { remaining_secs } => {
                format!("Please wait {remaining_secs}s and try again.")
            }
            other => other.to_string(),
        }
    }

    /// Seconds the caller should wait before re-sending, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RelayError::UpstreamRateLimited { retry_after_secs } => *retry_after_secs,
            RelayError::CoolingDown { remaining_secs } => Some(*remaining_secs),
            _ => None,
        }
    }

    /// Whether re-sending the same request later can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamRateLimited { .. }
                | RelayError::UpstreamUnavailable { .. }
                | RelayError::Network(_)
                | RelayError::Timeout(_)
                | RelayError::CoolingDown { .. }
                | RelayError::Busy
        )
    }
}
