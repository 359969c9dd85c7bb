//! Error types shared by the client core.

use std::time::Duration;

use thiserror::Error;

/// A failure surfaced by the client core.
///
/// Every network-facing component maps its failures into one of these
/// variants so callers can drive user-visible messaging: a rate limit
/// carries the wait time, an auth failure must never be retried, and a
/// stream failure always arrives after whatever partial content was
/// already delivered.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// The streaming transport failed before or during a response stream.
    #[error("stream failed: {0}")]
    Stream(String),

    /// A write to the storage endpoint failed.
    #[error("failed to persist {entity}: {message}")]
    Persist { entity: &'static str, message: String },

    /// The server refused the request with 429; `retry_after` is the wait
    /// the server asked for, when it sent one.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// 401/403: the bearer credential was missing, expired, or rejected.
    #[error("not authorized: {0}")]
    Auth(String),

    /// 402: the account's message allowance is exhausted.
    #[error("message limit reached")]
    MessageLimit,

    /// Any other request/response failure.
    #[error("network error: {0}")]
    Network(String),
}

impl ApiError {
    /// Classify a non-success HTTP status into an error variant.
    ///
    /// `retry_after` is the parsed `Retry-After` header value, if any.
    pub fn from_status(
        status: u16,
        retry_after: Option<Duration>,
        detail: impl Into<String>,
    ) -> Self {
        match status {
            401 | 403 => ApiError::Auth(detail.into()),
            402 => ApiError::MessageLimit,
            429 => ApiError::RateLimited { retry_after },
            _ => ApiError::Network(detail.into()),
        }
    }

    /// Whether a caller-side retry could plausibly succeed.
    ///
    /// Only generic network failures qualify. Auth failures will keep
    /// failing until the credential changes, rate limits carry their own
    /// wait time, and stream/persist failures must not be retried blindly
    /// because the request may have partially taken effect server-side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }

    /// The wait requested by a rate-limit response, if this is one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        ApiError::Network(error.to_string())
    }
}
