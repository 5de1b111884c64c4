//! Error types for the gateway
//!
//! Internal code propagates [`Error`]; the RPC boundary translates into the
//! closed [`ErrorCode`] taxonomy carried by [`ErrorBody`] frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Request failed schema validation
    #[error("invalid request: {message}")]
    Invalid {
        message: String,
        /// Offending field, when known
        field: Option<String>,
    },

    /// Caller is not authenticated
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but lacks the required scope
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflicting state (duplicate id, concurrent mutation)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Rate limited, with an optional retry hint
    #[error("rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Agent run exceeded its deadline
    #[error("agent timeout: {0}")]
    AgentTimeout(String),

    /// No live auth profile could serve the provider
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Channel exists but has no live connection
    #[error("channel not linked: {0}")]
    ChannelNotLinked(String),

    /// Compaction ran but did not reduce the token estimate
    #[error("compaction ineffective for {0}")]
    CompactionIneffective(String),

    /// Run was cancelled
    #[error("aborted: {0}")]
    Aborted(String),

    /// Session key failed to parse
    #[error("bad session key: {0}")]
    BadSessionKey(String),

    /// Channel adapter error
    #[error("channel error: {0}")]
    Channel(String),

    /// Media store / fetch error
    #[error("media error: {0}")]
    Media(String),

    /// Tool execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// Persistence is temporarily unavailable
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

/// Closed wire-level error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    AgentTimeout,
    ProviderUnavailable,
    ChannelNotLinked,
    CompactionIneffective,
    InternalError,
    ServiceUnavailable,
    Aborted,
}

/// Error shape sent over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorBody {
    /// Build a minimal body from a code and message
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            field: None,
            retryable: None,
            retry_after_ms: None,
            request_id: None,
        }
    }

    /// Attach the request id this error answers
    #[must_use]
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

impl Error {
    /// Map an internal error onto the wire taxonomy.
    ///
    /// Authorization errors never leak which scope was missing beyond the
    /// category; internal errors get a correlation id and a generic message.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::Invalid { message, field } => {
                let mut body = ErrorBody::new(ErrorCode::InvalidRequest, message.clone());
                body.field.clone_from(field);
                body
            }
            Self::Config(m) | Self::BadSessionKey(m) => {
                ErrorBody::new(ErrorCode::InvalidRequest, m.clone())
            }
            Self::Unauthorized(_) => {
                ErrorBody::new(ErrorCode::Unauthorized, "authentication required")
            }
            Self::Forbidden(_) => ErrorBody::new(ErrorCode::Forbidden, "insufficient scope"),
            Self::NotFound(m) => ErrorBody::new(ErrorCode::NotFound, m.clone()),
            Self::Conflict(m) => ErrorBody::new(ErrorCode::Conflict, m.clone()),
            Self::RateLimited { retry_after_ms } => {
                let mut body = ErrorBody::new(ErrorCode::RateLimited, "rate limited");
                body.retryable = Some(true);
                body.retry_after_ms = *retry_after_ms;
                body
            }
            Self::AgentTimeout(m) => ErrorBody::new(ErrorCode::AgentTimeout, m.clone()),
            Self::ProviderUnavailable(m) => {
                let mut body = ErrorBody::new(ErrorCode::ProviderUnavailable, m.clone());
                body.retryable = Some(true);
                body
            }
            Self::ChannelNotLinked(m) => ErrorBody::new(ErrorCode::ChannelNotLinked, m.clone()),
            Self::CompactionIneffective(m) => {
                ErrorBody::new(ErrorCode::CompactionIneffective, m.clone())
            }
            Self::Aborted(m) => ErrorBody::new(ErrorCode::Aborted, m.clone()),
            Self::StoreUnavailable(m) => {
                let mut body = ErrorBody::new(ErrorCode::ServiceUnavailable, m.clone());
                body.retryable = Some(true);
                body
            }
            Self::Channel(m) | Self::Media(m) | Self::Tool(m) => {
                ErrorBody::new(ErrorCode::InternalError, m.clone())
            }
            Self::Io(_) | Self::Http(_) | Self::Serialization(_) | Self::Toml(_)
            | Self::Internal(_) => {
                let correlation = uuid::Uuid::new_v4();
                tracing::error!(correlation = %correlation, error = %self, "internal error");
                ErrorBody::new(
                    ErrorCode::InternalError,
                    format!("internal error ({correlation})"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_does_not_leak_scope() {
        let err = Error::Forbidden("missing scope write".to_string());
        let body = err.to_body();
        assert_eq!(body.code, ErrorCode::Forbidden);
        assert!(!body.message.contains("write"));
    }

    #[test]
    fn rate_limited_carries_retry_hint() {
        let err = Error::RateLimited {
            retry_after_ms: Some(2500),
        };
        let body = err.to_body();
        assert_eq!(body.code, ErrorCode::RateLimited);
        assert_eq!(body.retry_after_ms, Some(2500));
        assert_eq!(body.retryable, Some(true));
    }

    #[test]
    fn error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ProviderUnavailable).unwrap();
        assert_eq!(json, "\"provider_unavailable\"");
    }

    #[test]
    fn invalid_carries_field_hint() {
        let err = Error::Invalid {
            message: "missing text".to_string(),
            field: Some("params.text".to_string()),
        };
        let body = err.to_body();
        assert_eq!(body.field.as_deref(), Some("params.text"));
    }
}
