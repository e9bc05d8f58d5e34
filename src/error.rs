//! Error taxonomy shared by the proxy handlers, the chat session and the
//! tool dispatcher.
//!
//! `AppError` is what gets surfaced to a caller.  Lower layers keep their
//! own error enums (`ProviderError`, `DispatchError`, `ValidationError`)
//! and are folded into an `AppError` at the boundary where they are
//! handled, which is also where they are logged.

use axum::http::StatusCode;

use crate::gemini::ProviderError;
use crate::retry::RetryError;
use crate::validation::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Forbidden,
    RateLimit,
    QuotaExceeded,
    Validation,
    Api,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Api => "API",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    #[error("Unable to reach the service. Please check your internet connection.")]
    Network { detail: String },
    #[error("Access to the AI service was refused. Check the API key configuration.")]
    Forbidden { detail: String },
    #[error("Too many requests. Please wait a moment and try again.")]
    RateLimit { detail: String },
    #[error("API quota exhausted for the current period. Please try again later.")]
    QuotaExceeded { detail: String },
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("An error occurred while fetching data from the upstream service.")]
    Api { detail: String },
    #[error("An unexpected error occurred.")]
    Unknown { detail: String },
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Network { .. } => ErrorKind::Network,
            AppError::Forbidden { .. } => ErrorKind::Forbidden,
            AppError::RateLimit { .. } => ErrorKind::RateLimit,
            AppError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Api { .. } => ErrorKind::Api,
            AppError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Text safe to show an end user.  Validation messages pass through
    /// verbatim, everything else is a fixed sentence per kind.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Underlying detail for logs; never sent to clients.
    pub fn detail(&self) -> String {
        match self {
            AppError::Network { detail }
            | AppError::Forbidden { detail }
            | AppError::RateLimit { detail }
            | AppError::QuotaExceeded { detail }
            | AppError::Api { detail }
            | AppError::Unknown { detail } => detail.clone(),
            AppError::Validation(v) => v.to_string(),
        }
    }

    /// Only connectivity failures and transient rate limits are worth
    /// another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::RateLimit)
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::QuotaExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Forbidden | ErrorKind::Api | ErrorKind::Network => StatusCode::BAD_GATEWAY,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify a raw provider failure by transport outcome, status code
    /// and message markers.
    pub fn from_provider(err: &ProviderError) -> Self {
        let detail = err.to_string();
        match err {
            ProviderError::Transport(_) => AppError::Network { detail },
            ProviderError::Decode(_) => AppError::Api { detail },
            ProviderError::Status { status, message } => {
                let lower = message.to_ascii_lowercase();
                if *status == 403 || lower.contains("permission_denied") {
                    AppError::Forbidden { detail }
                } else if err.is_quota_exhausted() {
                    AppError::QuotaExceeded { detail }
                } else if err.is_rate_limited() {
                    AppError::RateLimit { detail }
                } else {
                    AppError::Api { detail }
                }
            }
        }
    }

    /// Structured record at the point an error is handled.
    pub fn log(&self, context: serde_json::Value) {
        tracing::error!(
            kind = self.kind().as_str(),
            message = %self.detail(),
            context = %context,
            timestamp = %chrono::Utc::now().to_rfc3339(),
            "request failed"
        );
    }
}

impl From<RetryError<ProviderError>> for AppError {
    fn from(err: RetryError<ProviderError>) -> Self {
        match err {
            RetryError::QuotaExceeded(inner) => AppError::QuotaExceeded {
                detail: inner.to_string(),
            },
            RetryError::StillRateLimited { attempts, last } => AppError::RateLimit {
                detail: format!("still rate limited after {} attempts: {}", attempts, last),
            },
            RetryError::Failed(inner) => AppError::from_provider(&inner),
        }
    }
}
