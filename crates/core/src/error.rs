// Central Error Types for the Application

use thiserror::Error;

/// Maximum number of bytes of an external payload kept on a failure record
pub const RAW_EXCERPT_LIMIT: usize = 2048;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A read-check-write loop kept losing to concurrent writers
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller no longer holds the lease on the job
    #[error("Lease lost on job {job_id}")]
    LeaseLost { job_id: String },

    #[error("External service error: {0}")]
    External(#[from] ExternalError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Classified failure of a call to the external marketplace API.
///
/// `Clone` because a single token refresh result is handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    /// No response, 429 or 5xx; retried by the client until the budget is spent
    #[error("Transient external failure (status {status:?}): {message}")]
    Transient {
        status: Option<u16>,
        message: String,
        raw: Option<String>,
    },

    /// 401 that survived the one-shot refresh
    #[error("Authorization rejected after token refresh")]
    AuthExpired { raw: Option<String> },

    /// Any other 4xx
    #[error("Permanent external failure (status {status}): {message}")]
    Permanent {
        status: u16,
        message: String,
        raw: Option<String>,
    },

    #[error("Reauthorization required: {0}")]
    RefreshFailed(String),

    #[error("Stored token environment ({stored}) does not match configured environment ({configured})")]
    EnvironmentMismatch { stored: String, configured: String },

    #[error("Token store unavailable: {0}")]
    TokenStore(String),
}

impl ExternalError {
    /// Machine-filterable code stored on failed jobs
    pub fn code(&self) -> &'static str {
        match self {
            ExternalError::Transient { .. } => "TRANSIENT_EXTERNAL",
            ExternalError::AuthExpired { .. } => "AUTH_EXPIRED",
            ExternalError::Permanent { .. } => "PERMANENT_EXTERNAL",
            ExternalError::RefreshFailed(_) => "REAUTHORIZATION_REQUIRED",
            ExternalError::EnvironmentMismatch { .. } => "TOKEN_ENV_MISMATCH",
            ExternalError::TokenStore(_) => "TOKEN_STORE_ERROR",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ExternalError::Transient { status, .. } => *status,
            ExternalError::AuthExpired { .. } => Some(401),
            ExternalError::Permanent { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn raw_excerpt(&self) -> Option<&str> {
        match self {
            ExternalError::Transient { raw, .. }
            | ExternalError::AuthExpired { raw }
            | ExternalError::Permanent { raw, .. } => raw.as_deref(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExternalError::Transient { .. })
    }
}

/// Truncate an external payload to at most `RAW_EXCERPT_LIMIT` bytes on a char boundary
pub fn excerpt(raw: &str) -> String {
    if raw.len() <= RAW_EXCERPT_LIMIT {
        return raw.to_string();
    }
    let mut end = RAW_EXCERPT_LIMIT;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &raw[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_per_category() {
        let errors = [
            ExternalError::Transient {
                status: Some(503),
                message: "unavailable".into(),
                raw: None,
            },
            ExternalError::AuthExpired { raw: None },
            ExternalError::Permanent {
                status: 400,
                message: "bad".into(),
                raw: None,
            },
            ExternalError::RefreshFailed("revoked".into()),
            ExternalError::EnvironmentMismatch {
                stored: "sandbox".into(),
                configured: "production".into(),
            },
            ExternalError::TokenStore("down".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ExternalError::Transient {
            status: None,
            message: "timeout".into(),
            raw: None
        }
        .is_retryable());
        assert!(!ExternalError::Permanent {
            status: 404,
            message: "missing".into(),
            raw: None
        }
        .is_retryable());
        assert!(!ExternalError::RefreshFailed("x".into()).is_retryable());
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(RAW_EXCERPT_LIMIT);
        let cut = excerpt(&long);
        assert!(cut.len() <= RAW_EXCERPT_LIMIT + "…".len());
        assert!(cut.ends_with('…'));
        assert_eq!(excerpt("short"), "short");
    }
}
