//! Error types for community-feed
//!
//! Remote calls fail with [`XrpcError`], which is cloneable so that a single
//! in-flight request can hand the same failure to every caller waiting on it.
//! Everything else is converted to [`AppError`].

use thiserror::Error;

/// Failure of a remote procedure call or plain JSON endpoint
///
/// Callers render Status and Transport identically (a generic
/// "failed to load" state with a manual retry).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum XrpcError {
    /// Non-2xx HTTP status
    #[error("{method} failed: {status}")]
    Status {
        method: String,
        status: u16,
        /// `error` field of the XRPC error body, if any
        error: Option<String>,
        /// `message` field of the XRPC error body, if any
        message: Option<String>,
    },

    /// Network unreachable, connection reset or timeout
    #[error("{method} transport error: {message}")]
    Transport {
        method: String,
        message: String,
        timeout: bool,
    },

    /// 2xx response whose body is not the expected JSON
    #[error("{method} returned a malformed body: {message}")]
    Decode { method: String, message: String },

    /// DPoP proof could not be produced for the request
    #[error("{method} could not be signed: {message}")]
    Signing { method: String, message: String },
}

impl XrpcError {
    pub(crate) fn transport(method: &str, err: reqwest::Error) -> Self {
        XrpcError::Transport {
            method: method.to_string(),
            message: err.to_string(),
            timeout: err.is_timeout(),
        }
    }

    pub(crate) fn decode(method: &str, err: impl std::fmt::Display) -> Self {
        XrpcError::Decode {
            method: method.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn signing(method: &str, err: impl std::fmt::Display) -> Self {
        XrpcError::Signing {
            method: method.to_string(),
            message: err.to_string(),
        }
    }

    /// Whether a manual retry may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, XrpcError::Decode { .. } | XrpcError::Signing { .. })
    }

    /// Whether the server rejected the request only for a missing or stale
    /// DPoP nonce
    pub fn is_nonce_challenge(&self) -> bool {
        matches!(
            self,
            XrpcError::Status { status: 400 | 401, error: Some(error), .. }
                if error == "use_dpop_nonce"
        )
    }

    /// HTTP status, for protocol errors
    pub fn status(&self) -> Option<u16> {
        match self {
            XrpcError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short label used for the error metric
    pub fn kind(&self) -> &'static str {
        match self {
            XrpcError::Status { .. } => "status",
            XrpcError::Transport { .. } => "transport",
            XrpcError::Decode { .. } => "decode",
            XrpcError::Signing { .. } => "signing",
        }
    }
}

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Remote call failed
    #[error(transparent)]
    Xrpc(#[from] XrpcError),

    /// Query is disabled or input is invalid
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed AT URI
    #[error("Invalid AT URI: {0}")]
    InvalidUri(String),

    /// No authenticated session
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    /// OAuth handshake failure
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// Device storage error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(anyhow::anyhow!("Migration failed: {}", err))
    }
}

impl AppError {
    /// Short label used for the error metric
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Xrpc(err) => err.kind(),
            AppError::Validation(_) => "validation",
            AppError::InvalidUri(_) => "invalid_uri",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::OAuth(_) => "oauth",
            AppError::Database(_) => "database",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    /// Record this error in the error metric and return it
    pub fn record(self) -> Self {
        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();
        self
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
