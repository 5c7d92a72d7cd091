//! Error types for the UVZ tool server

use thiserror::Error;

/// Result type alias for UVZ operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving tool invocations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Quota exceeded, retry in {retry_after_ms}ms")]
    QuotaExceeded { retry_after_ms: u64 },

    #[error("Completion backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Completion backend rejected request ({status}): {message}")]
    BackendRejected { status: u16, message: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Stable machine-readable kind for the protocol boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::BackendRejected { .. } => "backend_rejected",
            Error::Template(_) => "template_error",
            Error::Tool(_) => "tool_error",
            Error::Search(_) => "search_error",
            Error::Config(_) => "config_error",
            Error::Io(_) | Error::Json(_) | Error::Http(_) => "internal_error",
        }
    }

    /// Retry hint in milliseconds, present only for quota denials.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::QuotaExceeded { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}
