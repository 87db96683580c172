//! Error types for the confab workspace.

use thiserror::Error;

/// Result type alias using the confab error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for confab services.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transport is disconnected or cannot accept the publish
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No reply arrived before the deadline
    #[error("Request timed out")]
    Timeout,

    /// Caller abandoned the request before a reply arrived
    #[error("Request cancelled")]
    Cancelled,

    /// Reply arrived for a session nobody is waiting on
    #[error("No matching session: {0}")]
    NoMatchingSession(String),

    /// Reply payload could not be decoded as expected
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if this is a timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if the caller may reasonably retry the same request.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_) | Self::Timeout)
    }

    /// Get HTTP status code for this error.
    ///
    /// Backend-unavailable and deadline conditions map to 503/504 so an
    /// HTTP layer can distinguish them from plain 500 bugs.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::NoMatchingSession(_) => 404,
            Self::Cancelled => 499,
            Self::MalformedReply(_) => 502,
            Self::TransportUnavailable(_) => 503,
            Self::Timeout => 504,
            Self::WithContext { source, .. } => source.status_code(),
            _ => 500,
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
