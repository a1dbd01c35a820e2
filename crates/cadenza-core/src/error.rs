//! Error types for the Cadenza singer lifecycle core.


/// Result type alias for Cadenza operations
pub type CadenzaResult<T> = Result<T, CadenzaError>;

/// Main error type for singer lifecycle operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CadenzaError {
    /// Singer discovery failed for a search root
    #[error("Singer discovery failed: {message}")]
    DiscoveryError {
        /// Error message describing the discovery failure
        message: String,
    },

    /// Voicebank definition could not be parsed
    #[error("Voicebank parse error: {message}")]
    ParseError {
        /// Error message describing the parse failure
        message: String,
    },

    /// File I/O error
    #[error("File I/O error: {message}")]
    FileError {
        /// Error message describing the file operation failure
        message: String,
    },

    /// Metadata cache error
    #[error("Metadata cache error: {message}")]
    CacheError {
        /// Error message describing the cache issue
        message: String,
    },

    /// Singer not found error
    #[error("Singer '{singer_id}' not found")]
    SingerNotFound {
        /// The singer ID that was not found
        singer_id: String,
    },

    /// External tool error
    #[error("Tool error: {message}")]
    ToolError {
        /// Error message describing the tool issue
        message: String,
    },

    /// Filesystem watcher error
    #[error("Watcher error: {message}")]
    WatchError {
        /// Error message describing the watcher issue
        message: String,
    },

    /// Invalid input error
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Error message describing the invalid input
        message: String,
    },

    /// Thread or concurrency error
    #[error("Concurrency error: {message}")]
    ConcurrencyError {
        /// Error message describing the concurrency issue
        message: String,
    },
}

impl CadenzaError {
    /// Create a new discovery error
    #[must_use]
    pub fn discovery<S: Into<String>>(message: S) -> Self {
        Self::DiscoveryError {
            message: message.into(),
        }
    }

    /// Create a new parse error
    #[must_use]
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::ParseError {
            message: message.into(),
        }
    }

    /// Create a new file error
    #[must_use]
    pub fn file<S: Into<String>>(message: S) -> Self {
        Self::FileError {
            message: message.into(),
        }
    }

    /// Create a new cache error
    #[must_use]
    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::CacheError {
            message: message.into(),
        }
    }

    /// Create a new singer not found error
    #[must_use]
    pub fn singer_not_found<S: Into<String>>(singer_id: S) -> Self {
        Self::SingerNotFound {
            singer_id: singer_id.into(),
        }
    }

    /// Create a new tool error
    #[must_use]
    pub fn tool<S: Into<String>>(message: S) -> Self {
        Self::ToolError {
            message: message.into(),
        }
    }

    /// Create a new watcher error
    #[must_use]
    pub fn watch<S: Into<String>>(message: S) -> Self {
        Self::WatchError {
            message: message.into(),
        }
    }

    /// Create a new invalid input error
    #[must_use]
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a new concurrency error
    #[must_use]
    pub fn concurrency<S: Into<String>>(message: S) -> Self {
        Self::ConcurrencyError {
            message: message.into(),
        }
    }

    /// Check if this error is transient and worth retrying
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::FileError { .. }
                | Self::CacheError { .. }
                | Self::WatchError { .. }
                | Self::ConcurrencyError { .. }
        )
    }

    /// Check if this error is due to invalid user input
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::SingerNotFound { .. }
        )
    }

    /// Get the error category for logging/metrics
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::DiscoveryError { .. } => "discovery",
            Self::ParseError { .. } => "parse",
            Self::FileError { .. } => "file",
            Self::CacheError { .. } => "cache",
            Self::SingerNotFound { .. } => "singer",
            Self::ToolError { .. } => "tool",
            Self::WatchError { .. } => "watch",
            Self::InvalidInput { .. } => "input",
            Self::ConcurrencyError { .. } => "concurrency",
        }
    }
}

// Convert from common error types
impl From<std::io::Error> for CadenzaError {
    fn from(err: std::io::Error) -> Self {
        Self::file(err.to_string())
    }
}

impl From<serde_json::Error> for CadenzaError {
    fn from(err: serde_json::Error) -> Self {
        Self::cache(format!("descriptor serialization error: {err}"))
    }
}

impl From<notify::Error> for CadenzaError {
    fn from(err: notify::Error) -> Self {
        Self::watch(err.to_string())
    }
}

impl From<anyhow::Error> for CadenzaError {
    fn from(err: anyhow::Error) -> Self {
        Self::parse(err.to_string())
    }
}
