use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error types for the flatgem library.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// IO error with context about the file path.
    #[error("IO error accessing '{path}': {message}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration: {message}")]
    Config {
        /// Detailed error message
        message: String,
    },

    /// No API key was supplied.
    #[error("No API key provided. Pass --api-key, set GEMINI_API_KEY or save one with `flatgem settings set-key`.")]
    MissingApiKey,

    /// The API rejected the key.
    #[error("Invalid API key: {message}")]
    InvalidApiKey {
        /// Message returned by the API
        message: String,
    },

    /// The API could not be reached.
    #[error("Could not connect to the API: {message}")]
    Network {
        /// Transport error message
        message: String,
    },

    /// The API answered but the request failed.
    #[error("API error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Api {
        /// HTTP status, when the failure came with one
        status: Option<u16>,
        /// Error message
        message: String,
    },

    /// Invalid UTF-8 encountered in file.
    #[error("Invalid UTF-8 encoding in file '{path}'. File may be binary or use unsupported encoding.")]
    InvalidUtf8 {
        /// Path to file with encoding issues
        path: PathBuf,
    },

    /// Settings file could not be located or written.
    #[error("Settings error: {message}")]
    Settings {
        /// Error message
        message: String,
    },

    /// The background worker could not start or died.
    #[error("Worker error: {message}")]
    Worker {
        /// Error message
        message: String,
    },

    /// JSON serialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// System time error.
    #[error("System time error: {message}")]
    SystemTime {
        /// Error message
        message: String,
    },
}

impl Error {
    /// Creates an IO error with path context.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: source.to_string(),
        }
    }

    /// Creates an IO error for a file read, mapping invalid data to [`Error::InvalidUtf8`].
    #[must_use]
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::InvalidData {
            Self::invalid_utf8(path)
        } else {
            Self::io(path, source)
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an API error.
    #[must_use]
    pub fn api(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Creates an invalid key error.
    #[must_use]
    pub fn invalid_api_key(message: impl Into<String>) -> Self {
        Self::InvalidApiKey {
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates an invalid UTF-8 error.
    #[must_use]
    pub fn invalid_utf8(path: impl Into<PathBuf>) -> Self {
        Self::InvalidUtf8 { path: path.into() }
    }

    /// Creates a settings error.
    #[must_use]
    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings {
            message: message.into(),
        }
    }

    /// Creates a worker error.
    #[must_use]
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Returns true if this is an IO error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::InvalidUtf8 { .. })
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true if the key is missing or was rejected.
    #[must_use]
    pub const fn is_credentials(&self) -> bool {
        matches!(self, Self::MissingApiKey | Self::InvalidApiKey { .. })
    }

    /// Returns true if the API could not be reached.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(e: std::time::SystemTimeError) -> Self {
        Self::SystemTime {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::api(e.status().map(|s| s.as_u16()), format!("malformed response: {e}"))
        } else if let Some(status) = e.status() {
            Self::api(Some(status.as_u16()), e.to_string())
        } else {
            Self::network(e.to_string())
        }
    }
}
