//! Shared error definitions for tether components.

/// The result type used throughout tether-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier failed to parse or validate.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of the failure.
        message: String,
    },

    /// A configuration value was malformed or out of range.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid-identifier error.
    #[must_use]
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
