//! Error types for configuration resolution

use thiserror::Error;

/// Errors raised while reading documents or building a step configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse {document}: {message}")]
    Parse { document: String, message: String },

    #[error("Failed to read {document}: {source}")]
    Io {
        document: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Type error for '{key}': expected {expected}, found {found}")]
    Type {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Interpolation of '{key}' did not finish after {passes} passes")]
    InterpolationCycle { key: String, passes: usize },
}

impl ConfigError {
    pub(crate) fn parse(document: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ConfigError::Parse {
            document: document.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn io(document: impl Into<String>, source: std::io::Error) -> Self {
        ConfigError::Io {
            document: document.into(),
            source,
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
