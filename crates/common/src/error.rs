//! Error types shared across Framestamp crates.

use std::path::PathBuf;

/// Top-level error type for Framestamp operations.
///
/// The first four variants form the export taxonomy reported through
/// export completion: caller misuse, engine construction failure,
/// failure while samples were flowing, and deliberate cancellation.
#[derive(Debug, thiserror::Error)]
pub enum FramestampError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Open failure: {message}")]
    OpenFailure { message: String },

    #[error("Pump failure: {message}")]
    PumpFailure { message: String },

    #[error("Export cancelled")]
    Cancelled,

    #[error("Media engine error: {message}")]
    Engine { message: String },

    #[error("Playback error: {message}")]
    Playback { message: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using FramestampError.
pub type FramestampResult<T> = Result<T, FramestampError>;

/// Coarse classification of a [`FramestampError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Caller misuse, detected before any engine resource exists.
    Configuration,
    /// Reader or writer could not be constructed.
    Open,
    /// A pull or push failed while reading/writing was active.
    Pump,
    /// Explicit cancellation. Not a defect.
    Cancelled,
    /// Anything else (I/O, parsing, engine internals).
    Runtime,
}

impl FramestampError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    pub fn open_failure(msg: impl Into<String>) -> Self {
        Self::OpenFailure {
            message: msg.into(),
        }
    }

    pub fn pump_failure(msg: impl Into<String>) -> Self {
        Self::PumpFailure {
            message: msg.into(),
        }
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine {
            message: msg.into(),
        }
    }

    pub fn playback(msg: impl Into<String>) -> Self {
        Self::Playback {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    /// Which part of the taxonomy this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } | Self::FileNotFound { .. } => ErrorCategory::Configuration,
            Self::OpenFailure { .. } => ErrorCategory::Open,
            Self::PumpFailure { .. } => ErrorCategory::Pump,
            Self::Cancelled => ErrorCategory::Cancelled,
            _ => ErrorCategory::Runtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            FramestampError::configuration("no output").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            FramestampError::open_failure("denied").category(),
            ErrorCategory::Open
        );
        assert_eq!(
            FramestampError::pump_failure("disk full").category(),
            ErrorCategory::Pump
        );
        assert_eq!(FramestampError::Cancelled.category(), ErrorCategory::Cancelled);

        let io = FramestampError::from(std::io::Error::other("boom"));
        assert_eq!(io.category(), ErrorCategory::Runtime);
    }

    #[test]
    fn test_display_includes_message() {
        let err = FramestampError::pump_failure("append rejected");
        assert_eq!(err.to_string(), "Pump failure: append rejected");
    }
}
