//! Error taxonomy shared by every component.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Invalid parameters supplied by the caller. Raised before any work starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Not enough periods or points for the requested computation.
    #[error("Insufficient data for {what}: need {required}, have {available}")]
    InsufficientData {
        what: String,
        required: usize,
        available: usize,
    },

    /// Predictions or prices missing/misaligned for a timestamp or instrument.
    #[error("Alignment error: {0}")]
    Alignment(String),

    /// An external collaborator (trainer, model) failed after all retries.
    #[error("External call failed: {0}")]
    External(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn alignment(msg: impl Into<String>) -> Self {
        Self::Alignment(msg.into())
    }

    pub fn insufficient(what: impl Into<String>, required: usize, available: usize) -> Self {
        Self::InsufficientData {
            what: what.into(),
            required,
            available,
        }
    }

    /// Short machine-friendly kind, used in failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::Alignment(_) => "alignment",
            Self::External(_) => "external",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
