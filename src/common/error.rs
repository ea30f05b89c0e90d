//! Error handling primitives shared across the core.
//!
//! Every failure that can surface to an operator carries the unit of work it
//! belongs to (model name, version, cluster count or batch window) so the
//! precise step can be retried on its own.

use thiserror::Error;

use crate::registry::domain::Stage;

/// Stable error codes, also used as the CLI exit status.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// Success code used as a sentinel.
    Ok = 0,
    /// Degenerate or unfit candidate.
    InvalidCandidate = 1,
    /// Selection over an empty set of runs.
    NoCandidates = 2,
    /// Lost a promotion race.
    ConcurrentPromotion = 3,
    /// Prediction returned the wrong number of labels.
    PredictionShapeMismatch = 4,
    /// Registry, prediction or notification endpoint failed.
    ExternalService = 5,
    /// Fallback write-back key matched more than one row.
    AmbiguousWriteBack = 6,
    /// Input failed validation.
    InvalidInput = 7,
    /// Requested entity does not exist.
    NotFound = 8,
    /// Storage, IO or serialisation failure.
    Internal = 9,
}

/// Canonical error type for the core.
#[derive(Error, Debug)]
pub enum PersonaError {
    #[error("invalid candidate for k={k}: {reason}")]
    InvalidCandidate { k: usize, reason: String },

    #[error("no candidate runs recorded for experiment '{experiment}'")]
    NoCandidates { experiment: String },

    #[error("concurrent promotion of {model_name} v{version}; retry once the other promotion finished")]
    ConcurrentPromotion { model_name: String, version: u32 },

    #[error("{model_name} v{version} cannot move from {from} to {to}")]
    InvalidTransition {
        model_name: String,
        version: u32,
        from: Stage,
        to: Stage,
    },

    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("prediction for window {window} returned {actual} labels for {expected} rows")]
    PredictionShapeMismatch {
        window: String,
        expected: usize,
        actual: usize,
    },

    #[error("{service} failed: {detail}")]
    ExternalService {
        service: &'static str,
        detail: String,
    },

    #[error("write-back key {key} in window {window} matches {matches} rows")]
    AmbiguousWriteBack {
        window: String,
        key: String,
        matches: usize,
    },

    #[error("write-back for window {window} stopped at {key} after {written} rows: {detail}")]
    WriteBack {
        window: String,
        key: String,
        written: usize,
        detail: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PersonaError>;

impl PersonaError {
    /// Validation helper.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Helper for failures of an external collaborator.
    pub fn external(service: &'static str, detail: impl ToString) -> Self {
        Self::ExternalService {
            service,
            detail: detail.to_string(),
        }
    }

    pub fn not_found(what: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            what,
            key: key.to_string(),
        }
    }

    /// Machine parsable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidCandidate { .. } => ErrorCode::InvalidCandidate,
            Self::NoCandidates { .. } => ErrorCode::NoCandidates,
            Self::ConcurrentPromotion { .. } => ErrorCode::ConcurrentPromotion,
            Self::InvalidTransition { .. }
            | Self::InvalidInput(_)
            | Self::Config(_)
            | Self::Csv(_) => ErrorCode::InvalidInput,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::PredictionShapeMismatch { .. } => ErrorCode::PredictionShapeMismatch,
            Self::ExternalService { .. } => ErrorCode::ExternalService,
            Self::AmbiguousWriteBack { .. } => ErrorCode::AmbiguousWriteBack,
            Self::WriteBack { .. } | Self::Storage(_) | Self::Io(_) | Self::Json(_) => {
                ErrorCode::Internal
            }
        }
    }
}
