//! Error kinds the engine and its callers branch on.
//!
//! Everything else travels as `anyhow::Error`. These variants are wrapped with
//! `anyhow::Context` on the way up, so `downcast_ref::<ChainError>()` keeps
//! working at any depth.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to call agent chain: max retries reached, {attempts}: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: String },

    #[error("agent chain returned no choices")]
    EmptyResponse,

    #[error("reflector limit calls reached ({0})")]
    ReflectorLimit(usize),

    #[error("reached max retries to call tool '{name}': {last_error}")]
    ToolRetriesExhausted { name: String, last_error: String },

    #[error("agent chain exceeded {0} iterations")]
    IterationLimit(usize),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("invalid subtask patch operation {index}: {reason}")]
    InvalidPatch { index: usize, reason: String },

    #[error("chain serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
}

impl ChainError {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        Self::NotFound { kind, id }
    }

    pub fn invalid_patch(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidPatch {
            index,
            reason: reason.into(),
        }
    }
}

/// True when the error (or anything it wraps) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ChainError>(), Some(ChainError::Cancelled))
        || err
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<ChainError>(), Some(ChainError::Cancelled)))
}

/// True for failures that must end the enclosing flow rather than be reported
/// back to the model as a failed step.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    if is_cancelled(err) {
        return true;
    }
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<ChainError>(), Some(ChainError::Serialization(_)))
            || cause.downcast_ref::<rusqlite::Error>().is_some()
    })
}
