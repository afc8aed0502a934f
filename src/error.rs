//! Error taxonomy surfaced by the store and the coordinator.

use serde::Serialize;

use crate::model::ManualStep;

/// Result alias used across the library.
pub type Result<T, E = KbError> = std::result::Result<T, E>;

/// Failures of a knowledge-base operation.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// The referenced record does not exist.
    #[error("{entity} `{id}` not found")]
    NotFound {
        /// Entity label (`fund`, `manual step`, ...).
        entity: &'static str,
        /// Requested id.
        id: String,
    },

    /// A destructive operation is blocked by live dependents.
    #[error("fund `{}` is referenced by {} manual step(s)", .0.fund_abbr, .0.steps.len())]
    Conflict(DependentConflict),

    /// A required field is missing or malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A generated identifier collided with an existing row.
    #[error("duplicate {entity} id `{id}`")]
    DuplicateKey {
        /// Entity label.
        entity: &'static str,
        /// Colliding id.
        id: String,
    },

    /// Unexpected store or transport failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl KbError {
    /// Shorthand for [`KbError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        KbError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`KbError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        KbError::Validation(message.into())
    }

    /// Whether the error is a generated-id collision.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, KbError::DuplicateKey { .. })
    }
}

impl From<tokio_postgres::Error> for KbError {
    fn from(err: tokio_postgres::Error) -> Self {
        KbError::Internal(anyhow::Error::new(err))
    }
}

/// Preview payload returned when a fund still has dependents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependentConflict {
    /// Abbreviation of the fund that was asked to be deleted.
    pub fund_abbr: String,
    /// Every live dependent at the time of the check.
    pub steps: Vec<DependentStep>,
}

/// Summary of one dependent manual step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependentStep {
    /// Step id.
    pub chunk_id: i32,
    /// Guide title.
    pub document_title: Option<String>,
    /// Position inside the guide.
    pub step_number: Option<i32>,
    /// Step heading.
    pub topic: Option<String>,
    /// Raw reference list as stored.
    pub fund_abbr: Option<String>,
}

impl From<&ManualStep> for DependentStep {
    fn from(step: &ManualStep) -> Self {
        Self {
            chunk_id: step.chunk_id,
            document_title: step.document_title.clone(),
            step_number: step.step_number,
            topic: step.topic.clone(),
            fund_abbr: step.fund_abbr.clone(),
        }
    }
}
