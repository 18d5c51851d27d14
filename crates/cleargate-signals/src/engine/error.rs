use thiserror::Error;

use crate::errors::{DefinitionError, DoorError, SignalError, StateError, TriggerError};

/// Errors from engine construction and the engine's public surface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The definition bundle was rejected. Carries every problem found.
    #[error("{} invalid definition(s): {}", .errors.len(), join(.errors))]
    Invalid { errors: Vec<DefinitionError> },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Door(#[from] DoorError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("build error: {message}")]
    Build { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },
}

impl From<Vec<DefinitionError>> for EngineError {
    fn from(errors: Vec<DefinitionError>) -> Self {
        Self::Invalid { errors }
    }
}

fn join(errors: &[DefinitionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
