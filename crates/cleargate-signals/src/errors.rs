//! Error types for every kernel operation.
//!
//! One enum per concern. Faults that are isolated per subscriber or per
//! target never surface through these enums to sibling work; they are
//! reported through [`ObservabilityProvider`](crate::traits::ObservabilityProvider).

use thiserror::Error;

use crate::types::DefinitionId;

/// Errors from [`CompiledFormula`](crate::formula::CompiledFormula) compilation
/// and evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,
    #[error("unexpected character '{found}' at position {position}")]
    InvalidCharacter { position: usize, found: char },
    #[error("formula references undeclared variable '{name}'")]
    UnknownVariable { name: String },
    #[error("variable '{name}' is declared more than once")]
    DuplicateVariable { name: String },
    #[error("'{name}' is not a valid variable name")]
    InvalidVariableName { name: String },
    #[error("unbalanced parentheses at position {position}")]
    UnbalancedParentheses { position: usize },
    #[error("unexpected '{found}' at position {position}")]
    UnexpectedToken { position: usize, found: String },
    #[error("formula ends unexpectedly")]
    UnexpectedEnd,
    #[error("formula nesting exceeds {limit} levels")]
    NestingTooDeep { limit: usize },
    #[error("expected {expected} values, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
}

/// Errors from relay-filter condition parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ExpressionError {
    #[error("parse error: {message}")]
    Parse { message: String },
}

/// Errors from typed [`Payload`](crate::types::Payload) accessors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PayloadError {
    #[error("payload type mismatch: expected '{expected}', found '{actual}'")]
    TypeMismatch { expected: String, actual: String },
    #[error("payload encode error: {message}")]
    Encode { message: String },
    #[error("payload decode error: {message}")]
    Decode { message: String },
}

/// Errors from [`StateStore`](crate::traits::StateStore).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    #[error("version conflict on {scope}/{key}: expected {expected:?}, found {actual:?}")]
    Conflict {
        scope: String,
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    #[error("state store error: {message}")]
    Store { message: String },
    #[error("state serialization error: {message}")]
    Serialization { message: String },
}

/// Registration-time rejection of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DefinitionError {
    #[error("definition {id} is registered more than once")]
    DuplicateId { id: DefinitionId },
    #[error("door {id}: {source}")]
    Formula {
        id: DefinitionId,
        #[source]
        source: FormulaError,
    },
    #[error("door {id}: relay filter on '{variable}': {source}")]
    RelayFilter {
        id: DefinitionId,
        variable: String,
        #[source]
        source: ExpressionError,
    },
    #[error("{id} references unknown {kind} '{reference}'")]
    UnknownReference {
        id: DefinitionId,
        kind: &'static str,
        reference: String,
    },
    #[error("trigger {id}: invalid cron expression '{expression}': {message}")]
    InvalidCron {
        id: DefinitionId,
        expression: String,
        message: String,
    },
    #[error("doors form a listening cycle through {id}")]
    Cycle { id: DefinitionId },
    #[error("{id}: {message}")]
    Invalid { id: DefinitionId, message: String },
    #[error("definition provider error: {message}")]
    Provider { message: String },
}

impl DefinitionError {
    /// Id of the rejected definition, when there is one.
    pub fn definition_id(&self) -> Option<DefinitionId> {
        match self {
            Self::DuplicateId { id }
            | Self::Formula { id, .. }
            | Self::RelayFilter { id, .. }
            | Self::UnknownReference { id, .. }
            | Self::InvalidCron { id, .. }
            | Self::Cycle { id }
            | Self::Invalid { id, .. } => Some(*id),
            Self::Provider { .. } => None,
        }
    }
}

/// Errors from the [`SignalRegistry`](crate::signals::SignalRegistry).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignalError {
    #[error("unknown signal: {reference}")]
    UnknownSignal { reference: String },
    #[error("signal {id} is already registered")]
    AlreadyRegistered { id: DefinitionId },
    #[error("signal registry is closed")]
    Closed,
}

/// Failure reported by a [`SignalHandler`](crate::traits::SignalHandler).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum HandlerError {
    #[error("handler failed: {message}")]
    Failed { message: String },
    #[error("handler cancelled")]
    Cancelled,
}

/// Failure reported by a [`TargetInvoker`](crate::traits::TargetInvoker).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum InvokeError {
    #[error("target not found: {target}")]
    NotFound { target: String },
    #[error("invocation failed: {message}")]
    Failed { message: String },
    #[error("invocation cancelled")]
    Cancelled,
}

/// Errors from [`StreamProvider`](crate::traits::StreamProvider).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StreamError {
    #[error("stream error: {message}")]
    Stream { message: String },
}

/// Errors from a single door evaluation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DoorError {
    #[error("unknown door: {id}")]
    UnknownDoor { id: DefinitionId },
    #[error("door {id} evaluation failed: {source}")]
    Formula {
        id: DefinitionId,
        #[source]
        source: FormulaError,
    },
    #[error("door state error: {0}")]
    State(#[from] StateError),
    #[error("door {id} lost {attempts} consecutive version races")]
    Conflict { id: DefinitionId, attempts: u32 },
    #[error("door evaluation cancelled before commit")]
    Cancelled,
}

/// Errors from trigger activation and its sources.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TriggerError {
    #[error("unknown trigger: {id}")]
    UnknownTrigger { id: DefinitionId },
    #[error("trigger {id} dispatch queue is full ({requested} items requested, {available} free)")]
    CapacityExceeded {
        id: DefinitionId,
        requested: usize,
        available: usize,
    },
    #[error("trigger {id} lost {attempts} consecutive version races")]
    Conflict { id: DefinitionId, attempts: u32 },
    #[error("trigger state error: {0}")]
    State(#[from] StateError),
    #[error("trigger config error: {message}")]
    Config { message: String },
    #[error("trigger runtime error: {message}")]
    Runtime { message: String },
    #[error("trigger activation cancelled before commit")]
    Cancelled,
}

impl From<DoorError> for HandlerError {
    fn from(err: DoorError) -> Self {
        match err {
            DoorError::Cancelled => Self::Cancelled,
            other => Self::Failed {
                message: other.to_string(),
            },
        }
    }
}

impl From<TriggerError> for HandlerError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::Cancelled => Self::Cancelled,
            other => Self::Failed {
                message: other.to_string(),
            },
        }
    }
}
