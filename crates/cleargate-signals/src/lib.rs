//! Cleargate Signals: signal, door and trigger orchestration.
//!
//! Signals are fired into a registry and fanned out to subscribers. Doors
//! combine the recent history of several signals through a boolean formula
//! and fire their own signal on each rising edge. Triggers turn cron ticks,
//! signals, door activations and stream items into bounded, queued
//! invocations of downstream workflows, signals and streams.
//!
//! The kernel owns no storage, workflow runtime or transport; those are
//! consumed through the traits in [`traits`], with in-memory defaults in
//! [`defaults`].
#[cfg(feature = "schemars")]
pub mod schema;

pub mod cancel;
pub mod config;
pub mod defaults;
pub mod doors;
pub mod engine;
pub mod errors;
pub mod formula;
pub mod relay_filter;
pub mod signals;
pub mod traits;
pub mod triggers;
pub mod types;
pub mod validate;

#[cfg(test)]
mod testing;

// Re-export public types at the crate level.

// cancel
pub use cancel::{Cancellation, CancellationSource};

// config
pub use config::EngineConfig;

// defaults
pub use defaults::{
    FileDefinitionProvider, InMemoryDefinitionProvider, InMemoryStateStore, InMemoryStreams,
    LoggingInvoker, ManualClock, MetricsObserver, MetricsSnapshot, TracingObservability,
};

// doors
pub use doors::{CompiledDoor, DoorHost, DoorOutcome, DOOR_ACTIVATION_TYPE};

// engine
pub use engine::{Engine, EngineBuilder, EngineError};

// errors
pub use errors::{
    DefinitionError, DoorError, ExpressionError, FormulaError, HandlerError, InvokeError,
    PayloadError, SignalError, StateError, StreamError, TriggerError,
};

// formula
pub use formula::CompiledFormula;

// relay_filter
pub use relay_filter::RelayFilter;

// signals
pub use signals::{DeliveryAck, DeliveryOutcome, FireReport, SignalRegistry, SubscriptionId};

// traits
pub use traits::{
    Clock, DefinitionChange, DefinitionProvider, DeliveryFault, FaultSite, InvocationContext,
    NoopObservability, ObservabilityProvider, OutputProvider, SignalHandler, StateStore,
    StreamProvider, StreamReceiver, SystemClock, TargetInvoker, Versioned,
};

// triggers
pub use triggers::{ActivationOrigin, ActivationReport, TriggerHost};

// types
pub use types::{
    DefinitionBundle, DefinitionId, DoorDefinition, DoorInput, DoorPhase, DoorState,
    OutputDefinition, OutputSource, Payload, Provenance, PullMode, RelayFilterDefinition,
    SignalDefinition, SignalMessage, TriggerDefinition, TriggerSourceDefinition, TriggerState,
    TriggerTarget, VariableValue,
};

// validate
pub use validate::validate_definitions;
