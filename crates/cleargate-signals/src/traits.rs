//! Capabilities the kernel consumes, as async trait interfaces.
//!
//! Every external collaborator (state persistence, definition source,
//! workflow runtime, streams, telemetry, time) sits behind one of these
//! traits. In-memory defaults live in [`defaults`](crate::defaults).
//! Adding a method to any trait requires a default implementation to
//! preserve backward compatibility.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::errors::*;
use crate::types::{DefinitionBundle, DefinitionId, SignalMessage, TriggerTarget};

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// A stored value and the version it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Value,
    pub version: u64,
}

/// Versioned key-value persistence for door and trigger state.
///
/// Keys are `(scope, key)` pairs; the kernel uses the `doors` and
/// `triggers` scopes keyed by definition id. [`save()`](Self::save) is a
/// compare-and-swap: `expected_version` must equal the stored version
/// (`None` means "must not exist yet"), otherwise it fails with
/// [`StateError::Conflict`] and nothing is written.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, scope: &str, key: &str) -> Result<Option<Versioned>, StateError>;

    /// Write `value`, returning the new version.
    async fn save(
        &self,
        scope: &str,
        key: &str,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StateError>;

    /// Remove a key. Default: unsupported, does nothing.
    async fn remove(&self, _scope: &str, _key: &str) -> Result<(), StateError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DefinitionProvider
// ---------------------------------------------------------------------------

/// A change announced by a [`DefinitionProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DefinitionChange {
    Upserted { id: DefinitionId },
    Removed { id: DefinitionId },
    Reloaded,
}

/// Read-only source of signal, door and trigger definitions.
#[async_trait]
pub trait DefinitionProvider: Send + Sync {
    async fn load(&self) -> Result<DefinitionBundle, DefinitionError>;

    /// Change notifications. Default: the provider never changes.
    fn subscribe_changes(&self) -> Option<broadcast::Receiver<DefinitionChange>> {
        None
    }
}

// ---------------------------------------------------------------------------
// SignalHandler
// ---------------------------------------------------------------------------

/// A subscriber to a signal.
///
/// Handlers run on their own task per delivery. An `Err` (or a panic) is
/// retried up to the configured attempt count, then reported as a delivery
/// fault; it never affects other subscribers of the same message.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    /// Label used in logs, acknowledgements and fault reports.
    fn name(&self) -> &str;

    async fn on_signal(
        &self,
        message: Arc<SignalMessage>,
        cancel: Cancellation,
    ) -> Result<(), HandlerError>;
}

// ---------------------------------------------------------------------------
// TargetInvoker
// ---------------------------------------------------------------------------

/// Context handed to a workflow invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub trigger_id: DefinitionId,
    pub trigger_name: String,
    pub activation_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub cancel: Cancellation,
}

/// The runtime that executes workflows a trigger targets.
#[async_trait]
pub trait TargetInvoker: Send + Sync {
    async fn invoke(
        &self,
        workflow_id: &str,
        input: Value,
        ctx: InvocationContext,
    ) -> Result<Value, InvokeError>;

    /// Whether `workflow_id` can be invoked. Checked when triggers register.
    /// Default: every id is accepted.
    fn knows(&self, _workflow_id: &str) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// StreamProvider
// ---------------------------------------------------------------------------

/// Receiver end of a stream subscription.
pub struct StreamReceiver {
    pub rx: mpsc::Receiver<Value>,
}

/// Named item streams: stream triggers consume them, stream targets feed them.
#[async_trait]
pub trait StreamProvider: Send + Sync {
    /// Push one item. May wait while subscribers are saturated.
    async fn push(&self, stream: &str, item: Value) -> Result<(), StreamError>;

    async fn subscribe(&self, stream: &str) -> Result<StreamReceiver, StreamError>;
}

// ---------------------------------------------------------------------------
// OutputProvider
// ---------------------------------------------------------------------------

/// Produces a trigger's output collection at activation time.
#[async_trait]
pub trait OutputProvider: Send + Sync {
    /// The collection to pick from, given the activation's input.
    async fn values(&self, trigger_id: DefinitionId, input: &Value)
        -> Result<Vec<Value>, TriggerError>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock source for window and timestamp bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// ObservabilityProvider
// ---------------------------------------------------------------------------

/// Where an isolated fault happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
#[non_exhaustive]
pub enum FaultSite {
    /// A signal subscriber failed to process a message.
    Subscriber {
        signal_id: DefinitionId,
        subscriber: String,
    },
    /// A trigger target invocation failed or was abandoned.
    Target {
        trigger_id: DefinitionId,
        target: TriggerTarget,
    },
}

/// One isolated delivery or invocation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFault {
    pub site: FaultSite,
    /// Message or activation the fault belongs to.
    pub cause_id: Uuid,
    pub attempts: u32,
    pub error: String,
}

/// Where runtime telemetry goes.
///
/// A projection only: the kernel never reads anything back. Calls happen
/// inline on hot paths, so implementations must not block.
pub trait ObservabilityProvider: Send + Sync {
    fn record_signal_fired(&self, message: &SignalMessage, subscribers: usize);

    fn record_delivery_fault(&self, fault: &DeliveryFault);

    fn record_door_evaluated(&self, door_id: DefinitionId, result: bool, activated: bool);

    fn record_trigger_fired(&self, trigger_id: DefinitionId, values: usize, invocations: usize);

    fn record_capacity_exceeded(&self, trigger_id: DefinitionId, requested: usize);

    /// A version race on `scope/key`; `recovered` is false once retries ran out.
    fn record_conflict(&self, scope: &str, key: &str, recovered: bool);

    /// A single activation or evaluation failed outright.
    fn record_activation_error(&self, scope: &str, id: DefinitionId, error: &str);
}

/// An observability provider that discards everything.
pub struct NoopObservability;

impl ObservabilityProvider for NoopObservability {
    fn record_signal_fired(&self, _message: &SignalMessage, _subscribers: usize) {}
    fn record_delivery_fault(&self, _fault: &DeliveryFault) {}
    fn record_door_evaluated(&self, _door_id: DefinitionId, _result: bool, _activated: bool) {}
    fn record_trigger_fired(&self, _id: DefinitionId, _values: usize, _invocations: usize) {}
    fn record_capacity_exceeded(&self, _trigger_id: DefinitionId, _requested: usize) {}
    fn record_conflict(&self, _scope: &str, _key: &str, _recovered: bool) {}
    fn record_activation_error(&self, _scope: &str, _id: DefinitionId, _error: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provenance;

    #[test]
    fn noop_observability_works() {
        let noop = NoopObservability;
        let id = DefinitionId::new();
        let message = SignalMessage {
            message_id: Uuid::new_v4(),
            signal_id: id,
            signal_name: "test".into(),
            emitted_at: Utc::now(),
            payload: None,
            provenance: Provenance::default(),
        };
        noop.record_signal_fired(&message, 2);
        noop.record_delivery_fault(&DeliveryFault {
            site: FaultSite::Subscriber {
                signal_id: id,
                subscriber: "door".into(),
            },
            cause_id: message.message_id,
            attempts: 3,
            error: "boom".into(),
        });
        noop.record_door_evaluated(id, true, true);
        noop.record_trigger_fired(id, 1, 2);
        noop.record_capacity_exceeded(id, 4);
        noop.record_conflict("doors", "x", true);
        noop.record_activation_error("triggers", id, "bad");
    }

    #[test]
    fn fault_site_is_tagged() {
        let site = FaultSite::Target {
            trigger_id: DefinitionId::new(),
            target: TriggerTarget::Workflow { id: "wf".into() },
        };
        let json = serde_json::to_value(&site).expect("serializes");
        assert_eq!(json["kind"], "target");
        assert_eq!(json["target"]["kind"], "workflow");
    }
}
