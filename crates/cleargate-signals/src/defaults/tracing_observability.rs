//! Observability provider that emits `tracing` events.

use crate::traits::{DeliveryFault, FaultSite, ObservabilityProvider};
use crate::types::{DefinitionId, SignalMessage};

/// Observability provider backed by the `tracing` crate.
///
/// Successful work is logged at `debug`, isolated faults at `warn`, and
/// failed activations at `error`. Install any `tracing` subscriber to
/// collect them.
pub struct TracingObservability;

impl TracingObservability {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TracingObservability {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservabilityProvider for TracingObservability {
    fn record_signal_fired(&self, message: &SignalMessage, subscribers: usize) {
        tracing::debug!(
            signal_id = %message.signal_id,
            signal = %message.signal_name,
            message_id = %message.message_id,
            subscribers,
            "signal fired"
        );
    }

    fn record_delivery_fault(&self, fault: &DeliveryFault) {
        match &fault.site {
            FaultSite::Subscriber {
                signal_id,
                subscriber,
            } => tracing::warn!(
                %signal_id,
                subscriber = %subscriber,
                message_id = %fault.cause_id,
                attempts = fault.attempts,
                error = %fault.error,
                "signal delivery fault"
            ),
            FaultSite::Target { trigger_id, target } => tracing::warn!(
                %trigger_id,
                target = %target,
                activation_id = %fault.cause_id,
                attempts = fault.attempts,
                error = %fault.error,
                "trigger target fault"
            ),
        }
    }

    fn record_door_evaluated(&self, door_id: DefinitionId, result: bool, activated: bool) {
        tracing::debug!(%door_id, result, activated, "door evaluated");
    }

    fn record_trigger_fired(&self, trigger_id: DefinitionId, values: usize, invocations: usize) {
        tracing::debug!(%trigger_id, values, invocations, "trigger fired");
    }

    fn record_capacity_exceeded(&self, trigger_id: DefinitionId, requested: usize) {
        tracing::warn!(%trigger_id, requested, "trigger dispatch queue saturated");
    }

    fn record_conflict(&self, scope: &str, key: &str, recovered: bool) {
        if recovered {
            tracing::debug!(scope, key, "state version conflict, retrying");
        } else {
            tracing::warn!(scope, key, "state version conflict persisted after retry");
        }
    }

    fn record_activation_error(&self, scope: &str, id: DefinitionId, error: &str) {
        tracing::error!(scope, %id, error, "activation failed");
    }
}
