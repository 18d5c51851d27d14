//! Trigger activation: output selection, state commit and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::dispatcher::{
    DispatchContext, InFlightRecorder, PendingItem, Reservation, TriggerDispatcher,
};
use super::output::{select, Selection};
use crate::cancel::Cancellation;
use crate::errors::{HandlerError, StateError, TriggerError};
use crate::traits::{Clock, ObservabilityProvider, OutputProvider, SignalHandler, StateStore};
use crate::types::{
    DefinitionId, OutputSource, PullMode, SignalMessage, TriggerDefinition, TriggerState,
};

/// State store scope for trigger state, keyed by trigger id.
pub const TRIGGER_SCOPE: &str = "triggers";

/// What caused an activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
#[non_exhaustive]
pub enum ActivationOrigin {
    Cron { tick: DateTime<Utc> },
    Signal { signal_id: DefinitionId, message_id: Uuid },
    Door { door_id: DefinitionId, message_id: Uuid },
    Stream { stream: String },
    Manual,
}

/// What to do when the dispatch queue has no room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backpressure {
    /// Fail with [`TriggerError::CapacityExceeded`].
    #[default]
    Reject,
    /// Wait for room before committing.
    Wait,
}

/// Input and provenance of one activation.
#[derive(Debug, Clone)]
pub struct ActivationContext {
    pub origin: ActivationOrigin,
    pub input: Value,
    pub correlation_id: Option<Uuid>,
    pub caused_by: Vec<Uuid>,
    pub backpressure: Backpressure,
}

impl ActivationContext {
    /// An operator-initiated activation.
    pub fn manual(input: Value) -> Self {
        Self {
            origin: ActivationOrigin::Manual,
            input,
            correlation_id: None,
            caused_by: Vec::new(),
            backpressure: Backpressure::Reject,
        }
    }

    /// Activation from a delivered signal or door message.
    pub fn from_message(origin: ActivationOrigin, message: &SignalMessage) -> Self {
        Self {
            origin,
            input: message
                .payload
                .as_ref()
                .map(|p| p.value().clone())
                .unwrap_or(Value::Null),
            correlation_id: message.provenance.correlation_id,
            caused_by: vec![message.message_id],
            backpressure: Backpressure::Reject,
        }
    }
}

/// Outcome of [`TriggerHost::activate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationReport {
    /// The trigger is disabled.
    Skipped { trigger_id: DefinitionId },
    Fired {
        trigger_id: DefinitionId,
        activation_id: Uuid,
        values: Vec<Value>,
        invocations: usize,
        fire_count: u64,
    },
}

impl ActivationReport {
    pub fn invocations(&self) -> usize {
        match self {
            Self::Skipped { .. } => 0,
            Self::Fired { invocations, .. } => *invocations,
        }
    }
}

struct TriggerSlot {
    definition: TriggerDefinition,
    lock: Arc<Mutex<()>>,
    dispatcher: TriggerDispatcher,
}

async fn load_state(
    store: &dyn StateStore,
    trigger_id: DefinitionId,
) -> Result<Option<(TriggerState, u64)>, StateError> {
    let Some(stored) = store.load(TRIGGER_SCOPE, &trigger_id.to_string()).await? else {
        return Ok(None);
    };
    let state: TriggerState =
        serde_json::from_value(stored.value).map_err(|e| StateError::Serialization {
            message: e.to_string(),
        })?;
    Ok(Some((state, stored.version)))
}

/// Writes a trigger's in-flight count back as its invocations finish.
struct StateRecorder {
    trigger_id: DefinitionId,
    store: Arc<dyn StateStore>,
    observability: Arc<dyn ObservabilityProvider>,
    conflict_retries: u32,
}

impl StateRecorder {
    async fn write(&self, in_flight: u64) -> Result<(), StateError> {
        let key = self.trigger_id.to_string();
        let mut retries = 0;
        loop {
            let Some((mut state, version)) = load_state(self.store.as_ref(), self.trigger_id).await?
            else {
                return Ok(());
            };
            if state.in_flight == in_flight {
                return Ok(());
            }
            state.in_flight = in_flight;
            let value = serde_json::to_value(&state).map_err(|e| StateError::Serialization {
                message: e.to_string(),
            })?;
            match self.store.save(TRIGGER_SCOPE, &key, value, Some(version)).await {
                Ok(_) => {
                    if retries > 0 {
                        self.observability.record_conflict(TRIGGER_SCOPE, &key, true);
                    }
                    return Ok(());
                }
                Err(StateError::Conflict { .. }) if retries < self.conflict_retries => {
                    retries += 1;
                }
                Err(e) => {
                    if matches!(e, StateError::Conflict { .. }) {
                        self.observability.record_conflict(TRIGGER_SCOPE, &key, false);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl InFlightRecorder for StateRecorder {
    async fn record_in_flight(&self, in_flight: u64) {
        if let Err(e) = self.write(in_flight).await {
            tracing::warn!(
                trigger_id = %self.trigger_id,
                in_flight,
                error = %e,
                "failed to persist trigger in-flight count"
            );
        }
    }
}

/// Owns every trigger's state machine and dispatcher.
///
/// An activation resolves the output collection, reserves dispatch slots,
/// then under the per-trigger lock loads the state, selects values,
/// commits the new cursor and counters with a versioned save and queues
/// one invocation per value per target. Nothing is queued unless the
/// commit succeeded.
pub struct TriggerHost {
    triggers: HashMap<DefinitionId, TriggerSlot>,
    store: Arc<dyn StateStore>,
    outputs: HashMap<String, Arc<dyn OutputProvider>>,
    observability: Arc<dyn ObservabilityProvider>,
    clock: Arc<dyn Clock>,
    conflict_retries: u32,
}

impl TriggerHost {
    /// Build the host and spawn a dispatcher per trigger. Must be called
    /// inside a tokio runtime.
    pub fn new(
        definitions: Vec<TriggerDefinition>,
        default_queue_capacity: usize,
        store: Arc<dyn StateStore>,
        outputs: HashMap<String, Arc<dyn OutputProvider>>,
        dispatch: DispatchContext,
        clock: Arc<dyn Clock>,
        conflict_retries: u32,
    ) -> Self {
        let observability = Arc::clone(&dispatch.observability);
        let triggers = definitions
            .into_iter()
            .map(|definition| {
                let capacity = definition.queue_capacity.unwrap_or(default_queue_capacity);
                let lock = Arc::new(Mutex::new(()));
                let recorder: Arc<dyn InFlightRecorder> = Arc::new(StateRecorder {
                    trigger_id: definition.id,
                    store: Arc::clone(&store),
                    observability: Arc::clone(&observability),
                    conflict_retries,
                });
                let dispatcher = TriggerDispatcher::spawn_recording(
                    &definition,
                    capacity,
                    dispatch.clone(),
                    Arc::clone(&lock),
                    Some(recorder),
                );
                (
                    definition.id,
                    TriggerSlot {
                        definition,
                        lock,
                        dispatcher,
                    },
                )
            })
            .collect();
        Self {
            triggers,
            store,
            outputs,
            observability,
            clock,
            conflict_retries,
        }
    }

    pub fn definition(&self, trigger_id: DefinitionId) -> Option<&TriggerDefinition> {
        self.triggers.get(&trigger_id).map(|slot| &slot.definition)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TriggerDefinition> {
        self.triggers.values().map(|slot| &slot.definition)
    }

    /// Clock used for fire timestamps and cron ticks.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Live count of invocations queued or running.
    pub fn in_flight(&self, trigger_id: DefinitionId) -> Result<u64, TriggerError> {
        Ok(self.slot(trigger_id)?.dispatcher.in_flight())
    }

    /// Persisted state with the live in-flight count.
    pub async fn state(&self, trigger_id: DefinitionId) -> Result<TriggerState, TriggerError> {
        let slot = self.slot(trigger_id)?;
        let mut state = self
            .load(trigger_id)
            .await?
            .map(|(state, _)| state)
            .unwrap_or_else(|| TriggerState::new(trigger_id));
        state.in_flight = slot.dispatcher.in_flight();
        Ok(state)
    }

    /// Wait for every dispatcher to go idle. Returns `false` on timeout.
    pub async fn drain(&self, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut drained = true;
        for slot in self.triggers.values() {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !slot.dispatcher.drain(left).await {
                tracing::warn!(
                    trigger_id = %slot.definition.id,
                    in_flight = slot.dispatcher.in_flight(),
                    "trigger still busy at shutdown"
                );
                drained = false;
            }
        }
        drained
    }

    fn slot(&self, trigger_id: DefinitionId) -> Result<&TriggerSlot, TriggerError> {
        self.triggers
            .get(&trigger_id)
            .ok_or(TriggerError::UnknownTrigger { id: trigger_id })
    }

    async fn load(
        &self,
        trigger_id: DefinitionId,
    ) -> Result<Option<(TriggerState, u64)>, StateError> {
        load_state(self.store.as_ref(), trigger_id).await
    }

    /// Resolve the collection to pick from. `None` passes the input through.
    async fn collection(
        &self,
        definition: &TriggerDefinition,
        input: &Value,
    ) -> Result<Option<(Vec<Value>, PullMode)>, TriggerError> {
        let Some(output) = &definition.output else {
            return Ok(None);
        };
        let values = match &output.source {
            OutputSource::Static { values } => values.clone(),
            OutputSource::Dynamic { provider } => {
                let provider = self.outputs.get(provider).ok_or_else(|| TriggerError::Config {
                    message: format!("output provider '{provider}' is not registered"),
                })?;
                provider.values(definition.id, input).await?
            }
        };
        Ok(Some((values, output.mode)))
    }

    /// Activate a trigger once.
    pub async fn activate(
        &self,
        trigger_id: DefinitionId,
        ctx: ActivationContext,
        cancel: &Cancellation,
    ) -> Result<ActivationReport, TriggerError> {
        let slot = self.slot(trigger_id)?;
        let definition = &slot.definition;
        if !definition.enabled {
            tracing::debug!(%trigger_id, "trigger disabled, activation skipped");
            return Ok(ActivationReport::Skipped { trigger_id });
        }
        if cancel.is_cancelled() {
            return Err(TriggerError::Cancelled);
        }

        let collection = self.collection(definition, &ctx.input).await?;
        let per_target = match &collection {
            None => 1,
            Some((values, PullMode::Broadcast)) => values.len(),
            Some((values, _)) => usize::from(!values.is_empty()),
        };
        let requested = per_target * definition.targets.len();

        let mut reservation = match ctx.backpressure {
            Backpressure::Wait => Some(slot.dispatcher.reserve(requested, cancel).await?),
            Backpressure::Reject => None,
        };

        let _guard = slot.lock.lock().await;
        let key = trigger_id.to_string();
        let mut retries = 0;
        let (selection, committed) = loop {
            if cancel.is_cancelled() {
                return Err(TriggerError::Cancelled);
            }
            let (state, version) = match self.load(trigger_id).await? {
                Some((state, version)) => (state, Some(version)),
                None => (TriggerState::new(trigger_id), None),
            };
            let selection = match &collection {
                None => Selection {
                    values: vec![ctx.input.clone()],
                    next_cursor: state.cursor,
                },
                Some((values, mode)) => select(*mode, values, state.cursor),
            };

            if reservation.is_none() {
                reservation = Some(self.try_reserve(slot, requested)?);
            }

            let mut next = state;
            next.cursor = selection.next_cursor;
            next.last_fired_at = Some(self.clock.now());
            next.fire_count += 1;
            next.in_flight = slot.dispatcher.in_flight() + requested as u64;

            if cancel.is_cancelled() {
                return Err(TriggerError::Cancelled);
            }
            let value = serde_json::to_value(&next).map_err(|e| StateError::Serialization {
                message: e.to_string(),
            })?;
            match self.store.save(TRIGGER_SCOPE, &key, value, version).await {
                Ok(_) => {
                    if retries > 0 {
                        self.observability.record_conflict(TRIGGER_SCOPE, &key, true);
                    }
                    break (selection, next);
                }
                Err(StateError::Conflict { .. }) if retries < self.conflict_retries => {
                    retries += 1;
                    tracing::debug!(%trigger_id, retries, "trigger state version race, reloading");
                }
                Err(StateError::Conflict { .. }) => {
                    self.observability.record_conflict(TRIGGER_SCOPE, &key, false);
                    return Err(TriggerError::Conflict {
                        id: trigger_id,
                        attempts: retries + 1,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };

        let activation_id = Uuid::new_v4();
        let items: Vec<PendingItem> = selection
            .values
            .iter()
            .flat_map(|value| {
                definition.targets.iter().map(|target| PendingItem {
                    activation_id,
                    value: value.clone(),
                    target: target.clone(),
                    correlation_id: ctx.correlation_id,
                    caused_by: ctx.caused_by.clone(),
                })
            })
            .collect();
        let invocations = items.len();
        let reservation = reservation.unwrap_or_else(Reservation::empty);
        // Queue while still holding the lock so commit order is dispatch order.
        slot.dispatcher.submit(reservation, items)?;
        drop(_guard);

        self.observability
            .record_trigger_fired(trigger_id, selection.values.len(), invocations);
        tracing::info!(
            %trigger_id,
            trigger = %definition.name,
            %activation_id,
            origin = ?ctx.origin,
            values = selection.values.len(),
            invocations,
            "trigger fired"
        );

        Ok(ActivationReport::Fired {
            trigger_id,
            activation_id,
            values: selection.values,
            invocations,
            fire_count: committed.fire_count,
        })
    }

    fn try_reserve(&self, slot: &TriggerSlot, requested: usize) -> Result<Reservation, TriggerError> {
        slot.dispatcher.try_reserve(requested).map_err(|e| {
            if matches!(e, TriggerError::CapacityExceeded { .. }) {
                self.observability
                    .record_capacity_exceeded(slot.definition.id, requested);
                tracing::warn!(
                    trigger_id = %slot.definition.id,
                    trigger = %slot.definition.name,
                    requested,
                    available = slot.dispatcher.available(),
                    "trigger dispatch queue full, activation rejected"
                );
            }
            e
        })
    }
}

/// Which kind of registry channel a [`TriggerSubscriber`] listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Signal,
    Door,
}

/// Activates a trigger from the signal registry.
///
/// A full dispatch queue drops the activation (already reported by the
/// host) instead of asking the registry to redeliver.
pub struct TriggerSubscriber {
    host: Arc<TriggerHost>,
    trigger_id: DefinitionId,
    kind: ChannelKind,
    name: String,
    observability: Arc<dyn ObservabilityProvider>,
}

impl TriggerSubscriber {
    pub fn new(
        host: Arc<TriggerHost>,
        trigger_id: DefinitionId,
        kind: ChannelKind,
        observability: Arc<dyn ObservabilityProvider>,
    ) -> Self {
        let name = match host.definition(trigger_id) {
            Some(def) => format!("trigger:{}", def.name),
            None => format!("trigger:{trigger_id}"),
        };
        Self {
            host,
            trigger_id,
            kind,
            name,
            observability,
        }
    }
}

#[async_trait]
impl SignalHandler for TriggerSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_signal(
        &self,
        message: Arc<SignalMessage>,
        cancel: Cancellation,
    ) -> Result<(), HandlerError> {
        let origin = match self.kind {
            ChannelKind::Signal => ActivationOrigin::Signal {
                signal_id: message.signal_id,
                message_id: message.message_id,
            },
            ChannelKind::Door => ActivationOrigin::Door {
                door_id: message.signal_id,
                message_id: message.message_id,
            },
        };
        let ctx = ActivationContext::from_message(origin, &message);
        match self.host.activate(self.trigger_id, ctx, &cancel).await {
            Ok(_) | Err(TriggerError::CapacityExceeded { .. }) => Ok(()),
            Err(TriggerError::Cancelled) => Err(HandlerError::Cancelled),
            Err(e) => {
                self.observability
                    .record_activation_error(TRIGGER_SCOPE, self.trigger_id, &e.to_string());
                Err(e.into())
            }
        }
    }
}
