//! Persisted, serialized door evaluation.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::machine::{CompiledDoor, DoorTransition};
use crate::cancel::Cancellation;
use crate::errors::{DoorError, FormulaError, HandlerError, StateError};
use crate::signals::SignalRegistry;
use crate::traits::{Clock, ObservabilityProvider, SignalHandler, StateStore};
use crate::types::{DefinitionId, DoorState, Payload, Provenance, SignalMessage};

/// State store scope for door state, keyed by door id.
pub const DOOR_SCOPE: &str = "doors";

/// Payload type tag of the message a door fires when it activates.
pub const DOOR_ACTIVATION_TYPE: &str = "door.activation";

/// What happened to one door for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorOutcome {
    /// The door does not listen to the signal, or has nothing to re-evaluate.
    Ignored,
    Evaluated { result: bool, activated: bool },
}

struct DoorSlot {
    door: Arc<CompiledDoor>,
    lock: Mutex<()>,
}

/// Runs every door's state machine against the state store.
///
/// Events for the same door are processed one at a time; different doors
/// proceed independently. Each evaluation is a load, a pure transition and
/// a versioned save. A lost version race reloads and retries up to
/// `conflict_retries` times before the event fails with
/// [`DoorError::Conflict`].
pub struct DoorHost {
    doors: HashMap<DefinitionId, DoorSlot>,
    store: Arc<dyn StateStore>,
    registry: Weak<SignalRegistry>,
    observability: Arc<dyn ObservabilityProvider>,
    clock: Arc<dyn Clock>,
    conflict_retries: u32,
}

impl DoorHost {
    pub fn new(
        doors: Vec<CompiledDoor>,
        store: Arc<dyn StateStore>,
        registry: Weak<SignalRegistry>,
        observability: Arc<dyn ObservabilityProvider>,
        clock: Arc<dyn Clock>,
        conflict_retries: u32,
    ) -> Self {
        let doors = doors
            .into_iter()
            .map(|door| {
                (
                    door.id(),
                    DoorSlot {
                        door: Arc::new(door),
                        lock: Mutex::new(()),
                    },
                )
            })
            .collect();
        Self {
            doors,
            store,
            registry,
            observability,
            clock,
            conflict_retries,
        }
    }

    pub fn door(&self, door_id: DefinitionId) -> Option<&Arc<CompiledDoor>> {
        self.doors.get(&door_id).map(|slot| &slot.door)
    }

    pub fn doors(&self) -> impl Iterator<Item = &Arc<CompiledDoor>> {
        self.doors.values().map(|slot| &slot.door)
    }

    /// Apply a delivered signal to one door.
    pub async fn on_signal(
        &self,
        door_id: DefinitionId,
        message: &SignalMessage,
        cancel: &Cancellation,
    ) -> Result<DoorOutcome, DoorError> {
        let slot = self.slot(door_id)?;
        let transition = {
            let _guard = slot.lock.lock().await;
            self.commit(&slot.door, cancel, |state, now| {
                slot.door.on_signal(state, message, now)
            })
            .await?
        };
        match transition {
            Some(t) => Ok(self
                .finish(&slot.door, t, message.provenance.correlation_id)
                .await),
            None => Ok(DoorOutcome::Ignored),
        }
    }

    /// Re-run a door's evaluation, applying window decay, without a new event.
    pub async fn reevaluate(
        &self,
        door_id: DefinitionId,
        cancel: &Cancellation,
    ) -> Result<DoorOutcome, DoorError> {
        let slot = self.slot(door_id)?;
        let transition = {
            let _guard = slot.lock.lock().await;
            self.commit(&slot.door, cancel, |state, now| slot.door.reevaluate(state, now))
                .await?
        };
        match transition {
            Some(t) => Ok(self.finish(&slot.door, t, None).await),
            None => Ok(DoorOutcome::Ignored),
        }
    }

    /// Current persisted state, `None` before the first relevant event.
    pub async fn state(&self, door_id: DefinitionId) -> Result<Option<DoorState>, DoorError> {
        self.slot(door_id)?;
        Ok(self.load(door_id).await?.map(|(state, _)| state))
    }

    fn slot(&self, door_id: DefinitionId) -> Result<&DoorSlot, DoorError> {
        self.doors
            .get(&door_id)
            .ok_or(DoorError::UnknownDoor { id: door_id })
    }

    async fn load(&self, door_id: DefinitionId) -> Result<Option<(DoorState, u64)>, StateError> {
        let Some(stored) = self.store.load(DOOR_SCOPE, &door_id.to_string()).await? else {
            return Ok(None);
        };
        let state: DoorState =
            serde_json::from_value(stored.value).map_err(|e| StateError::Serialization {
                message: e.to_string(),
            })?;
        Ok(Some((state, stored.version)))
    }

    /// Load, transition and save under optimistic concurrency.
    async fn commit<F>(
        &self,
        door: &CompiledDoor,
        cancel: &Cancellation,
        step: F,
    ) -> Result<Option<DoorTransition>, DoorError>
    where
        F: Fn(Option<DoorState>, DateTime<Utc>) -> Result<Option<DoorTransition>, FormulaError>,
    {
        let id = door.id();
        let key = id.to_string();
        let mut retries = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(DoorError::Cancelled);
            }
            let (state, version) = match self.load(id).await? {
                Some((state, version)) => (Some(state), Some(version)),
                None => (None, None),
            };
            let Some(transition) = step(state, self.clock.now())
                .map_err(|source| DoorError::Formula { id, source })?
            else {
                return Ok(None);
            };
            if cancel.is_cancelled() {
                return Err(DoorError::Cancelled);
            }

            let value = serde_json::to_value(&transition.state).map_err(|e| {
                StateError::Serialization {
                    message: e.to_string(),
                }
            })?;
            match self.store.save(DOOR_SCOPE, &key, value, version).await {
                Ok(_) => {
                    if retries > 0 {
                        self.observability.record_conflict(DOOR_SCOPE, &key, true);
                    }
                    return Ok(Some(transition));
                }
                Err(StateError::Conflict { .. }) if retries < self.conflict_retries => {
                    retries += 1;
                    tracing::debug!(door_id = %id, retries, "door state version race, reloading");
                }
                Err(StateError::Conflict { .. }) => {
                    self.observability.record_conflict(DOOR_SCOPE, &key, false);
                    return Err(DoorError::Conflict {
                        id,
                        attempts: retries + 1,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Report the evaluation and fire the door's own signal on a rising edge.
    async fn finish(
        &self,
        door: &CompiledDoor,
        transition: DoorTransition,
        correlation_id: Option<Uuid>,
    ) -> DoorOutcome {
        let id = door.id();
        self.observability
            .record_door_evaluated(id, transition.result, transition.activated);
        tracing::debug!(
            door_id = %id,
            result = transition.result,
            activated = transition.activated,
            "door evaluated"
        );

        if transition.activated {
            self.fire_activation(door, &transition, correlation_id).await;
        }
        DoorOutcome::Evaluated {
            result: transition.result,
            activated: transition.activated,
        }
    }

    async fn fire_activation(
        &self,
        door: &CompiledDoor,
        transition: &DoorTransition,
        correlation_id: Option<Uuid>,
    ) {
        let Some(registry) = self.registry.upgrade() else {
            tracing::debug!(door_id = %door.id(), "registry dropped, activation not fired");
            return;
        };
        let payload = Payload::new(
            DOOR_ACTIVATION_TYPE,
            json!({
                "door_id": door.id(),
                "door_name": door.name(),
                "activation_count": transition.state.activation_count,
            }),
        );
        let provenance = Provenance {
            emitter: Some(format!("door:{}", door.name())),
            correlation_id,
            require_ack: false,
            caused_by: transition.responsible.clone(),
        };
        match registry.fire(door.id(), Some(payload), provenance).await {
            Ok(report) => tracing::info!(
                door_id = %door.id(),
                door = door.name(),
                message_id = %report.message.message_id,
                "door activated"
            ),
            Err(e) => tracing::warn!(door_id = %door.id(), error = %e, "door activation not fired"),
        }
    }
}

/// Feeds one door from the signal registry.
pub struct DoorSubscriber {
    host: Arc<DoorHost>,
    door_id: DefinitionId,
    name: String,
    observability: Arc<dyn ObservabilityProvider>,
}

impl DoorSubscriber {
    pub fn new(
        host: Arc<DoorHost>,
        door_id: DefinitionId,
        observability: Arc<dyn ObservabilityProvider>,
    ) -> Self {
        let name = match host.door(door_id) {
            Some(door) => format!("door:{}", door.name()),
            None => format!("door:{door_id}"),
        };
        Self {
            host,
            door_id,
            name,
            observability,
        }
    }
}

#[async_trait]
impl SignalHandler for DoorSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_signal(
        &self,
        message: Arc<SignalMessage>,
        cancel: Cancellation,
    ) -> Result<(), HandlerError> {
        match self.host.on_signal(self.door_id, &message, &cancel).await {
            Ok(_) => Ok(()),
            Err(DoorError::Cancelled) => Err(HandlerError::Cancelled),
            Err(e) => {
                self.observability
                    .record_activation_error(DOOR_SCOPE, self.door_id, &e.to_string());
                Err(e.into())
            }
        }
    }
}
