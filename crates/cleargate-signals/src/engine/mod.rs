//! Engine builder and runtime: the single entry point for the signal kernel.
//!
//! The [`Engine`] wires the signal registry, the door host and the trigger
//! host together. Doors subscribe to their input signals, triggers
//! subscribe to their source signals and doors, and cron and stream
//! triggers run as background sources once the engine is started.
//! Construct via [`Engine::builder()`].
//!
//! ```rust,ignore
//! let orders = SignalDefinition::new("order.placed");
//! let paid = SignalDefinition::new("payment.settled");
//! let ready = DoorDefinition { /* ORDER & PAID */ };
//!
//! let engine = Engine::builder()
//!     .signal(orders.clone())
//!     .signal(paid.clone())
//!     .door(ready.clone())
//!     .trigger(
//!         TriggerDefinition::new("ship", TriggerSourceDefinition::Doors { ids: vec![ready.id] })
//!             .with_target(TriggerTarget::Workflow { id: "ship-order".into() }),
//!     )
//!     .invoker(Arc::new(MyWorkflowRuntime::new()))
//!     .build()
//!     .await?;
//! engine.start().await;
//!
//! engine.fire_signal(orders.id, Some(Payload::json(json!({"order": 7})))).await?;
//! ```

mod builder;
pub mod error;

pub use builder::EngineBuilder;
pub use error::EngineError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cancel::CancellationSource;
use crate::config::EngineConfig;
use crate::doors::{DoorHost, DoorOutcome};
use crate::signals::{FireReport, SignalRegistry, SubscriptionId};
use crate::traits::{ObservabilityProvider, SignalHandler, StreamProvider};
use crate::triggers::{ActivationContext, ActivationReport, TriggerHost, TriggerRunner};
use crate::types::{DefinitionId, DoorState, Payload, Provenance, TriggerState};

/// The assembled signal, door and trigger runtime.
///
/// Registries are frozen at build time. Signal-driven doors and triggers
/// react as soon as the engine is built; cron and stream sources wait for
/// [`start()`](Engine::start).
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) registry: Arc<SignalRegistry>,
    pub(super) door_host: Arc<DoorHost>,
    pub(super) trigger_host: Arc<TriggerHost>,
    pub(super) streams: Arc<dyn StreamProvider>,
    pub(super) observability: Arc<dyn ObservabilityProvider>,
    pub(super) runner: TriggerRunner,
    pub(super) cancel_source: CancellationSource,
    /// Activation sources and the definition watcher (for shutdown).
    pub(super) handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    pub(super) started: AtomicBool,
}

impl Engine {
    /// Create a new [`EngineBuilder`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Start cron and stream activation sources.
    ///
    /// This is a no-op if already started or after shutdown.
    pub async fn start(&self) {
        if self.cancel_source.is_cancelled() || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles = self.runner.start();
        tracing::info!(sources = handles.len(), "engine started");
        self.handles.lock().await.extend(handles);
    }

    /// Fire a signal and return the message id once it is queued for every
    /// subscriber.
    pub async fn fire_signal(
        &self,
        signal_id: DefinitionId,
        payload: Option<Payload>,
    ) -> Result<Uuid, EngineError> {
        let report = self
            .registry
            .fire(signal_id, payload, Provenance::default())
            .await?;
        Ok(report.message.message_id)
    }

    /// Fire a signal with explicit provenance. With
    /// [`Provenance::require_ack`] set, the report carries one
    /// acknowledgement per subscriber.
    pub async fn fire_signal_with(
        &self,
        signal_id: DefinitionId,
        payload: Option<Payload>,
        provenance: Provenance,
    ) -> Result<FireReport, EngineError> {
        Ok(self.registry.fire(signal_id, payload, provenance).await?)
    }

    /// Fire a signal by `namespace/name`, or by bare name when unambiguous.
    pub async fn fire_signal_by_name(
        &self,
        name: &str,
        payload: Option<Payload>,
    ) -> Result<Uuid, EngineError> {
        let report = self
            .registry
            .fire_by_name(name, payload, Provenance::default())
            .await?;
        Ok(report.message.message_id)
    }

    /// Activate a trigger by hand with `input` as the activation value.
    ///
    /// Fails with [`TriggerError::CapacityExceeded`](crate::errors::TriggerError::CapacityExceeded)
    /// instead of waiting when the trigger's queue has no room.
    pub async fn activate_trigger(
        &self,
        trigger_id: DefinitionId,
        input: Value,
    ) -> Result<ActivationReport, EngineError> {
        let cancel = self.cancel_source.token();
        Ok(self
            .trigger_host
            .activate(trigger_id, ActivationContext::manual(input), &cancel)
            .await?)
    }

    /// Re-run a door's evaluation without a new signal, applying window decay.
    pub async fn reevaluate_door(&self, door_id: DefinitionId) -> Result<DoorOutcome, EngineError> {
        let cancel = self.cancel_source.token();
        Ok(self.door_host.reevaluate(door_id, &cancel).await?)
    }

    /// Persisted door state, `None` before the door saw a relevant signal.
    pub async fn door_state(&self, door_id: DefinitionId) -> Result<Option<DoorState>, EngineError> {
        Ok(self.door_host.state(door_id).await?)
    }

    /// Persisted trigger state with the live in-flight count.
    pub async fn trigger_state(&self, trigger_id: DefinitionId) -> Result<TriggerState, EngineError> {
        Ok(self.trigger_host.state(trigger_id).await?)
    }

    /// Invocations of a trigger queued or running right now.
    pub fn in_flight(&self, trigger_id: DefinitionId) -> Result<u64, EngineError> {
        Ok(self.trigger_host.in_flight(trigger_id)?)
    }

    /// Attach an external subscriber to a signal or door channel.
    pub fn subscribe(
        &self,
        signal_id: DefinitionId,
        handler: Arc<dyn SignalHandler>,
    ) -> Result<SubscriptionId, EngineError> {
        Ok(self.registry.subscribe(signal_id, handler)?)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.registry.unsubscribe(subscription)
    }

    pub fn registry(&self) -> &Arc<SignalRegistry> {
        &self.registry
    }

    pub fn streams(&self) -> &Arc<dyn StreamProvider> {
        &self.streams
    }

    pub fn observability(&self) -> &Arc<dyn ObservabilityProvider> {
        &self.observability
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Gracefully shut down the engine.
    ///
    /// Stops activation sources, stops accepting fires, lets subscriber
    /// workers finish what they hold and waits up to
    /// [`EngineConfig::drain_timeout_ms`] for in-flight invocations.
    /// Invocations still queued when cancellation lands are abandoned and
    /// reported as target faults.
    pub async fn shutdown(&self) {
        self.cancel_source.cancel();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        TriggerRunner::shutdown(handles).await;

        let timeout = self.config.drain_timeout();
        self.registry.close(timeout).await;
        if !self.trigger_host.drain(timeout).await {
            tracing::warn!(?timeout, "shutdown: invocations still running after drain timeout");
        }
        tracing::info!("engine shut down");
    }
}
