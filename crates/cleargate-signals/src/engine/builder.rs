//! Engine builder: validates definitions and wires the registry, door host
//! and trigger host into a running [`Engine`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::error::EngineError;
use super::Engine;
use crate::cancel::{Cancellation, CancellationSource};
use crate::config::EngineConfig;
use crate::defaults::{InMemoryStateStore, InMemoryStreams, LoggingInvoker};
use crate::doors::{DoorHost, DoorSubscriber, DOOR_SCOPE};
use crate::signals::{DeliveryConfig, SignalRegistry};
use crate::traits::{
    Clock, DefinitionChange, DefinitionProvider, NoopObservability, ObservabilityProvider,
    OutputProvider, StateStore, StreamProvider, SystemClock, TargetInvoker,
};
use crate::triggers::{
    ActivationSource, ChannelKind, CronSource, DispatchContext, StreamSource, TriggerHost,
    TriggerRunner, TriggerSubscriber,
};
use crate::types::{
    DefinitionBundle, DefinitionId, DoorDefinition, SignalDefinition, TriggerDefinition,
    TriggerSourceDefinition,
};
use crate::validate::validate_definitions;

/// Builder for assembling the [`Engine`].
///
/// All provider fields are optional; in-memory or no-op defaults are
/// applied during [`build()`](EngineBuilder::build). Definitions added
/// directly are merged with whatever the definition provider loads, and
/// the whole bundle is validated before anything is registered.
pub struct EngineBuilder {
    bundle: DefinitionBundle,
    definitions: Option<Arc<dyn DefinitionProvider>>,
    state: Option<Arc<dyn StateStore>>,
    invoker: Option<Arc<dyn TargetInvoker>>,
    streams: Option<Arc<dyn StreamProvider>>,
    observability: Option<Arc<dyn ObservabilityProvider>>,
    clock: Option<Arc<dyn Clock>>,
    outputs: HashMap<String, Arc<dyn OutputProvider>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub(super) fn new() -> Self {
        Self {
            bundle: DefinitionBundle::default(),
            definitions: None,
            state: None,
            invoker: None,
            streams: None,
            observability: None,
            clock: None,
            outputs: HashMap::new(),
            config: EngineConfig::default(),
        }
    }

    /// Register a signal definition.
    pub fn signal(mut self, definition: SignalDefinition) -> Self {
        self.bundle.signals.push(definition);
        self
    }

    /// Register a door definition.
    pub fn door(mut self, definition: DoorDefinition) -> Self {
        self.bundle.doors.push(definition);
        self
    }

    /// Register a trigger definition.
    pub fn trigger(mut self, definition: TriggerDefinition) -> Self {
        self.bundle.triggers.push(definition);
        self
    }

    /// Load definitions from a provider at build time. Its change
    /// notifications are logged while the engine runs.
    pub fn definitions(mut self, provider: Arc<dyn DefinitionProvider>) -> Self {
        self.definitions = Some(provider);
        self
    }

    /// Set the state store. Default: [`InMemoryStateStore`].
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state = Some(store);
        self
    }

    /// Set the workflow runtime. Default: [`LoggingInvoker`].
    pub fn invoker(mut self, invoker: Arc<dyn TargetInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Set the stream provider. Default: [`InMemoryStreams`] sized by
    /// [`EngineConfig::stream_buffer`].
    pub fn streams(mut self, streams: Arc<dyn StreamProvider>) -> Self {
        self.streams = Some(streams);
        self
    }

    /// Set the observability provider. Default: [`NoopObservability`].
    pub fn observability(mut self, observability: Arc<dyn ObservabilityProvider>) -> Self {
        self.observability = Some(observability);
        self
    }

    /// Set the clock used for windows and timestamps. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register a dynamic output provider under `name`.
    pub fn output_provider(mut self, name: &str, provider: Arc<dyn OutputProvider>) -> Self {
        self.outputs.insert(name.to_string(), provider);
        self
    }

    /// Set engine configuration. Default: [`EngineConfig::default()`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the engine. Must be called inside a tokio runtime.
    ///
    /// Fails with [`EngineError::Invalid`] listing every rejected
    /// definition. Cron and stream sources are not started until
    /// [`Engine::start`].
    pub async fn build(mut self) -> Result<Engine, EngineError> {
        // 1. Apply defaults for unset providers.
        let config = self.config;
        let state: Arc<dyn StateStore> = self
            .state
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()));
        let invoker: Arc<dyn TargetInvoker> =
            self.invoker.unwrap_or_else(|| Arc::new(LoggingInvoker));
        let streams: Arc<dyn StreamProvider> = self
            .streams
            .unwrap_or_else(|| Arc::new(InMemoryStreams::with_capacity(config.stream_buffer)));
        let observability: Arc<dyn ObservabilityProvider> = self
            .observability
            .unwrap_or_else(|| Arc::new(NoopObservability));
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        // 2. Merge provider definitions.
        let mut changes = None;
        if let Some(provider) = &self.definitions {
            let loaded = provider.load().await?;
            tracing::debug!(
                signals = loaded.signals.len(),
                doors = loaded.doors.len(),
                triggers = loaded.triggers.len(),
                "loaded definitions from provider"
            );
            self.bundle.merge(loaded);
            changes = provider.subscribe_changes();
        }
        let bundle = self.bundle;

        // 3. Validate everything before registering anything.
        let provider_names: HashSet<String> = self.outputs.keys().cloned().collect();
        let doors = validate_definitions(&bundle, invoker.as_ref(), &provider_names)?;

        // 4. Register signals, and one channel per door.
        let cancel_source = CancellationSource::new();
        let cancel = cancel_source.token();
        let mut registry = SignalRegistry::new(
            DeliveryConfig::from(&config),
            Arc::clone(&observability),
            Arc::clone(&clock),
            cancel.clone(),
        );
        for signal in bundle.signals {
            registry.register(signal)?;
        }
        for door in &doors {
            registry.register(SignalDefinition {
                id: door.id(),
                name: door.name().to_string(),
                namespace: Some(DOOR_SCOPE.to_string()),
            })?;
        }
        let registry = Arc::new(registry);

        // 5. Door host, fed by a subscription per door input source.
        let door_host = Arc::new(DoorHost::new(
            doors,
            Arc::clone(&state),
            Arc::downgrade(&registry),
            Arc::clone(&observability),
            Arc::clone(&clock),
            config.conflict_retries,
        ));
        let door_feeds: Vec<_> = door_host
            .doors()
            .flat_map(|door| door.sources().map(move |source| (door.id(), source)))
            .collect();
        for (door_id, source) in door_feeds {
            let subscriber =
                DoorSubscriber::new(Arc::clone(&door_host), door_id, Arc::clone(&observability));
            registry.subscribe(source, Arc::new(subscriber))?;
        }

        // 6. Trigger host and its registry-driven subscriptions.
        let triggers = bundle.triggers;
        let trigger_host = Arc::new(TriggerHost::new(
            triggers.clone(),
            config.default_queue_capacity,
            Arc::clone(&state),
            self.outputs,
            DispatchContext {
                invoker,
                registry: Arc::downgrade(&registry),
                streams: Arc::clone(&streams),
                observability: Arc::clone(&observability),
                cancel: cancel.clone(),
            },
            Arc::clone(&clock),
            config.conflict_retries,
        ));

        // 7. Activation sources for cron and stream triggers.
        let mut sources: Vec<Arc<dyn ActivationSource>> = Vec::new();
        for trigger in triggers.iter().filter(|t| t.enabled) {
            match &trigger.source {
                TriggerSourceDefinition::Signals { ids } => subscribe_trigger(
                    &registry,
                    &trigger_host,
                    trigger,
                    ids,
                    ChannelKind::Signal,
                    &observability,
                )?,
                TriggerSourceDefinition::Doors { ids } => subscribe_trigger(
                    &registry,
                    &trigger_host,
                    trigger,
                    ids,
                    ChannelKind::Door,
                    &observability,
                )?,
                TriggerSourceDefinition::Cron { expression } => {
                    sources.push(Arc::new(CronSource::new(
                        trigger.id,
                        expression.clone(),
                        Arc::clone(&trigger_host),
                    )));
                }
                TriggerSourceDefinition::Stream { stream } => {
                    sources.push(Arc::new(StreamSource::new(
                        trigger.id,
                        stream.clone(),
                        Arc::clone(&streams),
                        Arc::clone(&trigger_host),
                    )));
                }
            }
        }
        let runner = TriggerRunner::new(sources, cancel.clone());

        // 8. Log definition changes. Registered definitions stay frozen.
        let mut background = Vec::new();
        if let Some(rx) = changes {
            background.push(spawn_change_watcher(rx, cancel));
        }

        tracing::info!(
            signals = registry.definitions().count(),
            doors = door_host.doors().count(),
            triggers = triggers.len(),
            sources = runner.len(),
            "engine built"
        );

        Ok(Engine {
            config,
            registry,
            door_host,
            trigger_host,
            streams,
            observability,
            runner,
            cancel_source,
            handles: tokio::sync::Mutex::new(background),
            started: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

fn subscribe_trigger(
    registry: &SignalRegistry,
    host: &Arc<TriggerHost>,
    trigger: &TriggerDefinition,
    channels: &[DefinitionId],
    kind: ChannelKind,
    observability: &Arc<dyn ObservabilityProvider>,
) -> Result<(), EngineError> {
    for channel in channels {
        let subscriber =
            TriggerSubscriber::new(Arc::clone(host), trigger.id, kind, Arc::clone(observability));
        registry.subscribe(*channel, Arc::new(subscriber))?;
    }
    Ok(())
}

fn spawn_change_watcher(
    mut rx: broadcast::Receiver<DefinitionChange>,
    cancel: Cancellation,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                change = rx.recv() => change,
                _ = cancel.cancelled() => return,
            };
            match change {
                Ok(change) => tracing::info!(
                    ?change,
                    "definition changed; rebuild the engine to apply it"
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "definition change notifications dropped")
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
