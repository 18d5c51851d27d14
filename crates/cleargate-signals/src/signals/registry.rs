//! Signal definitions, subscriptions and fan-out delivery.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::config::EngineConfig;
use crate::errors::{HandlerError, SignalError};
use crate::traits::{Clock, DeliveryFault, FaultSite, ObservabilityProvider, SignalHandler};
use crate::types::{DefinitionId, Payload, Provenance, SignalDefinition, SignalMessage};

/// Handle returned by [`SignalRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// How one subscriber fared with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, error: String },
    Cancelled,
    TimedOut,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Per-subscriber acknowledgement of an acknowledged fire.
#[derive(Debug, Clone)]
pub struct DeliveryAck {
    pub subscription: SubscriptionId,
    pub subscriber: String,
    pub outcome: DeliveryOutcome,
}

/// Result of [`SignalRegistry::fire`].
#[derive(Debug, Clone)]
pub struct FireReport {
    pub message: Arc<SignalMessage>,
    /// Subscribers the message was queued for.
    pub subscribers: usize,
    /// One entry per subscriber when the provenance requested acknowledgement,
    /// empty otherwise.
    pub acknowledgements: Vec<DeliveryAck>,
}

/// Delivery tuning, derived from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub buffer: usize,
    pub attempts: u32,
    pub retry_backoff: Duration,
    pub ack_timeout: Duration,
}

impl From<&EngineConfig> for DeliveryConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            buffer: config.subscriber_buffer.max(1),
            attempts: config.delivery_attempts.max(1),
            retry_backoff: config.delivery_retry_backoff(),
            ack_timeout: config.ack_timeout(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

struct Envelope {
    message: Arc<SignalMessage>,
    ack: Option<oneshot::Sender<DeliveryOutcome>>,
}

struct Subscription {
    id: SubscriptionId,
    name: String,
    tx: mpsc::Sender<Envelope>,
    worker: JoinHandle<()>,
}

/// Holds signal definitions and delivers fired messages to subscribers.
///
/// Definitions are registered while the registry is still exclusively owned
/// and are read-only afterwards. Each subscription owns a bounded queue and
/// a worker task, so a subscriber sees the messages of one signal in the
/// order they were fired, and a slow or failing subscriber never holds up
/// another one.
pub struct SignalRegistry {
    definitions: HashMap<DefinitionId, SignalDefinition>,
    subscriptions: RwLock<HashMap<DefinitionId, Vec<Subscription>>>,
    next_subscription: AtomicU64,
    closed: AtomicBool,
    delivery: DeliveryConfig,
    observability: Arc<dyn ObservabilityProvider>,
    clock: Arc<dyn Clock>,
    cancel: Cancellation,
}

impl SignalRegistry {
    pub fn new(
        delivery: DeliveryConfig,
        observability: Arc<dyn ObservabilityProvider>,
        clock: Arc<dyn Clock>,
        cancel: Cancellation,
    ) -> Self {
        Self {
            definitions: HashMap::new(),
            subscriptions: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            delivery,
            observability,
            clock,
            cancel,
        }
    }

    /// Add a definition. Ids are unique.
    pub fn register(&mut self, definition: SignalDefinition) -> Result<(), SignalError> {
        if self.definitions.contains_key(&definition.id) {
            return Err(SignalError::AlreadyRegistered { id: definition.id });
        }
        self.definitions.insert(definition.id, definition);
        Ok(())
    }

    pub fn definition(&self, id: DefinitionId) -> Option<&SignalDefinition> {
        self.definitions.get(&id)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &SignalDefinition> {
        self.definitions.values()
    }

    /// Resolve `namespace/name`, or a bare name when it is unambiguous.
    pub fn resolve_name(&self, name: &str) -> Option<DefinitionId> {
        if let Some(def) = self.definitions.values().find(|d| d.qualified_name() == name) {
            return Some(def.id);
        }
        let mut matches = self.definitions.values().filter(|d| d.name == name);
        match (matches.next(), matches.next()) {
            (Some(def), None) => Some(def.id),
            _ => None,
        }
    }

    /// Attach `handler` to a signal. Must be called inside a tokio runtime.
    pub fn subscribe(
        &self,
        signal_id: DefinitionId,
        handler: Arc<dyn SignalHandler>,
    ) -> Result<SubscriptionId, SignalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalError::Closed);
        }
        if !self.definitions.contains_key(&signal_id) {
            return Err(SignalError::UnknownSignal {
                reference: signal_id.to_string(),
            });
        }

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let name = handler.name().to_string();
        let (tx, rx) = mpsc::channel(self.delivery.buffer);
        let worker = tokio::spawn(run_worker(
            handler,
            signal_id,
            rx,
            self.delivery.clone(),
            Arc::clone(&self.observability),
            self.cancel.clone(),
        ));

        tracing::debug!(%signal_id, subscription = %id, subscriber = %name, "subscribed");
        self.subscriptions
            .write()
            .entry(signal_id)
            .or_default()
            .push(Subscription {
                id,
                name,
                tx,
                worker,
            });
        Ok(id)
    }

    /// Detach a subscription. Messages already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        for list in subs.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, signal_id: DefinitionId) -> usize {
        self.subscriptions
            .read()
            .get(&signal_id)
            .map_or(0, Vec::len)
    }

    /// Fire a signal and queue it for every current subscriber.
    ///
    /// Returns once the message is queued everywhere, or, when
    /// `provenance.require_ack` is set, once every subscriber has finished
    /// with it or the acknowledgement timeout elapsed.
    pub async fn fire(
        &self,
        signal_id: DefinitionId,
        payload: Option<Payload>,
        provenance: Provenance,
    ) -> Result<FireReport, SignalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalError::Closed);
        }
        let definition = self
            .definitions
            .get(&signal_id)
            .ok_or_else(|| SignalError::UnknownSignal {
                reference: signal_id.to_string(),
            })?;

        let message = Arc::new(SignalMessage {
            message_id: Uuid::new_v4(),
            signal_id,
            signal_name: definition.qualified_name(),
            emitted_at: self.clock.now(),
            payload,
            provenance,
        });
        self.publish(message).await
    }

    /// [`fire`](Self::fire) by qualified or unambiguous bare name.
    pub async fn fire_by_name(
        &self,
        name: &str,
        payload: Option<Payload>,
        provenance: Provenance,
    ) -> Result<FireReport, SignalError> {
        let id = self
            .resolve_name(name)
            .ok_or_else(|| SignalError::UnknownSignal {
                reference: name.to_string(),
            })?;
        self.fire(id, payload, provenance).await
    }

    async fn publish(&self, message: Arc<SignalMessage>) -> Result<FireReport, SignalError> {
        let targets: Vec<(SubscriptionId, String, mpsc::Sender<Envelope>)> = self
            .subscriptions
            .read()
            .get(&message.signal_id)
            .map(|list| {
                list.iter()
                    .map(|s| (s.id, s.name.clone(), s.tx.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let require_ack = message.provenance.require_ack;
        let mut pending = Vec::new();
        let mut acknowledgements = Vec::new();
        let mut queued = 0;

        for (id, name, tx) in targets {
            let (ack_tx, ack_rx) = if require_ack {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            let envelope = Envelope {
                message: Arc::clone(&message),
                ack: ack_tx,
            };
            if tx.send(envelope).await.is_err() {
                // Unsubscribed between the snapshot and the send.
                if require_ack {
                    acknowledgements.push(DeliveryAck {
                        subscription: id,
                        subscriber: name,
                        outcome: DeliveryOutcome::Failed {
                            attempts: 0,
                            error: "subscription closed".into(),
                        },
                    });
                }
                continue;
            }
            queued += 1;
            if let Some(rx) = ack_rx {
                pending.push((id, name, rx));
            }
        }

        self.observability.record_signal_fired(&message, queued);
        tracing::debug!(
            signal_id = %message.signal_id,
            message_id = %message.message_id,
            subscribers = queued,
            "signal fired"
        );

        if require_ack {
            let deadline = tokio::time::Instant::now() + self.delivery.ack_timeout;
            for (id, name, rx) in pending {
                let outcome = match tokio::time::timeout_at(deadline, rx).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => DeliveryOutcome::Failed {
                        attempts: 0,
                        error: "subscriber dropped the acknowledgement".into(),
                    },
                    Err(_) => DeliveryOutcome::TimedOut,
                };
                acknowledgements.push(DeliveryAck {
                    subscription: id,
                    subscriber: name,
                    outcome,
                });
            }
        }

        Ok(FireReport {
            message,
            subscribers: queued,
            acknowledgements,
        })
    }

    /// Stop accepting fires, detach every subscriber and wait up to
    /// `timeout` for workers to drain.
    pub async fn close(&self, timeout: Duration) {
        self.closed.store(true, Ordering::Release);
        let workers: Vec<JoinHandle<()>> = self
            .subscriptions
            .write()
            .drain()
            .flat_map(|(_, list)| list.into_iter().map(|s| s.worker))
            .collect();

        let deadline = tokio::time::Instant::now() + timeout;
        for mut worker in workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                worker.abort();
            }
        }
    }
}

async fn run_worker(
    handler: Arc<dyn SignalHandler>,
    signal_id: DefinitionId,
    mut rx: mpsc::Receiver<Envelope>,
    delivery: DeliveryConfig,
    observability: Arc<dyn ObservabilityProvider>,
    cancel: Cancellation,
) {
    while let Some(envelope) = rx.recv().await {
        let outcome = deliver(&handler, &envelope.message, &delivery, &cancel).await;
        if let DeliveryOutcome::Failed { attempts, error } = &outcome {
            observability.record_delivery_fault(&DeliveryFault {
                site: FaultSite::Subscriber {
                    signal_id,
                    subscriber: handler.name().to_string(),
                },
                cause_id: envelope.message.message_id,
                attempts: *attempts,
                error: error.clone(),
            });
            tracing::warn!(
                %signal_id,
                subscriber = handler.name(),
                message_id = %envelope.message.message_id,
                attempts,
                error = %error,
                "delivery failed"
            );
        }
        if let Some(ack) = envelope.ack {
            // The firer may have timed out already.
            let _ = ack.send(outcome);
        }
    }
}

/// Run one delivery with retries. Each attempt gets its own task so a
/// panicking handler only loses that attempt.
async fn deliver(
    handler: &Arc<dyn SignalHandler>,
    message: &Arc<SignalMessage>,
    delivery: &DeliveryConfig,
    cancel: &Cancellation,
) -> DeliveryOutcome {
    let mut error = String::new();
    for attempt in 1..=delivery.attempts {
        if cancel.is_cancelled() {
            return DeliveryOutcome::Cancelled;
        }
        let task = tokio::spawn({
            let handler = Arc::clone(handler);
            let message = Arc::clone(message);
            let cancel = cancel.clone();
            async move { handler.on_signal(message, cancel).await }
        });
        match task.await {
            Ok(Ok(())) => return DeliveryOutcome::Delivered { attempts: attempt },
            Ok(Err(HandlerError::Cancelled)) => return DeliveryOutcome::Cancelled,
            Ok(Err(e)) => error = e.to_string(),
            Err(join) if join.is_panic() => error = "handler panicked".into(),
            Err(_) => error = "handler task aborted".into(),
        }
        if attempt < delivery.attempts {
            tokio::select! {
                _ = tokio::time::sleep(delivery.retry_backoff) => {}
                _ = cancel.cancelled() => return DeliveryOutcome::Cancelled,
            }
        }
    }
    DeliveryOutcome::Failed {
        attempts: delivery.attempts,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use crate::defaults::MetricsObserver;
    use crate::traits::SystemClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Records the message ids it sees, in order.
    struct Recorder {
        name: String,
        seen: Mutex<Vec<Uuid>>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SignalHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        async fn on_signal(
            &self,
            message: Arc<SignalMessage>,
            _cancel: Cancellation,
        ) -> Result<(), HandlerError> {
            self.seen.lock().push(message.message_id);
            Ok(())
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SignalHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn on_signal(
            &self,
            _message: Arc<SignalMessage>,
            _cancel: Cancellation,
        ) -> Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(HandlerError::Failed {
                    message: format!("failure {n}"),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Panicker;

    #[async_trait]
    impl SignalHandler for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }
        async fn on_signal(
            &self,
            _message: Arc<SignalMessage>,
            _cancel: Cancellation,
        ) -> Result<(), HandlerError> {
            panic!("handler blew up");
        }
    }

    struct Sleeper(Duration);

    #[async_trait]
    impl SignalHandler for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }
        async fn on_signal(
            &self,
            _message: Arc<SignalMessage>,
            _cancel: Cancellation,
        ) -> Result<(), HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn fast_delivery() -> DeliveryConfig {
        DeliveryConfig {
            buffer: 64,
            attempts: 3,
            retry_backoff: Duration::from_millis(1),
            ack_timeout: Duration::from_secs(5),
        }
    }

    fn registry_with(
        delivery: DeliveryConfig,
        observability: Arc<dyn ObservabilityProvider>,
    ) -> (SignalRegistry, SignalDefinition, CancellationSource) {
        let source = CancellationSource::new();
        let mut registry =
            SignalRegistry::new(delivery, observability, Arc::new(SystemClock), source.token());
        let def = SignalDefinition::new("door.opened").with_namespace("lobby");
        registry.register(def.clone()).expect("registers");
        (registry, def, source)
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (mut registry, def, _source) =
            registry_with(fast_delivery(), Arc::new(MetricsObserver::new()));
        assert!(matches!(
            registry.register(def).unwrap_err(),
            SignalError::AlreadyRegistered { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_signal() {
        let (registry, _def, _source) =
            registry_with(fast_delivery(), Arc::new(MetricsObserver::new()));
        let err = registry
            .fire(DefinitionId::new(), None, Provenance::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::UnknownSignal { .. }));
        assert!(registry
            .subscribe(DefinitionId::new(), Recorder::new("r"))
            .is_err());
    }

    #[tokio::test]
    async fn test_per_signal_order_preserved_per_subscriber() {
        let (registry, def, _source) =
            registry_with(fast_delivery(), Arc::new(MetricsObserver::new()));
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        registry.subscribe(def.id, a.clone()).expect("subscribes");
        registry.subscribe(def.id, b.clone()).expect("subscribes");

        let mut fired = Vec::new();
        for i in 0..25 {
            let report = registry
                .fire(def.id, Some(Payload::json(json!(i))), Provenance::default())
                .await
                .expect("fires");
            assert_eq!(report.subscribers, 2);
            assert!(report.acknowledgements.is_empty());
            fired.push(report.message.message_id);
        }
        // Acknowledged sentinel: everything before it has been handled.
        registry
            .fire(def.id, None, Provenance::acknowledged())
            .await
            .expect("fires");

        assert_eq!(a.seen.lock()[..25], fired[..]);
        assert_eq!(b.seen.lock()[..25], fired[..]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let metrics = Arc::new(MetricsObserver::new());
        let (registry, def, _source) = registry_with(fast_delivery(), metrics.clone());
        let ok = Recorder::new("ok");
        registry
            .subscribe(
                def.id,
                Arc::new(Flaky {
                    failures: u32::MAX,
                    calls: AtomicU32::new(0),
                }),
            )
            .expect("subscribes");
        registry.subscribe(def.id, Arc::new(Panicker)).expect("subscribes");
        registry.subscribe(def.id, ok.clone()).expect("subscribes");

        let report = registry
            .fire(def.id, None, Provenance::acknowledged())
            .await
            .expect("fires");

        let outcome_of = |name: &str| {
            report
                .acknowledgements
                .iter()
                .find(|a| a.subscriber == name)
                .map(|a| a.outcome.clone())
                .expect("acknowledged")
        };
        assert!(matches!(outcome_of("flaky"), DeliveryOutcome::Failed { attempts: 3, .. }));
        assert!(matches!(outcome_of("panicker"), DeliveryOutcome::Failed { .. }));
        assert_eq!(outcome_of("ok"), DeliveryOutcome::Delivered { attempts: 1 });
        assert_eq!(ok.seen.lock().as_slice(), &[report.message.message_id]);

        let snap = metrics.snapshot();
        assert_eq!(snap.subscriber_faults, 2);
        assert_eq!(snap.signals_fired, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (registry, def, _source) =
            registry_with(fast_delivery(), Arc::new(MetricsObserver::new()));
        registry
            .subscribe(
                def.id,
                Arc::new(Flaky {
                    failures: 1,
                    calls: AtomicU32::new(0),
                }),
            )
            .expect("subscribes");

        let report = registry
            .fire(def.id, None, Provenance::acknowledged())
            .await
            .expect("fires");
        assert_eq!(
            report.acknowledgements[0].outcome,
            DeliveryOutcome::Delivered { attempts: 2 }
        );
    }

    #[tokio::test]
    async fn test_ack_times_out_for_slow_subscriber() {
        let delivery = DeliveryConfig {
            ack_timeout: Duration::from_millis(30),
            ..fast_delivery()
        };
        let (registry, def, _source) = registry_with(delivery, Arc::new(MetricsObserver::new()));
        registry
            .subscribe(def.id, Arc::new(Sleeper(Duration::from_secs(2))))
            .expect("subscribes");

        let report = registry
            .fire(def.id, None, Provenance::acknowledged())
            .await
            .expect("fires");
        assert_eq!(report.acknowledgements[0].outcome, DeliveryOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_fire_by_name_and_unsubscribe() {
        let (registry, def, _source) =
            registry_with(fast_delivery(), Arc::new(MetricsObserver::new()));
        let rec = Recorder::new("r");
        let sub = registry.subscribe(def.id, rec.clone()).expect("subscribes");

        registry
            .fire_by_name("lobby/door.opened", None, Provenance::acknowledged())
            .await
            .expect("qualified name");
        registry
            .fire_by_name("door.opened", None, Provenance::acknowledged())
            .await
            .expect("bare name");
        assert_eq!(rec.seen.lock().len(), 2);

        assert!(registry.unsubscribe(sub));
        assert!(!registry.unsubscribe(sub));
        let report = registry
            .fire(def.id, None, Provenance::acknowledged())
            .await
            .expect("fires");
        assert_eq!(report.subscribers, 0);
        assert!(registry
            .fire_by_name("nope", None, Provenance::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_rejects_fires() {
        let (registry, def, source) =
            registry_with(fast_delivery(), Arc::new(MetricsObserver::new()));
        registry
            .subscribe(def.id, Arc::new(Sleeper(Duration::from_secs(30))))
            .expect("subscribes");
        registry
            .fire(def.id, None, Provenance::default())
            .await
            .expect("fires");

        source.cancel();
        registry.close(Duration::from_millis(50)).await;
        assert!(matches!(
            registry.fire(def.id, None, Provenance::default()).await,
            Err(SignalError::Closed)
        ));
        assert_eq!(registry.subscriber_count(def.id), 0);
    }
}
