//! Per-trigger bounded FIFO dispatch of target invocations.
//!
//! Each trigger owns one dispatcher: a queue bounded by `queue_capacity`
//! and a pump task that starts at most `max_concurrent` invocations at a
//! time, in submission order. Activations reserve queue slots before they
//! commit, so a full queue is detected before any state is written.
//!
//! The in-flight count is only decremented while holding the trigger's
//! lock, after the [`InFlightRecorder`] has persisted the new value, so a
//! drained dispatcher never leaves a stale count behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::errors::TriggerError;
use crate::signals::SignalRegistry;
use crate::traits::{
    DeliveryFault, FaultSite, InvocationContext, ObservabilityProvider, StreamProvider,
    TargetInvoker,
};
use crate::types::{DefinitionId, Payload, Provenance, TriggerDefinition, TriggerTarget};

/// Collaborators a dispatcher needs to reach its targets.
#[derive(Clone)]
pub struct DispatchContext {
    pub invoker: Arc<dyn TargetInvoker>,
    pub registry: Weak<SignalRegistry>,
    pub streams: Arc<dyn StreamProvider>,
    pub observability: Arc<dyn ObservabilityProvider>,
    pub cancel: Cancellation,
}

/// One value for one target, ready to queue.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub activation_id: Uuid,
    pub value: Value,
    pub target: TriggerTarget,
    pub correlation_id: Option<Uuid>,
    pub caused_by: Vec<Uuid>,
}

/// Queue slots held for one activation. Dropping it unused frees the slots.
#[derive(Debug)]
pub struct Reservation {
    permit: Option<OwnedSemaphorePermit>,
    count: usize,
}

impl Reservation {
    pub(crate) fn empty() -> Self {
        Self {
            permit: None,
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Persists a trigger's in-flight count as invocations finish.
///
/// Called under the trigger's lock with the count that will hold once the
/// finishing invocation is released.
#[async_trait]
pub trait InFlightRecorder: Send + Sync {
    async fn record_in_flight(&self, in_flight: u64);
}

/// Invocations queued or running, with a wakeup when it drops to zero.
#[derive(Default)]
struct InFlightCounter {
    count: AtomicU64,
    idle: Notify,
}

impl InFlightCounter {
    fn get(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Decrements the counter when an invocation finishes or is abandoned.
struct InFlight(Arc<InFlightCounter>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

struct Target {
    trigger_id: DefinitionId,
    trigger_name: Arc<str>,
    ctx: DispatchContext,
    lock: Arc<Mutex<()>>,
    recorder: Option<Arc<dyn InFlightRecorder>>,
}

impl Target {
    /// Record the count left after `released` go, then let them go.
    async fn settle(&self, released: Vec<InFlight>) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let Some(counter) = released.first().map(|guard| Arc::clone(&guard.0)) else {
            return;
        };
        let _lock = self.lock.lock().await;
        let remaining = counter.get().saturating_sub(released.len() as u64);
        recorder.record_in_flight(remaining).await;
        drop(released);
    }
}

pub struct TriggerDispatcher {
    trigger_id: DefinitionId,
    tx: mpsc::UnboundedSender<PendingItem>,
    queue_slots: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<InFlightCounter>,
}

impl TriggerDispatcher {
    /// Start a dispatcher for `definition` that keeps its in-flight count in
    /// memory only. Must be called inside a tokio runtime.
    pub fn spawn(definition: &TriggerDefinition, queue_capacity: usize, ctx: DispatchContext) -> Self {
        Self::spawn_recording(
            definition,
            queue_capacity,
            ctx,
            Arc::new(Mutex::new(())),
            None,
        )
    }

    /// Start a dispatcher whose completions are persisted through
    /// `recorder` under `lock`, the same lock activations commit under.
    pub fn spawn_recording(
        definition: &TriggerDefinition,
        queue_capacity: usize,
        ctx: DispatchContext,
        lock: Arc<Mutex<()>>,
        recorder: Option<Arc<dyn InFlightRecorder>>,
    ) -> Self {
        let capacity = queue_capacity.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));
        let max_concurrent = definition.max_concurrent.clamp(1, Semaphore::MAX_PERMITS);
        let (tx, rx) = mpsc::unbounded_channel();
        let queue_slots = Arc::new(Semaphore::new(capacity));
        let workers = Arc::new(Semaphore::new(max_concurrent));
        let in_flight = Arc::new(InFlightCounter::default());

        let target = Arc::new(Target {
            trigger_id: definition.id,
            trigger_name: Arc::from(definition.name.as_str()),
            ctx,
            lock,
            recorder,
        });
        tokio::spawn(run_pump(
            rx,
            Arc::clone(&queue_slots),
            workers,
            Arc::clone(&in_flight),
            target,
        ));

        Self {
            trigger_id: definition.id,
            tx,
            queue_slots,
            capacity,
            in_flight,
        }
    }

    /// Invocations queued or running.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.get()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free queue slots.
    pub fn available(&self) -> usize {
        self.queue_slots.available_permits()
    }

    fn exceeded(&self, requested: usize) -> TriggerError {
        TriggerError::CapacityExceeded {
            id: self.trigger_id,
            requested,
            available: self.available(),
        }
    }

    /// Reserve `n` slots now or fail with [`TriggerError::CapacityExceeded`].
    pub fn try_reserve(&self, n: usize) -> Result<Reservation, TriggerError> {
        if n == 0 {
            return Ok(Reservation::empty());
        }
        if n > self.capacity {
            return Err(self.exceeded(n));
        }
        Arc::clone(&self.queue_slots)
            .try_acquire_many_owned(n as u32)
            .map(|permit| Reservation {
                permit: Some(permit),
                count: n,
            })
            .map_err(|_| self.exceeded(n))
    }

    /// Wait for `n` slots. Fails at once if `n` can never fit.
    pub async fn reserve(&self, n: usize, cancel: &Cancellation) -> Result<Reservation, TriggerError> {
        if n == 0 {
            return Ok(Reservation::empty());
        }
        if n > self.capacity {
            return Err(self.exceeded(n));
        }
        let slots = Arc::clone(&self.queue_slots);
        tokio::select! {
            permit = slots.acquire_many_owned(n as u32) => permit
                .map(|permit| Reservation { permit: Some(permit), count: n })
                .map_err(|_| TriggerError::Runtime { message: "dispatcher closed".into() }),
            _ = cancel.cancelled() => Err(TriggerError::Cancelled),
        }
    }

    /// Queue `items` against a reservation of the same size.
    pub fn submit(&self, reservation: Reservation, items: Vec<PendingItem>) -> Result<(), TriggerError> {
        if items.len() != reservation.count {
            return Err(TriggerError::Runtime {
                message: format!(
                    "reserved {} slots for {} items",
                    reservation.count,
                    items.len()
                ),
            });
        }
        if let Some(permit) = reservation.permit {
            // Slots are handed back one by one as the pump dequeues.
            permit.forget();
        }
        for item in items {
            self.in_flight.count.fetch_add(1, Ordering::SeqCst);
            if self.tx.send(item).is_err() {
                drop(InFlight(Arc::clone(&self.in_flight)));
                return Err(TriggerError::Runtime {
                    message: "dispatcher stopped".into(),
                });
            }
        }
        Ok(())
    }

    /// Wait until nothing is queued or running, up to `timeout`.
    /// Returns `false` if work was still in flight.
    pub async fn drain(&self, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

async fn run_pump(
    mut rx: mpsc::UnboundedReceiver<PendingItem>,
    queue_slots: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    in_flight: Arc<InFlightCounter>,
    target: Arc<Target>,
) {
    let cancel = target.ctx.cancel.clone();
    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&workers).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        queue_slots.add_permits(1);
        let guard = InFlight(Arc::clone(&in_flight));
        tokio::spawn(execute(Arc::clone(&target), item, permit, guard));
    }

    rx.close();
    let mut abandoned = Vec::new();
    while let Ok(item) = rx.try_recv() {
        abandoned.push(InFlight(Arc::clone(&in_flight)));
        target.ctx.observability.record_delivery_fault(&DeliveryFault {
            site: FaultSite::Target {
                trigger_id: target.trigger_id,
                target: item.target,
            },
            cause_id: item.activation_id,
            attempts: 0,
            error: "abandoned at shutdown".into(),
        });
    }
    if !abandoned.is_empty() {
        tracing::warn!(
            trigger_id = %target.trigger_id,
            trigger = %target.trigger_name,
            abandoned = abandoned.len(),
            "dispatcher stopped with queued invocations"
        );
        target.settle(abandoned).await;
    }
}

async fn execute(target: Arc<Target>, item: PendingItem, _permit: OwnedSemaphorePermit, guard: InFlight) {
    let call = tokio::spawn(invoke_target(Arc::clone(&target), item.clone()));
    let result = match call.await {
        Ok(result) => result,
        Err(join) if join.is_panic() => Err("target panicked".to_string()),
        Err(_) => Err("target task aborted".to_string()),
    };

    if let Err(error) = result {
        tracing::warn!(
            trigger_id = %target.trigger_id,
            trigger = %target.trigger_name,
            target = %item.target,
            activation_id = %item.activation_id,
            error = %error,
            "target invocation failed"
        );
        target.ctx.observability.record_delivery_fault(&DeliveryFault {
            site: FaultSite::Target {
                trigger_id: target.trigger_id,
                target: item.target,
            },
            cause_id: item.activation_id,
            attempts: 1,
            error,
        });
    }
    target.settle(vec![guard]).await;
}

async fn invoke_target(target: Arc<Target>, item: PendingItem) -> Result<(), String> {
    let ctx = &target.ctx;
    match &item.target {
        TriggerTarget::Workflow { id } => {
            let invocation = InvocationContext {
                trigger_id: target.trigger_id,
                trigger_name: target.trigger_name.to_string(),
                activation_id: item.activation_id,
                correlation_id: item.correlation_id,
                cancel: ctx.cancel.clone(),
            };
            ctx.invoker
                .invoke(id, item.value, invocation)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        TriggerTarget::Signal { id } => {
            let registry = ctx
                .registry
                .upgrade()
                .ok_or_else(|| "signal registry dropped".to_string())?;
            let provenance = Provenance {
                emitter: Some(format!("trigger:{}", target.trigger_name)),
                correlation_id: item.correlation_id,
                require_ack: false,
                caused_by: item.caused_by,
            };
            registry
                .fire(*id, Some(Payload::json(item.value)), provenance)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        TriggerTarget::Stream { stream } => ctx
            .streams
            .push(stream, item.value)
            .await
            .map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use crate::defaults::{InMemoryStreams, MetricsObserver};
    use crate::testing::RecordingInvoker;
    use crate::types::TriggerSourceDefinition;
    use serde_json::json;
    use std::time::Duration;

    fn definition(max_concurrent: usize) -> TriggerDefinition {
        TriggerDefinition::new("t", TriggerSourceDefinition::Stream { stream: "s".into() })
            .with_target(TriggerTarget::Workflow { id: "wf".into() })
            .with_max_concurrent(max_concurrent)
    }

    fn context(
        invoker: Arc<RecordingInvoker>,
        metrics: Arc<MetricsObserver>,
        cancel: Cancellation,
    ) -> DispatchContext {
        DispatchContext {
            invoker,
            registry: Weak::new(),
            streams: Arc::new(InMemoryStreams::new()),
            observability: metrics,
            cancel,
        }
    }

    fn items(n: usize) -> Vec<PendingItem> {
        (0..n)
            .map(|i| PendingItem {
                activation_id: Uuid::new_v4(),
                value: json!(i),
                target: TriggerTarget::Workflow { id: "wf".into() },
                correlation_id: None,
                caused_by: Vec::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fifo_with_single_slot() {
        let invoker = Arc::new(RecordingInvoker::new());
        let dispatcher = TriggerDispatcher::spawn(
            &definition(1),
            16,
            context(invoker.clone(), Arc::new(MetricsObserver::new()), Cancellation::never()),
        );
        let reservation = dispatcher.try_reserve(5).expect("fits");
        dispatcher.submit(reservation, items(5)).expect("queued");

        invoker.wait_for(5).await;
        assert_eq!(invoker.inputs(), (0..5).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(invoker.peak(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let invoker = Arc::new(RecordingInvoker::with_delay(Duration::from_millis(20)));
        let dispatcher = TriggerDispatcher::spawn(
            &definition(2),
            16,
            context(invoker.clone(), Arc::new(MetricsObserver::new()), Cancellation::never()),
        );
        for item in items(10) {
            let reservation = dispatcher.try_reserve(1).expect("fits");
            dispatcher.submit(reservation, vec![item]).expect("queued");
        }
        invoker.wait_for(10).await;
        assert_eq!(invoker.peak(), 2);
        assert!(dispatcher.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let invoker = Arc::new(RecordingInvoker::with_delay(Duration::from_millis(200)));
        let dispatcher = TriggerDispatcher::spawn(
            &definition(1),
            2,
            context(invoker, Arc::new(MetricsObserver::new()), Cancellation::never()),
        );
        assert!(matches!(
            dispatcher.try_reserve(3),
            Err(TriggerError::CapacityExceeded { requested: 3, .. })
        ));

        let held = dispatcher.try_reserve(2).expect("fits");
        assert_eq!(dispatcher.available(), 0);
        assert!(matches!(
            dispatcher.try_reserve(1),
            Err(TriggerError::CapacityExceeded { available: 0, .. })
        ));
        drop(held);
        assert_eq!(dispatcher.available(), 2);
    }

    #[tokio::test]
    async fn test_reserve_waits_for_space() {
        let invoker = Arc::new(RecordingInvoker::with_delay(Duration::from_millis(10)));
        let dispatcher = TriggerDispatcher::spawn(
            &definition(1),
            1,
            context(invoker.clone(), Arc::new(MetricsObserver::new()), Cancellation::never()),
        );
        let never = Cancellation::never();
        for item in items(4) {
            let reservation = dispatcher.reserve(1, &never).await.expect("space frees up");
            dispatcher.submit(reservation, vec![item]).expect("queued");
        }
        invoker.wait_for(4).await;
    }

    #[tokio::test]
    async fn test_failed_target_is_reported() {
        let invoker = Arc::new(RecordingInvoker::failing("wf"));
        let metrics = Arc::new(MetricsObserver::new());
        let dispatcher = TriggerDispatcher::spawn(
            &definition(1),
            4,
            context(invoker.clone(), metrics.clone(), Cancellation::never()),
        );
        let reservation = dispatcher.try_reserve(2).expect("fits");
        dispatcher.submit(reservation, items(2)).expect("queued");
        invoker.wait_for(2).await;
        assert!(dispatcher.drain(Duration::from_secs(1)).await);

        assert_eq!(metrics.snapshot().target_faults, 2);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_queue() {
        let invoker = Arc::new(RecordingInvoker::with_delay(Duration::from_millis(100)));
        let metrics = Arc::new(MetricsObserver::new());
        let source = CancellationSource::new();
        let dispatcher = TriggerDispatcher::spawn(
            &definition(1),
            8,
            context(invoker.clone(), metrics.clone(), source.token()),
        );
        let reservation = dispatcher.try_reserve(5).expect("fits");
        dispatcher.submit(reservation, items(5)).expect("queued");
        tokio::time::sleep(Duration::from_millis(20)).await;

        source.cancel();
        assert!(dispatcher.drain(Duration::from_secs(2)).await);
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(invoker.calls().len() < 5);
        assert!(metrics.snapshot().target_faults >= 3);
    }

    #[derive(Default)]
    struct Recorded(parking_lot::Mutex<Vec<u64>>);

    #[async_trait]
    impl InFlightRecorder for Recorded {
        async fn record_in_flight(&self, in_flight: u64) {
            self.0.lock().push(in_flight);
        }
    }

    #[tokio::test]
    async fn test_completions_are_recorded_before_release() {
        let invoker = Arc::new(RecordingInvoker::with_delay(Duration::from_millis(5)));
        let recorded = Arc::new(Recorded::default());
        let dispatcher = TriggerDispatcher::spawn_recording(
            &definition(1),
            8,
            context(invoker.clone(), Arc::new(MetricsObserver::new()), Cancellation::never()),
            Arc::new(Mutex::new(())),
            Some(recorded.clone() as Arc<dyn InFlightRecorder>),
        );
        let reservation = dispatcher.try_reserve(3).expect("fits");
        dispatcher.submit(reservation, items(3)).expect("queued");

        assert!(dispatcher.drain(Duration::from_secs(2)).await);
        assert_eq!(*recorded.0.lock(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_mismatched_submit_rejected() {
        let dispatcher = TriggerDispatcher::spawn(
            &definition(1),
            4,
            context(
                Arc::new(RecordingInvoker::new()),
                Arc::new(MetricsObserver::new()),
                Cancellation::never(),
            ),
        );
        let reservation = dispatcher.try_reserve(1).expect("fits");
        assert!(dispatcher.submit(reservation, items(2)).is_err());
        assert_eq!(dispatcher.available(), 4);
    }
}
