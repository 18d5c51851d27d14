//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cancel::Cancellation;
use crate::defaults::InMemoryStateStore;
use crate::errors::{HandlerError, InvokeError, StateError};
use crate::traits::{InvocationContext, SignalHandler, StateStore, TargetInvoker, Versioned};
use crate::types::SignalMessage;

/// Forwards every delivered message into a channel.
pub(crate) struct ChannelHandler {
    name: String,
    tx: mpsc::UnboundedSender<Arc<SignalMessage>>,
}

impl ChannelHandler {
    pub(crate) fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<SignalMessage>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                name: name.into(),
                tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl SignalHandler for ChannelHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_signal(
        &self,
        message: Arc<SignalMessage>,
        _cancel: Cancellation,
    ) -> Result<(), HandlerError> {
        let _ = self.tx.send(message);
        Ok(())
    }
}

/// Wait for the next message or fail the test after a few seconds.
pub(crate) async fn next_message(
    rx: &mut mpsc::UnboundedReceiver<Arc<SignalMessage>>,
) -> Arc<SignalMessage> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message arrives in time")
        .expect("channel open")
}

/// One recorded workflow invocation.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub workflow_id: String,
    pub input: Value,
    pub ctx: InvocationContext,
}

/// Records invocations and the peak number running at once.
#[derive(Default)]
pub(crate) struct RecordingInvoker {
    pub delay: Duration,
    pub fail: Option<String>,
    calls: Mutex<Vec<Invocation>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    notify: tokio::sync::Notify,
}

impl RecordingInvoker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail every invocation of `workflow_id`.
    pub(crate) fn failing(workflow_id: &str) -> Self {
        Self {
            fail: Some(workflow_id.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    pub(crate) fn inputs(&self) -> Vec<Value> {
        self.calls.lock().iter().map(|c| c.input.clone()).collect()
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` invocations completed.
    pub(crate) async fn wait_for(&self, n: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let notified = self.notify.notified();
                if self.calls.lock().len() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await;
        assert!(waited.is_ok(), "expected {n} invocations, saw {}", self.calls.lock().len());
    }
}

#[async_trait]
impl TargetInvoker for RecordingInvoker {
    async fn invoke(
        &self,
        workflow_id: &str,
        input: Value,
        ctx: InvocationContext,
    ) -> Result<Value, InvokeError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        self.calls.lock().push(Invocation {
            workflow_id: workflow_id.to_string(),
            input: input.clone(),
            ctx,
        });
        self.notify.notify_waiters();

        if self.fail.as_deref() == Some(workflow_id) {
            return Err(InvokeError::Failed {
                message: format!("{workflow_id} refused"),
            });
        }
        Ok(input)
    }
}

/// In-memory store whose next `conflicts` saves lose a version race.
pub(crate) struct ConflictingStore {
    inner: InMemoryStateStore,
    remaining: AtomicU32,
}

impl ConflictingStore {
    pub(crate) fn new(conflicts: u32) -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            remaining: AtomicU32::new(conflicts),
        }
    }
}

#[async_trait]
impl StateStore for ConflictingStore {
    async fn load(&self, scope: &str, key: &str) -> Result<Option<Versioned>, StateError> {
        self.inner.load(scope, key).await
    }

    async fn save(
        &self,
        scope: &str,
        key: &str,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StateError> {
        let lose = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Err(StateError::Conflict {
                scope: scope.into(),
                key: key.into(),
                expected: expected_version,
                actual: expected_version.map(|v| v + 1),
            });
        }
        self.inner.save(scope, key, value, expected_version).await
    }
}
