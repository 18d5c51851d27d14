//! Lifecycle of the long-running activation sources.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::cancel::Cancellation;
use crate::errors::TriggerError;
use crate::types::DefinitionId;

/// A task that activates one trigger from outside the signal registry
/// (a cron schedule, a stream).
#[async_trait]
pub trait ActivationSource: Send + Sync {
    /// Source kind for logs (`cron`, `stream`).
    fn kind(&self) -> &str;

    fn trigger_id(&self) -> DefinitionId;

    /// Run until `cancel` fires. Per-activation failures are handled
    /// inside; an `Err` means the source cannot run at all.
    async fn run(&self, cancel: Cancellation) -> Result<(), TriggerError>;
}

/// Spawns every activation source on its own task and waits for them at
/// shutdown.
pub struct TriggerRunner {
    sources: Vec<Arc<dyn ActivationSource>>,
    cancel: Cancellation,
}

impl TriggerRunner {
    pub fn new(sources: Vec<Arc<dyn ActivationSource>>, cancel: Cancellation) -> Self {
        Self { sources, cancel }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Spawn a tokio task for each source.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.sources
            .iter()
            .map(|source| {
                let source = Arc::clone(source);
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = source.run(cancel).await {
                        tracing::error!(
                            trigger_id = %source.trigger_id(),
                            source = source.kind(),
                            "activation source failed: {e}"
                        );
                    }
                })
            })
            .collect()
    }

    /// Await source tasks. The caller cancels first.
    pub async fn shutdown(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            let _ = handle.await;
        }
    }
}
