//! Stream activation source.

use std::sync::Arc;

use async_trait::async_trait;

use super::host::{ActivationContext, ActivationOrigin, Backpressure, TriggerHost};
use super::runner::ActivationSource;
use crate::cancel::Cancellation;
use crate::errors::TriggerError;
use crate::traits::StreamProvider;
use crate::types::DefinitionId;

/// Activates a trigger once per item of a named stream.
///
/// Activations wait for dispatch room, so a saturated trigger stops
/// reading and the stream's own buffer pushes back on producers.
pub struct StreamSource {
    trigger_id: DefinitionId,
    stream: String,
    streams: Arc<dyn StreamProvider>,
    host: Arc<TriggerHost>,
}

impl StreamSource {
    pub fn new(
        trigger_id: DefinitionId,
        stream: impl Into<String>,
        streams: Arc<dyn StreamProvider>,
        host: Arc<TriggerHost>,
    ) -> Self {
        Self {
            trigger_id,
            stream: stream.into(),
            streams,
            host,
        }
    }
}

#[async_trait]
impl ActivationSource for StreamSource {
    fn kind(&self) -> &str {
        "stream"
    }

    fn trigger_id(&self) -> DefinitionId {
        self.trigger_id
    }

    async fn run(&self, cancel: Cancellation) -> Result<(), TriggerError> {
        let mut receiver = self
            .streams
            .subscribe(&self.stream)
            .await
            .map_err(|e| TriggerError::Runtime {
                message: e.to_string(),
            })?;
        tracing::debug!(trigger_id = %self.trigger_id, stream = %self.stream, "stream source started");

        loop {
            let item = tokio::select! {
                item = receiver.rx.recv() => match item {
                    Some(item) => item,
                    None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            };
            let ctx = ActivationContext {
                origin: ActivationOrigin::Stream {
                    stream: self.stream.clone(),
                },
                input: item,
                correlation_id: None,
                caused_by: Vec::new(),
                backpressure: Backpressure::Wait,
            };
            match self.host.activate(self.trigger_id, ctx, &cancel).await {
                Ok(_) => {}
                Err(TriggerError::Cancelled) => return Ok(()),
                Err(e) => tracing::warn!(
                    trigger_id = %self.trigger_id,
                    stream = %self.stream,
                    error = %e,
                    "stream activation failed"
                ),
            }
        }
    }
}
