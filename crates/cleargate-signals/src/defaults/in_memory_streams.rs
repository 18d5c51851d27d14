//! In-memory stream provider using bounded tokio mpsc channels.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use crate::errors::StreamError;
use crate::traits::{StreamProvider, StreamReceiver};

const DEFAULT_CAPACITY: usize = 1000;

/// In-memory streams backed by one bounded `mpsc` channel per subscriber.
///
/// Every subscriber sees every item pushed after it subscribed. A push waits
/// while any subscriber's buffer is full, so a slow consumer slows the
/// producer down instead of losing items. Closed subscribers are pruned.
pub struct InMemoryStreams {
    streams: Arc<RwLock<HashMap<String, Vec<mpsc::Sender<Value>>>>>,
    capacity: usize,
}

impl InMemoryStreams {
    /// Create a new stream provider with the default per-subscriber buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }
}

impl Default for InMemoryStreams {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamProvider for InMemoryStreams {
    async fn push(&self, stream: &str, item: Value) -> Result<(), StreamError> {
        let senders: Vec<mpsc::Sender<Value>> = {
            let streams = self.streams.read().await;
            match streams.get(stream) {
                Some(senders) => senders.clone(),
                None => return Ok(()),
            }
        };

        let mut closed = false;
        for tx in &senders {
            // Ignore send errors: a dropped receiver just unsubscribes.
            if tx.send(item.clone()).await.is_err() {
                closed = true;
            }
        }

        if closed {
            let mut streams = self.streams.write().await;
            if let Some(senders) = streams.get_mut(stream) {
                senders.retain(|tx| !tx.is_closed());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, stream: &str) -> Result<StreamReceiver, StreamError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.streams
            .write()
            .await
            .entry(stream.to_string())
            .or_default()
            .push(tx);
        Ok(StreamReceiver { rx })
    }
}
