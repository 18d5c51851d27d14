//! In-memory definition provider with change notification.

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::errors::DefinitionError;
use crate::traits::{DefinitionChange, DefinitionProvider};
use crate::types::{DefinitionBundle, DoorDefinition, SignalDefinition, TriggerDefinition};

const CHANGE_CAPACITY: usize = 64;

/// Definitions held in memory. Upserts replace by id and announce the change.
pub struct InMemoryDefinitionProvider {
    bundle: RwLock<DefinitionBundle>,
    changes: broadcast::Sender<DefinitionChange>,
}

impl InMemoryDefinitionProvider {
    pub fn new(bundle: DefinitionBundle) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            bundle: RwLock::new(bundle),
            changes,
        }
    }

    pub fn upsert_signal(&self, def: SignalDefinition) {
        let id = def.id;
        {
            let mut bundle = self.bundle.write();
            bundle.signals.retain(|s| s.id != id);
            bundle.signals.push(def);
        }
        self.announce(DefinitionChange::Upserted { id });
    }

    pub fn upsert_door(&self, def: DoorDefinition) {
        let id = def.id;
        {
            let mut bundle = self.bundle.write();
            bundle.doors.retain(|d| d.id != id);
            bundle.doors.push(def);
        }
        self.announce(DefinitionChange::Upserted { id });
    }

    pub fn upsert_trigger(&self, def: TriggerDefinition) {
        let id = def.id;
        {
            let mut bundle = self.bundle.write();
            bundle.triggers.retain(|t| t.id != id);
            bundle.triggers.push(def);
        }
        self.announce(DefinitionChange::Upserted { id });
    }

    fn announce(&self, change: DefinitionChange) {
        // No subscribers is not an error.
        let _ = self.changes.send(change);
    }
}

impl Default for InMemoryDefinitionProvider {
    fn default() -> Self {
        Self::new(DefinitionBundle::default())
    }
}

#[async_trait]
impl DefinitionProvider for InMemoryDefinitionProvider {
    async fn load(&self) -> Result<DefinitionBundle, DefinitionError> {
        Ok(self.bundle.read().clone())
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<DefinitionChange>> {
        Some(self.changes.subscribe())
    }
}
