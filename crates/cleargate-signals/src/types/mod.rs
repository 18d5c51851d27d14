//! Definition and state records for signals, doors and triggers.
//!
//! Definitions are serde data loaded from a
//! [`DefinitionProvider`](crate::traits::DefinitionProvider) and never
//! mutated by the kernel. State records are owned by their state machine
//! and persisted through a [`StateStore`](crate::traits::StateStore).
//!
//! All enums use `#[non_exhaustive]` so adding variants is never a
//! breaking change for downstream consumers.

pub mod doors;
pub mod signals;
pub mod triggers;

pub use doors::*;
pub use signals::*;
pub use triggers::*;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable identifier of a signal, door or trigger definition.
///
/// Doors double as signal channels: a door's activation is fired on the
/// signal whose id equals the door's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(transparent)]
pub struct DefinitionId(pub Uuid);

impl DefinitionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DefinitionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for DefinitionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Every definition the kernel consumes, as delivered by a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct DefinitionBundle {
    #[serde(default)]
    pub signals: Vec<SignalDefinition>,
    #[serde(default)]
    pub doors: Vec<DoorDefinition>,
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
}

impl DefinitionBundle {
    /// Append every definition from `other`.
    pub fn merge(&mut self, other: DefinitionBundle) {
        self.signals.extend(other.signals);
        self.doors.extend(other.doors);
        self.triggers.extend(other.triggers);
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.doors.is_empty() && self.triggers.is_empty()
    }
}
