//! Trigger definitions and persisted trigger state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DefinitionId;

/// What activates a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", tag = "kind")]
#[non_exhaustive]
pub enum TriggerSourceDefinition {
    /// 5-field (minute precision) or 6/7-field (seconds first) cron.
    Cron { expression: String },
    /// Any message on one of these signals.
    Signals { ids: Vec<DefinitionId> },
    /// A rising edge on one of these doors.
    Doors { ids: Vec<DefinitionId> },
    /// Each item pushed to the named stream.
    Stream { stream: String },
}

/// How a value is picked from the output collection on each activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum PullMode {
    /// One element chosen uniformly at random.
    Random,
    /// Round-robin using the persisted cursor.
    #[default]
    Circling,
    /// Every element, in collection order.
    Broadcast,
}

/// Where the output collection comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", tag = "kind")]
#[non_exhaustive]
pub enum OutputSource {
    Static { values: Vec<Value> },
    /// A provider registered on the engine builder under `provider`.
    Dynamic { provider: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct OutputDefinition {
    pub source: OutputSource,
    #[serde(default)]
    pub mode: PullMode,
}

/// A downstream unit a trigger invokes with each output value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", tag = "kind")]
#[non_exhaustive]
pub enum TriggerTarget {
    Workflow { id: String },
    Signal { id: DefinitionId },
    Stream { stream: String },
}

impl std::fmt::Display for TriggerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerTarget::Workflow { id } => write!(f, "workflow:{id}"),
            TriggerTarget::Signal { id } => write!(f, "signal:{id}"),
            TriggerTarget::Stream { stream } => write!(f, "stream:{stream}"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct TriggerDefinition {
    pub id: DefinitionId,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub source: TriggerSourceDefinition,
    /// Without an output definition, each activation passes its own input
    /// (signal payload value, stream item, or `null` for cron).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
    pub targets: Vec<TriggerTarget>,
    /// Upper bound on target invocations running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Bound on queued invocations. Defaults to the engine config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
}

impl TriggerDefinition {
    /// An enabled trigger with no output definition and a single slot.
    pub fn new(name: impl Into<String>, source: TriggerSourceDefinition) -> Self {
        Self {
            id: DefinitionId::new(),
            name: name.into(),
            enabled: true,
            source,
            output: None,
            targets: Vec::new(),
            max_concurrent: 1,
            queue_capacity: None,
        }
    }

    pub fn with_target(mut self, target: TriggerTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_output(mut self, source: OutputSource, mode: PullMode) -> Self {
        self.output = Some(OutputDefinition { source, mode });
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

/// Persisted state of one trigger instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct TriggerState {
    pub trigger_id: DefinitionId,
    /// Next index for [`PullMode::Circling`].
    #[serde(default)]
    pub cursor: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fire_count: u64,
    /// Target invocations running or queued when last written.
    #[serde(default)]
    pub in_flight: u64,
}

impl TriggerState {
    pub fn new(trigger_id: DefinitionId) -> Self {
        Self {
            trigger_id,
            cursor: 0,
            last_fired_at: None,
            fire_count: 0,
            in_flight: 0,
        }
    }
}
