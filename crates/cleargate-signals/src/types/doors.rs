//! Door definitions and persisted door state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DefinitionId;

/// Name of the synthetic variable holding a door's previous result.
pub const THIS_VARIABLE: &str = "this";

/// A predicate over a signal payload, as written in a definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct RelayFilterDefinition {
    /// Required payload type tag. Payloads with another tag read as `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
    /// Condition over the payload value, e.g. `total > 100 && currency == "EUR"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Binds a listened signal (or door) to a formula variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct DoorInput {
    pub source: DefinitionId,
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_filter: Option<RelayFilterDefinition>,
}

/// A stateful boolean gate over several signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct DoorDefinition {
    pub id: DefinitionId,
    pub name: String,
    pub inputs: Vec<DoorInput>,
    pub formula: String,
    /// Window after the first event during which received values count.
    /// `None` never decays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_window_ms: Option<u64>,
    /// Declare the `this` variable (the door's previous result) after the inputs.
    #[serde(default)]
    pub use_current_status: bool,
}

impl DoorDefinition {
    /// Declared variable names in evaluation order.
    pub fn variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inputs.iter().map(|i| i.variable.clone()).collect();
        if self.use_current_status {
            names.push(THIS_VARIABLE.to_string());
        }
        names
    }
}

/// Lifecycle phase of a door instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DoorPhase {
    /// No history in the current window.
    #[default]
    Idle,
    /// Partial history; the last evaluation was `false`.
    Armed,
    /// The last evaluation was `true`.
    Evaluated,
}

/// Last-known value of one declared variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct VariableValue {
    pub name: String,
    pub value: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Message that set the value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

impl VariableValue {
    fn unset(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: false,
            updated_at: None,
            message_id: None,
        }
    }
}

/// Persisted state of one door instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct DoorState {
    pub door_id: DefinitionId,
    pub values: Vec<VariableValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<bool>,
    #[serde(default)]
    pub phase: DoorPhase,
    #[serde(default)]
    pub activation_count: u64,
}

impl DoorState {
    /// A fresh state with every declared variable `false`.
    pub fn new(door_id: DefinitionId, variables: &[String]) -> Self {
        Self {
            door_id,
            values: variables.iter().map(|n| VariableValue::unset(n)).collect(),
            window_start: None,
            last_result: None,
            phase: DoorPhase::Idle,
            activation_count: 0,
        }
    }

    /// Whether the stored variables line up with `variables`.
    pub fn matches_layout(&self, variables: &[String]) -> bool {
        self.values.len() == variables.len()
            && self
                .values
                .iter()
                .zip(variables)
                .all(|(v, n)| v.name.eq_ignore_ascii_case(n))
    }

    /// Drop every value and the previous result. The activation count survives.
    pub fn reset(&mut self) {
        for value in &mut self.values {
            *value = VariableValue::unset(&value.name);
        }
        self.window_start = None;
        self.last_result = None;
        self.phase = DoorPhase::Idle;
    }
}
