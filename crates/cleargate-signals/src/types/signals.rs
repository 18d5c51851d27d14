//! Signal definitions, payloads and fired messages.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::DefinitionId;
use crate::errors::PayloadError;

/// A named, fireable event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct SignalDefinition {
    pub id: DefinitionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SignalDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: DefinitionId::new(),
            name: name.into(),
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// `namespace/name`, or just `name` without a namespace.
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Type tag used by [`Payload::json`].
pub const JSON_PAYLOAD_TYPE: &str = "json";

/// A tagged, opaque payload carried by a signal.
///
/// The type tag names the producer's schema. Typed access goes through
/// [`decode`](Self::decode), which checks the tag before deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct Payload {
    type_tag: String,
    value: Value,
}

impl Payload {
    pub fn new(type_tag: impl Into<String>, value: Value) -> Self {
        Self {
            type_tag: type_tag.into(),
            value,
        }
    }

    /// An untyped JSON payload.
    pub fn json(value: Value) -> Self {
        Self::new(JSON_PAYLOAD_TYPE, value)
    }

    /// Serialize `data` under `type_tag`.
    pub fn encode<T: Serialize>(type_tag: impl Into<String>, data: &T) -> Result<Self, PayloadError> {
        let value = serde_json::to_value(data).map_err(|e| PayloadError::Encode {
            message: e.to_string(),
        })?;
        Ok(Self::new(type_tag, value))
    }

    /// Deserialize the value, requiring the tag to equal `expected`.
    pub fn decode<T: DeserializeOwned>(&self, expected: &str) -> Result<T, PayloadError> {
        if self.type_tag != expected {
            return Err(PayloadError::TypeMismatch {
                expected: expected.to_string(),
                actual: self.type_tag.clone(),
            });
        }
        serde_json::from_value(self.value.clone()).map_err(|e| PayloadError::Decode {
            message: e.to_string(),
        })
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Who fired a message and what it answers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct Provenance {
    /// Identity of the emitting actor (`door:<name>`, `trigger:<name>`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitter: Option<String>,
    /// Flow-wide correlation id, carried unchanged through doors and triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Block the firer until every subscriber processed the message.
    #[serde(default)]
    pub require_ack: bool,
    /// Message ids that caused this one (door activations, trigger targets).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caused_by: Vec<Uuid>,
}

impl Provenance {
    pub fn acknowledged() -> Self {
        Self {
            require_ack: true,
            ..Self::default()
        }
    }

    pub fn from_emitter(emitter: impl Into<String>) -> Self {
        Self {
            emitter: Some(emitter.into()),
            ..Self::default()
        }
    }
}

/// One firing of a signal. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct SignalMessage {
    pub message_id: Uuid,
    pub signal_id: DefinitionId,
    pub signal_name: String,
    pub emitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub provenance: Provenance,
}
