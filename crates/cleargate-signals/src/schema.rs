//! JSON Schema generation for definition and state records.
//!
//! This module is only available when the `schemars` feature is enabled.

use schemars::{schema_for, JsonSchema};
use serde_json::Value;
use std::collections::BTreeMap;

/// Generate JSON Schema for a single type.
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_default()
}

/// Generate every record schema, keyed by type name.
pub fn all_schemas() -> BTreeMap<String, Value> {
    let mut schemas = BTreeMap::new();

    // definitions
    schemas.insert("DefinitionId".into(), schema_of::<crate::DefinitionId>());
    schemas.insert(
        "DefinitionBundle".into(),
        schema_of::<crate::DefinitionBundle>(),
    );
    schemas.insert(
        "SignalDefinition".into(),
        schema_of::<crate::SignalDefinition>(),
    );
    schemas.insert("DoorDefinition".into(), schema_of::<crate::DoorDefinition>());
    schemas.insert("DoorInput".into(), schema_of::<crate::DoorInput>());
    schemas.insert(
        "RelayFilterDefinition".into(),
        schema_of::<crate::RelayFilterDefinition>(),
    );
    schemas.insert(
        "TriggerDefinition".into(),
        schema_of::<crate::TriggerDefinition>(),
    );
    schemas.insert(
        "TriggerSourceDefinition".into(),
        schema_of::<crate::TriggerSourceDefinition>(),
    );
    schemas.insert("TriggerTarget".into(), schema_of::<crate::TriggerTarget>());
    schemas.insert(
        "OutputDefinition".into(),
        schema_of::<crate::OutputDefinition>(),
    );
    schemas.insert("OutputSource".into(), schema_of::<crate::OutputSource>());
    schemas.insert("PullMode".into(), schema_of::<crate::PullMode>());

    // messages
    schemas.insert("SignalMessage".into(), schema_of::<crate::SignalMessage>());
    schemas.insert("Payload".into(), schema_of::<crate::Payload>());
    schemas.insert("Provenance".into(), schema_of::<crate::Provenance>());

    // state
    schemas.insert("DoorState".into(), schema_of::<crate::DoorState>());
    schemas.insert("DoorPhase".into(), schema_of::<crate::DoorPhase>());
    schemas.insert("VariableValue".into(), schema_of::<crate::VariableValue>());
    schemas.insert("TriggerState".into(), schema_of::<crate::TriggerState>());

    schemas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_of_produces_valid_json_schema() {
        let schema = schema_of::<crate::DoorDefinition>();
        let obj = schema.as_object().expect("object");
        assert!(obj.contains_key("title") || obj.contains_key("type") || obj.contains_key("$ref"));
    }

    #[test]
    fn all_schemas_non_empty() {
        let schemas = all_schemas();
        assert_eq!(schemas.len(), 19);
        for (name, schema) in &schemas {
            assert!(schema.is_object(), "Schema for {name} is not an object");
        }
    }
}
