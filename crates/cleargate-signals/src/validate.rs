use std::collections::{HashMap, HashSet};

use crate::doors::CompiledDoor;
use crate::errors::DefinitionError;
use crate::traits::TargetInvoker;
use crate::triggers::parse_schedule;
use crate::types::{
    DefinitionBundle, DefinitionId, DoorDefinition, OutputSource, TriggerDefinition,
    TriggerSourceDefinition, TriggerTarget,
};

/// Validate a definition bundle for registration.
///
/// Returns the compiled doors if every definition is valid, or every
/// problem found, so a broken bundle is reported in one pass.
pub fn validate_definitions(
    bundle: &DefinitionBundle,
    invoker: &dyn TargetInvoker,
    output_providers: &HashSet<String>,
) -> Result<Vec<CompiledDoor>, Vec<DefinitionError>> {
    let mut errors = Vec::new();

    // 1. No duplicate ids across signals, doors and triggers.
    let mut seen = HashSet::new();
    let ids = bundle
        .signals
        .iter()
        .map(|s| s.id)
        .chain(bundle.doors.iter().map(|d| d.id))
        .chain(bundle.triggers.iter().map(|t| t.id));
    for id in ids {
        if !seen.insert(id) {
            errors.push(DefinitionError::DuplicateId { id });
        }
    }

    // 2. Signals need a name.
    for signal in &bundle.signals {
        if signal.name.trim().is_empty() {
            errors.push(DefinitionError::Invalid {
                id: signal.id,
                message: "signal name is empty".into(),
            });
        }
    }

    let signal_ids: HashSet<DefinitionId> = bundle.signals.iter().map(|s| s.id).collect();
    let door_ids: HashSet<DefinitionId> = bundle.doors.iter().map(|d| d.id).collect();

    // 3. Door inputs listen to known signals or doors, and each door compiles.
    let mut compiled = Vec::new();
    for door in &bundle.doors {
        if door.inputs.is_empty() {
            errors.push(DefinitionError::Invalid {
                id: door.id,
                message: "door listens to nothing".into(),
            });
        }
        for input in &door.inputs {
            if !signal_ids.contains(&input.source) && !door_ids.contains(&input.source) {
                errors.push(DefinitionError::UnknownReference {
                    id: door.id,
                    kind: "signal or door",
                    reference: input.source.to_string(),
                });
            }
        }
        match CompiledDoor::compile(door.clone()) {
            Ok(door) => compiled.push(door),
            Err(e) => errors.push(e),
        }
    }

    // 4. Doors must not listen to themselves, directly or through other doors.
    for id in find_door_cycles(&bundle.doors) {
        errors.push(DefinitionError::Cycle { id });
    }

    // 5. Triggers.
    for trigger in &bundle.triggers {
        validate_trigger(
            trigger,
            &signal_ids,
            &door_ids,
            invoker,
            output_providers,
            &mut errors,
        );
    }

    if errors.is_empty() {
        Ok(compiled)
    } else {
        Err(errors)
    }
}

fn validate_trigger(
    trigger: &TriggerDefinition,
    signal_ids: &HashSet<DefinitionId>,
    door_ids: &HashSet<DefinitionId>,
    invoker: &dyn TargetInvoker,
    output_providers: &HashSet<String>,
    errors: &mut Vec<DefinitionError>,
) {
    let id = trigger.id;
    let invalid = |message: &str| DefinitionError::Invalid {
        id,
        message: message.to_string(),
    };

    // Source references resolve.
    match &trigger.source {
        TriggerSourceDefinition::Cron { expression } => {
            if let Err(message) = parse_schedule(expression) {
                errors.push(DefinitionError::InvalidCron {
                    id,
                    expression: expression.clone(),
                    message,
                });
            }
        }
        TriggerSourceDefinition::Signals { ids } => {
            if ids.is_empty() {
                errors.push(invalid("signal source lists no signals"));
            }
            for source in ids.iter().filter(|s| !signal_ids.contains(s)) {
                errors.push(DefinitionError::UnknownReference {
                    id,
                    kind: "signal",
                    reference: source.to_string(),
                });
            }
        }
        TriggerSourceDefinition::Doors { ids } => {
            if ids.is_empty() {
                errors.push(invalid("door source lists no doors"));
            }
            for source in ids.iter().filter(|s| !door_ids.contains(s)) {
                errors.push(DefinitionError::UnknownReference {
                    id,
                    kind: "door",
                    reference: source.to_string(),
                });
            }
        }
        TriggerSourceDefinition::Stream { stream } => {
            if stream.trim().is_empty() {
                errors.push(invalid("stream name is empty"));
            }
        }
    }

    // Targets resolve.
    if trigger.targets.is_empty() {
        errors.push(invalid("trigger has no targets"));
    }
    for target in &trigger.targets {
        match target {
            TriggerTarget::Workflow { id: workflow } => {
                if !invoker.knows(workflow) {
                    errors.push(DefinitionError::UnknownReference {
                        id,
                        kind: "workflow",
                        reference: workflow.clone(),
                    });
                }
            }
            TriggerTarget::Signal { id: signal } => {
                if !signal_ids.contains(signal) {
                    errors.push(DefinitionError::UnknownReference {
                        id,
                        kind: "signal",
                        reference: signal.to_string(),
                    });
                }
                if let TriggerSourceDefinition::Signals { ids } = &trigger.source {
                    if ids.contains(signal) {
                        errors.push(invalid("trigger targets a signal it listens to"));
                    }
                }
            }
            TriggerTarget::Stream { stream } => {
                if stream.trim().is_empty() {
                    errors.push(invalid("stream target name is empty"));
                }
            }
        }
    }

    // Bounds.
    if trigger.max_concurrent == 0 {
        errors.push(invalid("max_concurrent must be at least 1"));
    }
    if trigger.queue_capacity == Some(0) {
        errors.push(invalid("queue_capacity must be at least 1"));
    }

    // Dynamic outputs name a registered provider.
    if let Some(output) = &trigger.output {
        if let OutputSource::Dynamic { provider } = &output.source {
            if !output_providers.contains(provider) {
                errors.push(DefinitionError::UnknownReference {
                    id,
                    kind: "output provider",
                    reference: provider.clone(),
                });
            }
        }
    }
}

/// Doors that sit on a listening cycle, found by DFS over door-to-door inputs.
fn find_door_cycles(doors: &[DoorDefinition]) -> Vec<DefinitionId> {
    let door_ids: HashSet<DefinitionId> = doors.iter().map(|d| d.id).collect();
    let listens: HashMap<DefinitionId, Vec<DefinitionId>> = doors
        .iter()
        .map(|d| {
            let upstream = d
                .inputs
                .iter()
                .map(|i| i.source)
                .filter(|s| door_ids.contains(s))
                .collect();
            (d.id, upstream)
        })
        .collect();

    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    let mut cyclic = Vec::new();
    for door in doors {
        dfs(door.id, &listens, &mut visited, &mut in_stack, &mut cyclic);
    }
    cyclic
}

fn dfs(
    node: DefinitionId,
    listens: &HashMap<DefinitionId, Vec<DefinitionId>>,
    visited: &mut HashSet<DefinitionId>,
    in_stack: &mut HashSet<DefinitionId>,
    cyclic: &mut Vec<DefinitionId>,
) {
    if !visited.insert(node) {
        return;
    }
    in_stack.insert(node);

    if let Some(upstream) = listens.get(&node) {
        for &next in upstream {
            if in_stack.contains(&next) {
                if !cyclic.contains(&next) {
                    cyclic.push(next);
                }
            } else {
                dfs(next, listens, visited, in_stack, cyclic);
            }
        }
    }

    in_stack.remove(&node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::LoggingInvoker;
    use crate::errors::FormulaError;
    use crate::types::{DoorInput, PullMode, SignalDefinition};

    fn door(name: &str, sources: &[DefinitionId], formula: &str) -> DoorDefinition {
        DoorDefinition {
            id: DefinitionId::new(),
            name: name.into(),
            inputs: sources
                .iter()
                .enumerate()
                .map(|(i, s)| DoorInput {
                    source: *s,
                    variable: format!("v{i}"),
                    relay_filter: None,
                })
                .collect(),
            formula: formula.into(),
            active_window_ms: None,
            use_current_status: false,
        }
    }

    fn validate(bundle: &DefinitionBundle) -> Result<Vec<CompiledDoor>, Vec<DefinitionError>> {
        validate_definitions(bundle, &LoggingInvoker, &HashSet::new())
    }

    #[test]
    fn valid_bundle() {
        let a = SignalDefinition::new("a");
        let b = SignalDefinition::new("b");
        let gate = door("gate", &[a.id, b.id], "v0 & v1");
        let trigger = TriggerDefinition::new(
            "on-gate",
            TriggerSourceDefinition::Doors { ids: vec![gate.id] },
        )
        .with_target(TriggerTarget::Workflow { id: "wf".into() });
        let bundle = DefinitionBundle {
            signals: vec![a, b],
            doors: vec![gate],
            triggers: vec![trigger],
        };
        let compiled = validate(&bundle).expect("valid");
        assert_eq!(compiled.len(), 1);
    }

    #[test]
    fn duplicate_ids() {
        let a = SignalDefinition::new("a");
        let mut b = SignalDefinition::new("b");
        b.id = a.id;
        let bundle = DefinitionBundle {
            signals: vec![a, b],
            ..Default::default()
        };
        let errors = validate(&bundle).err().expect("invalid");
        assert!(matches!(errors[0], DefinitionError::DuplicateId { .. }));
    }

    #[test]
    fn door_errors_are_collected() {
        let a = SignalDefinition::new("a");
        let unknown = DefinitionId::new();
        let broken = door("broken", &[a.id, unknown], "v0 & (v1");
        let bundle = DefinitionBundle {
            signals: vec![a],
            doors: vec![broken.clone()],
            ..Default::default()
        };
        let errors = validate(&bundle).err().expect("invalid");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| matches!(
            e,
            DefinitionError::UnknownReference { kind: "signal or door", .. }
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            DefinitionError::Formula {
                source: FormulaError::UnbalancedParentheses { .. },
                ..
            }
        )));
        assert!(errors.iter().all(|e| e.definition_id() == Some(broken.id)));
    }

    #[test]
    fn door_cycle_rejected() {
        let a = SignalDefinition::new("a");
        let mut first = door("first", &[a.id], "v0");
        let second = door("second", &[first.id], "v0");
        first.inputs.push(DoorInput {
            source: second.id,
            variable: "back".into(),
            relay_filter: None,
        });
        first.formula = "v0 | back".into();
        let bundle = DefinitionBundle {
            signals: vec![a],
            doors: vec![first, second],
            ..Default::default()
        };
        let errors = validate(&bundle).err().expect("invalid");
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], DefinitionError::Cycle { .. }));
    }

    #[test]
    fn door_chain_is_fine() {
        let a = SignalDefinition::new("a");
        let first = door("first", &[a.id], "v0");
        let second = door("second", &[first.id], "v0");
        let bundle = DefinitionBundle {
            signals: vec![a],
            doors: vec![first, second],
            ..Default::default()
        };
        assert!(validate(&bundle).is_ok());
    }

    #[test]
    fn trigger_problems() {
        let a = SignalDefinition::new("a");
        let cron = TriggerDefinition::new(
            "bad-cron",
            TriggerSourceDefinition::Cron {
                expression: "every tuesday".into(),
            },
        )
        .with_target(TriggerTarget::Workflow { id: "wf".into() });
        let mut loops = TriggerDefinition::new(
            "loops",
            TriggerSourceDefinition::Signals { ids: vec![a.id] },
        )
        .with_target(TriggerTarget::Signal { id: a.id })
        .with_output(
            OutputSource::Dynamic {
                provider: "missing".into(),
            },
            PullMode::Random,
        );
        loops.max_concurrent = 0;
        let no_targets = TriggerDefinition::new(
            "idle",
            TriggerSourceDefinition::Doors {
                ids: vec![DefinitionId::new()],
            },
        );

        let bundle = DefinitionBundle {
            signals: vec![a],
            triggers: vec![cron, loops, no_targets],
            ..Default::default()
        };
        let errors = validate(&bundle).err().expect("invalid");
        assert!(errors
            .iter()
            .any(|e| matches!(e, DefinitionError::InvalidCron { .. })));
        assert!(errors.iter().any(|e| matches!(
            e,
            DefinitionError::UnknownReference { kind: "output provider", .. }
        )));
        assert!(errors
            .iter()
            .any(|e| matches!(e, DefinitionError::UnknownReference { kind: "door", .. })));
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert!(messages.iter().any(|m| m.contains("listens to")));
        assert!(messages.iter().any(|m| m.contains("max_concurrent")));
        assert!(messages.iter().any(|m| m.contains("no targets")));
    }

    struct KnownWorkflows;

    #[async_trait::async_trait]
    impl TargetInvoker for KnownWorkflows {
        async fn invoke(
            &self,
            _workflow_id: &str,
            _input: serde_json::Value,
            _ctx: crate::traits::InvocationContext,
        ) -> Result<serde_json::Value, crate::errors::InvokeError> {
            Ok(serde_json::Value::Null)
        }

        fn knows(&self, workflow_id: &str) -> bool {
            workflow_id == "billing"
        }
    }

    #[test]
    fn unknown_workflow_rejected() {
        let a = SignalDefinition::new("a");
        let trigger = TriggerDefinition::new(
            "t",
            TriggerSourceDefinition::Signals { ids: vec![a.id] },
        )
        .with_target(TriggerTarget::Workflow {
            id: "billing".into(),
        })
        .with_target(TriggerTarget::Workflow {
            id: "shipping".into(),
        });
        let bundle = DefinitionBundle {
            signals: vec![a],
            triggers: vec![trigger],
            ..Default::default()
        };
        let errors = validate_definitions(&bundle, &KnownWorkflows, &HashSet::new())
            .err()
            .expect("invalid");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("shipping"));
    }
}
