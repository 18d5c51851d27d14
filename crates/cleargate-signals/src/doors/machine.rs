//! Pure door transitions: no I/O, no locking.
//!
//! [`CompiledDoor`] maps incoming signals onto formula variables, applies
//! window decay and reports rising edges. Persistence and serialization
//! per door live in [`DoorHost`](super::DoorHost).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::errors::{DefinitionError, FormulaError};
use crate::formula::CompiledFormula;
use crate::relay_filter::RelayFilter;
use crate::types::{
    DefinitionId, DoorDefinition, DoorPhase, DoorState, SignalMessage, THIS_VARIABLE,
};

struct Binding {
    index: usize,
    filter: Option<RelayFilter>,
}

/// Result of applying one event to a door.
#[derive(Debug, Clone, PartialEq)]
pub struct DoorTransition {
    /// State to persist.
    pub state: DoorState,
    pub result: bool,
    /// `true` only on a `false -> true` edge.
    pub activated: bool,
    /// Message ids behind the currently-true variables, set when activated.
    pub responsible: Vec<Uuid>,
}

/// A validated door definition, ready to evaluate.
pub struct CompiledDoor {
    definition: DoorDefinition,
    formula: CompiledFormula,
    variables: Vec<String>,
    bindings: HashMap<DefinitionId, Vec<Binding>>,
    window: Option<Duration>,
    this_index: Option<usize>,
}

impl CompiledDoor {
    pub fn compile(definition: DoorDefinition) -> Result<Self, DefinitionError> {
        let id = definition.id;
        if let Some(input) = definition
            .inputs
            .iter()
            .find(|i| i.variable.eq_ignore_ascii_case(THIS_VARIABLE))
        {
            return Err(DefinitionError::Invalid {
                id,
                message: format!("input variable '{}' is reserved", input.variable),
            });
        }

        let variables = definition.variable_names();
        let formula = CompiledFormula::compile(&definition.formula, variables.as_slice())
            .map_err(|source| DefinitionError::Formula { id, source })?;

        let mut bindings: HashMap<DefinitionId, Vec<Binding>> = HashMap::new();
        for (index, input) in definition.inputs.iter().enumerate() {
            let filter = input
                .relay_filter
                .as_ref()
                .map(RelayFilter::compile)
                .transpose()
                .map_err(|source| DefinitionError::RelayFilter {
                    id,
                    variable: input.variable.clone(),
                    source,
                })?;
            bindings
                .entry(input.source)
                .or_default()
                .push(Binding { index, filter });
        }

        let window = definition
            .active_window_ms
            .map(|ms| Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX)));
        let this_index = definition
            .use_current_status
            .then_some(definition.inputs.len());

        Ok(Self {
            definition,
            formula,
            variables,
            bindings,
            window,
            this_index,
        })
    }

    pub fn id(&self) -> DefinitionId {
        self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &DoorDefinition {
        &self.definition
    }

    /// Signal ids this door listens to.
    pub fn sources(&self) -> impl Iterator<Item = DefinitionId> + '_ {
        self.bindings.keys().copied()
    }

    pub fn listens_to(&self, signal_id: DefinitionId) -> bool {
        self.bindings.contains_key(&signal_id)
    }

    /// A fresh state for this door's variable layout.
    pub fn initial_state(&self) -> DoorState {
        DoorState::new(self.definition.id, &self.variables)
    }

    /// Apply one signal. `Ok(None)` when the door does not listen to it.
    pub fn on_signal(
        &self,
        state: Option<DoorState>,
        message: &SignalMessage,
        now: DateTime<Utc>,
    ) -> Result<Option<DoorTransition>, FormulaError> {
        let Some(bindings) = self.bindings.get(&message.signal_id) else {
            return Ok(None);
        };

        let mut state = self.adopt(state);
        if self.expired(&state, now) {
            state.reset();
        }

        for binding in bindings {
            let value = match &binding.filter {
                Some(filter) => filter.evaluate(message.payload.as_ref()),
                None => true,
            };
            let slot = &mut state.values[binding.index];
            slot.value = value;
            slot.updated_at = Some(now);
            slot.message_id = Some(message.message_id);
        }
        if state.window_start.is_none() {
            state.window_start = Some(now);
        }

        self.evaluate(state).map(Some)
    }

    /// Re-run the evaluation without a new event.
    ///
    /// No stored state means nothing to re-evaluate. An expired window
    /// resets the door to idle without evaluating.
    pub fn reevaluate(
        &self,
        state: Option<DoorState>,
        now: DateTime<Utc>,
    ) -> Result<Option<DoorTransition>, FormulaError> {
        let Some(state) = state else {
            return Ok(None);
        };
        let mut state = self.adopt(Some(state));
        if self.expired(&state, now) {
            state.reset();
            return Ok(Some(DoorTransition {
                state,
                result: false,
                activated: false,
                responsible: Vec::new(),
            }));
        }
        if state.window_start.is_none() {
            return Ok(None);
        }
        self.evaluate(state).map(Some)
    }

    fn adopt(&self, state: Option<DoorState>) -> DoorState {
        match state {
            Some(state) if state.matches_layout(&self.variables) => state,
            Some(stale) => {
                tracing::debug!(door_id = %self.definition.id, "door layout changed, starting fresh");
                let mut fresh = self.initial_state();
                fresh.activation_count = stale.activation_count;
                fresh
            }
            None => self.initial_state(),
        }
    }

    fn expired(&self, state: &DoorState, now: DateTime<Utc>) -> bool {
        match (self.window, state.window_start) {
            (Some(window), Some(start)) => now - start > window,
            _ => false,
        }
    }

    fn evaluate(&self, mut state: DoorState) -> Result<DoorTransition, FormulaError> {
        let previous = state.last_result;
        if let Some(i) = self.this_index {
            state.values[i].value = previous.unwrap_or(false);
        }
        let vector: Vec<bool> = state.values.iter().map(|v| v.value).collect();
        let result = self.formula.evaluate(&vector)?;
        let activated = result && previous != Some(true);

        state.last_result = Some(result);
        state.phase = if result {
            DoorPhase::Evaluated
        } else {
            DoorPhase::Armed
        };
        if activated {
            state.activation_count += 1;
        }

        let mut responsible = Vec::new();
        if activated {
            for (i, value) in state.values.iter().enumerate() {
                if Some(i) == self.this_index || !value.value {
                    continue;
                }
                if let Some(id) = value.message_id {
                    if !responsible.contains(&id) {
                        responsible.push(id);
                    }
                }
            }
        }

        Ok(DoorTransition {
            state,
            result,
            activated,
            responsible,
        })
    }
}
