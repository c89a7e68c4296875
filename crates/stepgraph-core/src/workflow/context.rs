//! Binding environment for one container execution.
//!
//! `BindingEnv` maps `(step, direction, class, name)` to resolved values. It
//! is append-only: a binding is written exactly once, when its producer
//! finishes, and only by the container's scheduling loop. Workers never see
//! the environment; they receive already-resolved inputs.
//!
//! A [`Scope`] layers the per-run extras (fan-out item, loop iteration) over
//! a borrowed environment and is what reference resolution and expression
//! evaluation read from.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use stepgraph_types::artifact::ArtifactHandle;
use stepgraph_types::expr::{Direction, IoClass, RefScope, Reference};
use stepgraph_types::run::{StepOutputs, StepPhase};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Serialized size above which a parameter value is logged as oversized.
pub const LARGE_VALUE_BYTES: usize = 1_048_576;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("'{0}' is already bound")]
    AlreadyBound(String),
}

/// Why a reference could not be resolved.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    /// The producer finished without succeeding; readers are skipped.
    #[error("step '{step}' finished {phase:?}; {reference} is unavailable")]
    Unavailable {
        step: String,
        phase: StepPhase,
        reference: String,
    },

    /// The producer has not finished yet.
    #[error("{0} is not bound yet")]
    NotReady(String),

    /// Nothing of that name exists in scope.
    #[error("{0} is not defined")]
    Missing(String),
}

impl ResolveError {
    /// Whether the reader should be skipped rather than failed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ResolveError::Unavailable { .. })
    }
}

// ---------------------------------------------------------------------------
// BindingEnv
// ---------------------------------------------------------------------------

/// Address of one binding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BindingKey {
    pub step: String,
    pub direction: Direction,
    pub class: IoClass,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Parameter(Value),
    Artifact(ArtifactHandle),
}

/// Append-only map of resolved step inputs and outputs in one container.
#[derive(Debug, Clone, Default)]
pub struct BindingEnv {
    /// The container's own resolved inputs.
    inputs: StepOutputs,
    entries: BTreeMap<BindingKey, Binding>,
    phases: BTreeMap<String, StepPhase>,
}

impl BindingEnv {
    pub fn new(inputs: StepOutputs) -> Self {
        Self {
            inputs,
            ..Self::default()
        }
    }

    pub fn inputs(&self) -> &StepOutputs {
        &self.inputs
    }

    /// Terminal phase of a finished step.
    pub fn phase(&self, step: &str) -> Option<StepPhase> {
        self.phases.get(step).copied()
    }

    pub fn get(&self, key: &BindingKey) -> Option<&Binding> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a finished step. Inputs and outputs are only stored for
    /// `Succeeded` steps; other phases just mark the step finished.
    pub fn record(
        &mut self,
        step: &str,
        phase: StepPhase,
        inputs: &StepOutputs,
        outputs: &StepOutputs,
    ) -> Result<(), ContextError> {
        if self.phases.contains_key(step) {
            return Err(ContextError::AlreadyBound(step.to_string()));
        }
        self.phases.insert(step.to_string(), phase);
        if phase != StepPhase::Succeeded {
            return Ok(());
        }
        for (direction, values) in [(Direction::Inputs, inputs), (Direction::Outputs, outputs)] {
            for (name, value) in &values.parameters {
                let size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
                if size > LARGE_VALUE_BYTES {
                    tracing::warn!(step, name = name.as_str(), size, "large parameter value");
                }
                self.insert(step, direction, IoClass::Parameter, name, Binding::Parameter(value.clone()))?;
            }
            for (name, handle) in &values.artifacts {
                self.insert(step, direction, IoClass::Artifact, name, Binding::Artifact(handle.clone()))?;
            }
        }
        Ok(())
    }

    fn insert(
        &mut self,
        step: &str,
        direction: Direction,
        class: IoClass,
        name: &str,
        binding: Binding,
    ) -> Result<(), ContextError> {
        let key = BindingKey {
            step: step.to_string(),
            direction,
            class,
            name: name.to_string(),
        };
        if self.entries.contains_key(&key) {
            return Err(ContextError::AlreadyBound(format!("{step}.{name}")));
        }
        self.entries.insert(key, binding);
        Ok(())
    }

    /// Scope over this environment with no item or iteration.
    pub fn scope(&self) -> Scope<'_> {
        Scope {
            env: self,
            item: None,
            iteration: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Outputs of one finished loop iteration.
#[derive(Debug, Clone, Default)]
pub struct Iteration {
    pub index: u32,
    pub outputs: StepOutputs,
}

/// Read view used by reference resolution and expression evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    env: &'a BindingEnv,
    item: Option<&'a Value>,
    iteration: Option<&'a Iteration>,
}

impl<'a> Scope<'a> {
    pub fn with_item(mut self, item: &'a Value) -> Self {
        self.item = Some(item);
        self
    }

    pub fn with_iteration(mut self, iteration: &'a Iteration) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn env(&self) -> &'a BindingEnv {
        self.env
    }

    /// Resolve a parameter reference to its value.
    pub fn parameter(&self, reference: &Reference) -> Result<Value, ResolveError> {
        let missing = || ResolveError::Missing(reference.to_string());
        match &reference.scope {
            RefScope::Step { step } => match self.lookup(step, reference)? {
                Binding::Parameter(v) => Ok(v.clone()),
                Binding::Artifact(_) => Err(missing()),
            },
            RefScope::Container => self
                .env
                .inputs
                .parameters
                .get(&reference.name)
                .cloned()
                .ok_or_else(missing),
            RefScope::Item => {
                let item = self.item.ok_or_else(missing)?;
                if reference.name.is_empty() {
                    Ok(item.clone())
                } else {
                    item.get(&reference.name).cloned().ok_or_else(missing)
                }
            }
            RefScope::Iteration => self
                .iteration
                .and_then(|it| it.outputs.parameters.get(&reference.name))
                .cloned()
                .ok_or_else(missing),
            RefScope::LoopIndex => self
                .iteration
                .map(|it| Value::from(it.index))
                .ok_or_else(missing),
        }
    }

    /// Resolve an artifact reference to its handle.
    pub fn artifact(&self, reference: &Reference) -> Result<ArtifactHandle, ResolveError> {
        let missing = || ResolveError::Missing(reference.to_string());
        match &reference.scope {
            RefScope::Step { step } => match self.lookup(step, reference)? {
                Binding::Artifact(h) => Ok(h.clone()),
                Binding::Parameter(_) => Err(missing()),
            },
            RefScope::Container => self
                .env
                .inputs
                .artifacts
                .get(&reference.name)
                .cloned()
                .ok_or_else(missing),
            RefScope::Iteration => self
                .iteration
                .and_then(|it| it.outputs.artifacts.get(&reference.name))
                .cloned()
                .ok_or_else(missing),
            RefScope::Item | RefScope::LoopIndex => Err(missing()),
        }
    }

    fn lookup(&self, step: &str, reference: &Reference) -> Result<&'a Binding, ResolveError> {
        match self.env.phase(step) {
            None => Err(ResolveError::NotReady(reference.to_string())),
            Some(StepPhase::Succeeded) => {
                let key = BindingKey {
                    step: step.to_string(),
                    direction: reference.direction,
                    class: reference.class,
                    name: reference.name.clone(),
                };
                self.env
                    .entries
                    .get(&key)
                    .ok_or_else(|| ResolveError::Missing(reference.to_string()))
            }
            Some(phase) => Err(ResolveError::Unavailable {
                step: step.to_string(),
                phase,
                reference: reference.to_string(),
            }),
        }
    }

    /// JSON object JEXL expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "steps": { "<step>": { "phase": "...", "inputs": {...}, "outputs": {...} } },
    ///   "inputs": { "parameters": {...}, "artifacts": {...} },
    ///   "item": <current item or null>,
    ///   "iteration": { "index": 0, "outputs": {...} }
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let mut steps = Map::new();
        for (step, phase) in &self.env.phases {
            steps.insert(
                step.clone(),
                json!({
                    "phase": phase,
                    "inputs": { "parameters": {}, "artifacts": {} },
                    "outputs": { "parameters": {}, "artifacts": {} },
                }),
            );
        }
        for (key, binding) in &self.env.entries {
            let Some(entry) = steps.get_mut(&key.step) else {
                continue;
            };
            let direction = match key.direction {
                Direction::Inputs => "inputs",
                Direction::Outputs => "outputs",
            };
            let (class, value) = match binding {
                Binding::Parameter(v) => ("parameters", v.clone()),
                Binding::Artifact(h) => ("artifacts", artifact_json(h)),
            };
            entry[direction][class][key.name.as_str()] = value;
        }

        let iteration = self.iteration.map_or(Value::Null, |it| {
            json!({
                "index": it.index,
                "outputs": outputs_json(&it.outputs),
            })
        });

        json!({
            "steps": steps,
            "inputs": outputs_json(&self.env.inputs),
            "item": self.item.cloned().unwrap_or(Value::Null),
            "iteration": iteration,
        })
    }
}

fn artifact_json(handle: &ArtifactHandle) -> Value {
    json!(handle.locator.display_path())
}

fn outputs_json(values: &StepOutputs) -> Value {
    let artifacts: Map<String, Value> = values
        .artifacts
        .iter()
        .map(|(k, h)| (k.clone(), artifact_json(h)))
        .collect();
    json!({
        "parameters": values.parameters,
        "artifacts": artifacts,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_a() -> BindingEnv {
        let mut env = BindingEnv::new(StepOutputs::new().with_parameter("x", json!(1)));
        env.record(
            "a",
            StepPhase::Succeeded,
            &StepOutputs::new().with_parameter("msg", json!(1)),
            &StepOutputs::new()
                .with_parameter("msg", json!(2))
                .with_artifact("log", ArtifactHandle::local("/tmp/log")),
        )
        .unwrap();
        env
    }

    #[test]
    fn test_resolve_step_output_and_input() {
        let env = env_with_a();
        let scope = env.scope();
        assert_eq!(scope.parameter(&Reference::step_output("a", "msg")).unwrap(), json!(2));
        assert_eq!(scope.parameter(&Reference::step_input("a", "msg")).unwrap(), json!(1));
        assert_eq!(scope.parameter(&Reference::input("x")).unwrap(), json!(1));
        let handle = scope.artifact(&Reference::step_artifact("a", "log")).unwrap();
        assert_eq!(handle.local_path().unwrap().to_str(), Some("/tmp/log"));
    }

    #[test]
    fn test_record_is_append_only() {
        let mut env = env_with_a();
        let err = env
            .record("a", StepPhase::Succeeded, &StepOutputs::new(), &StepOutputs::new())
            .unwrap_err();
        assert_eq!(err, ContextError::AlreadyBound("a".to_string()));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_unavailable_after_skip_or_failure() {
        let mut env = BindingEnv::default();
        env.record("gate", StepPhase::Skipped, &StepOutputs::new(), &StepOutputs::new())
            .unwrap();
        let err = env
            .scope()
            .parameter(&Reference::step_output("gate", "ok"))
            .unwrap_err();
        assert!(err.is_unavailable());

        let err = env
            .scope()
            .parameter(&Reference::step_output("later", "ok"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotReady(_)));
    }

    #[test]
    fn test_missing_output_name() {
        let env = env_with_a();
        let err = env
            .scope()
            .parameter(&Reference::step_output("a", "nope"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Missing(_)));
    }

    #[test]
    fn test_item_and_iteration_scope() {
        let env = BindingEnv::default();
        let item = json!({"file": "f1.txt"});
        let iteration = Iteration {
            index: 3,
            outputs: StepOutputs::new().with_parameter("y", json!(9)),
        };
        let scope = env.scope().with_item(&item).with_iteration(&iteration);
        assert_eq!(scope.parameter(&Reference::item()).unwrap(), item);
        assert_eq!(scope.parameter(&Reference::item_field("file")).unwrap(), json!("f1.txt"));
        assert_eq!(scope.parameter(&Reference::iteration_output("y")).unwrap(), json!(9));
        assert_eq!(scope.parameter(&Reference::loop_index()).unwrap(), json!(3));
    }

    #[test]
    fn test_expression_context_shape() {
        let env = env_with_a();
        let ctx = env.scope().to_expression_context();
        assert_eq!(ctx["steps"]["a"]["outputs"]["parameters"]["msg"], json!(2));
        assert_eq!(ctx["steps"]["a"]["inputs"]["parameters"]["msg"], json!(1));
        assert_eq!(ctx["steps"]["a"]["outputs"]["artifacts"]["log"], json!("/tmp/log"));
        assert_eq!(ctx["steps"]["a"]["phase"], json!("succeeded"));
        assert_eq!(ctx["inputs"]["parameters"]["x"], json!(1));
        assert!(ctx["item"].is_null());
    }
}
