//! Templates: leaf scripts and the composite Steps / DAG / Loop kinds.
//!
//! Composite templates own their steps; a step owns a private copy of the
//! template it instantiates, so the whole graph is a plain tree of values that
//! can be cloned, serialized and inspected without shared mutable state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::error::GraphError;
use crate::expr::Expr;
use crate::io::{Inputs, Outputs};
use crate::step::Step;

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Any template kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Template {
    Script(ScriptTemplate),
    Steps(Steps),
    Dag(Dag),
    Loop(LoopTemplate),
}

impl Template {
    pub fn name(&self) -> &str {
        match self {
            Template::Script(t) => &t.name,
            Template::Steps(t) => &t.name,
            Template::Dag(t) => &t.name,
            Template::Loop(t) => &t.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Template::Script(_) => "script",
            Template::Steps(_) => "steps",
            Template::Dag(_) => "dag",
            Template::Loop(_) => "loop",
        }
    }

    pub fn inputs(&self) -> &Inputs {
        match self {
            Template::Script(t) => &t.inputs,
            Template::Steps(t) => &t.inputs,
            Template::Dag(t) => &t.inputs,
            Template::Loop(t) => &t.inputs,
        }
    }

    pub fn inputs_mut(&mut self) -> &mut Inputs {
        match self {
            Template::Script(t) => &mut t.inputs,
            Template::Steps(t) => &mut t.inputs,
            Template::Dag(t) => &mut t.inputs,
            Template::Loop(t) => &mut t.inputs,
        }
    }

    pub fn outputs(&self) -> &Outputs {
        match self {
            Template::Script(t) => &t.outputs,
            Template::Steps(t) => &t.outputs,
            Template::Dag(t) => &t.outputs,
            Template::Loop(t) => &t.outputs,
        }
    }

    pub fn outputs_mut(&mut self) -> &mut Outputs {
        match self {
            Template::Script(t) => &mut t.outputs,
            Template::Steps(t) => &mut t.outputs,
            Template::Dag(t) => &mut t.outputs,
            Template::Loop(t) => &mut t.outputs,
        }
    }

    /// Whether this template contains other steps.
    pub fn is_container(&self) -> bool {
        !matches!(self, Template::Script(_))
    }

    /// Direct child steps (layer order for Steps, insertion order for DAG).
    pub fn child_steps(&self) -> Vec<&Step> {
        match self {
            Template::Script(_) | Template::Loop(_) => Vec::new(),
            Template::Steps(t) => t.layers.iter().flatten().collect(),
            Template::Dag(t) => t.tasks.iter().collect(),
        }
    }

    /// Templates nested directly under this one.
    pub fn child_templates(&self) -> Vec<&Template> {
        match self {
            Template::Loop(t) => vec![t.body.as_ref()],
            other => other.child_steps().into_iter().map(Step::template).collect(),
        }
    }

    pub fn timeout_secs(&self) -> Option<u64> {
        match self {
            Template::Script(t) => t.timeout_secs,
            _ => None,
        }
    }

    pub fn retry(&self) -> Option<&RetryConfig> {
        match self {
            Template::Script(t) => t.retry.as_ref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptTemplate
// ---------------------------------------------------------------------------

/// Leaf template: one unit of user work, run by a registered step body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptTemplate {
    pub name: String,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub outputs: Outputs,
    /// Name of the body in the engine's registry.
    pub body: String,
    /// Image for cluster adapters; defaults from `EngineConfig::default_image`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl ScriptTemplate {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Inputs::default(),
            outputs: Outputs::default(),
            body: body.into(),
            image: None,
            timeout_secs: None,
            retry: None,
        }
    }
}

impl From<ScriptTemplate> for Template {
    fn from(t: ScriptTemplate) -> Self {
        Template::Script(t)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One layer of concurrently running steps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Layer(pub Vec<Step>);

impl From<Step> for Layer {
    fn from(step: Step) -> Self {
        Layer(vec![step])
    }
}

impl From<Vec<Step>> for Layer {
    fn from(steps: Vec<Step>) -> Self {
        Layer(steps)
    }
}

/// Composite template of ordered layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Steps {
    pub name: String,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default)]
    layers: Vec<Vec<Step>>,
    /// Cap on concurrently running steps within one layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

impl Steps {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Inputs::default(),
            outputs: Outputs::default(),
            layers: Vec::new(),
            parallelism: None,
        }
    }

    /// Append a layer; a bare step becomes a singleton layer.
    pub fn add(&mut self, layer: impl Into<Layer>) -> Result<(), GraphError> {
        let Layer(steps) = layer.into();
        for (i, step) in steps.iter().enumerate() {
            let clash = self.layers.iter().flatten().any(|s| s.name == step.name)
                || steps[..i].iter().any(|s| s.name == step.name);
            if clash {
                return Err(GraphError::DuplicateStep {
                    container: self.name.clone(),
                    step: step.name.clone(),
                });
            }
        }
        self.layers.push(steps);
        Ok(())
    }

    pub fn layers(&self) -> &[Vec<Step>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Vec<Step>] {
        &mut self.layers
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.layers.iter().flatten().find(|s| s.name == name)
    }

    /// Index of the layer holding `name`.
    pub fn layer_of(&self, name: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.iter().any(|s| s.name == name))
    }
}

impl From<Steps> for Template {
    fn from(t: Steps) -> Self {
        Template::Steps(t)
    }
}

// ---------------------------------------------------------------------------
// Dag
// ---------------------------------------------------------------------------

/// Composite template of tasks with explicit and inferred dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub name: String,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default)]
    tasks: Vec<Step>,
    /// Cap on concurrently running tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

impl Dag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Inputs::default(),
            outputs: Outputs::default(),
            tasks: Vec::new(),
            parallelism: None,
        }
    }

    pub fn add(&mut self, task: Step) -> Result<(), GraphError> {
        if self.tasks.iter().any(|t| t.name == task.name) {
            return Err(GraphError::DuplicateStep {
                container: self.name.clone(),
                step: task.name,
            });
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn tasks(&self) -> &[Step] {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut [Step] {
        &mut self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&Step> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

impl From<Dag> for Template {
    fn from(t: Dag) -> Self {
        Template::Dag(t)
    }
}

// ---------------------------------------------------------------------------
// LoopTemplate
// ---------------------------------------------------------------------------

/// Bounded loop: runs `body` repeatedly, feeding `carry` bindings from each
/// iteration into the next, until `until` holds or `max_iterations` is hit.
///
/// Iteration 0 receives the loop's own inputs. `carry` maps a body input name
/// to an expression over `Reference::iteration_output`, `Reference::loop_index`
/// and the loop inputs; inputs not carried keep their previous value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopTemplate {
    pub name: String,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub outputs: Outputs,
    pub body: Box<Template>,
    #[serde(default)]
    pub carry: BTreeMap<String, Expr>,
    pub until: Expr,
    pub max_iterations: u32,
}

impl LoopTemplate {
    /// Loop over `body`; inputs mirror the body's inputs and outputs mirror
    /// the last iteration's outputs.
    pub fn new(name: impl Into<String>, body: &Template, until: Expr, max_iterations: u32) -> Self {
        let inputs = body.inputs().clone();
        let mut outputs = Outputs::default();
        for (k, decl) in &body.outputs().parameters {
            let mut out =
                crate::io::OutputParameter::from_reference(crate::expr::Reference::iteration_output(k.clone()));
            out.value_type = decl.value_type.clone();
            outputs.parameter(k.clone(), out);
        }
        for k in body.outputs().artifacts.keys() {
            outputs.artifact(
                k.clone(),
                crate::io::OutputArtifact::from_reference(crate::expr::Reference::iteration_artifact(
                    k.clone(),
                )),
            );
        }
        Self {
            name: name.into(),
            inputs,
            outputs,
            body: Box::new(body.clone()),
            carry: BTreeMap::new(),
            until,
            max_iterations,
        }
    }

    pub fn carry(mut self, input: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.carry.insert(input.into(), value.into());
        self
    }
}

impl From<LoopTemplate> for Template {
    fn from(t: LoopTemplate) -> Self {
        Template::Loop(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Reference;
    use crate::io::{InputParameter, ValueType};

    fn leaf(name: &str) -> Template {
        let mut t = ScriptTemplate::new(name, name);
        t.inputs.parameter("x", InputParameter::typed(ValueType::Int));
        t.outputs.returned("y", Some(ValueType::Int));
        t.into()
    }

    #[test]
    fn test_steps_add_normalizes_bare_step() {
        let mut steps = Steps::new("pipeline");
        steps.add(Step::new("a", &leaf("inc"))).unwrap();
        steps
            .add(vec![Step::new("b", &leaf("inc")), Step::new("c", &leaf("inc"))])
            .unwrap();
        assert_eq!(steps.layers().len(), 2);
        assert_eq!(steps.layers()[0].len(), 1);
        assert_eq!(steps.layer_of("c"), Some(1));
    }

    #[test]
    fn test_steps_rejects_duplicate_names() {
        let mut steps = Steps::new("pipeline");
        steps.add(Step::new("a", &leaf("inc"))).unwrap();
        let err = steps.add(Step::new("a", &leaf("inc"))).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateStep { .. }));
        let err = steps
            .add(vec![Step::new("d", &leaf("inc")), Step::new("d", &leaf("inc"))])
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateStep { .. }));
    }

    #[test]
    fn test_dag_rejects_duplicate_task() {
        let mut dag = Dag::new("flow");
        dag.add(Step::new("a", &leaf("inc"))).unwrap();
        assert!(dag.add(Step::new("a", &leaf("inc"))).is_err());
        assert_eq!(dag.tasks().len(), 1);
    }

    #[test]
    fn test_loop_mirrors_body_signature() {
        let body = leaf("inc");
        let lp = LoopTemplate::new("count-up", &body, Reference::iteration_output("y").greater_eq(3), 10)
            .carry("x", Reference::iteration_output("y"));
        assert!(lp.inputs.parameters.contains_key("x"));
        assert!(lp.outputs.parameters.contains_key("y"));
        assert_eq!(lp.carry.len(), 1);
        let t: Template = lp.into();
        assert_eq!(t.child_templates().len(), 1);
        assert_eq!(t.kind(), "loop");
    }

    #[test]
    fn test_template_serde_roundtrip() {
        let mut dag = Dag::new("flow");
        dag.add(Step::new("a", &leaf("inc"))).unwrap();
        let t: Template = dag.into();
        let json = serde_json::to_string(&t).unwrap();
        let back: Template = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
