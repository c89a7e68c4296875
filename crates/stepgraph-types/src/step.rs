//! Steps and tasks: a template instantiated with concrete arguments.
//!
//! A `Step` takes a private deep copy of its template at construction, so
//! editing the template afterwards (or binding it to another step) never
//! changes an existing step. The same type serves as a DAG task; DAG tasks
//! additionally use `dependencies`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::error::GraphError;
use crate::expr::{Expr, FanOut, Reference, Sequence};
use crate::io::{ArgumentValue, ArtifactSource, BoundArtifact, BoundParameter, Outputs, ValueType};
use crate::template::Template;

/// Which inputs are split across slices and which outputs are gathered back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slices {
    /// List-valued input parameters; run *i* receives element *i*.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_parameters: Vec<String>,
    /// Input artifacts split per run (collection items, or sub-paths).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_artifacts: Vec<String>,
    /// Output parameters reassembled into an ordered list. When no sliced
    /// outputs are named, every output is reassembled; otherwise the rest
    /// must agree across runs and keep a single value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_parameters: Vec<String>,
    /// Output artifacts reassembled into an ordered collection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_artifacts: Vec<String>,
    /// Slice artifacts by sub-path of one shared artifact.
    #[serde(default)]
    pub sub_path: bool,
    /// Runs packed per worker, processed sequentially.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_size: Option<usize>,
    /// Cap on simultaneously running groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
}

impl Slices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_parameter(mut self, name: impl Into<String>) -> Self {
        self.input_parameters.push(name.into());
        self
    }

    pub fn input_artifact(mut self, name: impl Into<String>) -> Self {
        self.input_artifacts.push(name.into());
        self
    }

    pub fn output_parameter(mut self, name: impl Into<String>) -> Self {
        self.output_parameters.push(name.into());
        self
    }

    pub fn output_artifact(mut self, name: impl Into<String>) -> Self {
        self.output_artifacts.push(name.into());
        self
    }

    pub fn by_sub_path(mut self) -> Self {
        self.sub_path = true;
        self
    }

    pub fn group_size(mut self, size: usize) -> Self {
        self.group_size = Some(size);
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }
}

/// When a failed step (or failed slices of a batch) lets the graph proceed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailurePolicy {
    #[serde(default)]
    pub continue_on_failed: bool,
    /// A fan-out batch succeeds once this many runs succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_num_success: Option<usize>,
    /// A fan-out batch succeeds once this share of runs succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_success_ratio: Option<f64>,
}

impl FailurePolicy {
    /// Whether a batch with `succeeded` out of `total` runs counts as success.
    pub fn batch_tolerated(&self, succeeded: usize, total: usize) -> bool {
        if succeeded == total {
            return true;
        }
        if let Some(n) = self.continue_on_num_success {
            if succeeded >= n {
                return true;
            }
        }
        if let Some(ratio) = self.continue_on_success_ratio {
            if total > 0 && (succeeded as f64) / (total as f64) >= ratio {
                return true;
            }
        }
        false
    }
}

/// A template bound inside a Steps or DAG container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    template: Box<Template>,
    pub parameters: BTreeMap<String, BoundParameter>,
    pub artifacts: BTreeMap<String, BoundArtifact>,
    /// Owned copy of the template's output declarations.
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<FanOut>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slices: Option<Slices>,
    #[serde(default)]
    pub policy: FailurePolicy,
    /// Idempotency key for looking the step up after a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Explicit DAG dependencies (inferred ones are added on prepare).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl Step {
    /// Bind `template` under `name`, taking a private copy of it.
    pub fn new(name: impl Into<String>, template: &Template) -> Self {
        let template = Box::new(template.clone());
        let parameters = template
            .inputs()
            .parameters
            .iter()
            .map(|(k, decl)| {
                (
                    k.clone(),
                    BoundParameter {
                        decl: decl.clone(),
                        value: None,
                    },
                )
            })
            .collect();
        let artifacts = template
            .inputs()
            .artifacts
            .iter()
            .map(|(k, decl)| {
                (
                    k.clone(),
                    BoundArtifact {
                        decl: decl.clone(),
                        source: None,
                    },
                )
            })
            .collect();
        let outputs = template.outputs().clone();
        Self {
            name: name.into(),
            template,
            parameters,
            artifacts,
            outputs,
            when: None,
            fan_out: None,
            slices: None,
            policy: FailurePolicy::default(),
            key: None,
            dependencies: Vec::new(),
            timeout_secs: None,
            retry: None,
        }
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Mutable access for graph preparation (nested container unification).
    pub fn template_mut(&mut self) -> &mut Template {
        &mut self.template
    }

    /// Bind parameter arguments. Literals that fit neither the declared type
    /// nor a list of it are rejected here; the exact check, which depends on
    /// slicing, and reference unification happen when the container is
    /// prepared.
    pub fn set_parameters<I, K, V>(&mut self, arguments: I) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ArgumentValue>,
    {
        for (name, value) in arguments {
            let name = name.into();
            let value = value.into();
            let bound = self
                .parameters
                .get_mut(&name)
                .ok_or_else(|| GraphError::UnknownInput {
                    template: self.template.name().to_string(),
                    name: name.clone(),
                })?;
            if let (ArgumentValue::Literal { value: literal }, Some(ty)) = (&value, &bound.decl.value_type)
            {
                // slices may be declared after binding
                if !ty.admits(literal) && !ValueType::list_of(ty.clone()).admits(literal) {
                    return Err(GraphError::TypeMismatch {
                        context: format!("{}.{}", self.name, name),
                        detail: format!("literal {literal} is not a {ty:?}"),
                    });
                }
            }
            bound.value = Some(value);
        }
        Ok(())
    }

    /// Bind artifact arguments. `None` marks the input optional and unset.
    pub fn set_artifacts<I, K>(&mut self, arguments: I) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = (K, Option<ArtifactSource>)>,
        K: Into<String>,
    {
        for (name, source) in arguments {
            let name = name.into();
            let bound = self
                .artifacts
                .get_mut(&name)
                .ok_or_else(|| GraphError::UnknownInput {
                    template: self.template.name().to_string(),
                    name: name.clone(),
                })?;
            match source {
                Some(source) => bound.source = Some(source),
                None => {
                    bound.decl.optional = true;
                    bound.source = None;
                }
            }
        }
        Ok(())
    }

    /// Chainable single-parameter bind.
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<ArgumentValue>,
    ) -> Result<Self, GraphError> {
        self.set_parameters([(name.into(), value.into())])?;
        Ok(self)
    }

    /// Chainable single-artifact bind.
    pub fn with_artifact(
        mut self,
        name: impl Into<String>,
        source: impl Into<ArtifactSource>,
    ) -> Result<Self, GraphError> {
        self.set_artifacts([(name.into(), Some(source.into()))])?;
        Ok(self)
    }

    pub fn when(mut self, guard: impl Into<Expr>) -> Self {
        self.when = Some(guard.into());
        self
    }

    pub fn with_param(mut self, items: impl Into<Expr>) -> Self {
        self.fan_out = Some(FanOut::Param {
            items: items.into(),
        });
        self
    }

    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.fan_out = Some(FanOut::Sequence { sequence });
        self
    }

    pub fn with_slices(mut self, slices: Slices) -> Self {
        self.slices = Some(slices);
        self
    }

    pub fn continue_on_failed(mut self) -> Self {
        self.policy.continue_on_failed = true;
        self
    }

    pub fn continue_on_num_success(mut self, n: usize) -> Self {
        self.policy.continue_on_num_success = Some(n);
        self
    }

    pub fn continue_on_success_ratio(mut self, ratio: f64) -> Self {
        self.policy.continue_on_success_ratio = Some(ratio);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.dependencies.push(step.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Reference to one of this step's output parameters.
    pub fn output(&self, name: impl Into<String>) -> Reference {
        Reference::step_output(self.name.clone(), name)
    }

    /// Reference to one of this step's output artifacts.
    pub fn output_artifact(&self, name: impl Into<String>) -> Reference {
        Reference::step_artifact(self.name.clone(), name)
    }

    /// Whether this step expands into several runs.
    pub fn is_fan_out(&self) -> bool {
        self.fan_out.is_some() || self.slices.is_some()
    }

    /// Whether the fan-out gathers output `name` into a list or collection.
    pub fn gathers_output(&self, name: &str) -> bool {
        if !self.is_fan_out() {
            return false;
        }
        match &self.slices {
            Some(s) if !s.output_parameters.is_empty() || !s.output_artifacts.is_empty() => {
                s.output_parameters.iter().chain(&s.output_artifacts).any(|o| o == name)
            }
            _ => true,
        }
    }

    /// Every reference read by this step's arguments, guard and fan-out.
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs: Vec<&Reference> = self
            .parameters
            .values()
            .filter_map(|b| b.value.as_ref())
            .flat_map(ArgumentValue::references)
            .collect();
        refs.extend(self.artifacts.values().filter_map(|b| match &b.source {
            Some(ArtifactSource::Reference { reference }) => Some(reference),
            _ => None,
        }));
        if let Some(guard) = &self.when {
            refs.extend(guard.references());
        }
        if let Some(fan_out) = &self.fan_out {
            refs.extend(fan_out.references());
        }
        refs
    }

    /// Steps this one reads data from (deduplicated, in first-seen order).
    pub fn data_dependencies(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for r in self.references() {
            if let Some(step) = r.step() {
                if step != self.name && !out.iter().any(|s| s == step) {
                    out.push(step.to_string());
                }
            }
        }
        out
    }
}
