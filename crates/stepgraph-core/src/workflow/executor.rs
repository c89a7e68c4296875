//! Local execution engine.
//!
//! `LocalExecutor` prepares a template tree, checks the root inputs and every
//! named step body, then runs the root with a fresh run id. Containers are
//! scheduled by [`super::container`]; leaves by [`super::script`]. Every
//! attempt goes through [`run_attempts`], which applies the step timeout and
//! the retry policy.
//!
//! # Execution flow
//!
//! 1. Clone and `prepare` the template tree (references, types, dependencies).
//! 2. Fill defaults into the root inputs and reject unknown or missing ones.
//! 3. Register a cancellation token for the run and publish `RunStarted`.
//! 4. Run the root; collect every step record into a `RunReport`.
//! 5. Publish `RunCompleted` with the terminal status.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use stepgraph_types::config::{EngineConfig, RetryConfig};
use stepgraph_types::error::GraphError;
use stepgraph_types::event::RunEvent;
use stepgraph_types::run::{RunReport, RunStatus, StepOutputs, StepPhase, StepRecord};
use stepgraph_types::template::{LoopTemplate, Template};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;

use super::binding::prepare;
use super::body::{BodyRegistry, StepError};
use super::container::{container_outputs, run_dag, run_steps};
use super::context::{BindingEnv, Iteration};
use super::definition::collect_templates;
use super::expression::Evaluator;
use super::retry::RetryHandler;
use super::script::run_script;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// GraphExecutor trait
// ---------------------------------------------------------------------------

/// Trait for graph execution engines.
///
/// Uses RPITIT for async methods. The local engine implements it; a
/// cluster-backed engine submits the same template tree instead.
pub trait GraphExecutor: Send + Sync {
    /// Run `template` to completion with `inputs` bound to its declared
    /// inputs.
    fn run(
        &self,
        template: &Template,
        inputs: StepOutputs,
    ) -> impl Future<Output = Result<RunReport, ExecutorError>> + Send;

    /// Cancel a running run: nothing new is started, running steps drain.
    fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError>;
}

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

/// State shared by every run of one executor.
pub(crate) struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) bodies: BodyRegistry,
    pub(crate) evaluator: Evaluator,
    pub(crate) events: EventBus,
}

/// Handle threaded through one run.
pub(crate) struct RunContext {
    pub(crate) run_id: Uuid,
    pub(crate) engine: Arc<Engine>,
    pub(crate) cancel: CancellationToken,
    pub(crate) records: mpsc::UnboundedSender<StepRecord>,
}

impl RunContext {
    pub(crate) fn record(&self, record: StepRecord) {
        let _ = self.records.send(record);
    }

    pub(crate) fn publish(&self, event: RunEvent) {
        self.engine.events.publish(event);
    }

    /// Private working directory of the step at `path`.
    pub(crate) fn workdir(&self, path: &str) -> std::path::PathBuf {
        self.engine
            .config
            .work_dir
            .join(self.run_id.to_string())
            .join(path)
    }
}

// ---------------------------------------------------------------------------
// LocalExecutor
// ---------------------------------------------------------------------------

/// In-process executor running step bodies on the tokio runtime.
pub struct LocalExecutor {
    engine: Arc<Engine>,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl LocalExecutor {
    pub fn new(config: EngineConfig, bodies: BodyRegistry) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self::with_event_bus(config, bodies, events)
    }

    /// Executor publishing on an existing bus.
    pub fn with_event_bus(config: EngineConfig, bodies: BodyRegistry, events: EventBus) -> Self {
        Self {
            engine: Arc::new(Engine {
                config,
                bodies,
                evaluator: Evaluator::new(),
                events,
            }),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    pub fn events(&self) -> &EventBus {
        &self.engine.events
    }

    /// Run under a caller-chosen id, so observers can subscribe first.
    pub async fn run_with_id(
        &self,
        run_id: Uuid,
        template: &Template,
        inputs: StepOutputs,
    ) -> Result<RunReport, ExecutorError> {
        let mut root = template.clone();
        prepare(&mut root)?;
        apply_default_image(&mut root, &self.engine.config.default_image);
        self.check_bodies(&root)?;
        let inputs = root_inputs(&root, inputs)?;

        let cancel = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, cancel.clone());
        let (records, mut received) = mpsc::unbounded_channel();
        let run = Arc::new(RunContext {
            run_id,
            engine: Arc::clone(&self.engine),
            cancel: cancel.clone(),
            records,
        });

        let root_name = root.name().to_string();
        run.publish(RunEvent::RunStarted {
            run_id,
            root: root_name.clone(),
        });
        tracing::info!(run_id = %run_id, root = root_name.as_str(), "starting run");

        let started_at = Utc::now();
        let clock = Instant::now();
        let retry = effective_retry(&self.engine.config, None, &root);
        let timeout = effective_timeout(&self.engine.config, None, &root);
        let (result, attempts) =
            run_attempts(&run, &root, inputs.clone(), &root_name, None, &retry, timeout, &cancel).await;

        self.cancellation_tokens.remove(&run_id);
        let duration_ms = clock.elapsed().as_millis() as u64;

        let (status, outputs, error) = match result {
            Ok(outputs) => (RunStatus::Succeeded, outputs, None),
            Err(StepError::Graph(e)) => {
                tracing::error!(run_id = %run_id, error = %e, "run aborted by a configuration error");
                run.publish(RunEvent::RunCompleted {
                    run_id,
                    root: root_name,
                    status: RunStatus::Failed,
                    duration_ms,
                });
                return Err(e.into());
            }
            Err(e) if cancel.is_cancelled() => (RunStatus::Cancelled, StepOutputs::new(), Some(e.to_string())),
            Err(e) => (RunStatus::Failed, StepOutputs::new(), Some(e.to_string())),
        };

        let mut steps = Vec::new();
        while let Ok(record) = received.try_recv() {
            steps.push(record);
        }
        let phase = match status {
            RunStatus::Succeeded => StepPhase::Succeeded,
            _ => StepPhase::Failed,
        };
        let finished_at = Utc::now();
        steps.push(StepRecord {
            name: root_name.clone(),
            path: root_name.clone(),
            template: root_name.clone(),
            key: None,
            phase,
            inputs,
            outputs: outputs.clone(),
            error: error.clone(),
            attempts,
            slice_index: None,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
        });

        run.publish(RunEvent::RunCompleted {
            run_id,
            root: root_name.clone(),
            status,
            duration_ms,
        });
        tracing::info!(
            run_id = %run_id,
            root = root_name.as_str(),
            status = ?status,
            duration_ms,
            steps = steps.len(),
            "run finished"
        );

        Ok(RunReport {
            run_id,
            root: root_name,
            status,
            error,
            outputs,
            steps,
            started_at,
            finished_at: Some(finished_at),
        })
    }

    /// Every script template must name a registered body.
    fn check_bodies(&self, root: &Template) -> Result<(), ExecutorError> {
        for template in collect_templates(root)? {
            if let Template::Script(script) = template {
                if !self.engine.bodies.contains(&script.body) {
                    return Err(ExecutorError::UnknownBody(script.body.clone()));
                }
            }
        }
        Ok(())
    }
}

impl GraphExecutor for LocalExecutor {
    async fn run(&self, template: &Template, inputs: StepOutputs) -> Result<RunReport, ExecutorError> {
        self.run_with_id(Uuid::now_v7(), template, inputs).await
    }

    fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let token = self
            .cancellation_tokens
            .get(&run_id)
            .ok_or(ExecutorError::RunNotFound(run_id))?;
        token.cancel();
        tracing::info!(run_id = %run_id, "run cancelled");
        Ok(())
    }
}

/// Record `image` on every script template that names none.
fn apply_default_image(template: &mut Template, image: &str) {
    match template {
        Template::Script(script) => {
            if script.image.is_none() {
                script.image = Some(image.to_string());
            }
        }
        Template::Steps(steps) => {
            for layer in steps.layers_mut() {
                for step in layer.iter_mut() {
                    apply_default_image(step.template_mut(), image);
                }
            }
        }
        Template::Dag(dag) => {
            for task in dag.tasks_mut() {
                apply_default_image(task.template_mut(), image);
            }
        }
        Template::Loop(lp) => apply_default_image(&mut lp.body, image),
    }
}

/// Root inputs with defaults filled in, checked against the declaration.
fn root_inputs(template: &Template, supplied: StepOutputs) -> Result<StepOutputs, ExecutorError> {
    let declared = template.inputs();
    let unknown = supplied
        .parameters
        .keys()
        .find(|k| !declared.parameters.contains_key(*k))
        .or_else(|| supplied.artifacts.keys().find(|k| !declared.artifacts.contains_key(*k)));
    if let Some(name) = unknown {
        return Err(GraphError::UnknownInput {
            template: template.name().to_string(),
            name: name.clone(),
        }
        .into());
    }

    let mut inputs = supplied;
    for (name, decl) in &declared.parameters {
        if let Some(value) = inputs.parameters.get(name) {
            if let Some(ty) = &decl.value_type {
                if !ty.admits(value) {
                    return Err(GraphError::TypeMismatch {
                        context: format!("input '{name}' of '{}'", template.name()),
                        detail: format!("{value} is not {ty:?}"),
                    }
                    .into());
                }
            }
            continue;
        }
        let Some(default) = &decl.default else {
            return Err(ExecutorError::MissingInput {
                template: template.name().to_string(),
                name: name.clone(),
            });
        };
        inputs.parameters.insert(name.clone(), default.clone());
    }
    for (name, decl) in &declared.artifacts {
        if !decl.optional && !inputs.artifacts.contains_key(name) {
            return Err(ExecutorError::MissingInput {
                template: template.name().to_string(),
                name: name.clone(),
            });
        }
    }
    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// Step retry policy, then the template's, then the engine default.
pub(crate) fn effective_retry(config: &EngineConfig, step: Option<&RetryConfig>, template: &Template) -> RetryConfig {
    step.or(template.retry()).unwrap_or(&config.retry).clone()
}

/// Step timeout, then the template's; the engine default applies to leaves.
pub(crate) fn effective_timeout(config: &EngineConfig, step: Option<u64>, template: &Template) -> Option<u64> {
    step.or(template.timeout_secs()).or(match template {
        Template::Script(_) => config.step_timeout_secs,
        _ => None,
    })
}

/// Run `template` until it succeeds, fails for good or `abort` fires
/// between attempts. Returns the result and the number of attempts made.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_attempts(
    run: &Arc<RunContext>,
    template: &Template,
    inputs: StepOutputs,
    path: &str,
    slice_index: Option<usize>,
    retry: &RetryConfig,
    timeout: Option<u64>,
    abort: &CancellationToken,
) -> (Result<StepOutputs, StepError>, u32) {
    let mut attempt = 1;
    loop {
        let execution = execute_template(run, template, inputs.clone(), path, slice_index, attempt);
        let result = match timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), execution)
                .await
                .unwrap_or_else(|_| Err(StepError::Timeout(secs))),
            None => execution.await,
        };
        let error = match result {
            Ok(outputs) => return (Ok(outputs), attempt),
            Err(e) => e,
        };
        if !RetryHandler::should_retry(retry, attempt, &error, run.engine.config.timeout_is_transient) {
            return (Err(error), attempt);
        }

        let delay = RetryHandler::delay(retry, attempt);
        tracing::warn!(
            run_id = %run.run_id,
            step = path,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying step"
        );
        run.publish(RunEvent::StepRetrying {
            run_id: run.run_id,
            path: path.to_string(),
            attempt,
            error: error.to_string(),
            delay_ms: delay.as_millis() as u64,
        });
        tokio::select! {
            _ = abort.cancelled() => return (Err(StepError::Cancelled), attempt),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// One attempt of any template kind.
pub(crate) fn execute_template<'a>(
    run: &'a Arc<RunContext>,
    template: &'a Template,
    inputs: StepOutputs,
    path: &'a str,
    slice_index: Option<usize>,
    attempt: u32,
) -> BoxFuture<'a, Result<StepOutputs, StepError>> {
    Box::pin(async move {
        match template {
            Template::Script(script) => run_script(run, script, inputs, path, slice_index, attempt).await,
            Template::Steps(steps) => run_steps(run, steps, inputs, path).await,
            Template::Dag(dag) => run_dag(run, dag, inputs, path).await,
            Template::Loop(lp) => run_loop(run, lp, inputs, path).await,
        }
    })
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Run the loop body until `until` holds. The body always runs at least
/// once; hitting `max_iterations` first is a fatal error.
async fn run_loop(
    run: &Arc<RunContext>,
    lp: &LoopTemplate,
    inputs: StepOutputs,
    path: &str,
) -> Result<StepOutputs, StepError> {
    let evaluator = &run.engine.evaluator;
    let body = lp.body.as_ref();
    let retry = effective_retry(&run.engine.config, None, body);
    let timeout = effective_timeout(&run.engine.config, None, body);
    let mut current = inputs;

    for index in 0..lp.max_iterations {
        if run.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let iteration_path = format!("{path}/{index}");
        let started_at = Utc::now();
        let (result, attempts) = run_attempts(
            run,
            body,
            current.clone(),
            &iteration_path,
            None,
            &retry,
            timeout,
            &run.cancel,
        )
        .await;
        run.record(StepRecord {
            name: body.name().to_string(),
            path: iteration_path.clone(),
            template: body.name().to_string(),
            key: None,
            phase: if result.is_ok() { StepPhase::Succeeded } else { StepPhase::Failed },
            inputs: current.clone(),
            outputs: result.as_ref().cloned().unwrap_or_default(),
            error: result.as_ref().err().map(ToString::to_string),
            attempts,
            slice_index: None,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        });
        let outputs = result?;

        let iteration = Iteration { index, outputs };
        let env = BindingEnv::new(current.clone());
        let scope = env.scope().with_iteration(&iteration);
        let done = evaluator
            .evaluate_bool(&lp.until, &scope)
            .map_err(|e| StepError::fatal(format!("loop '{}' exit condition: {e}", lp.name)))?;
        tracing::debug!(run_id = %run.run_id, step = path, iteration = index, done, "loop iteration finished");
        if done {
            return container_outputs(evaluator, &lp.name, &lp.outputs, &scope);
        }

        let mut next = current.clone();
        for (name, expr) in &lp.carry {
            let carried = if lp.inputs.artifacts.contains_key(name) {
                evaluator
                    .evaluate_artifact(expr, &scope)
                    .map(|handle| {
                        next.artifacts.insert(name.clone(), handle);
                    })
            } else {
                evaluator.evaluate(expr, &scope).map(|value| {
                    next.parameters.insert(name.clone(), value);
                })
            };
            carried.map_err(|e| StepError::fatal(format!("loop '{}' carry '{name}': {e}", lp.name)))?;
        }
        current = next;
    }

    Err(StepError::fatal(format!(
        "loop '{}' did not finish within {} iterations",
        lp.name, lp.max_iterations
    )))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that reject a run before or instead of producing a report.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("template '{template}' requires input '{name}'")]
    MissingInput { template: String, name: String },

    #[error("no step body registered under '{0}'")]
    UnknownBody(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
