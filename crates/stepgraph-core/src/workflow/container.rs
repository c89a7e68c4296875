//! Scheduling loop for Steps and DAG containers.
//!
//! A [`Container`] owns the binding environment of one container execution
//! and is the only writer to it. Runnable steps are resolved against the
//! environment, expanded into jobs (one per fan-out slice, packed into
//! groups) and spawned on a `JoinSet` bounded by a semaphore. Completions
//! are folded back into the environment one at a time, so a consumer is
//! only resolved after its producer's outputs are recorded.
//!
//! An untolerated failure halts the container: nothing new is submitted,
//! running jobs drain, and every step that never started is recorded as
//! skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use stepgraph_types::artifact::ArtifactHandle;
use stepgraph_types::error::GraphError;
use stepgraph_types::event::RunEvent;
use stepgraph_types::expr::FanOut;
use stepgraph_types::io::{ArgumentValue, ArtifactSource, OutputSource, Outputs};
use stepgraph_types::run::{StepOutputs, StepPhase, StepRecord};
use stepgraph_types::step::Step;
use stepgraph_types::template::{Dag, Steps};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::body::StepError;
use super::context::{BindingEnv, ResolveError, Scope};
use super::executor::{RunContext, effective_retry, effective_timeout, run_attempts};
use super::expression::{Evaluator, ExpressionError};
use super::slices::{SliceCatalog, driving_items, groups, slice_inputs};

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run a Steps container: one layer at a time, each layer fully drained
/// before the next is resolved.
pub(crate) async fn run_steps(
    run: &Arc<RunContext>,
    steps: &Steps,
    inputs: StepOutputs,
    path: &str,
) -> Result<StepOutputs, StepError> {
    let mut container = Container::new(run, &steps.name, path, steps.parallelism, inputs);
    for (index, layer) in steps.layers().iter().enumerate() {
        if container.halted() {
            let reason = container.halt_reason();
            for step in layer {
                container.skip(step, reason.clone());
            }
            continue;
        }
        tracing::debug!(
            run_id = %run.run_id,
            container = path,
            layer = index,
            steps = layer.len(),
            "scheduling layer"
        );
        let planned: Vec<(Arc<Step>, Plan)> = layer
            .iter()
            .map(|step| (Arc::new(step.clone()), container.plan(step)))
            .collect();
        let jobs: usize = planned.iter().map(|(step, plan)| plan.group_count(step)).sum();
        container.set_capacity(jobs);
        for (step, plan) in planned {
            container.launch(step, plan);
        }
        container.drain().await;
    }
    container.finish(&steps.outputs)
}

/// Run a DAG container: a task becomes runnable as soon as all of its
/// dependencies have finished.
pub(crate) async fn run_dag(
    run: &Arc<RunContext>,
    dag: &Dag,
    inputs: StepOutputs,
    path: &str,
) -> Result<StepOutputs, StepError> {
    let mut container = Container::new(run, &dag.name, path, dag.parallelism, inputs);
    container.set_capacity(Semaphore::MAX_PERMITS);
    let mut waiting: Vec<&Step> = dag.tasks().iter().collect();

    loop {
        if !container.halted() {
            container.resolve(&mut waiting);
        }
        if !container.next().await {
            break;
        }
    }

    if container.halted() {
        let reason = container.halt_reason();
        for task in waiting {
            container.skip(task, reason.clone());
        }
    } else if !waiting.is_empty() {
        return Err(GraphError::Unreachable {
            container: dag.name.clone(),
            pending: waiting.iter().map(|t| t.name.clone()).collect(),
        }
        .into());
    }
    container.finish(&dag.outputs)
}

/// Outputs of a container (or loop) evaluated over its environment.
///
/// An output whose producer did not succeed is left out; readers of it
/// then fail to resolve.
pub(crate) fn container_outputs(
    evaluator: &Evaluator,
    container: &str,
    outputs: &Outputs,
    scope: &Scope<'_>,
) -> Result<StepOutputs, StepError> {
    let mut out = StepOutputs::new();
    for (name, decl) in &outputs.parameters {
        let value = match &decl.source {
            OutputSource::Reference { reference } => scope.parameter(reference).map_err(ExpressionError::from),
            OutputSource::Expression { expr } => evaluator.evaluate(expr, scope),
            OutputSource::Path { .. } => return Err(path_output(container, name)),
        };
        match value {
            Ok(v) => {
                out.parameters.insert(name.clone(), v);
            }
            Err(e) if e.is_unavailable() => {
                tracing::warn!(container, output = name.as_str(), error = %e, "container output unavailable");
            }
            Err(e) => return Err(StepError::fatal(format!("output '{name}' of '{container}': {e}"))),
        }
    }
    for (name, decl) in &outputs.artifacts {
        let handle = match &decl.source {
            OutputSource::Reference { reference } => scope.artifact(reference).map_err(ExpressionError::from),
            OutputSource::Expression { expr } => evaluator.evaluate_artifact(expr, scope),
            OutputSource::Path { .. } => return Err(path_output(container, name)),
        };
        match handle {
            Ok(h) => {
                out.artifacts.insert(name.clone(), h);
            }
            Err(e) if e.is_unavailable() => {
                tracing::warn!(container, output = name.as_str(), error = %e, "container artifact unavailable");
            }
            Err(e) => return Err(StepError::fatal(format!("artifact '{name}' of '{container}': {e}"))),
        }
    }
    Ok(out)
}

fn path_output(container: &str, name: &str) -> StepError {
    StepError::Graph(GraphError::InvalidOutput {
        template: container.to_string(),
        output: name.to_string(),
        reason: "container outputs come from a reference or an expression".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Why a step's inputs could not be resolved.
enum Unresolved {
    /// An upstream step did not succeed; the step is skipped.
    Skip(String),
    Fail(String),
}

impl From<ResolveError> for Unresolved {
    fn from(e: ResolveError) -> Self {
        if e.is_unavailable() {
            Unresolved::Skip(e.to_string())
        } else {
            Unresolved::Fail(e.to_string())
        }
    }
}

impl From<ExpressionError> for Unresolved {
    fn from(e: ExpressionError) -> Self {
        if e.is_unavailable() {
            Unresolved::Skip(e.to_string())
        } else {
            Unresolved::Fail(e.to_string())
        }
    }
}

/// Inputs of one run of a step.
struct SliceRun {
    index: usize,
    inputs: StepOutputs,
}

/// What to do with a runnable step.
enum Plan {
    Skip(String),
    Fail(StepError),
    Single(StepOutputs),
    /// Fan-out runs plus the inputs shared by all of them.
    Batch { runs: Vec<SliceRun>, common: StepOutputs },
}

impl Plan {
    /// Worker groups this plan will occupy.
    fn group_count(&self, step: &Step) -> usize {
        match self {
            Plan::Skip(_) | Plan::Fail(_) => 0,
            Plan::Single(_) => 1,
            Plan::Batch { runs, .. } => {
                let group_size = step.slices.as_ref().and_then(|s| s.group_size);
                groups(runs.len(), group_size).len()
            }
        }
    }
}

/// Resolve every bound argument of `step` in `scope`.
fn resolve_inputs(evaluator: &Evaluator, step: &Step, scope: &Scope<'_>) -> Result<StepOutputs, Unresolved> {
    let mut inputs = StepOutputs::new();
    for (name, bound) in &step.parameters {
        let value = match &bound.value {
            Some(ArgumentValue::Literal { value }) => value.clone(),
            Some(ArgumentValue::Reference { reference }) => scope.parameter(reference)?,
            Some(ArgumentValue::Expression { expr }) => evaluator.evaluate(expr, scope)?,
            None => match &bound.decl.default {
                Some(value) => value.clone(),
                None => return Err(Unresolved::Fail(format!("input '{name}' has no argument and no default"))),
            },
        };
        inputs.parameters.insert(name.clone(), value);
    }
    for (name, bound) in &step.artifacts {
        let handle = match &bound.source {
            Some(ArtifactSource::Reference { reference }) => scope.artifact(reference)?,
            Some(ArtifactSource::Handle { handle }) => handle.clone(),
            Some(ArtifactSource::Raw { data }) => ArtifactHandle::raw(data.clone()),
            None if bound.decl.optional => continue,
            None => return Err(Unresolved::Fail(format!("artifact '{name}' is not bound"))),
        };
        inputs.artifacts.insert(name.clone(), handle);
    }
    Ok(inputs)
}

/// Inputs identical across every run of a batch.
fn common_inputs(runs: &[SliceRun]) -> StepOutputs {
    let Some((first, rest)) = runs.split_first() else {
        return StepOutputs::new();
    };
    let mut common = first.inputs.clone();
    common
        .parameters
        .retain(|k, v| rest.iter().all(|r| r.inputs.parameters.get(k) == Some(v)));
    common
        .artifacts
        .retain(|k, h| rest.iter().all(|r| r.inputs.artifacts.get(k) == Some(h)));
    common
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Result of one run of a step.
struct JobOutcome {
    step: String,
    path: String,
    slice_index: Option<usize>,
    inputs: StepOutputs,
    result: Result<StepOutputs, StepError>,
    /// 0 when the run never started.
    attempts: u32,
    started_at: Option<DateTime<Utc>>,
    finished_at: DateTime<Utc>,
}

fn job_path(container: &str, step: &str, slice_index: Option<usize>) -> String {
    match slice_index {
        Some(i) => format!("{container}/{step}({i})"),
        None => format!("{container}/{step}"),
    }
}

async fn run_job(
    run: &Arc<RunContext>,
    step: &Step,
    container_path: &str,
    slice: SliceRun,
    fan_out: bool,
    abort: &CancellationToken,
) -> JobOutcome {
    let slice_index = fan_out.then_some(slice.index);
    let path = job_path(container_path, &step.name, slice_index);
    let template = step.template();
    let retry = effective_retry(&run.engine.config, step.retry.as_ref(), template);
    let timeout = effective_timeout(&run.engine.config, step.timeout_secs, template);

    run.publish(RunEvent::StepStarted {
        run_id: run.run_id,
        path: path.clone(),
        template: template.name().to_string(),
        slice_index,
    });
    let started_at = Utc::now();
    let (result, attempts) = run_attempts(
        run,
        template,
        slice.inputs.clone(),
        &path,
        slice_index,
        &retry,
        timeout,
        abort,
    )
    .await;
    JobOutcome {
        step: step.name.clone(),
        path,
        slice_index,
        inputs: slice.inputs,
        result,
        attempts,
        started_at: Some(started_at),
        finished_at: Utc::now(),
    }
}

fn not_started(step: &Step, container_path: &str, slice: SliceRun, fan_out: bool) -> JobOutcome {
    let slice_index = fan_out.then_some(slice.index);
    JobOutcome {
        step: step.name.clone(),
        path: job_path(container_path, &step.name, slice_index),
        slice_index,
        inputs: slice.inputs,
        result: Err(StepError::Cancelled),
        attempts: 0,
        started_at: None,
        finished_at: Utc::now(),
    }
}

/// Progress of one step's jobs.
struct Batch {
    step: Arc<Step>,
    total: usize,
    remaining: usize,
    succeeded: usize,
    /// Present for fan-out steps.
    catalog: Option<SliceCatalog>,
    inputs: StepOutputs,
    outputs: StepOutputs,
    errors: Vec<StepError>,
    attempts: u32,
    started_at: DateTime<Utc>,
    clock: Instant,
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

struct Container<'r> {
    run: &'r Arc<RunContext>,
    name: &'r str,
    path: &'r str,
    /// Smallest of the container's and the engine's parallelism.
    cap: Option<usize>,
    env: BindingEnv,
    semaphore: Arc<Semaphore>,
    abort: CancellationToken,
    jobs: JoinSet<Vec<JobOutcome>>,
    batches: HashMap<String, Batch>,
    /// Failed steps whose policy let the graph proceed.
    tolerated: HashSet<String>,
    failure: Option<(String, StepError)>,
}

impl<'r> Container<'r> {
    fn new(
        run: &'r Arc<RunContext>,
        name: &'r str,
        path: &'r str,
        parallelism: Option<usize>,
        inputs: StepOutputs,
    ) -> Self {
        let cap = match (parallelism, run.engine.config.parallelism) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            run,
            name,
            path,
            cap,
            env: BindingEnv::new(inputs),
            semaphore: Arc::new(Semaphore::new(1)),
            abort: run.cancel.child_token(),
            jobs: JoinSet::new(),
            batches: HashMap::new(),
            tolerated: HashSet::new(),
            failure: None,
        }
    }

    /// Size the worker pool for `jobs` groups, within the parallelism cap.
    fn set_capacity(&mut self, jobs: usize) {
        let permits = self
            .cap
            .map_or(jobs, |cap| cap.min(jobs))
            .clamp(1, Semaphore::MAX_PERMITS);
        self.semaphore = Arc::new(Semaphore::new(permits));
    }

    fn halted(&self) -> bool {
        self.abort.is_cancelled()
    }

    fn halt_reason(&self) -> String {
        match &self.failure {
            Some((path, _)) => format!("not started: step '{path}' failed"),
            None => "not started: run cancelled".to_string(),
        }
    }

    fn halt(&mut self, path: &str, error: StepError) {
        if self.failure.is_none() {
            self.failure = Some((path.to_string(), error));
        }
        self.abort.cancel();
    }

    /// Launch or prune every waiting DAG task whose dependencies finished,
    /// until nothing changes.
    fn resolve(&mut self, waiting: &mut Vec<&Step>) {
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < waiting.len() {
                let task = waiting[i];
                match self.readiness(task) {
                    None => i += 1,
                    Some(Err(reason)) => {
                        waiting.remove(i);
                        self.skip(task, reason);
                        progressed = true;
                    }
                    Some(Ok(())) => {
                        waiting.remove(i);
                        let plan = self.plan(task);
                        self.launch(Arc::new(task.clone()), plan);
                        progressed = true;
                    }
                }
                if self.halted() {
                    return;
                }
            }
            if !progressed {
                return;
            }
        }
    }

    /// `None` while a dependency is unfinished; `Err` when an untolerated
    /// failed dependency prunes the task.
    fn readiness(&self, task: &Step) -> Option<Result<(), String>> {
        let mut pruned = None;
        for dep in &task.dependencies {
            match self.env.phase(dep) {
                None => return None,
                Some(StepPhase::Failed) if !self.tolerated.contains(dep) => {
                    pruned.get_or_insert_with(|| format!("dependency '{dep}' failed"));
                }
                Some(_) => {}
            }
        }
        Some(pruned.map_or(Ok(()), Err))
    }

    /// Guard, resolve and expand one runnable step.
    fn plan(&self, step: &Step) -> Plan {
        let evaluator = &self.run.engine.evaluator;
        let scope = self.env.scope();
        if let Some(guard) = &step.when {
            match evaluator.evaluate_bool(guard, &scope) {
                Ok(true) => {}
                Ok(false) => return Plan::Skip("guard evaluated to false".to_string()),
                Err(e) if e.is_unavailable() => return Plan::Skip(e.to_string()),
                Err(e) => return Plan::Fail(StepError::fatal(format!("guard: {e}"))),
            }
        }
        let planned = if step.is_fan_out() {
            self.expand(step, &scope)
        } else {
            resolve_inputs(evaluator, step, &scope).map(Plan::Single)
        };
        match planned {
            Ok(plan) => plan,
            Err(Unresolved::Skip(reason)) => Plan::Skip(reason),
            Err(Unresolved::Fail(reason)) => Plan::Fail(StepError::Fatal(reason)),
        }
    }

    fn expand(&self, step: &Step, scope: &Scope<'_>) -> Result<Plan, Unresolved> {
        let evaluator = &self.run.engine.evaluator;
        let sliced = |e: super::slices::SliceError| Unresolved::Fail(e.to_string());

        if let Some(fan_out) = &step.fan_out {
            let items = match fan_out {
                FanOut::Param { items } => evaluator.evaluate_list(items, scope)?,
                FanOut::Sequence { sequence } => evaluator.sequence(sequence, scope)?,
            };
            let total = items.len();
            let mut runs = Vec::with_capacity(total);
            for (index, item) in items.iter().enumerate() {
                let mut inputs = resolve_inputs(evaluator, step, &scope.with_item(item))?;
                if let Some(slices) = &step.slices {
                    inputs = slice_inputs(slices, &inputs, index, total, item).map_err(sliced)?;
                }
                runs.push(SliceRun { index, inputs });
            }
            let common = common_inputs(&runs);
            return Ok(Plan::Batch { runs, common });
        }

        let Some(slices) = &step.slices else {
            return resolve_inputs(evaluator, step, scope).map(Plan::Single);
        };
        let base = resolve_inputs(evaluator, step, scope)?;
        let items = driving_items(slices, &base).map_err(sliced)?;
        let total = items.len();
        let runs = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                slice_inputs(slices, &base, index, total, item).map(|inputs| SliceRun { index, inputs })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(sliced)?;
        let common = common_inputs(&runs);
        Ok(Plan::Batch { runs, common })
    }

    fn launch(&mut self, step: Arc<Step>, plan: Plan) {
        match plan {
            Plan::Skip(reason) => self.skip(&step, reason),
            Plan::Fail(error) => {
                let path = job_path(self.path, &step.name, None);
                self.finish_step(&step, &path, StepPhase::Failed, StepOutputs::new(), StepOutputs::new(), Some(&error), 0, Utc::now(), 0);
                self.settle_failure(&step, &path, error);
            }
            Plan::Single(inputs) => {
                let batch = self.new_batch(&step, 1, None, inputs.clone());
                self.batches.insert(step.name.clone(), batch);
                self.spawn_group(Arc::clone(&step), vec![SliceRun { index: 0, inputs }], false, None);
            }
            Plan::Batch { runs, common } => {
                let total = runs.len();
                let catalog = SliceCatalog::new(&step.outputs, total, |name| step.gathers_output(name));
                let batch = self.new_batch(&step, total, Some(catalog), common);
                self.batches.insert(step.name.clone(), batch);
                tracing::debug!(run_id = %self.run.run_id, step = step.name.as_str(), total, "fanning out");
                if total == 0 {
                    self.finalize(&step.name);
                    return;
                }
                let slices = step.slices.clone().unwrap_or_default();
                let pool = slices.pool_size.map(|n| Arc::new(Semaphore::new(n.max(1))));
                let mut runs = runs.into_iter();
                for range in groups(total, slices.group_size) {
                    let group: Vec<SliceRun> = runs.by_ref().take(range.len()).collect();
                    self.spawn_group(Arc::clone(&step), group, true, pool.clone());
                }
            }
        }
    }

    fn new_batch(&self, step: &Arc<Step>, total: usize, catalog: Option<SliceCatalog>, inputs: StepOutputs) -> Batch {
        Batch {
            step: Arc::clone(step),
            total,
            remaining: total,
            succeeded: 0,
            catalog,
            inputs,
            outputs: StepOutputs::new(),
            errors: Vec::new(),
            attempts: 0,
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    /// One worker processes `runs` in order.
    fn spawn_group(&mut self, step: Arc<Step>, runs: Vec<SliceRun>, fan_out: bool, pool: Option<Arc<Semaphore>>) {
        let run = Arc::clone(self.run);
        let semaphore = Arc::clone(&self.semaphore);
        let abort = self.abort.clone();
        let path = self.path.to_string();
        self.jobs.spawn(async move {
            let _pool_permit = match pool {
                Some(pool) => pool.acquire_owned().await.ok(),
                None => None,
            };
            let _permit = semaphore.acquire_owned().await.ok();
            let mut outcomes = Vec::with_capacity(runs.len());
            for slice in runs {
                if abort.is_cancelled() {
                    outcomes.push(not_started(&step, &path, slice, fan_out));
                    continue;
                }
                outcomes.push(run_job(&run, &step, &path, slice, fan_out, &abort).await);
            }
            outcomes
        });
    }

    /// Fold the next finished group into the container. `false` once no
    /// jobs are running.
    async fn next(&mut self) -> bool {
        let Some(joined) = self.jobs.join_next().await else {
            return false;
        };
        match joined {
            Ok(outcomes) => {
                for outcome in outcomes {
                    self.complete(outcome);
                }
            }
            Err(e) => {
                tracing::error!(run_id = %self.run.run_id, container = self.path, error = %e, "worker task failed");
                let path = self.path.to_string();
                self.halt(&path, StepError::fatal(format!("worker task failed: {e}")));
            }
        }
        true
    }

    async fn drain(&mut self) {
        while self.next().await {}
    }

    fn complete(&mut self, outcome: JobOutcome) {
        let run = self.run;
        let Some(batch) = self.batches.get_mut(&outcome.step) else {
            return;
        };
        let phase = match &outcome.result {
            Ok(_) => StepPhase::Succeeded,
            Err(StepError::Cancelled) if outcome.attempts == 0 => StepPhase::Skipped,
            Err(_) => StepPhase::Failed,
        };

        if let Some(index) = outcome.slice_index {
            let error = outcome.result.as_ref().err().map(ToString::to_string);
            run.record(StepRecord {
                name: batch.step.name.clone(),
                path: outcome.path.clone(),
                template: batch.step.template().name().to_string(),
                key: None,
                phase,
                inputs: outcome.inputs.clone(),
                outputs: outcome.result.as_ref().cloned().unwrap_or_default(),
                error: error.clone(),
                attempts: outcome.attempts,
                slice_index: Some(index),
                started_at: outcome.started_at,
                finished_at: Some(outcome.finished_at),
            });
            if let (StepPhase::Failed, Some(error)) = (phase, error) {
                let policy = &batch.step.policy;
                run.publish(RunEvent::StepFailed {
                    run_id: run.run_id,
                    path: outcome.path.clone(),
                    error,
                    tolerated: policy.continue_on_failed
                        || policy.continue_on_num_success.is_some()
                        || policy.continue_on_success_ratio.is_some(),
                });
            }
        }

        batch.attempts = batch.attempts.max(outcome.attempts);
        batch.remaining = batch.remaining.saturating_sub(1);
        match outcome.result {
            Ok(outputs) => match (&mut batch.catalog, outcome.slice_index) {
                (Some(catalog), Some(index)) => match catalog.record(index, &outputs) {
                    Ok(()) => batch.succeeded += 1,
                    Err(e) => batch.errors.push(StepError::fatal(e.to_string())),
                },
                _ => {
                    batch.succeeded += 1;
                    batch.outputs = outputs;
                }
            },
            Err(e) => batch.errors.push(e),
        }
        if batch.remaining == 0 {
            let name = outcome.step;
            self.finalize(&name);
        }
    }

    /// Close a step whose jobs have all finished.
    fn finalize(&mut self, name: &str) {
        let Some(batch) = self.batches.remove(name) else {
            return;
        };
        let step = Arc::clone(&batch.step);
        let path = job_path(self.path, &step.name, None);
        let failure = batch.errors.iter().find(|e| **e != StepError::Cancelled).cloned();
        let duration_ms = batch.clock.elapsed().as_millis() as u64;

        let (phase, outputs) = match (&failure, &batch.catalog) {
            (None, _) if batch.errors.is_empty() => (StepPhase::Succeeded, batch.outputs),
            (None, _) => (StepPhase::Skipped, StepOutputs::new()),
            (Some(_), Some(_)) if step.policy.batch_tolerated(batch.succeeded, batch.total) => {
                tracing::warn!(
                    run_id = %self.run.run_id,
                    step = path.as_str(),
                    succeeded = batch.succeeded,
                    total = batch.total,
                    "accepting partially failed batch"
                );
                (StepPhase::Succeeded, StepOutputs::new())
            }
            (Some(_), _) => (StepPhase::Failed, StepOutputs::new()),
        };
        // fan-out outputs are the ordered reassembly of the slices that succeeded
        let outputs = match (&batch.catalog, phase) {
            (Some(catalog), StepPhase::Succeeded) => catalog.reassemble(),
            _ => outputs,
        };
        let error = match phase {
            StepPhase::Failed => failure.clone(),
            StepPhase::Skipped => Some(StepError::Cancelled),
            _ => None,
        };

        self.finish_step(
            &step,
            &path,
            phase,
            batch.inputs,
            outputs,
            error.as_ref(),
            batch.attempts,
            batch.started_at,
            duration_ms,
        );
        if let (StepPhase::Failed, Some(error)) = (phase, failure) {
            self.settle_failure(&step, &path, error);
        }
    }

    /// Record a finished step in the report and the environment.
    #[allow(clippy::too_many_arguments)]
    fn finish_step(
        &mut self,
        step: &Step,
        path: &str,
        phase: StepPhase,
        inputs: StepOutputs,
        outputs: StepOutputs,
        error: Option<&StepError>,
        attempts: u32,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) {
        if let Err(e) = self.env.record(&step.name, phase, &inputs, &outputs) {
            self.halt(path, StepError::fatal(e.to_string()));
        }
        match phase {
            StepPhase::Succeeded => {
                tracing::debug!(run_id = %self.run.run_id, step = path, duration_ms, "step succeeded");
                self.run.publish(RunEvent::StepSucceeded {
                    run_id: self.run.run_id,
                    path: path.to_string(),
                    duration_ms,
                });
            }
            StepPhase::Skipped => {
                self.run.publish(RunEvent::StepSkipped {
                    run_id: self.run.run_id,
                    path: path.to_string(),
                    reason: error.map(ToString::to_string).unwrap_or_default(),
                });
            }
            _ => {}
        }
        self.run.record(StepRecord {
            name: step.name.clone(),
            path: path.to_string(),
            template: step.template().name().to_string(),
            key: step.key.clone(),
            phase,
            inputs,
            outputs,
            error: error.map(ToString::to_string),
            attempts,
            slice_index: None,
            started_at: (attempts > 0).then_some(started_at),
            finished_at: Some(Utc::now()),
        });
    }

    /// Apply the step's failure policy to a failed step.
    fn settle_failure(&mut self, step: &Step, path: &str, error: StepError) {
        let tolerated = step.policy.continue_on_failed;
        self.run.publish(RunEvent::StepFailed {
            run_id: self.run.run_id,
            path: path.to_string(),
            error: error.to_string(),
            tolerated,
        });
        if tolerated {
            tracing::warn!(run_id = %self.run.run_id, step = path, error = %error, "step failed; continuing");
            self.tolerated.insert(step.name.clone());
        } else {
            tracing::warn!(run_id = %self.run.run_id, step = path, error = %error, "step failed; halting container");
            self.halt(path, error);
        }
    }

    /// Record a step that will never run.
    fn skip(&mut self, step: &Step, reason: String) {
        let path = job_path(self.path, &step.name, None);
        tracing::debug!(run_id = %self.run.run_id, step = path.as_str(), reason = reason.as_str(), "step skipped");
        if let Err(e) = self.env.record(&step.name, StepPhase::Skipped, &StepOutputs::new(), &StepOutputs::new()) {
            self.halt(&path, StepError::fatal(e.to_string()));
        }
        self.run.publish(RunEvent::StepSkipped {
            run_id: self.run.run_id,
            path: path.clone(),
            reason: reason.clone(),
        });
        self.run.record(StepRecord::skipped(
            &step.name,
            &path,
            step.template().name(),
            step.key.clone(),
            Some(reason),
        ));
    }

    /// Container result once every job has drained.
    fn finish(self, outputs: &Outputs) -> Result<StepOutputs, StepError> {
        if let Some((path, error)) = self.failure {
            return Err(match error {
                StepError::Graph(e) => StepError::Graph(e),
                StepError::Cancelled => StepError::Cancelled,
                other => StepError::Fatal(format!("step '{path}' failed: {other}")),
            });
        }
        if self.run.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        container_outputs(&self.run.engine.evaluator, self.name, outputs, &self.env.scope())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepgraph_types::expr::Reference;
    use stepgraph_types::io::{OutputParameter, ValueType};
    use stepgraph_types::template::{ScriptTemplate, Template};

    fn leaf() -> Template {
        let mut t = ScriptTemplate::new("echo", "echo");
        t.inputs.parameter("x", stepgraph_types::io::InputParameter::typed(ValueType::Int));
        t.outputs.returned("x", Some(ValueType::Int));
        t.into()
    }

    #[test]
    fn test_resolve_inputs_uses_default_and_reference() {
        let mut t = ScriptTemplate::new("pair", "pair");
        t.inputs
            .parameter("a", stepgraph_types::io::InputParameter::new())
            .parameter("b", stepgraph_types::io::InputParameter::new().with_default(json!("dflt")));
        let step = Step::new("s", &Template::from(t))
            .with_parameter("a", Reference::step_output("up", "x"))
            .unwrap();
        let mut env = BindingEnv::default();
        env.record(
            "up",
            StepPhase::Succeeded,
            &StepOutputs::new(),
            &StepOutputs::new().with_parameter("x", 7),
        )
        .unwrap();
        let Ok(inputs) = resolve_inputs(&Evaluator::new(), &step, &env.scope()) else {
            panic!("inputs should resolve");
        };
        assert_eq!(inputs.parameter("a"), Some(&json!(7)));
        assert_eq!(inputs.parameter("b"), Some(&json!("dflt")));
    }

    #[test]
    fn test_unavailable_producer_skips_reader() {
        let step = Step::new("s", &leaf())
            .with_parameter("x", Reference::step_output("up", "x"))
            .unwrap();
        let mut env = BindingEnv::default();
        env.record("up", StepPhase::Failed, &StepOutputs::new(), &StepOutputs::new())
            .unwrap();
        assert!(matches!(
            resolve_inputs(&Evaluator::new(), &step, &env.scope()),
            Err(Unresolved::Skip(_))
        ));
    }

    #[test]
    fn test_common_inputs_keep_shared_values() {
        let runs = vec![
            SliceRun {
                index: 0,
                inputs: StepOutputs::new().with_parameter("item", 0).with_parameter("greeting", "hi"),
            },
            SliceRun {
                index: 1,
                inputs: StepOutputs::new().with_parameter("item", 1).with_parameter("greeting", "hi"),
            },
        ];
        let common = common_inputs(&runs);
        assert_eq!(common.parameter("greeting"), Some(&json!("hi")));
        assert!(common.parameter("item").is_none());
    }

    #[test]
    fn test_container_outputs_from_expression() {
        let mut env = BindingEnv::default();
        env.record(
            "a",
            StepPhase::Succeeded,
            &StepOutputs::new(),
            &StepOutputs::new().with_parameter("x", 1),
        )
        .unwrap();
        env.record("b", StepPhase::Skipped, &StepOutputs::new(), &StepOutputs::new())
            .unwrap();
        let mut outputs = Outputs::default();
        outputs.parameter(
            "picked",
            OutputParameter::from_expression(stepgraph_types::expr::if_then_else(
                Reference::step_output("a", "x").equals(1),
                Reference::step_output("a", "x"),
                Reference::step_output("b", "x"),
            )),
        );
        outputs.parameter("missing", OutputParameter::from_reference(Reference::step_output("b", "x")));
        let out = container_outputs(&Evaluator::new(), "main", &outputs, &env.scope()).unwrap();
        assert_eq!(out.parameter("picked"), Some(&json!(1)));
        assert!(out.parameter("missing").is_none());
    }

    #[tokio::test]
    async fn test_dag_task_left_waiting_is_unreachable() {
        use crate::event::bus::EventBus;
        use crate::workflow::body::BodyRegistry;
        use crate::workflow::executor::Engine;
        use stepgraph_types::config::EngineConfig;

        let dir = tempfile::tempdir().unwrap();
        let mut bodies = BodyRegistry::new();
        bodies.register_fn("echo", |inv| Ok(StepOutputs::new().with_parameter("x", inv.int("x")?)));
        let engine = Arc::new(Engine {
            config: EngineConfig {
                work_dir: dir.path().to_path_buf(),
                ..EngineConfig::default()
            },
            bodies,
            evaluator: Evaluator::new(),
            events: EventBus::new(16),
        });
        let (records, mut received) = tokio::sync::mpsc::unbounded_channel();
        let run = Arc::new(RunContext {
            run_id: uuid::Uuid::now_v7(),
            engine,
            cancel: CancellationToken::new(),
            records,
        });

        // unprepared: "ghost" is never part of the DAG
        let mut dag = Dag::new("main");
        dag.add(Step::new("a", &leaf()).with_parameter("x", 1).unwrap()).unwrap();
        dag.add(Step::new("b", &leaf()).with_parameter("x", 2).unwrap().depends_on("ghost"))
            .unwrap();

        let err = run_dag(&run, &dag, StepOutputs::new(), "main").await.unwrap_err();
        match err {
            StepError::Graph(GraphError::Unreachable { container, pending }) => {
                assert_eq!(container, "main");
                assert_eq!(pending, vec!["b".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let finished = received.try_recv().unwrap();
        assert_eq!((finished.path.as_str(), finished.phase), ("main/a", StepPhase::Succeeded));
    }

    #[test]
    fn test_job_paths() {
        assert_eq!(job_path("main", "fan", Some(2)), "main/fan(2)");
        assert_eq!(job_path("main/inner", "a", None), "main/inner/a");
    }
}
