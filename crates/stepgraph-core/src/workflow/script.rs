//! Leaf execution: one run of a script template.
//!
//! Prepares the step's working directory, materializes inline artifacts,
//! invokes the registered body and collects its outputs. Outputs the body
//! does not return are read from their declared path in the working
//! directory.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use stepgraph_types::artifact::{ArtifactHandle, ArtifactLocator};
use stepgraph_types::io::OutputSource;
use stepgraph_types::run::StepOutputs;
use stepgraph_types::template::ScriptTemplate;

use super::body::{Invocation, StepError};
use super::context::BindingEnv;
use super::executor::RunContext;

/// Run one attempt of `script` with resolved `inputs`.
pub(crate) async fn run_script(
    run: &Arc<RunContext>,
    script: &ScriptTemplate,
    inputs: StepOutputs,
    path: &str,
    slice_index: Option<usize>,
    attempt: u32,
) -> Result<StepOutputs, StepError> {
    let body = run
        .engine
        .bodies
        .get(&script.body)
        .cloned()
        .ok_or_else(|| StepError::fatal(format!("no step body registered under '{}'", script.body)))?;

    let workdir = run.workdir(path);
    tokio::fs::create_dir_all(&workdir)
        .await
        .map_err(|e| StepError::transient(format!("cannot create {}: {e}", workdir.display())))?;

    clear_outputs(script, &workdir).await?;
    let artifacts = materialize(script, &workdir, inputs.artifacts).await?;
    let invocation = Invocation {
        run_id: run.run_id,
        path: path.to_string(),
        template: script.name.clone(),
        parameters: inputs.parameters,
        artifacts,
        workdir,
        slice_index,
        attempt,
    };

    tracing::debug!(
        run_id = %run.run_id,
        step = path,
        body = script.body.as_str(),
        attempt,
        "invoking step body"
    );
    let returned = body.run(&invocation).await?;
    collect_outputs(run, script, &invocation, returned).await
}

/// Remove whatever an earlier attempt left at the declared output paths.
async fn clear_outputs(script: &ScriptTemplate, workdir: &Path) -> Result<(), StepError> {
    let declared = script
        .outputs
        .parameters
        .values()
        .map(|p| &p.source)
        .chain(script.outputs.artifacts.values().map(|a| &a.source));
    for source in declared {
        let OutputSource::Path { path } = source else {
            continue;
        };
        let target = workdir.join(path);
        let removed = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
            Ok(_) => tokio::fs::remove_file(&target).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => Err(e),
        };
        removed.map_err(|e| StepError::transient(format!("cannot clear {}: {e}", target.display())))?;
    }
    Ok(())
}

/// Write inline (`Raw`) artifacts to files so bodies only see paths.
async fn materialize(
    script: &ScriptTemplate,
    workdir: &Path,
    artifacts: BTreeMap<String, ArtifactHandle>,
) -> Result<BTreeMap<String, ArtifactHandle>, StepError> {
    let mut out = BTreeMap::new();
    for (name, handle) in artifacts {
        let data = match &handle.locator {
            ArtifactLocator::Raw { data } => data.clone(),
            _ => {
                out.insert(name, handle);
                continue;
            }
        };
        let relative = script
            .inputs
            .artifacts
            .get(&name)
            .and_then(|decl| decl.path.clone())
            .unwrap_or_else(|| format!("inputs/artifacts/{name}"));
        let target = workdir.join(relative);
        write_file(&target, data.as_bytes()).await?;
        out.insert(name, ArtifactHandle::local(target));
    }
    Ok(out)
}

async fn write_file(target: &Path, bytes: &[u8]) -> Result<(), StepError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StepError::transient(format!("cannot create {}: {e}", parent.display())))?;
    }
    tokio::fs::write(target, bytes)
        .await
        .map_err(|e| StepError::transient(format!("cannot write {}: {e}", target.display())))
}

/// Match returned outputs against the declaration and fill the rest from
/// the working directory.
async fn collect_outputs(
    run: &Arc<RunContext>,
    script: &ScriptTemplate,
    invocation: &Invocation,
    mut returned: StepOutputs,
) -> Result<StepOutputs, StepError> {
    let declared = &script.outputs;
    if let Some(name) = returned
        .parameters
        .keys()
        .find(|k| !declared.parameters.contains_key(*k))
    {
        return Err(StepError::fatal(format!(
            "body '{}' returned undeclared output '{name}'",
            script.body
        )));
    }
    if let Some(name) = returned
        .artifacts
        .keys()
        .find(|k| !declared.artifacts.contains_key(*k))
    {
        return Err(StepError::fatal(format!(
            "body '{}' returned undeclared artifact '{name}'",
            script.body
        )));
    }

    let mut outputs = StepOutputs::new();
    for (name, decl) in &declared.parameters {
        let value = match returned.parameters.remove(name) {
            Some(value) => value,
            None => match &decl.source {
                OutputSource::Path { path } => read_parameter(&invocation.workdir.join(path), name).await?,
                OutputSource::Expression { expr } => {
                    let env = BindingEnv::new(StepOutputs {
                        parameters: invocation.parameters.clone(),
                        artifacts: invocation.artifacts.clone(),
                    });
                    run.engine
                        .evaluator
                        .evaluate(expr, &env.scope())
                        .map_err(|e| StepError::fatal(format!("output '{name}': {e}")))?
                }
                OutputSource::Reference { reference } => {
                    return Err(StepError::fatal(format!(
                        "output '{name}' of leaf '{}' cannot read {reference}",
                        script.name
                    )));
                }
            },
        };
        if let Some(ty) = &decl.value_type {
            if !ty.admits(&value) {
                return Err(StepError::fatal(format!(
                    "output '{name}' of '{}' is {value}, expected {ty:?}",
                    script.name
                )));
            }
        }
        outputs.parameters.insert(name.clone(), value);
    }

    for (name, decl) in &declared.artifacts {
        let handle = match returned.artifacts.remove(name) {
            Some(handle) => handle,
            None => {
                let OutputSource::Path { path } = &decl.source else {
                    return Err(StepError::fatal(format!("artifact '{name}' has no path")));
                };
                let file = invocation.workdir.join(path);
                if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
                    return Err(StepError::fatal(format!(
                        "artifact '{name}' was not produced at {}",
                        file.display()
                    )));
                }
                ArtifactHandle::local(file)
            }
        };
        outputs.artifacts.insert(name.clone(), handle);
    }
    Ok(outputs)
}

/// Parameter file contents: JSON when it parses, the trimmed text otherwise.
async fn read_parameter(file: &Path, name: &str) -> Result<Value, StepError> {
    let text = tokio::fs::read_to_string(file).await.map_err(|e| {
        StepError::fatal(format!("output '{name}' was not produced at {}: {e}", file.display()))
    })?;
    Ok(serde_json::from_str(text.trim()).unwrap_or_else(|_| Value::String(text.trim().to_string())))
}
