//! Fan-out slicing and fan-in reassembly.
//!
//! A fan-out step runs once per driving item. Sliced inputs hand run *i*
//! element *i* of a list parameter, item *i* of a collection artifact, or
//! one catalog entry of a shared artifact. Sliced outputs come back through
//! a [`SliceCatalog`] that reassembles them in item order, whatever order
//! the runs finished in.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use serde_json::Value;
use stepgraph_types::artifact::{ArtifactHandle, ArtifactLocator, PathManifest};
use stepgraph_types::io::Outputs;
use stepgraph_types::run::StepOutputs;
use stepgraph_types::step::Slices;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SliceError {
    #[error("sliced input '{name}' has {actual} entries but the batch has {expected} runs")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("sliced input '{0}' is not a list")]
    NotAList(String),

    #[error("sliced input '{0}' is not bound")]
    Unbound(String),

    #[error("artifact '{name}' cannot be sliced: {reason}")]
    NotSliceable { name: String, reason: String },

    #[error("slice {order} reported output '{output}' twice")]
    DuplicateEntry { output: String, order: usize },

    #[error("slice {order} reported a different value for unsliced output '{output}'")]
    Divergent { output: String, order: usize },

    #[error("slice {order} is outside a batch of {total}")]
    OutOfRange { order: usize, total: usize },
}

// ---------------------------------------------------------------------------
// Driving items
// ---------------------------------------------------------------------------

/// Items for a step that slices inputs without an explicit fan-out list.
///
/// Driven by the first sliced parameter (items are indices), else by the
/// first sliced artifact: catalog paths when slicing by sub-path, indices of
/// a collection otherwise.
pub fn driving_items(slices: &Slices, inputs: &StepOutputs) -> Result<Vec<Value>, SliceError> {
    if let Some(name) = slices.input_parameters.first() {
        let list = list_parameter(inputs, name)?;
        return Ok((0..list.len()).map(Value::from).collect());
    }
    if let Some(name) = slices.input_artifacts.first() {
        let handle = inputs
            .artifact(name)
            .ok_or_else(|| SliceError::Unbound(name.clone()))?;
        if slices.sub_path {
            let manifest = manifest(name, handle)?;
            return Ok(manifest.paths().map(Value::from).collect());
        }
        let items = handle.items().ok_or_else(|| SliceError::NotSliceable {
            name: name.clone(),
            reason: "not a collection".to_string(),
        })?;
        return Ok((0..items.len()).map(Value::from).collect());
    }
    Ok(Vec::new())
}

/// Ordered catalog of an artifact: its own catalog when it carries one,
/// otherwise the files under its local path, sorted.
pub fn manifest(name: &str, handle: &ArtifactHandle) -> Result<PathManifest, SliceError> {
    if let Some(catalog) = &handle.catalog {
        return Ok(catalog.clone());
    }
    let root = handle.local_path().ok_or_else(|| SliceError::NotSliceable {
        name: name.to_string(),
        reason: format!("no catalog for {}", handle.locator.display_path()),
    })?;
    scan(name, &root)
}

fn scan(name: &str, root: &Path) -> Result<PathManifest, SliceError> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| SliceError::NotSliceable {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(rel) = PathManifest::relative_entry(root, entry.path()) {
            paths.push(rel);
        }
    }
    Ok(PathManifest::sorted(paths))
}

// ---------------------------------------------------------------------------
// Per-run inputs
// ---------------------------------------------------------------------------

/// Inputs of run `index` out of `total`: every sliced input replaced by its
/// element for that run.
pub fn slice_inputs(
    slices: &Slices,
    inputs: &StepOutputs,
    index: usize,
    total: usize,
    item: &Value,
) -> Result<StepOutputs, SliceError> {
    let mut sliced = inputs.clone();
    for name in &slices.input_parameters {
        let list = list_parameter(inputs, name)?;
        if list.len() != total {
            return Err(SliceError::LengthMismatch {
                name: name.clone(),
                expected: total,
                actual: list.len(),
            });
        }
        sliced.parameters.insert(name.clone(), list[index].clone());
    }
    for name in &slices.input_artifacts {
        let handle = inputs
            .artifact(name)
            .ok_or_else(|| SliceError::Unbound(name.clone()))?;
        let piece = if slices.sub_path {
            let sub_path = match item.as_str() {
                Some(path) => path.to_string(),
                None => nth_entry(name, handle, index, total)?,
            };
            handle.slice(&sub_path).to_handle()
        } else {
            let items = handle.items().ok_or_else(|| SliceError::NotSliceable {
                name: name.clone(),
                reason: "not a collection".to_string(),
            })?;
            if items.len() != total {
                return Err(SliceError::LengthMismatch {
                    name: name.clone(),
                    expected: total,
                    actual: items.len(),
                });
            }
            items[index].clone()
        };
        sliced.artifacts.insert(name.clone(), piece);
    }
    Ok(sliced)
}

fn nth_entry(name: &str, handle: &ArtifactHandle, index: usize, total: usize) -> Result<String, SliceError> {
    let manifest = manifest(name, handle)?;
    if manifest.len() != total {
        return Err(SliceError::LengthMismatch {
            name: name.to_string(),
            expected: total,
            actual: manifest.len(),
        });
    }
    Ok(manifest.entries()[index].path.clone())
}

/// A list parameter; JSON-encoded lists passed as strings are decoded.
fn list_parameter(inputs: &StepOutputs, name: &str) -> Result<Vec<Value>, SliceError> {
    match inputs.parameter(name) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(SliceError::NotAList(name.to_string())),
        },
        Some(_) => Err(SliceError::NotAList(name.to_string())),
        None => Err(SliceError::Unbound(name.to_string())),
    }
}

/// Index ranges of runs packed into one worker, in order.
pub fn groups(total: usize, group_size: Option<usize>) -> Vec<Range<usize>> {
    let size = group_size.unwrap_or(1).max(1);
    (0..total)
        .step_by(size)
        .map(|start| start..(start + size).min(total))
        .collect()
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// Collects per-slice outputs and reassembles them in slice order.
#[derive(Debug, Clone)]
pub struct SliceCatalog {
    total: usize,
    parameters: BTreeMap<String, BTreeMap<usize, Value>>,
    artifacts: BTreeMap<String, BTreeMap<usize, ArtifactHandle>>,
    shared_parameters: BTreeMap<String, Option<Value>>,
    shared_artifacts: BTreeMap<String, Option<ArtifactHandle>>,
}

impl SliceCatalog {
    /// Catalog for a batch of `total` runs of a template with `outputs`.
    /// Outputs for which `gathered` holds are reassembled, so an empty batch
    /// yields empty lists for them; every run must report the same value for
    /// the others.
    pub fn new(outputs: &Outputs, total: usize, gathered: impl Fn(&str) -> bool) -> Self {
        let mut catalog = Self {
            total,
            parameters: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            shared_parameters: BTreeMap::new(),
            shared_artifacts: BTreeMap::new(),
        };
        for name in outputs.parameters.keys() {
            if gathered(name) {
                catalog.parameters.insert(name.clone(), BTreeMap::new());
            } else {
                catalog.shared_parameters.insert(name.clone(), None);
            }
        }
        for name in outputs.artifacts.keys() {
            if gathered(name) {
                catalog.artifacts.insert(name.clone(), BTreeMap::new());
            } else {
                catalog.shared_artifacts.insert(name.clone(), None);
            }
        }
        catalog
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Record the outputs of the slice at `order`. A rejected slice leaves
    /// the catalog unchanged.
    pub fn record(&mut self, order: usize, outputs: &StepOutputs) -> Result<(), SliceError> {
        if order >= self.total {
            return Err(SliceError::OutOfRange {
                order,
                total: self.total,
            });
        }
        for (name, value) in &outputs.parameters {
            check_entry(&self.parameters, &self.shared_parameters, name, order, value)?;
        }
        for (name, handle) in &outputs.artifacts {
            check_entry(&self.artifacts, &self.shared_artifacts, name, order, handle)?;
        }

        for (name, value) in &outputs.parameters {
            match self.shared_parameters.get_mut(name) {
                Some(slot) => *slot = Some(value.clone()),
                None => {
                    self.parameters.entry(name.clone()).or_default().insert(order, value.clone());
                }
            }
        }
        for (name, handle) in &outputs.artifacts {
            match self.shared_artifacts.get_mut(name) {
                Some(slot) => *slot = Some(handle.clone()),
                None => {
                    self.artifacts.entry(name.clone()).or_default().insert(order, handle.clone());
                }
            }
        }
        Ok(())
    }

    /// Lists and collections ordered by slice position, plus the single
    /// value of each unsliced output. Slices that recorded nothing leave no
    /// entry.
    pub fn reassemble(&self) -> StepOutputs {
        let mut out = StepOutputs::new();
        for (name, entries) in &self.parameters {
            out.parameters
                .insert(name.clone(), Value::Array(entries.values().cloned().collect()));
        }
        for (name, entries) in &self.artifacts {
            let items: Vec<ArtifactHandle> = entries.values().cloned().collect();
            let catalog = PathManifest::from_paths(items.iter().map(|h| entry_path(&h.locator)));
            out.artifacts
                .insert(name.clone(), ArtifactHandle::collection(items).with_catalog(catalog));
        }
        for (name, value) in &self.shared_parameters {
            if let Some(value) = value {
                out.parameters.insert(name.clone(), value.clone());
            }
        }
        for (name, handle) in &self.shared_artifacts {
            if let Some(handle) = handle {
                out.artifacts.insert(name.clone(), handle.clone());
            }
        }
        out
    }
}

fn check_entry<T: PartialEq>(
    gathered: &BTreeMap<String, BTreeMap<usize, T>>,
    shared: &BTreeMap<String, Option<T>>,
    name: &str,
    order: usize,
    value: &T,
) -> Result<(), SliceError> {
    match shared.get(name) {
        Some(Some(seen)) if seen != value => Err(SliceError::Divergent {
            output: name.to_string(),
            order,
        }),
        Some(_) => Ok(()),
        None if gathered.get(name).is_some_and(|e| e.contains_key(&order)) => Err(SliceError::DuplicateEntry {
            output: name.to_string(),
            order,
        }),
        None => Ok(()),
    }
}

/// Catalog path of one reassembled item: the sub-path for slices of a
/// shared artifact, the display path otherwise.
fn entry_path(locator: &ArtifactLocator) -> String {
    match locator {
        ArtifactLocator::SubPath { sub_path, .. } => sub_path.clone(),
        other => other.display_path(),
    }
}
