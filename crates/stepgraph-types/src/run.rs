//! Run-time status and the records a finished run exposes for querying.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::artifact::ArtifactHandle;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Per-step state machine: `Waiting -> Pending -> {Succeeded | Failed | Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Not yet runnable.
    Waiting,
    /// Submitted to the worker pool.
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl StepPhase {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            StepPhase::Succeeded | StepPhase::Failed | StepPhase::Skipped
        )
    }
}

/// Terminal (or current) status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Resolved outputs of a step (or inputs handed to a body).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutputs {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, ArtifactHandle>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_artifact(mut self, name: impl Into<String>, handle: ArtifactHandle) -> Self {
        self.artifacts.insert(name.into(), handle);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn artifact(&self, name: &str) -> Option<&ArtifactHandle> {
        self.artifacts.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What happened to one step (or one slice of a fan-out step).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name inside its container.
    pub name: String,
    /// Slash-separated path from the root template, e.g. `main/hello1`.
    pub path: String,
    /// Name of the template this step instantiated.
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub phase: StepPhase,
    #[serde(default)]
    pub inputs: StepOutputs,
    #[serde(default)]
    pub outputs: StepOutputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts made (0 for skipped steps).
    pub attempts: u32,
    /// Position inside a fan-out batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A record for a step that never ran.
    pub fn skipped(name: &str, path: &str, template: &str, key: Option<String>, reason: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            template: template.to_string(),
            key,
            phase: StepPhase::Skipped,
            inputs: StepOutputs::default(),
            outputs: StepOutputs::default(),
            error: reason,
            attempts: 0,
            slice_index: None,
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }
}

/// Result of a local run: terminal status plus every step record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Name of the root template.
    pub root: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Outputs of the root template.
    #[serde(default)]
    pub outputs: StepOutputs,
    pub steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_finished() {
        assert!(!StepPhase::Waiting.is_finished());
        assert!(!StepPhase::Pending.is_finished());
        assert!(StepPhase::Succeeded.is_finished());
        assert!(StepPhase::Failed.is_finished());
        assert!(StepPhase::Skipped.is_finished());
    }

    #[test]
    fn test_phase_serde_snake_case() {
        assert_eq!(serde_json::to_string(&StepPhase::Succeeded).unwrap(), "\"succeeded\"");
        let p: StepPhase = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(p, StepPhase::Skipped);
    }

    #[test]
    fn test_step_outputs_builder() {
        let out = StepOutputs::new()
            .with_parameter("msg", json!(2))
            .with_artifact("log", ArtifactHandle::raw("ok"));
        assert_eq!(out.parameter("msg"), Some(&json!(2)));
        assert!(out.artifact("log").is_some());
        assert!(!out.is_empty());
    }

    #[test]
    fn test_skipped_record() {
        let r = StepRecord::skipped("b", "main/b", "inc", None, Some("guard false".into()));
        assert_eq!(r.phase, StepPhase::Skipped);
        assert_eq!(r.attempts, 0);
        assert!(r.started_at.is_none());
    }
}
