//! Event types for the run event bus.
//!
//! `RunEvent` is broadcast while a graph executes locally. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunStatus;

/// Events emitted during a local run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run has started.
    RunStarted { run_id: Uuid, root: String },

    /// A step (or one slice of it) was submitted to the worker pool.
    StepStarted {
        run_id: Uuid,
        path: String,
        template: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slice_index: Option<usize>,
    },

    /// A transient failure will be retried.
    StepRetrying {
        run_id: Uuid,
        path: String,
        attempt: u32,
        error: String,
        delay_ms: u64,
    },

    /// A step finished successfully.
    StepSucceeded {
        run_id: Uuid,
        path: String,
        duration_ms: u64,
    },

    /// A step failed after exhausting its retries.
    StepFailed {
        run_id: Uuid,
        path: String,
        error: String,
        /// Whether the step's policy lets the graph proceed.
        tolerated: bool,
    },

    /// A step was skipped (false guard or unavailable upstream data).
    StepSkipped {
        run_id: Uuid,
        path: String,
        reason: String,
    },

    /// A run reached its terminal status.
    RunCompleted {
        run_id: Uuid,
        root: String,
        status: RunStatus,
        duration_ms: u64,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepRetrying { run_id, .. }
            | RunEvent::StepSucceeded { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::StepSkipped { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. } => *run_id,
        }
    }

    /// Step path for step-level events.
    pub fn path(&self) -> Option<&str> {
        match self {
            RunEvent::StepStarted { path, .. }
            | RunEvent::StepRetrying { path, .. }
            | RunEvent::StepSucceeded { path, .. }
            | RunEvent::StepFailed { path, .. }
            | RunEvent::StepSkipped { path, .. } => Some(path),
            RunEvent::RunStarted { .. } | RunEvent::RunCompleted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_tagged() {
        let event = RunEvent::StepSkipped {
            run_id: Uuid::nil(),
            path: "main/b".to_string(),
            reason: "guard evaluated to false".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_skipped");
        let back: RunEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_accessors() {
        let id = Uuid::now_v7();
        let started = RunEvent::RunStarted {
            run_id: id,
            root: "main".to_string(),
        };
        assert_eq!(started.run_id(), id);
        assert!(started.path().is_none());

        let failed = RunEvent::StepFailed {
            run_id: id,
            path: "main/a".to_string(),
            error: "boom".to_string(),
            tolerated: true,
        };
        assert_eq!(failed.path(), Some("main/a"));
    }
}
