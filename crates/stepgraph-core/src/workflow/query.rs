//! Read-only queries over a finished run.
//!
//! `RunQuery` is the surface a caller inspects results through. A local run
//! answers from its `RunReport`; a cluster-backed implementation answers the
//! same questions from the engine's status API.

use serde_json::Value;
use stepgraph_types::run::{RunReport, RunStatus, StepOutputs, StepPhase, StepRecord};

/// Query surface over the records of one run.
///
/// Steps are addressed by path (`main/hello1`); fan-out slices by
/// `main/step(2)`.
pub trait RunQuery {
    /// Terminal status of the run.
    fn status(&self) -> RunStatus;

    /// All step records, in completion order.
    fn records(&self) -> &[StepRecord];

    /// Record at an exact path.
    fn record(&self, path: &str) -> Option<&StepRecord> {
        self.records().iter().find(|r| r.path == path)
    }

    /// Record of the step carrying idempotency key `key`.
    fn by_key(&self, key: &str) -> Option<&StepRecord> {
        self.records()
            .iter()
            .find(|r| r.slice_index.is_none() && r.key.as_deref() == Some(key))
    }

    /// Every record whose step name is `name`, slices excluded.
    fn by_name(&self, name: &str) -> Vec<&StepRecord> {
        self.records()
            .iter()
            .filter(|r| r.name == name && r.slice_index.is_none())
            .collect()
    }

    fn phase(&self, path: &str) -> Option<StepPhase> {
        self.record(path).map(|r| r.phase)
    }

    fn outputs(&self, path: &str) -> Option<&StepOutputs> {
        self.record(path).map(|r| &r.outputs)
    }

    /// One output parameter of the step at `path`.
    fn parameter(&self, path: &str, name: &str) -> Option<&Value> {
        self.outputs(path).and_then(|o| o.parameter(name))
    }

    /// Records of the slices of the fan-out step at `path`, in slice order.
    fn slices(&self, path: &str) -> Vec<&StepRecord> {
        let mut out: Vec<&StepRecord> = self
            .records()
            .iter()
            .filter(|r| r.slice_index.is_some_and(|i| r.path == format!("{path}({i})")))
            .collect();
        out.sort_by_key(|r| r.slice_index);
        out
    }
}

impl RunQuery for RunReport {
    fn status(&self) -> RunStatus {
        self.status
    }

    fn records(&self) -> &[StepRecord] {
        &self.steps
    }
}
