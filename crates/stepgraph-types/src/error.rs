use thiserror::Error;

/// Configuration errors detected while building or preparing a graph.
///
/// Every variant names the offending template, step or reference so callers
/// can report the problem before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("cycle detected in '{container}' involving step '{step}'")]
    CycleDetected { container: String, step: String },

    #[error("template name '{0}' is used by two different templates")]
    DuplicateTemplate(String),

    #[error("step '{step}' appears twice in '{container}'")]
    DuplicateStep { container: String, step: String },

    #[error("step '{step}' in '{container}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        container: String,
        step: String,
        dependency: String,
    },

    #[error("unknown reference in '{context}': {reference}")]
    UnknownReference { context: String, reference: String },

    #[error("template '{template}' declares no input named '{name}'")]
    UnknownInput { template: String, name: String },

    #[error("step '{step}' reads '{sibling}' from the same layer")]
    SameLayerReference { step: String, sibling: String },

    #[error("type mismatch on '{context}': {detail}")]
    TypeMismatch { context: String, detail: String },

    #[error("as-artifact flag conflict between '{producer}' and '{consumer}'")]
    ArtifactFlagConflict { producer: String, consumer: String },

    #[error("invalid output '{output}' on template '{template}': {reason}")]
    InvalidOutput {
        template: String,
        output: String,
        reason: String,
    },

    #[error("invalid fan-out on step '{step}': {reason}")]
    InvalidFanOut { step: String, reason: String },

    #[error("invalid slices on step '{step}': {reason}")]
    InvalidSlices { step: String, reason: String },

    #[error("step '{step}' binds nothing to required input '{name}'")]
    MissingArgument { step: String, name: String },

    #[error("steps in '{container}' can never run: {}", pending.join(", "))]
    Unreachable {
        container: String,
        pending: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_container_and_step() {
        let err = GraphError::CycleDetected {
            container: "pipeline".to_string(),
            step: "b".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pipeline"));
        assert!(msg.contains("'b'"));
    }

    #[test]
    fn test_unknown_input_display() {
        let err = GraphError::UnknownInput {
            template: "duplicate".to_string(),
            name: "msg2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "template 'duplicate' declares no input named 'msg2'"
        );
    }
}
