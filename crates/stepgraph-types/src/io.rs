//! Input/output declarations and argument sources.
//!
//! A template declares its signature as two tagged families: parameters
//! (small JSON values with an optional [`ValueType`]) and artifacts (file sets
//! addressed by an [`ArtifactHandle`]). Steps own a copy of the declarations
//! augmented with the concrete argument each input is bound to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::ArtifactHandle;
use crate::expr::{Expr, Reference};

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Element type of a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum ValueType {
    Any,
    Str,
    Int,
    Float,
    Bool,
    Object,
    List(Box<ValueType>),
}

impl ValueType {
    /// List of the given element type.
    pub fn list_of(element: ValueType) -> Self {
        ValueType::List(Box::new(element))
    }

    /// Element type when this is a list.
    pub fn element(&self) -> Option<&ValueType> {
        match self {
            ValueType::List(inner) => Some(inner),
            _ => None,
        }
    }

    /// Structural check of a JSON value against this type.
    ///
    /// `null` is admitted by every type: it is the explicit "null" literal,
    /// distinct from an absent binding.
    pub fn admits(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            ValueType::Any => true,
            ValueType::Str => value.is_string(),
            ValueType::Int => value.is_i64() || value.is_u64(),
            ValueType::Float => value.is_number(),
            ValueType::Bool => value.is_boolean(),
            ValueType::Object => value.is_object(),
            ValueType::List(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| inner.admits(v))),
        }
    }
}

/// Whether a parameter travels as an artifact (for values too large to
/// inline). Tri-state so that "not specified" can be filled in from the other
/// end of a reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFlag {
    #[default]
    Unset,
    On,
    Off,
}

impl ArtifactFlag {
    pub fn is_on(self) -> bool {
        self == ArtifactFlag::On
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Declared input parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    /// Default used when no argument is bound. `Some(Value::Null)` is an
    /// explicit null default; `None` means the input is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub as_artifact: ArtifactFlag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputParameter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn typed(value_type: ValueType) -> Self {
        Self {
            value_type: Some(value_type),
            ..Self::default()
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn as_artifact(mut self) -> Self {
        self.as_artifact = ArtifactFlag::On;
        self
    }

    pub fn inline(mut self) -> Self {
        self.as_artifact = ArtifactFlag::Off;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Declared input artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputArtifact {
    /// Optional inputs may stay unbound.
    #[serde(default)]
    pub optional: bool,
    /// Relative placement inside the step's working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputArtifact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Where an output value comes from. Exactly one source per output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum OutputSource {
    /// A file inside the step's working directory (leaf templates).
    Path { path: String },
    /// Another step's output (container templates).
    Reference { reference: Reference },
    /// An expression over the container's bindings, e.g. an if/else choice.
    Expression { expr: Expr },
}

/// Declared output parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputParameter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    pub source: OutputSource,
    #[serde(default)]
    pub as_artifact: ArtifactFlag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl OutputParameter {
    pub fn from_path(path: impl Into<String>) -> Self {
        Self::with_source(OutputSource::Path { path: path.into() })
    }

    pub fn from_reference(reference: Reference) -> Self {
        Self::with_source(OutputSource::Reference { reference })
    }

    pub fn from_expression(expr: Expr) -> Self {
        Self::with_source(OutputSource::Expression { expr })
    }

    fn with_source(source: OutputSource) -> Self {
        Self {
            value_type: None,
            source,
            as_artifact: ArtifactFlag::Unset,
            description: None,
        }
    }

    pub fn typed(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn as_artifact(mut self) -> Self {
        self.as_artifact = ArtifactFlag::On;
        self
    }
}

/// Declared output artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub source: OutputSource,
}

impl OutputArtifact {
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            source: OutputSource::Path { path: path.into() },
        }
    }

    pub fn from_reference(reference: Reference) -> Self {
        Self {
            source: OutputSource::Reference { reference },
        }
    }
}

/// Input signature of a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inputs {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, InputParameter>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, InputArtifact>,
}

impl Inputs {
    pub fn parameter(&mut self, name: impl Into<String>, decl: InputParameter) -> &mut Self {
        self.parameters.insert(name.into(), decl);
        self
    }

    pub fn artifact(&mut self, name: impl Into<String>, decl: InputArtifact) -> &mut Self {
        self.artifacts.insert(name.into(), decl);
        self
    }
}

/// Output signature of a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outputs {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, OutputParameter>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, OutputArtifact>,
}

impl Outputs {
    pub fn parameter(&mut self, name: impl Into<String>, decl: OutputParameter) -> &mut Self {
        self.parameters.insert(name.into(), decl);
        self
    }

    /// Parameter a leaf body returns directly; falls back to the
    /// conventional `outputs/parameters/<name>` file when not returned.
    pub fn returned(&mut self, name: impl Into<String>, value_type: Option<ValueType>) -> &mut Self {
        let name = name.into();
        let mut decl = OutputParameter::from_path(format!("outputs/parameters/{name}"));
        decl.value_type = value_type;
        self.parameters.insert(name, decl);
        self
    }

    pub fn artifact(&mut self, name: impl Into<String>, decl: OutputArtifact) -> &mut Self {
        self.artifacts.insert(name.into(), decl);
        self
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Concrete value bound to an input parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgumentValue {
    /// Literal JSON; `Value::Null` is an explicit null.
    Literal { value: Value },
    Reference { reference: Reference },
    Expression { expr: Expr },
}

impl ArgumentValue {
    pub fn null() -> Self {
        ArgumentValue::Literal { value: Value::Null }
    }

    pub fn reference(&self) -> Option<&Reference> {
        match self {
            ArgumentValue::Reference { reference } => Some(reference),
            _ => None,
        }
    }

    /// Every reference this argument reads.
    pub fn references(&self) -> Vec<&Reference> {
        match self {
            ArgumentValue::Literal { .. } => Vec::new(),
            ArgumentValue::Reference { reference } => vec![reference],
            ArgumentValue::Expression { expr } => expr.references(),
        }
    }
}

impl From<Value> for ArgumentValue {
    fn from(value: Value) -> Self {
        ArgumentValue::Literal { value }
    }
}

impl From<Reference> for ArgumentValue {
    fn from(reference: Reference) -> Self {
        ArgumentValue::Reference { reference }
    }
}

impl From<Expr> for ArgumentValue {
    fn from(expr: Expr) -> Self {
        match expr {
            Expr::Literal { value } => ArgumentValue::Literal { value },
            Expr::Ref { reference } => ArgumentValue::Reference { reference },
            expr => ArgumentValue::Expression { expr },
        }
    }
}

impl From<i64> for ArgumentValue {
    fn from(v: i64) -> Self {
        ArgumentValue::Literal { value: Value::from(v) }
    }
}

impl From<i32> for ArgumentValue {
    fn from(v: i32) -> Self {
        ArgumentValue::Literal { value: Value::from(v) }
    }
}

impl From<&str> for ArgumentValue {
    fn from(v: &str) -> Self {
        ArgumentValue::Literal { value: Value::from(v) }
    }
}

impl From<bool> for ArgumentValue {
    fn from(v: bool) -> Self {
        ArgumentValue::Literal { value: Value::from(v) }
    }
}

/// Concrete source bound to an input artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactSource {
    Reference { reference: Reference },
    Handle { handle: ArtifactHandle },
    /// Inline text materialized as a file.
    Raw { data: String },
}

impl From<Reference> for ArtifactSource {
    fn from(reference: Reference) -> Self {
        ArtifactSource::Reference { reference }
    }
}

impl From<ArtifactHandle> for ArtifactSource {
    fn from(handle: ArtifactHandle) -> Self {
        ArtifactSource::Handle { handle }
    }
}

/// A step's owned copy of an input parameter plus its bound argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundParameter {
    pub decl: InputParameter,
    /// `None` means absent: the declared default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ArgumentValue>,
}

/// A step's owned copy of an input artifact plus its bound source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundArtifact {
    pub decl: InputArtifact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ArtifactSource>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_type_admits() {
        assert!(ValueType::Int.admits(&json!(3)));
        assert!(!ValueType::Int.admits(&json!("3")));
        assert!(ValueType::Float.admits(&json!(3)));
        assert!(ValueType::list_of(ValueType::Str).admits(&json!(["a", "b"])));
        assert!(!ValueType::list_of(ValueType::Str).admits(&json!(["a", 1])));
        assert!(ValueType::Bool.admits(&Value::Null), "null is always admitted");
    }

    #[test]
    fn test_null_literal_is_distinct_from_absent() {
        let null = BoundParameter {
            decl: InputParameter::new(),
            value: Some(ArgumentValue::null()),
        };
        let absent = BoundParameter {
            decl: InputParameter::new(),
            value: None,
        };
        assert_ne!(null, absent);
    }

    #[test]
    fn test_returned_output_uses_conventional_path() {
        let mut outputs = Outputs::default();
        outputs.returned("msg", Some(ValueType::Int));
        let decl = &outputs.parameters["msg"];
        assert_eq!(
            decl.source,
            OutputSource::Path {
                path: "outputs/parameters/msg".to_string()
            }
        );
        assert_eq!(decl.value_type, Some(ValueType::Int));
    }

    #[test]
    fn test_expr_argument_collapses_literals_and_refs() {
        let arg = ArgumentValue::from(Expr::from(json!(1)));
        assert!(matches!(arg, ArgumentValue::Literal { .. }));
        let arg = ArgumentValue::from(Expr::from(Reference::input("x")));
        assert!(arg.reference().is_some());
    }
}
