//! Symbolic references and the small expression tree built from them.
//!
//! A [`Reference`] names a value that only exists at run time (a sibling
//! step's output, the enclosing container's input, the current fan-out item).
//! References compare structurally through `Eq`/`Hash` so they can be
//! de-duplicated; comparisons that produce *expressions* are explicit builder
//! methods (`equals`, `less_than`, ...) returning an [`Expr`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// What a reference is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RefScope {
    /// A sibling step or task in the same container.
    Step { step: String },
    /// The enclosing container's own inputs.
    Container,
    /// The current fan-out element.
    Item,
    /// Outputs of the current loop iteration.
    Iteration,
    /// Zero-based index of the current loop iteration.
    LoopIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inputs,
    Outputs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoClass {
    Parameter,
    Artifact,
}

/// Handle for a value resolved at run time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    #[serde(flatten)]
    pub scope: RefScope,
    pub direction: Direction,
    pub class: IoClass,
    /// Output/input name; for `Item` an optional field name (empty = whole item).
    #[serde(default)]
    pub name: String,
}

impl Reference {
    fn new(scope: RefScope, direction: Direction, class: IoClass, name: impl Into<String>) -> Self {
        Self {
            scope,
            direction,
            class,
            name: name.into(),
        }
    }

    /// Output parameter of a sibling step.
    pub fn step_output(step: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            RefScope::Step { step: step.into() },
            Direction::Outputs,
            IoClass::Parameter,
            name,
        )
    }

    /// Output artifact of a sibling step.
    pub fn step_artifact(step: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            RefScope::Step { step: step.into() },
            Direction::Outputs,
            IoClass::Artifact,
            name,
        )
    }

    /// Input parameter of a sibling step (as resolved when it ran).
    pub fn step_input(step: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            RefScope::Step { step: step.into() },
            Direction::Inputs,
            IoClass::Parameter,
            name,
        )
    }

    /// Input parameter of the enclosing container.
    pub fn input(name: impl Into<String>) -> Self {
        Self::new(RefScope::Container, Direction::Inputs, IoClass::Parameter, name)
    }

    /// Input artifact of the enclosing container.
    pub fn input_artifact(name: impl Into<String>) -> Self {
        Self::new(RefScope::Container, Direction::Inputs, IoClass::Artifact, name)
    }

    /// The current fan-out element.
    pub fn item() -> Self {
        Self::new(RefScope::Item, Direction::Inputs, IoClass::Parameter, "")
    }

    /// A field of the current fan-out element (object items).
    pub fn item_field(field: impl Into<String>) -> Self {
        Self::new(RefScope::Item, Direction::Inputs, IoClass::Parameter, field)
    }

    /// Output parameter of the loop iteration that just finished.
    pub fn iteration_output(name: impl Into<String>) -> Self {
        Self::new(RefScope::Iteration, Direction::Outputs, IoClass::Parameter, name)
    }

    /// Output artifact of the loop iteration that just finished.
    pub fn iteration_artifact(name: impl Into<String>) -> Self {
        Self::new(RefScope::Iteration, Direction::Outputs, IoClass::Artifact, name)
    }

    /// Zero-based loop iteration index.
    pub fn loop_index() -> Self {
        Self::new(RefScope::LoopIndex, Direction::Inputs, IoClass::Parameter, "")
    }

    /// Step this reference points at, if it is step-scoped.
    pub fn step(&self) -> Option<&str> {
        match &self.scope {
            RefScope::Step { step } => Some(step),
            _ => None,
        }
    }

    pub fn is_artifact(&self) -> bool {
        self.class == IoClass::Artifact
    }

    pub fn equals(&self, other: impl Into<Expr>) -> Expr {
        Expr::from(self.clone()).equals(other)
    }

    pub fn not_equals(&self, other: impl Into<Expr>) -> Expr {
        Expr::from(self.clone()).not_equals(other)
    }

    pub fn less_than(&self, other: impl Into<Expr>) -> Expr {
        Expr::from(self.clone()).less_than(other)
    }

    pub fn less_eq(&self, other: impl Into<Expr>) -> Expr {
        Expr::from(self.clone()).less_eq(other)
    }

    pub fn greater_than(&self, other: impl Into<Expr>) -> Expr {
        Expr::from(self.clone()).greater_than(other)
    }

    pub fn greater_eq(&self, other: impl Into<Expr>) -> Expr {
        Expr::from(self.clone()).greater_eq(other)
    }

    /// JEXL path for this reference.
    pub fn to_jexl(&self) -> String {
        let class = match self.class {
            IoClass::Parameter => "parameters",
            IoClass::Artifact => "artifacts",
        };
        let direction = match self.direction {
            Direction::Inputs => "inputs",
            Direction::Outputs => "outputs",
        };
        match &self.scope {
            RefScope::Step { step } => {
                format!("steps[{}].{direction}.{class}[{}]", quote(step), quote(&self.name))
            }
            RefScope::Container => format!("inputs.{class}[{}]", quote(&self.name)),
            RefScope::Item if self.name.is_empty() => "item".to_string(),
            RefScope::Item => format!("item[{}]", quote(&self.name)),
            RefScope::Iteration => format!("iteration.outputs.{class}[{}]", quote(&self.name)),
            RefScope::LoopIndex => "iteration.index".to_string(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_jexl())
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

// ---------------------------------------------------------------------------
// Expr
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }
}

/// Expression over run-time values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Value,
    },
    Ref {
        reference: Reference,
    },
    Compare {
        cmp: Comparison,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And {
        terms: Vec<Expr>,
    },
    Or {
        terms: Vec<Expr>,
    },
    Not {
        term: Box<Expr>,
    },
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Integers `start, start+step, ...` up to but excluding `end`.
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        step: Box<Expr>,
    },
    Length {
        of: Box<Expr>,
    },
    /// Opaque JEXL source evaluated as-is.
    Jexl {
        source: String,
    },
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn jexl(source: impl Into<String>) -> Self {
        Expr::Jexl {
            source: source.into(),
        }
    }

    fn compare(self, cmp: Comparison, other: impl Into<Expr>) -> Expr {
        Expr::Compare {
            cmp,
            lhs: Box::new(self),
            rhs: Box::new(other.into()),
        }
    }

    pub fn equals(self, other: impl Into<Expr>) -> Expr {
        self.compare(Comparison::Eq, other)
    }

    pub fn not_equals(self, other: impl Into<Expr>) -> Expr {
        self.compare(Comparison::Ne, other)
    }

    pub fn less_than(self, other: impl Into<Expr>) -> Expr {
        self.compare(Comparison::Lt, other)
    }

    pub fn less_eq(self, other: impl Into<Expr>) -> Expr {
        self.compare(Comparison::Le, other)
    }

    pub fn greater_than(self, other: impl Into<Expr>) -> Expr {
        self.compare(Comparison::Gt, other)
    }

    pub fn greater_eq(self, other: impl Into<Expr>) -> Expr {
        self.compare(Comparison::Ge, other)
    }

    /// Conjunction; nested `And`s are flattened.
    pub fn and(self, other: impl Into<Expr>) -> Expr {
        let mut terms = match self {
            Expr::And { terms } => terms,
            other => vec![other],
        };
        match other.into() {
            Expr::And { terms: more } => terms.extend(more),
            other => terms.push(other),
        }
        Expr::And { terms }
    }

    /// Disjunction; nested `Or`s are flattened.
    pub fn or(self, other: impl Into<Expr>) -> Expr {
        let mut terms = match self {
            Expr::Or { terms } => terms,
            other => vec![other],
        };
        match other.into() {
            Expr::Or { terms: more } => terms.extend(more),
            other => terms.push(other),
        }
        Expr::Or { terms }
    }

    pub fn negate(self) -> Expr {
        Expr::Not {
            term: Box::new(self),
        }
    }

    pub fn length(self) -> Expr {
        Expr::Length { of: Box::new(self) }
    }

    /// Every reference read by this expression, in traversal order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Expr::Literal { .. } | Expr::Jexl { .. } => {}
            Expr::Ref { reference } => out.push(reference),
            Expr::Compare { lhs, rhs, .. } => {
                lhs.collect_references(out);
                rhs.collect_references(out);
            }
            Expr::And { terms } | Expr::Or { terms } => {
                for t in terms {
                    t.collect_references(out);
                }
            }
            Expr::Not { term } => term.collect_references(out),
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_references(out);
                then.collect_references(out);
                otherwise.collect_references(out);
            }
            Expr::Range { start, end, step } => {
                start.collect_references(out);
                end.collect_references(out);
                step.collect_references(out);
            }
            Expr::Length { of } => of.collect_references(out),
        }
    }

    /// Render as a JEXL string (for adapters and diagnostics).
    pub fn to_jexl(&self) -> String {
        match self {
            Expr::Literal { value } => value.to_string(),
            Expr::Ref { reference } => reference.to_jexl(),
            Expr::Compare { cmp, lhs, rhs } => {
                format!("({} {} {})", lhs.to_jexl(), cmp.symbol(), rhs.to_jexl())
            }
            Expr::And { terms } => join_terms(terms, " && "),
            Expr::Or { terms } => join_terms(terms, " || "),
            Expr::Not { term } => format!("!{}", term.to_jexl()),
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => format!(
                "({} ? {} : {})",
                cond.to_jexl(),
                then.to_jexl(),
                otherwise.to_jexl()
            ),
            Expr::Range { start, end, step } => format!(
                "{}|range({}, {})",
                start.to_jexl(),
                end.to_jexl(),
                step.to_jexl()
            ),
            Expr::Length { of } => format!("{}|length", of.to_jexl()),
            Expr::Jexl { source } => source.clone(),
        }
    }
}

fn join_terms(terms: &[Expr], sep: &str) -> String {
    let rendered: Vec<String> = terms.iter().map(Expr::to_jexl).collect();
    format!("({})", rendered.join(sep))
}

/// `cond ? then : otherwise`.
pub fn if_then_else(cond: impl Into<Expr>, then: impl Into<Expr>, otherwise: impl Into<Expr>) -> Expr {
    Expr::IfElse {
        cond: Box::new(cond.into()),
        then: Box::new(then.into()),
        otherwise: Box::new(otherwise.into()),
    }
}

/// `[0, 1, ..., end-1]`; `end` may be a reference.
pub fn range(end: impl Into<Expr>) -> Expr {
    range_from(0, end, 1)
}

/// `[start, start+step, ...)` up to `end` (exclusive).
pub fn range_from(start: impl Into<Expr>, end: impl Into<Expr>, step: impl Into<Expr>) -> Expr {
    Expr::Range {
        start: Box::new(start.into()),
        end: Box::new(end.into()),
        step: Box::new(step.into()),
    }
}

impl From<Reference> for Expr {
    fn from(reference: Reference) -> Self {
        Expr::Ref { reference }
    }
}

impl From<&Reference> for Expr {
    fn from(reference: &Reference) -> Self {
        Expr::Ref {
            reference: reference.clone(),
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Literal { value }
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::literal(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::literal(v)
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::literal(v)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self {
        Expr::literal(v)
    }
}

impl From<&str> for Expr {
    fn from(v: &str) -> Self {
        Expr::literal(v)
    }
}

impl From<String> for Expr {
    fn from(v: String) -> Self {
        Expr::literal(v)
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Integer sequence definition (`with_sequence`). Either `count` or `end` bounds it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Expr>,
    /// printf-style `%d` / `%0Nd` format turning each number into a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Sequence {
    pub fn count(count: impl Into<Expr>) -> Self {
        Self {
            count: Some(count.into()),
            ..Self::default()
        }
    }

    /// Inclusive `start..=end`, matching the cluster engine.
    pub fn between(start: impl Into<Expr>, end: impl Into<Expr>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Self::default()
        }
    }

    pub fn formatted(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn references(&self) -> Vec<&Reference> {
        [&self.start, &self.end, &self.count]
            .into_iter()
            .flatten()
            .flat_map(Expr::references)
            .collect()
    }
}

/// How a step fans out into parallel runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FanOut {
    /// One run per element of a list-valued expression.
    Param { items: Expr },
    /// One run per number of a sequence.
    Sequence { sequence: Sequence },
}

impl FanOut {
    pub fn references(&self) -> Vec<&Reference> {
        match self {
            FanOut::Param { items } => items.references(),
            FanOut::Sequence { sequence } => sequence.references(),
        }
    }
}
