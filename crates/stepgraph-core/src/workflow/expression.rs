//! Expression evaluation for guards, fan-out lists, computed arguments and
//! container outputs.
//!
//! Structured [`Expr`] trees are evaluated natively against a [`Scope`].
//! Opaque `Expr::Jexl` sources go through `jexl_eval` with the standard
//! transforms pre-registered; the scope is passed as a context object and
//! never interpolated into the expression string.

use serde_json::{json, Value};
use stepgraph_types::artifact::ArtifactHandle;
use stepgraph_types::expr::{Comparison, Expr, Sequence};

use super::context::{ResolveError, Scope};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("cannot apply '{op}' to {detail}")]
    Type { op: &'static str, detail: String },

    #[error("expected a list, got {0}")]
    NotAList(Value),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid sequence format '{0}'")]
    InvalidFormat(String),
}

impl ExpressionError {
    /// Whether evaluation failed only because an upstream step did not succeed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ExpressionError::Resolve(e) if e.is_unavailable())
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluator shared by every container of a run.
pub struct Evaluator {
    jexl: jexl_eval::Evaluator<'static>,
}

impl Evaluator {
    pub fn new() -> Self {
        let jexl = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = args.first().map_or(0, length_of);
                Ok(json!(len))
            })
            // `start|range(end, step)`; invalid bounds yield an empty list
            .with_transform("range", |args: &[Value]| {
                let start = args.first().and_then(as_integer).unwrap_or(0);
                let end = args.get(1).and_then(as_integer).unwrap_or(start);
                let step = args.get(2).and_then(as_integer).unwrap_or(1);
                Ok(json!(integer_range(start, end, step).unwrap_or_default()))
            });

        Self { jexl }
    }

    /// Evaluate an expression to a JSON value.
    pub fn evaluate(&self, expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Literal { value } => Ok(value.clone()),
            Expr::Ref { reference } => {
                if reference.is_artifact() {
                    let handle = scope.artifact(reference)?;
                    Ok(json!(handle.locator.display_path()))
                } else {
                    Ok(scope.parameter(reference)?)
                }
            }
            Expr::Compare { cmp, lhs, rhs } => {
                let l = self.evaluate(lhs, scope)?;
                let r = self.evaluate(rhs, scope)?;
                compare(*cmp, &l, &r).map(Value::Bool)
            }
            Expr::And { terms } => {
                for term in terms {
                    if !value_to_bool(&self.evaluate(term, scope)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or { terms } => {
                for term in terms {
                    if value_to_bool(&self.evaluate(term, scope)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Not { term } => Ok(Value::Bool(!value_to_bool(&self.evaluate(term, scope)?))),
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                // only the chosen branch is evaluated
                if value_to_bool(&self.evaluate(cond, scope)?) {
                    self.evaluate(then, scope)
                } else {
                    self.evaluate(otherwise, scope)
                }
            }
            Expr::Range { start, end, step } => {
                let start = self.integer(start, scope, "range")?;
                let end = self.integer(end, scope, "range")?;
                let step = self.integer(step, scope, "range")?;
                Ok(json!(integer_range(start, end, step)?))
            }
            Expr::Length { of } => {
                let value = self.evaluate(of, scope)?;
                match &value {
                    Value::Array(_) | Value::String(_) | Value::Object(_) => Ok(json!(length_of(&value))),
                    other => Err(ExpressionError::Type {
                        op: "length",
                        detail: other.to_string(),
                    }),
                }
            }
            Expr::Jexl { source } => self
                .jexl
                .eval_in_context(source, &scope.to_expression_context())
                .map_err(|e| ExpressionError::EvalFailed(e.to_string())),
        }
    }

    /// Evaluate and coerce to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expr: &Expr, scope: &Scope<'_>) -> Result<bool, ExpressionError> {
        Ok(value_to_bool(&self.evaluate(expr, scope)?))
    }

    /// Evaluate to a list. A JSON-encoded string holding a list is decoded.
    pub fn evaluate_list(&self, expr: &Expr, scope: &Scope<'_>) -> Result<Vec<Value>, ExpressionError> {
        match self.evaluate(expr, scope)? {
            Value::Array(items) => Ok(items),
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(Value::Array(items)) => Ok(items),
                _ => Err(ExpressionError::NotAList(Value::String(s))),
            },
            other => Err(ExpressionError::NotAList(other)),
        }
    }

    /// Evaluate an expression selecting an artifact: a reference, or an
    /// if/else choosing between such expressions.
    pub fn evaluate_artifact(&self, expr: &Expr, scope: &Scope<'_>) -> Result<ArtifactHandle, ExpressionError> {
        match expr {
            Expr::Ref { reference } => Ok(scope.artifact(reference)?),
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                if self.evaluate_bool(cond, scope)? {
                    self.evaluate_artifact(then, scope)
                } else {
                    self.evaluate_artifact(otherwise, scope)
                }
            }
            other => Err(ExpressionError::Type {
                op: "artifact",
                detail: other.to_jexl(),
            }),
        }
    }

    /// Expand an integer sequence, formatting each number when requested.
    ///
    /// `count` yields `start..start+count`; `start`/`end` is inclusive and
    /// counts down when `end < start`.
    pub fn sequence(&self, sequence: &Sequence, scope: &Scope<'_>) -> Result<Vec<Value>, ExpressionError> {
        let start = match &sequence.start {
            Some(e) => self.integer(e, scope, "sequence")?,
            None => 0,
        };
        let numbers: Vec<i64> = match (&sequence.count, &sequence.end) {
            (Some(count), _) => {
                let count = self.integer(count, scope, "sequence")?;
                if count < 0 {
                    return Err(ExpressionError::InvalidRange(format!("negative count {count}")));
                }
                let end = start.checked_add(count).ok_or_else(|| {
                    ExpressionError::InvalidRange(format!("{start} + {count} overflows"))
                })?;
                check_len("sequence", i128::from(count))?;
                (start..end).collect()
            }
            (None, Some(end)) => {
                let end = self.integer(end, scope, "sequence")?;
                check_len("sequence", (i128::from(end) - i128::from(start)).abs() + 1)?;
                if end >= start {
                    (start..=end).collect()
                } else {
                    (end..=start).rev().collect()
                }
            }
            (None, None) => {
                return Err(ExpressionError::InvalidRange(
                    "sequence needs a count or an end".to_string(),
                ));
            }
        };
        match &sequence.format {
            None => Ok(numbers.into_iter().map(Value::from).collect()),
            Some(format) => numbers
                .into_iter()
                .map(|n| format_number(format, n).map(Value::String))
                .collect(),
        }
    }

    fn integer(&self, expr: &Expr, scope: &Scope<'_>, op: &'static str) -> Result<i64, ExpressionError> {
        let value = self.evaluate(expr, scope)?;
        as_integer(&value).ok_or_else(|| ExpressionError::Type {
            op,
            detail: value.to_string(),
        })
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn length_of(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        _ => 0,
    }
}

/// Integral value of a number or numeric string.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn integer_range(start: i64, end: i64, step: i64) -> Result<Vec<i64>, ExpressionError> {
    if step == 0 {
        return Err(ExpressionError::InvalidRange("step must not be zero".to_string()));
    }
    let (span, step) = (i128::from(end) - i128::from(start), i128::from(step));
    let len = if span.signum() == step.signum() {
        (span.abs() + step.abs() - 1) / step.abs()
    } else {
        0
    };
    let len = check_len("range", len)?;
    // every element lies between start and end, so the cast cannot truncate
    Ok((0..len as i128).map(|k| (i128::from(start) + k * step) as i64).collect())
}

/// Longest list a range or sequence may expand to.
pub const MAX_EXPANSION: usize = 1_000_000;

fn check_len(op: &str, len: i128) -> Result<usize, ExpressionError> {
    if len > MAX_EXPANSION as i128 {
        return Err(ExpressionError::InvalidRange(format!(
            "{op} of {len} elements exceeds {MAX_EXPANSION}"
        )));
    }
    Ok(len.max(0) as usize)
}

/// Compare two values. Numbers (and numeric strings opposite a number)
/// compare numerically; strings compare lexicographically.
fn compare(cmp: Comparison, l: &Value, r: &Value) -> Result<bool, ExpressionError> {
    let numeric = match (l, r) {
        (Value::Number(_), Value::Number(_))
        | (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_)) => as_number(l).zip(as_number(r)),
        _ => None,
    };
    let ordering = match (numeric, l, r) {
        (Some((a, b)), _, _) => a.partial_cmp(&b),
        (None, Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (None, Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match cmp {
        Comparison::Eq => Ok(ordering.map_or(l == r, |o| o.is_eq())),
        Comparison::Ne => Ok(ordering.map_or(l != r, |o| o.is_ne())),
        _ => {
            let o = ordering.ok_or_else(|| ExpressionError::Type {
                op: cmp.symbol(),
                detail: format!("{l} and {r}"),
            })?;
            Ok(match cmp {
                Comparison::Lt => o.is_lt(),
                Comparison::Le => o.is_le(),
                Comparison::Gt => o.is_gt(),
                _ => o.is_ge(),
            })
        }
    }
}

/// printf-style integer formatting: `%d`, `%5d`, `%05d` with surrounding text.
fn format_number(format: &str, n: i64) -> Result<String, ExpressionError> {
    let invalid = || ExpressionError::InvalidFormat(format.to_string());
    let start = format.find('%').ok_or_else(invalid)?;
    let rest = &format[start + 1..];
    let end = rest.find('d').ok_or_else(invalid)?;
    let spec = &rest[..end];
    let zero = spec.starts_with('0');
    let width: usize = if spec.is_empty() {
        0
    } else {
        spec.parse().map_err(|_| invalid())?
    };
    let number = if zero {
        format!("{n:0width$}")
    } else {
        format!("{n:width$}")
    };
    Ok(format!("{}{}{}", &format[..start], number, &rest[end + 1..]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::BindingEnv;
    use stepgraph_types::expr::{if_then_else, range, range_from, Reference};
    use stepgraph_types::run::{StepOutputs, StepPhase};

    fn env() -> BindingEnv {
        let mut env = BindingEnv::new(StepOutputs::new().with_parameter("n", json!(3)));
        env.record(
            "flip",
            StepPhase::Succeeded,
            &StepOutputs::new(),
            &StepOutputs::new().with_parameter("result", json!("heads")),
        )
        .unwrap();
        env.record("tails", StepPhase::Skipped, &StepOutputs::new(), &StepOutputs::new())
            .unwrap();
        env
    }

    #[test]
    fn test_compare_and_logic() {
        let env = env();
        let eval = Evaluator::new();
        let flip = Reference::step_output("flip", "result");
        assert!(eval.evaluate_bool(&flip.equals("heads"), &env.scope()).unwrap());
        assert!(!eval.evaluate_bool(&flip.equals("tails"), &env.scope()).unwrap());
        let guard = flip.equals("heads").and(Reference::input("n").greater_than(2));
        assert!(eval.evaluate_bool(&guard, &env.scope()).unwrap());
        assert!(!eval.evaluate_bool(&guard.negate(), &env.scope()).unwrap());
    }

    #[test]
    fn test_numeric_strings_compare_numerically() {
        assert!(compare(Comparison::Eq, &json!(1), &json!(1.0)).unwrap());
        assert!(compare(Comparison::Lt, &json!("9"), &json!(10)).unwrap());
        assert!(compare(Comparison::Lt, &json!("10"), &json!("9")).unwrap());
        assert!(compare(Comparison::Lt, &json!({}), &json!(1)).is_err());
    }

    #[test]
    fn test_if_else_evaluates_only_chosen_branch() {
        let env = env();
        let eval = Evaluator::new();
        let expr = if_then_else(
            Reference::step_output("flip", "result").equals("heads"),
            Reference::step_output("flip", "result"),
            Reference::step_output("tails", "result"),
        );
        assert_eq!(eval.evaluate(&expr, &env.scope()).unwrap(), json!("heads"));

        let expr = if_then_else(false, 1, Reference::step_output("tails", "result"));
        let err = eval.evaluate(&expr, &env.scope()).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_range_and_length() {
        let env = env();
        let eval = Evaluator::new();
        let items = eval.evaluate_list(&range(Reference::input("n")), &env.scope()).unwrap();
        assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
        let down = eval.evaluate(&range_from(3, 0, -1), &env.scope()).unwrap();
        assert_eq!(down, json!([3, 2, 1]));
        assert!(eval.evaluate(&range_from(0, 3, 0), &env.scope()).is_err());
        let len = eval.evaluate(&range(4).length(), &env.scope()).unwrap();
        assert_eq!(len, json!(4));
    }

    #[test]
    fn test_evaluate_list_decodes_json_string() {
        let env = BindingEnv::default();
        let eval = Evaluator::new();
        let items = eval
            .evaluate_list(&Expr::literal("[\"f1.txt\", \"f2.txt\"]"), &env.scope())
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(eval.evaluate_list(&Expr::literal(5), &env.scope()).is_err());
    }

    #[test]
    fn test_sequence_count_between_and_format() {
        let env = env();
        let eval = Evaluator::new();
        let seq = Sequence::count(Reference::input("n"));
        assert_eq!(eval.sequence(&seq, &env.scope()).unwrap(), vec![json!(0), json!(1), json!(2)]);

        let seq = Sequence::between(2, 4);
        assert_eq!(eval.sequence(&seq, &env.scope()).unwrap(), vec![json!(2), json!(3), json!(4)]);

        let seq = Sequence::between(3, 1).formatted("part-%03d.txt");
        assert_eq!(
            eval.sequence(&seq, &env.scope()).unwrap(),
            vec![json!("part-003.txt"), json!("part-002.txt"), json!("part-001.txt")]
        );
    }

    #[test]
    fn test_sequence_and_range_bounds() {
        let env = env();
        let eval = Evaluator::new();
        let near_max = Sequence {
            start: Some(i64::MAX.into()),
            ..Sequence::count(2)
        };
        assert!(matches!(
            eval.sequence(&near_max, &env.scope()),
            Err(ExpressionError::InvalidRange(_))
        ));
        let huge = Sequence::between(i64::MIN, i64::MAX);
        assert!(matches!(eval.sequence(&huge, &env.scope()), Err(ExpressionError::InvalidRange(_))));
        assert!(matches!(
            eval.sequence(&Sequence::count(i64::MAX), &env.scope()),
            Err(ExpressionError::InvalidRange(_))
        ));

        assert!(eval.evaluate(&range_from(0, i64::MAX, 1), &env.scope()).is_err());
        let edge = eval
            .evaluate(&range_from(i64::MAX - 2, i64::MAX, 1), &env.scope())
            .unwrap();
        assert_eq!(edge, json!([i64::MAX - 2, i64::MAX - 1]));
        let stepped = eval.evaluate(&range_from(0, 7, 3), &env.scope()).unwrap();
        assert_eq!(stepped, json!([0, 3, 6]));
    }

    #[test]
    fn test_format_number_variants() {
        assert_eq!(format_number("%d", 7).unwrap(), "7");
        assert_eq!(format_number("%3d", 7).unwrap(), "  7");
        assert_eq!(format_number("x%02dy", 7).unwrap(), "x07y");
        assert!(format_number("%s", 7).is_err());
    }

    #[test]
    fn test_jexl_over_scope() {
        let env = env();
        let eval = Evaluator::new();
        let expr = Expr::jexl("steps.flip.outputs.parameters.result == 'heads' && inputs.parameters.n > 2");
        assert!(eval.evaluate_bool(&expr, &env.scope()).unwrap());

        let expr = Expr::jexl("steps.flip.outputs.parameters.result|upper");
        assert_eq!(eval.evaluate(&expr, &env.scope()).unwrap(), json!("HEADS"));
    }

    #[test]
    fn test_jexl_item_access() {
        let env = BindingEnv::default();
        let eval = Evaluator::new();
        let item = json!({"name": "f1.txt"});
        let expr = Expr::jexl("item.name|endsWith('.txt')");
        assert!(eval.evaluate_bool(&expr, &env.scope().with_item(&item)).unwrap());
    }

    #[test]
    fn test_truthiness() {
        assert!(!value_to_bool(&json!(null)));
        assert!(!value_to_bool(&json!(0)));
        assert!(!value_to_bool(&json!("")));
        assert!(!value_to_bool(&json!("false")));
        assert!(value_to_bool(&json!([])));
        assert!(value_to_bool(&json!("yes")));
    }

    #[test]
    fn test_artifact_choice() {
        let mut env = BindingEnv::default();
        env.record(
            "a",
            StepPhase::Succeeded,
            &StepOutputs::new(),
            &StepOutputs::new().with_artifact("out", ArtifactHandle::raw("from a")),
        )
        .unwrap();
        env.record("b", StepPhase::Skipped, &StepOutputs::new(), &StepOutputs::new())
            .unwrap();
        let eval = Evaluator::new();
        let pick = if_then_else(
            Expr::literal(true),
            Reference::step_artifact("a", "out"),
            Reference::step_artifact("b", "out"),
        );
        assert_eq!(
            eval.evaluate_artifact(&pick, &env.scope()).unwrap(),
            ArtifactHandle::raw("from a")
        );
        let err = eval
            .evaluate_artifact(&Expr::from(Reference::step_artifact("b", "out")), &env.scope())
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
