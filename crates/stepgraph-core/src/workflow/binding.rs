//! Graph preparation: reference checks, type and artifact-flag unification,
//! dependency inference.
//!
//! `prepare` walks a template tree bottom-up. For every container it checks
//! that each reference names something visible (earlier layers for Steps,
//! any sibling for DAGs), that every required input is bound, and that fan-out
//! and slice settings are coherent. Where two ends of a reference disagree on
//! a declared type or as-artifact flag it reports the conflict; where one end
//! leaves it unset it is filled in from the other.

use stepgraph_types::error::GraphError;
use stepgraph_types::expr::{Direction, Expr, IoClass, RefScope, Reference};
use stepgraph_types::io::{ArgumentValue, ArtifactFlag, Inputs, OutputSource, Outputs, ValueType};
use stepgraph_types::step::Step;
use stepgraph_types::template::{Dag, LoopTemplate, ScriptTemplate, Steps, Template};

use super::dag;

/// Validate and unify a template tree in place.
pub fn prepare(template: &mut Template) -> Result<(), GraphError> {
    match template {
        Template::Script(t) => check_script_outputs(t),
        Template::Steps(s) => prepare_steps(s),
        Template::Dag(d) => prepare_dag(d),
        Template::Loop(l) => prepare_loop(l),
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// How a reader sees a sibling it names.
enum Sibling<'a> {
    Visible(&'a Step),
    SameLayer,
    Unknown,
}

fn prepare_steps(s: &mut Steps) -> Result<(), GraphError> {
    for layer in s.layers_mut() {
        for step in layer.iter_mut() {
            prepare(step.template_mut())?;
        }
    }

    let fixes = {
        let view: &Steps = s;
        let mut fixes = Vec::new();
        for (li, layer) in view.layers().iter().enumerate() {
            for step in layer {
                let lookup = |name: &str| match view.layer_of(name) {
                    Some(pl) if pl < li => view.step(name).map_or(Sibling::Unknown, Sibling::Visible),
                    Some(pl) if pl == li => Sibling::SameLayer,
                    _ => Sibling::Unknown,
                };
                check_step(&view.name, &view.inputs, step, &lookup)?;
                fixes.extend(plan_step_unification(&view.name, &view.inputs, step, &lookup)?);
            }
        }
        let lookup = |name: &str| view.step(name);
        fixes.extend(check_container_outputs(
            &view.name,
            &view.inputs,
            &view.outputs,
            &lookup,
            None,
        )?);
        fixes
    };

    let mut inputs = s.inputs.clone();
    let mut outputs = s.outputs.clone();
    let steps = s.layers_mut().iter_mut().flat_map(|layer| layer.iter_mut());
    apply_fixes(&fixes, &mut inputs, &mut outputs, steps);
    s.inputs = inputs;
    s.outputs = outputs;
    Ok(())
}

fn prepare_dag(d: &mut Dag) -> Result<(), GraphError> {
    for task in d.tasks_mut() {
        prepare(task.template_mut())?;
    }
    dag::infer_dependencies(d)?;
    dag::validate_dag(&d.name, d.tasks())?;

    let fixes = {
        let view: &Dag = d;
        let lookup = |name: &str| view.task(name).map_or(Sibling::Unknown, Sibling::Visible);
        let mut fixes = Vec::new();
        for task in view.tasks() {
            check_step(&view.name, &view.inputs, task, &lookup)?;
            fixes.extend(plan_step_unification(&view.name, &view.inputs, task, &lookup)?);
        }
        let lookup = |name: &str| view.task(name);
        fixes.extend(check_container_outputs(
            &view.name,
            &view.inputs,
            &view.outputs,
            &lookup,
            None,
        )?);
        fixes
    };

    let mut inputs = d.inputs.clone();
    let mut outputs = d.outputs.clone();
    apply_fixes(&fixes, &mut inputs, &mut outputs, d.tasks_mut().iter_mut());
    d.inputs = inputs;
    d.outputs = outputs;
    Ok(())
}

fn prepare_loop(l: &mut LoopTemplate) -> Result<(), GraphError> {
    prepare(&mut l.body)?;

    let body_inputs = l.body.inputs();
    for name in l.carry.keys() {
        if !body_inputs.parameters.contains_key(name) && !body_inputs.artifacts.contains_key(name) {
            return Err(GraphError::UnknownInput {
                template: l.body.name().to_string(),
                name: name.clone(),
            });
        }
    }

    let body_outputs = l.body.outputs();
    let exprs = l.carry.values().chain(std::iter::once(&l.until));
    for r in exprs.flat_map(Expr::references) {
        let known = match &r.scope {
            RefScope::Iteration => has_output(body_outputs, r),
            RefScope::LoopIndex => true,
            RefScope::Container => has_input(&l.inputs, r),
            RefScope::Step { .. } | RefScope::Item => false,
        };
        if !known {
            return Err(GraphError::UnknownReference {
                context: l.name.clone(),
                reference: r.to_string(),
            });
        }
    }

    let lookup = |_: &str| -> Option<&Step> { None };
    check_container_outputs(&l.name, &l.inputs, &l.outputs, &lookup, Some(body_outputs))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Step checks
// ---------------------------------------------------------------------------

fn check_step<'a>(
    container: &str,
    inputs: &Inputs,
    step: &Step,
    lookup: &dyn Fn(&str) -> Sibling<'a>,
) -> Result<(), GraphError> {
    let context = format!("{container}/{}", step.name);
    for r in step.references() {
        match &r.scope {
            RefScope::Step { step: producer } => match lookup(producer.as_str()) {
                Sibling::Visible(p) => {
                    if !step_has(p, r) {
                        return Err(GraphError::UnknownReference {
                            context,
                            reference: r.to_string(),
                        });
                    }
                }
                Sibling::SameLayer => {
                    return Err(GraphError::SameLayerReference {
                        step: step.name.clone(),
                        sibling: producer.clone(),
                    });
                }
                Sibling::Unknown => {
                    return Err(GraphError::UnknownReference {
                        context,
                        reference: r.to_string(),
                    });
                }
            },
            RefScope::Container => {
                if !has_input(inputs, r) {
                    return Err(GraphError::UnknownReference {
                        context,
                        reference: r.to_string(),
                    });
                }
            }
            RefScope::Item => {
                if !step.is_fan_out() {
                    return Err(GraphError::InvalidFanOut {
                        step: step.name.clone(),
                        reason: "reads the fan-out item but does not fan out".to_string(),
                    });
                }
            }
            RefScope::Iteration | RefScope::LoopIndex => {
                return Err(GraphError::UnknownReference {
                    context,
                    reference: r.to_string(),
                });
            }
        }
    }

    for (name, bound) in &step.parameters {
        if bound.value.is_none() && bound.decl.default.is_none() {
            return Err(GraphError::MissingArgument {
                step: step.name.clone(),
                name: name.clone(),
            });
        }
        if let (Some(ArgumentValue::Literal { value }), Some(ty)) = (&bound.value, &bound.decl.value_type) {
            let sliced = step
                .slices
                .as_ref()
                .is_some_and(|s| s.input_parameters.contains(name));
            let expected = if sliced { ValueType::list_of(ty.clone()) } else { ty.clone() };
            if !expected.admits(value) {
                return Err(GraphError::TypeMismatch {
                    context: format!("{}.{name}", step.name),
                    detail: format!("literal {value} is not a {expected:?}"),
                });
            }
        }
        if let Some(ArgumentValue::Reference { reference }) = &bound.value {
            if reference.is_artifact() {
                return Err(GraphError::TypeMismatch {
                    context: format!("{}.{name}", step.name),
                    detail: format!("parameter bound to artifact {reference}"),
                });
            }
        }
    }
    for (name, bound) in &step.artifacts {
        if bound.source.is_none() && !bound.decl.optional {
            return Err(GraphError::MissingArgument {
                step: step.name.clone(),
                name: name.clone(),
            });
        }
    }

    check_fan_out(step)
}

fn check_fan_out(step: &Step) -> Result<(), GraphError> {
    let invalid_slices = |reason: String| GraphError::InvalidSlices {
        step: step.name.clone(),
        reason,
    };

    if let Some(stepgraph_types::expr::FanOut::Param {
        items: Expr::Literal { value },
    }) = &step.fan_out
    {
        if !value.is_array() && !value.is_string() {
            return Err(GraphError::InvalidFanOut {
                step: step.name.clone(),
                reason: format!("items literal {value} is not a list"),
            });
        }
    }

    let Some(slices) = &step.slices else {
        return Ok(());
    };
    for name in &slices.input_parameters {
        if !step.parameters.contains_key(name) {
            return Err(invalid_slices(format!("no input parameter '{name}'")));
        }
    }
    for name in &slices.input_artifacts {
        if !step.artifacts.contains_key(name) {
            return Err(invalid_slices(format!("no input artifact '{name}'")));
        }
    }
    for name in &slices.output_parameters {
        if !step.outputs.parameters.contains_key(name) {
            return Err(invalid_slices(format!("no output parameter '{name}'")));
        }
    }
    for name in &slices.output_artifacts {
        if !step.outputs.artifacts.contains_key(name) {
            return Err(invalid_slices(format!("no output artifact '{name}'")));
        }
    }
    if slices.sub_path && slices.input_artifacts.is_empty() {
        return Err(invalid_slices("sub-path slicing needs a sliced input artifact".to_string()));
    }
    if step.fan_out.is_none() && slices.input_parameters.is_empty() && slices.input_artifacts.is_empty() {
        return Err(invalid_slices("nothing drives the fan-out".to_string()));
    }
    if slices.group_size == Some(0) || slices.pool_size == Some(0) {
        return Err(invalid_slices("group and pool sizes must be positive".to_string()));
    }
    Ok(())
}

fn check_script_outputs(t: &ScriptTemplate) -> Result<(), GraphError> {
    let invalid = |output: &str, reason: &str| GraphError::InvalidOutput {
        template: t.name.clone(),
        output: output.to_string(),
        reason: reason.to_string(),
    };
    for (name, out) in &t.outputs.parameters {
        match &out.source {
            OutputSource::Path { .. } => {}
            OutputSource::Expression { expr } => {
                if expr.references().iter().any(|r| r.scope != RefScope::Container) {
                    return Err(invalid(name, "a leaf expression may only read the template's inputs"));
                }
            }
            OutputSource::Reference { .. } => {
                return Err(invalid(name, "a leaf output comes from a path or an expression"));
            }
        }
    }
    for (name, out) in &t.outputs.artifacts {
        if !matches!(out.source, OutputSource::Path { .. }) {
            return Err(invalid(name, "a leaf artifact comes from a path"));
        }
    }
    Ok(())
}

/// Check a container's output sources and plan type fixes for them.
fn check_container_outputs<'a>(
    container: &str,
    inputs: &Inputs,
    outputs: &Outputs,
    lookup: &dyn Fn(&str) -> Option<&'a Step>,
    iteration: Option<&Outputs>,
) -> Result<Vec<Fix>, GraphError> {
    let invalid = |output: &str, reason: String| GraphError::InvalidOutput {
        template: container.to_string(),
        output: output.to_string(),
        reason,
    };
    let check_ref = |output: &str, r: &Reference| -> Result<(), GraphError> {
        let ok = match &r.scope {
            RefScope::Step { step } => lookup(step.as_str()).is_some_and(|s| step_has(s, r)),
            RefScope::Container => has_input(inputs, r),
            RefScope::Iteration => iteration.is_some_and(|o| has_output(o, r)),
            RefScope::Item | RefScope::LoopIndex => false,
        };
        if ok {
            Ok(())
        } else {
            Err(invalid(output, format!("{r} is not visible here")))
        }
    };

    let mut fixes = Vec::new();
    let sources = outputs
        .parameters
        .iter()
        .map(|(k, o)| (k, &o.source))
        .chain(outputs.artifacts.iter().map(|(k, o)| (k, &o.source)));
    for (name, source) in sources {
        match source {
            OutputSource::Path { .. } => {
                return Err(invalid(name, "container outputs come from a reference or an expression".to_string()));
            }
            OutputSource::Reference { reference } => check_ref(name, reference)?,
            OutputSource::Expression { expr } => {
                for r in expr.references() {
                    check_ref(name, r)?;
                }
            }
        }
    }

    for (name, out) in &outputs.parameters {
        let OutputSource::Reference { reference } = &out.source else {
            continue;
        };
        let RefScope::Step { step } = &reference.scope else {
            continue;
        };
        let Some(producer) = lookup(step.as_str()) else {
            continue;
        };
        let Some((ty, flag)) = producer_signature(producer, reference) else {
            continue;
        };
        let context = format!("{container}.{name}");
        let unified = unify_types(&ty, &out.value_type).map_err(|detail| GraphError::TypeMismatch {
            context: context.clone(),
            detail,
        })?;
        let flag = merge_flags(flag, out.as_artifact).ok_or_else(|| GraphError::ArtifactFlagConflict {
            producer: reference.to_string(),
            consumer: context.clone(),
        })?;
        fixes.push(Fix {
            target: Target::ContainerOutput { name: name.clone() },
            value_type: unified,
            flag,
        });
    }
    Ok(fixes)
}

// ---------------------------------------------------------------------------
// Unification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Target {
    StepInput { step: String, name: String },
    StepOutput { step: String, name: String },
    ContainerInput { name: String },
    ContainerOutput { name: String },
}

/// Type and flag to fill in where the target leaves them unset.
#[derive(Debug, Clone)]
struct Fix {
    target: Target,
    value_type: Option<ValueType>,
    flag: ArtifactFlag,
}

fn plan_step_unification<'a>(
    container: &str,
    inputs: &Inputs,
    step: &Step,
    lookup: &dyn Fn(&str) -> Sibling<'a>,
) -> Result<Vec<Fix>, GraphError> {
    let mut fixes = Vec::new();
    for (name, bound) in &step.parameters {
        let Some(ArgumentValue::Reference { reference }) = &bound.value else {
            continue;
        };
        let consumer = format!("{container}/{}.{name}", step.name);
        let sliced = step
            .slices
            .as_ref()
            .is_some_and(|s| s.input_parameters.contains(name));

        let (producer_ty, producer_flag, producer_target) = match &reference.scope {
            RefScope::Step { step: p } => {
                let Sibling::Visible(producer) = lookup(p.as_str()) else {
                    continue;
                };
                let Some((ty, flag)) = producer_signature(producer, reference) else {
                    continue;
                };
                let single = !producer.gathers_output(&reference.name);
                let target = (reference.direction == Direction::Outputs && single).then(|| Target::StepOutput {
                    step: p.clone(),
                    name: reference.name.clone(),
                });
                (ty, flag, target)
            }
            RefScope::Container => {
                let Some(decl) = inputs.parameters.get(&reference.name) else {
                    continue;
                };
                (
                    decl.value_type.clone(),
                    decl.as_artifact,
                    Some(Target::ContainerInput {
                        name: reference.name.clone(),
                    }),
                )
            }
            _ => continue,
        };

        // A sliced input receives one element of the bound list.
        let consumer_ty = if sliced {
            bound.decl.value_type.clone().map(ValueType::list_of)
        } else {
            bound.decl.value_type.clone()
        };
        let unified = unify_types(&producer_ty, &consumer_ty).map_err(|detail| GraphError::TypeMismatch {
            context: consumer.clone(),
            detail,
        })?;
        let flag = merge_flags(producer_flag, bound.decl.as_artifact).ok_or_else(|| {
            GraphError::ArtifactFlagConflict {
                producer: reference.to_string(),
                consumer: consumer.clone(),
            }
        })?;

        let input_ty = match (&unified, sliced) {
            (Some(ty), true) => match ty.element() {
                Some(el) => Some(el.clone()),
                None if *ty == ValueType::Any => Some(ValueType::Any),
                None => {
                    return Err(GraphError::TypeMismatch {
                        context: consumer,
                        detail: format!("sliced input bound to non-list {ty:?}"),
                    });
                }
            },
            (ty, _) => ty.clone(),
        };
        fixes.push(Fix {
            target: Target::StepInput {
                step: step.name.clone(),
                name: name.clone(),
            },
            value_type: input_ty,
            flag,
        });
        if let Some(target) = producer_target {
            fixes.push(Fix {
                target,
                value_type: if sliced { None } else { unified },
                flag,
            });
        }
    }
    Ok(fixes)
}

/// Declared type and flag at the producing end of a parameter reference,
/// as seen by a reader (a fan-out producer's gathered outputs are lists).
fn producer_signature(producer: &Step, r: &Reference) -> Option<(Option<ValueType>, ArtifactFlag)> {
    if r.class != IoClass::Parameter {
        return None;
    }
    match r.direction {
        Direction::Outputs => producer.outputs.parameters.get(&r.name).map(|o| {
            let ty = if producer.gathers_output(&r.name) {
                Some(o.value_type.clone().map_or(ValueType::list_of(ValueType::Any), ValueType::list_of))
            } else {
                o.value_type.clone()
            };
            (ty, o.as_artifact)
        }),
        Direction::Inputs => producer
            .parameters
            .get(&r.name)
            .map(|b| (b.decl.value_type.clone(), b.decl.as_artifact)),
    }
}

fn unify_types(a: &Option<ValueType>, b: &Option<ValueType>) -> Result<Option<ValueType>, String> {
    match (a, b) {
        (None, x) | (x, None) => Ok(x.clone()),
        (Some(ValueType::Any), x) | (x, Some(ValueType::Any)) => Ok(x.clone()),
        (Some(ValueType::List(x)), Some(ValueType::List(y))) => {
            let inner = unify_types(&Some((**x).clone()), &Some((**y).clone()))?;
            Ok(inner.map(ValueType::list_of))
        }
        (Some(ValueType::Int), Some(ValueType::Float)) | (Some(ValueType::Float), Some(ValueType::Int)) => {
            Ok(Some(ValueType::Float))
        }
        (Some(x), Some(y)) if x == y => Ok(Some(x.clone())),
        (Some(x), Some(y)) => Err(format!("{x:?} vs {y:?}")),
    }
}

/// Merged flag, or `None` on an explicit on/off conflict.
fn merge_flags(a: ArtifactFlag, b: ArtifactFlag) -> Option<ArtifactFlag> {
    match (a, b) {
        (ArtifactFlag::Unset, x) | (x, ArtifactFlag::Unset) => Some(x),
        (x, y) if x == y => Some(x),
        _ => None,
    }
}

fn apply_fixes<'s>(
    fixes: &[Fix],
    inputs: &mut Inputs,
    outputs: &mut Outputs,
    steps: impl Iterator<Item = &'s mut Step>,
) {
    fn fill(ty: &mut Option<ValueType>, flag: &mut ArtifactFlag, fix: &Fix) {
        if ty.is_none() {
            *ty = fix.value_type.clone();
        }
        if *flag == ArtifactFlag::Unset {
            *flag = fix.flag;
        }
    }

    let mut steps: Vec<&mut Step> = steps.collect();
    for fix in fixes {
        match &fix.target {
            Target::StepInput { step, name } => {
                if let Some(bound) = steps
                    .iter_mut()
                    .find(|s| &s.name == step)
                    .and_then(|s| s.parameters.get_mut(name))
                {
                    fill(&mut bound.decl.value_type, &mut bound.decl.as_artifact, fix);
                }
            }
            Target::StepOutput { step, name } => {
                if let Some(out) = steps
                    .iter_mut()
                    .find(|s| &s.name == step)
                    .and_then(|s| s.outputs.parameters.get_mut(name))
                {
                    fill(&mut out.value_type, &mut out.as_artifact, fix);
                }
            }
            Target::ContainerInput { name } => {
                if let Some(decl) = inputs.parameters.get_mut(name) {
                    fill(&mut decl.value_type, &mut decl.as_artifact, fix);
                }
            }
            Target::ContainerOutput { name } => {
                if let Some(out) = outputs.parameters.get_mut(name) {
                    fill(&mut out.value_type, &mut out.as_artifact, fix);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

fn step_has(step: &Step, r: &Reference) -> bool {
    match (r.direction, r.class) {
        (Direction::Outputs, IoClass::Parameter) => step.outputs.parameters.contains_key(&r.name),
        (Direction::Outputs, IoClass::Artifact) => step.outputs.artifacts.contains_key(&r.name),
        (Direction::Inputs, IoClass::Parameter) => step.parameters.contains_key(&r.name),
        (Direction::Inputs, IoClass::Artifact) => step.artifacts.contains_key(&r.name),
    }
}

fn has_input(inputs: &Inputs, r: &Reference) -> bool {
    match r.class {
        IoClass::Parameter => inputs.parameters.contains_key(&r.name),
        IoClass::Artifact => inputs.artifacts.contains_key(&r.name),
    }
}

fn has_output(outputs: &Outputs, r: &Reference) -> bool {
    match r.class {
        IoClass::Parameter => outputs.parameters.contains_key(&r.name),
        IoClass::Artifact => outputs.artifacts.contains_key(&r.name),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepgraph_types::io::{InputArtifact, InputParameter, OutputArtifact, OutputParameter};
    use stepgraph_types::step::Slices;

    fn duplicate() -> Template {
        let mut t = ScriptTemplate::new("duplicate", "duplicate");
        t.inputs.parameter("msg", InputParameter::typed(ValueType::Int));
        t.outputs.returned("msg", Some(ValueType::Int));
        t.into()
    }

    fn untyped() -> Template {
        let mut t = ScriptTemplate::new("passthrough", "passthrough");
        t.inputs.parameter("msg", InputParameter::new());
        t.outputs.returned("msg", None);
        t.into()
    }

    fn hello_steps() -> Steps {
        let mut steps = Steps::new("main");
        let hello0 = Step::new("hello0", &duplicate()).with_parameter("msg", 1).unwrap();
        let hello1 = Step::new("hello1", &duplicate())
            .with_parameter("msg", hello0.output("msg"))
            .unwrap();
        steps.add(hello0).unwrap();
        steps.add(hello1).unwrap();
        steps
    }

    #[test]
    fn test_prepare_accepts_layered_references() {
        let mut t: Template = hello_steps().into();
        prepare(&mut t).unwrap();
    }

    #[test]
    fn test_same_layer_reference_rejected() {
        let mut steps = Steps::new("main");
        let a = Step::new("a", &duplicate()).with_parameter("msg", 1).unwrap();
        let b = Step::new("b", &duplicate())
            .with_parameter("msg", a.output("msg"))
            .unwrap();
        steps.add(vec![a, b]).unwrap();
        let mut t: Template = steps.into();
        let err = prepare(&mut t).unwrap_err();
        assert_eq!(
            err,
            GraphError::SameLayerReference {
                step: "b".to_string(),
                sibling: "a".to_string()
            }
        );
    }

    #[test]
    fn test_reference_to_later_layer_rejected() {
        let mut steps = Steps::new("main");
        let a = Step::new("a", &duplicate())
            .with_parameter("msg", Reference::step_output("b", "msg"))
            .unwrap();
        let b = Step::new("b", &duplicate()).with_parameter("msg", 1).unwrap();
        steps.add(a).unwrap();
        steps.add(b).unwrap();
        let mut t: Template = steps.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::UnknownReference { .. })));
    }

    #[test]
    fn test_unknown_output_name_rejected() {
        let mut steps = hello_steps();
        let c = Step::new("c", &duplicate())
            .with_parameter("msg", Reference::step_output("hello0", "nope"))
            .unwrap();
        steps.add(c).unwrap();
        let mut t: Template = steps.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::UnknownReference { .. })));
    }

    #[test]
    fn test_missing_required_argument() {
        let mut steps = Steps::new("main");
        steps.add(Step::new("a", &duplicate())).unwrap();
        let mut t: Template = steps.into();
        assert_eq!(
            prepare(&mut t).unwrap_err(),
            GraphError::MissingArgument {
                step: "a".to_string(),
                name: "msg".to_string()
            }
        );
    }

    #[test]
    fn test_type_propagates_into_untyped_reader() {
        let mut steps = Steps::new("main");
        let a = Step::new("a", &duplicate()).with_parameter("msg", 1).unwrap();
        let b = Step::new("b", &untyped()).with_parameter("msg", a.output("msg")).unwrap();
        steps.add(a).unwrap();
        steps.add(b).unwrap();
        let mut t: Template = steps.into();
        prepare(&mut t).unwrap();
        let Template::Steps(s) = &t else { unreachable!() };
        assert_eq!(s.step("b").unwrap().parameters["msg"].decl.value_type, Some(ValueType::Int));
    }

    #[test]
    fn test_type_propagates_back_into_untyped_producer() {
        let mut steps = Steps::new("main");
        let a = Step::new("a", &untyped()).with_parameter("msg", 1).unwrap();
        let b = Step::new("b", &duplicate()).with_parameter("msg", a.output("msg")).unwrap();
        steps.add(a).unwrap();
        steps.add(b).unwrap();
        let mut t: Template = steps.into();
        prepare(&mut t).unwrap();
        let Template::Steps(s) = &t else { unreachable!() };
        assert_eq!(s.step("a").unwrap().outputs.parameters["msg"].value_type, Some(ValueType::Int));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut text = ScriptTemplate::new("text", "text");
        text.outputs.returned("msg", Some(ValueType::Str));
        let mut steps = Steps::new("main");
        let a = Step::new("a", &Template::from(text));
        let b = Step::new("b", &duplicate()).with_parameter("msg", a.output("msg")).unwrap();
        steps.add(a).unwrap();
        steps.add(b).unwrap();
        let mut t: Template = steps.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::TypeMismatch { .. })));
    }

    #[test]
    fn test_artifact_flag_conflict_and_fill() {
        let mut big = ScriptTemplate::new("big", "big");
        big.outputs
            .parameter("blob", OutputParameter::from_path("blob.json").as_artifact());
        let mut small = ScriptTemplate::new("small", "small");
        small.inputs.parameter("blob", InputParameter::new().inline());
        let mut open = ScriptTemplate::new("open", "open");
        open.inputs.parameter("blob", InputParameter::new());

        let mut steps = Steps::new("main");
        let a = Step::new("a", &Template::from(big));
        let ok = Step::new("ok", &Template::from(open)).with_parameter("blob", a.output("blob")).unwrap();
        steps.add(a.clone()).unwrap();
        steps.add(ok).unwrap();
        let mut t: Template = steps.clone().into();
        prepare(&mut t).unwrap();
        let Template::Steps(s) = &t else { unreachable!() };
        assert_eq!(s.step("ok").unwrap().parameters["blob"].decl.as_artifact, ArtifactFlag::On);

        let bad = Step::new("bad", &Template::from(small)).with_parameter("blob", a.output("blob")).unwrap();
        steps.add(bad).unwrap();
        let mut t: Template = steps.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::ArtifactFlagConflict { .. })));
    }

    #[test]
    fn test_item_reference_requires_fan_out() {
        let mut steps = Steps::new("main");
        let a = Step::new("a", &duplicate()).with_parameter("msg", Reference::item()).unwrap();
        steps.add(a.clone()).unwrap();
        let mut t: Template = steps.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::InvalidFanOut { .. })));

        let mut steps = Steps::new("main");
        steps.add(a.with_param(json!([1, 2, 3]))).unwrap();
        let mut t: Template = steps.into();
        prepare(&mut t).unwrap();
    }

    #[test]
    fn test_slices_validation() {
        let mut t = ScriptTemplate::new("count", "count");
        t.inputs.parameter("file", InputParameter::typed(ValueType::Str));
        t.inputs.artifact("data", InputArtifact::new());
        t.outputs.returned("n", Some(ValueType::Int));
        let t: Template = t.into();

        let bad = Step::new("c", &t)
            .with_parameter("file", "f1.txt")
            .unwrap()
            .with_artifact("data", stepgraph_types::artifact::ArtifactHandle::local("/data"))
            .unwrap()
            .with_slices(Slices::new().input_parameter("nope"));
        let mut steps = Steps::new("main");
        steps.add(bad).unwrap();
        let mut root: Template = steps.into();
        assert!(matches!(prepare(&mut root), Err(GraphError::InvalidSlices { .. })));

        let sub_path_without_artifact = Step::new("c", &t)
            .with_slices(Slices::new().input_parameter("file").by_sub_path())
            .with_parameter("file", json!(["f1.txt"]))
            .unwrap()
            .with_artifact("data", stepgraph_types::artifact::ArtifactHandle::local("/data"))
            .unwrap();
        let mut steps = Steps::new("main");
        steps.add(sub_path_without_artifact).unwrap();
        let mut root: Template = steps.into();
        assert!(matches!(prepare(&mut root), Err(GraphError::InvalidSlices { .. })));
    }

    fn count_files() -> Template {
        let mut t = ScriptTemplate::new("count", "count");
        t.inputs.parameter("file", InputParameter::typed(ValueType::Str));
        t.outputs.returned("n", Some(ValueType::Int));
        t.outputs.returned("unit", Some(ValueType::Str));
        t.into()
    }

    fn label() -> Template {
        let mut t = ScriptTemplate::new("label", "label");
        t.inputs.parameter("text", InputParameter::typed(ValueType::Str));
        t.into()
    }

    #[test]
    fn test_list_literal_bound_before_slices() {
        let bound_first = Step::new("c", &count_files())
            .with_parameter("file", json!(["f1.txt", "f2.txt"]))
            .unwrap()
            .with_slices(Slices::new().input_parameter("file"));
        let mut steps = Steps::new("main");
        steps.add(bound_first).unwrap();
        let mut t: Template = steps.into();
        prepare(&mut t).unwrap();

        let unsliced = Step::new("c", &count_files())
            .with_parameter("file", json!(["f1.txt", "f2.txt"]))
            .unwrap();
        let mut steps = Steps::new("main");
        steps.add(unsliced).unwrap();
        let mut t: Template = steps.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::TypeMismatch { .. })));
    }

    #[test]
    fn test_only_sliced_outputs_read_as_lists() {
        let producer = || {
            Step::new("c", &count_files())
                .with_slices(Slices::new().input_parameter("file").output_parameter("n"))
                .with_parameter("file", json!(["f1.txt", "f2.txt"]))
                .unwrap()
        };

        let c = producer();
        let reader = Step::new("show", &label()).with_parameter("text", c.output("unit")).unwrap();
        let mut steps = Steps::new("main");
        steps.add(c).unwrap();
        steps.add(reader).unwrap();
        let mut t: Template = steps.into();
        prepare(&mut t).unwrap();

        let c = producer();
        let reader = Step::new("show", &label()).with_parameter("text", c.output("n")).unwrap();
        let mut steps = Steps::new("main");
        steps.add(c).unwrap();
        steps.add(reader).unwrap();
        let mut t: Template = steps.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::TypeMismatch { .. })));
    }

    #[test]
    fn test_leaf_output_sources() {
        let mut t = ScriptTemplate::new("leaf", "leaf");
        t.outputs.parameter(
            "x",
            OutputParameter::from_reference(Reference::step_output("a", "y")),
        );
        let mut t: Template = t.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::InvalidOutput { .. })));
    }

    #[test]
    fn test_container_output_must_be_visible() {
        let mut steps = hello_steps();
        steps.outputs.parameter(
            "msg",
            OutputParameter::from_reference(Reference::step_output("hello1", "msg")),
        );
        let mut t: Template = steps.clone().into();
        prepare(&mut t).unwrap();
        let Template::Steps(s) = &t else { unreachable!() };
        assert_eq!(s.outputs.parameters["msg"].value_type, Some(ValueType::Int));

        steps.outputs.artifact("log", OutputArtifact::from_path("log.txt"));
        let mut t: Template = steps.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::InvalidOutput { .. })));
    }

    #[test]
    fn test_dag_infers_dependencies_on_prepare() {
        let mut dag = Dag::new("flow");
        let a = Step::new("a", &duplicate()).with_parameter("msg", 1).unwrap();
        let b = Step::new("b", &duplicate()).with_parameter("msg", a.output("msg")).unwrap();
        dag.add(b).unwrap();
        dag.add(a).unwrap();
        let mut t: Template = dag.into();
        prepare(&mut t).unwrap();
        let Template::Dag(d) = &t else { unreachable!() };
        assert_eq!(d.task("b").unwrap().dependencies, vec!["a".to_string()]);
    }

    #[test]
    fn test_loop_carry_must_name_body_input() {
        let body = duplicate();
        let lp = LoopTemplate::new("again", &body, Reference::iteration_output("msg").greater_eq(8), 10)
            .carry("nope", Reference::iteration_output("msg"));
        let mut t: Template = lp.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::UnknownInput { .. })));

        let lp = LoopTemplate::new("again", &body, Reference::iteration_output("msg").greater_eq(8), 10)
            .carry("msg", Reference::iteration_output("msg"));
        let mut t: Template = lp.into();
        prepare(&mut t).unwrap();
    }

    #[test]
    fn test_nested_containers_are_prepared() {
        let mut inner = Steps::new("inner");
        let a = Step::new("a", &duplicate()).with_parameter("msg", 1).unwrap();
        let b = Step::new("b", &duplicate()).with_parameter("msg", a.output("msg")).unwrap();
        inner.add(vec![a, b]).unwrap();
        let mut outer = Steps::new("outer");
        outer.add(Step::new("nested", &Template::from(inner))).unwrap();
        let mut t: Template = outer.into();
        assert!(matches!(prepare(&mut t), Err(GraphError::SameLayerReference { .. })));
    }
}
