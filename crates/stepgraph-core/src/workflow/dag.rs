//! Task dependency graph, cycle detection and wave planning for DAG templates.
//!
//! Uses `petgraph` to model task dependencies as a directed graph. A task's
//! dependencies are its explicit `dependencies` plus every sibling whose
//! outputs it reads. Topological sort detects cycles; depth-based grouping
//! produces the waves an adapter (or a log line) can show.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stepgraph_types::error::GraphError;
use stepgraph_types::expr::RefScope;
use stepgraph_types::step::Step;
use stepgraph_types::template::Dag;

// ---------------------------------------------------------------------------
// Dependency inference
// ---------------------------------------------------------------------------

/// Add every data dependency to the task's explicit dependency list.
///
/// A reference to a task that does not exist in `dag` is rejected. Running
/// this twice is harmless.
pub fn infer_dependencies(dag: &mut Dag) -> Result<(), GraphError> {
    let names: Vec<String> = dag.tasks().iter().map(|t| t.name.clone()).collect();
    let container = dag.name.clone();
    for task in dag.tasks_mut() {
        for reference in task.references() {
            if let RefScope::Step { step } = &reference.scope {
                if !names.iter().any(|n| n == step) {
                    return Err(GraphError::UnknownReference {
                        context: format!("{container}/{}", task.name),
                        reference: reference.to_string(),
                    });
                }
                if step == &task.name {
                    return Err(GraphError::CycleDetected {
                        container: container.clone(),
                        step: task.name.clone(),
                    });
                }
            }
        }
        for dep in task.data_dependencies() {
            if !task.dependencies.contains(&dep) {
                task.dependencies.push(dep);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

fn dependency_graph<'a>(
    container: &str,
    tasks: &'a [Step],
) -> Result<(DiGraph<&'a str, ()>, Vec<petgraph::graph::NodeIndex>), GraphError> {
    let name_to_idx: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    // Edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = tasks.iter().map(|t| graph.add_node(t.name.as_str())).collect();

    for (to_idx, task) in tasks.iter().enumerate() {
        for dep in &task.dependencies {
            let from_idx = name_to_idx.get(dep.as_str()).ok_or_else(|| {
                GraphError::UnknownDependency {
                    container: container.to_string(),
                    step: task.name.clone(),
                    dependency: dep.clone(),
                }
            })?;
            graph.add_edge(nodes[*from_idx], nodes[to_idx], ());
        }
    }
    Ok((graph, nodes))
}

/// Validate that the tasks form a DAG: every dependency exists, no cycles.
pub fn validate_dag(container: &str, tasks: &[Step]) -> Result<(), GraphError> {
    let (graph, _) = dependency_graph(container, tasks)?;
    toposort(&graph, None).map_err(|cycle| GraphError::CycleDetected {
        container: container.to_string(),
        step: graph[cycle.node_id()].to_string(),
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Execution plan (wave computation)
// ---------------------------------------------------------------------------

/// Group tasks into waves: every task's dependencies sit in earlier waves.
///
/// Index 0 is the first wave. Within a wave, tasks keep insertion order.
pub fn build_execution_plan<'a>(
    container: &str,
    tasks: &'a [Step],
) -> Result<Vec<Vec<&'a Step>>, GraphError> {
    if tasks.is_empty() {
        return Ok(vec![]);
    }

    let (graph, _) = dependency_graph(container, tasks)?;
    let sorted = toposort(&graph, None).map_err(|cycle| GraphError::CycleDetected {
        container: container.to_string(),
        step: graph[cycle.node_id()].to_string(),
    })?;

    let by_name: HashMap<&str, &Step> = tasks.iter().map(|t| (t.name.as_str(), t)).collect();
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for node in sorted {
        let name = graph[node];
        let depth = by_name[name]
            .dependencies
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(name, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&Step>> = vec![vec![]; max_depth + 1];
    for task in tasks {
        waves[depths[task.name.as_str()]].push(task);
    }
    Ok(waves)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_types::expr::Reference;
    use stepgraph_types::io::{InputParameter, ValueType};
    use stepgraph_types::template::{ScriptTemplate, Template};

    fn inc() -> Template {
        let mut t = ScriptTemplate::new("inc", "inc");
        t.inputs
            .parameter("x", InputParameter::typed(ValueType::Int).with_default(0.into()));
        t.outputs.returned("y", Some(ValueType::Int));
        t.into()
    }

    fn task(name: &str, deps: &[&str]) -> Step {
        let mut step = Step::new(name, &inc());
        for d in deps {
            step = step.depends_on(*d);
        }
        step
    }

    fn names(wave: &[&Step]) -> Vec<String> {
        wave.iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn test_no_dependencies_single_wave() {
        let tasks = vec![task("a", &[]), task("b", &[]), task("c", &[])];
        let waves = build_execution_plan("flow", &tasks).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].len(), 3);
    }

    #[test]
    fn test_diamond_three_waves() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ];
        let waves = build_execution_plan("flow", &tasks).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(names(&waves[0]), vec!["a"]);
        assert_eq!(names(&waves[1]), vec!["b", "c"]);
        assert_eq!(names(&waves[2]), vec!["d"]);
    }

    #[test]
    fn test_plan_is_independent_of_insertion_order() {
        let forward = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        let backward = vec![task("c", &["b"]), task("b", &["a"]), task("a", &[])];
        let w1: Vec<Vec<String>> = build_execution_plan("flow", &forward)
            .unwrap()
            .iter()
            .map(|w| names(w))
            .collect();
        let w2: Vec<Vec<String>> = build_execution_plan("flow", &backward)
            .unwrap()
            .iter()
            .map(|w| names(w))
            .collect();
        assert_eq!(w1, w2);
    }

    #[test]
    fn test_cycle_detected_names_container() {
        let tasks = vec![task("a", &["c"]), task("b", &["a"]), task("c", &["b"])];
        let err = validate_dag("flow", &tasks).unwrap_err();
        match err {
            GraphError::CycleDetected { container, .. } => assert_eq!(container, "flow"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let tasks = vec![task("a", &["missing"])];
        let err = validate_dag("flow", &tasks).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn test_empty_dag() {
        assert!(build_execution_plan("flow", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_infer_dependencies_from_references() {
        let mut dag = Dag::new("flow");
        let a = task("a", &[]);
        let b = Step::new("b", &inc())
            .with_parameter("x", a.output("y"))
            .unwrap();
        dag.add(b).unwrap();
        dag.add(a).unwrap();
        infer_dependencies(&mut dag).unwrap();
        assert_eq!(dag.task("b").unwrap().dependencies, vec!["a".to_string()]);

        infer_dependencies(&mut dag).unwrap();
        assert_eq!(dag.task("b").unwrap().dependencies.len(), 1);

        let waves = build_execution_plan(&dag.name, dag.tasks()).unwrap();
        assert_eq!(names(&waves[0]), vec!["a"]);
        assert_eq!(names(&waves[1]), vec!["b"]);
    }

    #[test]
    fn test_inferred_cycle_is_rejected() {
        let mut dag = Dag::new("flow");
        let a = Step::new("a", &inc())
            .with_parameter("x", Reference::step_output("b", "y"))
            .unwrap();
        let b = Step::new("b", &inc())
            .with_parameter("x", Reference::step_output("a", "y"))
            .unwrap();
        dag.add(a).unwrap();
        dag.add(b).unwrap();
        infer_dependencies(&mut dag).unwrap();
        let err = validate_dag(&dag.name, dag.tasks()).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
    }

    #[test]
    fn test_reference_to_unknown_task() {
        let mut dag = Dag::new("flow");
        let a = Step::new("a", &inc())
            .with_parameter("x", Reference::step_output("ghost", "y"))
            .unwrap();
        dag.add(a).unwrap();
        let err = infer_dependencies(&mut dag).unwrap_err();
        assert!(matches!(err, GraphError::UnknownReference { .. }));
    }
}
