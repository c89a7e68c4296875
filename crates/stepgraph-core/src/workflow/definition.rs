//! Template enumeration and YAML round trip.
//!
//! `collect_templates` walks a template tree the way a cluster adapter needs
//! it: every distinct template once, children before the templates that use
//! them. The YAML helpers convert between files and the template tree for
//! inspection and adapters.

use std::path::{Path, PathBuf};

use stepgraph_types::error::GraphError;
use stepgraph_types::template::Template;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while reading or writing template files.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse or serialize failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// The parsed tree is not a valid graph.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// Every template reachable from `root`, children first, de-duplicated by
/// name.
///
/// Two structurally different templates sharing one name is an error: an
/// adapter emits templates by name, so one of them would silently win.
pub fn collect_templates(root: &Template) -> Result<Vec<&Template>, GraphError> {
    let mut out: Vec<&Template> = Vec::new();
    visit(root, &mut out)?;
    Ok(out)
}

fn visit<'a>(template: &'a Template, out: &mut Vec<&'a Template>) -> Result<(), GraphError> {
    for child in template.child_templates() {
        visit(child, out)?;
    }
    match out.iter().find(|t| t.name() == template.name()) {
        Some(seen) if *seen == template => Ok(()),
        Some(_) => Err(GraphError::DuplicateTemplate(template.name().to_string())),
        None => {
            out.push(template);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// YAML
// ---------------------------------------------------------------------------

/// Parse a YAML document into a template tree.
///
/// Checks template-name uniqueness; full binding checks happen when the tree
/// is prepared for execution.
pub fn parse_template_yaml(yaml: &str) -> Result<Template, DefinitionError> {
    let template: Template =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    collect_templates(&template)?;
    Ok(template)
}

/// Serialize a template tree to YAML.
pub fn serialize_template_yaml(template: &Template) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(template).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load a template tree from a YAML file.
pub fn load_template_file(path: &Path) -> Result<Template, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_template_yaml(&content)
}

/// Save a template tree to a YAML file, creating parent directories.
pub fn save_template_file(path: &Path, template: &Template) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_template_yaml(template)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Every parseable template file (`.yaml` / `.yml`) under `base_dir`.
/// Files that do not parse are logged and skipped.
pub fn discover_templates(base_dir: &Path) -> Result<Vec<(PathBuf, Template)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(base_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
        .collect();
    files.sort();
    for path in files {
        match load_template_file(&path) {
            Ok(template) => results.push((path, template)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable template file"),
        }
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_types::expr::Reference;
    use stepgraph_types::io::{InputParameter, ValueType};
    use stepgraph_types::step::Step;
    use stepgraph_types::template::{ScriptTemplate, Steps};

    fn duplicate() -> Template {
        let mut t = ScriptTemplate::new("duplicate", "duplicate");
        t.inputs.parameter("msg", InputParameter::typed(ValueType::Int));
        t.outputs.returned("msg", Some(ValueType::Int));
        t.into()
    }

    fn pipeline() -> Template {
        let mut steps = Steps::new("main");
        let hello0 = Step::new("hello0", &duplicate()).with_parameter("msg", 1).unwrap();
        let hello1 = Step::new("hello1", &duplicate())
            .with_parameter("msg", hello0.output("msg"))
            .unwrap();
        steps.add(hello0).unwrap();
        steps.add(hello1).unwrap();
        steps.into()
    }

    #[test]
    fn test_collect_templates_children_first_and_deduplicated() {
        let root = pipeline();
        let names: Vec<&str> = collect_templates(&root)
            .unwrap()
            .into_iter()
            .map(Template::name)
            .collect();
        assert_eq!(names, vec!["duplicate", "main"]);
    }

    #[test]
    fn test_collect_templates_rejects_conflicting_names() {
        let mut other = ScriptTemplate::new("duplicate", "other-body");
        other.outputs.returned("msg", None);
        let mut steps = Steps::new("main");
        steps.add(Step::new("a", &duplicate()).with_parameter("msg", 1).unwrap()).unwrap();
        steps.add(Step::new("b", &Template::from(other))).unwrap();
        let err = collect_templates(&Template::from(steps)).unwrap_err();
        assert_eq!(err, GraphError::DuplicateTemplate("duplicate".to_string()));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let root = pipeline();
        let yaml = serialize_template_yaml(&root).unwrap();
        let parsed = parse_template_yaml(&yaml).unwrap();
        assert_eq!(parsed, root);

        let Template::Steps(steps) = &parsed else {
            panic!("expected a steps template");
        };
        let hello1 = steps.step("hello1").unwrap();
        assert_eq!(
            hello1.parameters["msg"].value.as_ref().and_then(|v| v.reference()),
            Some(&Reference::step_output("hello0", "msg"))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_template_yaml("kind: nonsense\nname: x").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_save_load_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        save_template_file(&dir.path().join("a/main.yaml"), &pipeline()).unwrap();
        save_template_file(&dir.path().join("leaf.yml"), &duplicate()).unwrap();
        std::fs::write(dir.path().join("notes.yaml"), "key: value").unwrap();

        let loaded = load_template_file(&dir.path().join("a/main.yaml")).unwrap();
        assert_eq!(loaded.name(), "main");

        let found = discover_templates(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_templates(Path::new("/nonexistent/path")).unwrap();
        assert!(found.is_empty());
    }
}
