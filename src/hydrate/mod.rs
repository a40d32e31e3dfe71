//! Test environment and object hydration
//!
//! The environment owns the per-run unique id and turns raw object YAML
//! into something the driver can apply: pseudo-keys are stripped, fixture
//! placeholders are replaced, and tracking metadata is injected.
//!
//! # Pseudo-keys
//!
//! Top-level keys beginning with `$` configure the driver instead of the
//! object. `$apply` selects the operation (`update`, `delete`, `fixture`,
//! or a fixture rename mapping); `$check` carries an inline policy module
//! evaluated after the operation. Unknown pseudo-keys are stripped without
//! error.

use kube::api::DynamicObject;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Error;
use crate::policy::Module;
use crate::yaml::Node;
use crate::{fixture, yaml, Result, ANNOTATION_RUN_ID, LABEL_MANAGED_BY, PROGNAME};

/// The operation to apply to an object, from the `$apply` pseudo-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    /// Create or patch the object.
    #[default]
    Update,
    /// Delete the object.
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// A hydrated Kubernetes object and its driver metadata.
#[derive(Debug, Clone)]
pub struct HydratedObject {
    /// The object to apply.
    pub object: DynamicObject,
    /// An inline check to run after the operation, from `$check`.
    pub check: Option<Module>,
    /// Whether the object is being updated or deleted.
    pub operation: Operation,
}

/// What the `$apply` pseudo-key resolved to.
enum ApplyOp {
    Operation(Operation),
    Fixture { rename: Option<String> },
}

/// Holds metadata that describes the context of a test run.
#[derive(Debug, Clone)]
pub struct Environment {
    run_id: String,
}

impl Default for Environment {
    fn default() -> Self {
        Environment {
            run_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Environment {
    /// Create an environment with a fresh run id.
    pub fn new() -> Self {
        Self::default()
    }

    /// The unique identifier for this run.
    pub fn unique_id(&self) -> &str {
        &self.run_id
    }

    /// Hydrate raw object YAML into a [`HydratedObject`].
    ///
    /// The pipeline: parse into an anchor-retaining node tree, strip
    /// pseudo-keys, replace fixture placeholders (applying any rename
    /// before alias resolution), inject tracking metadata, and convert to
    /// an unstructured object.
    pub fn hydrate_object(&self, source: &str) -> Result<HydratedObject> {
        let mut tree = yaml::parse_node(source)
            .map_err(|e| Error::bad_input(format!("failed to parse YAML object: {e}")))?;

        let mut operation = Operation::Update;
        let mut check = None;
        let mut fixture_rename = None;

        for (key, node) in tree.drain_special_keys() {
            match key.as_str() {
                "$apply" => match decode_apply(&node)? {
                    ApplyOp::Operation(op) => operation = op,
                    ApplyOp::Fixture { rename } => {
                        operation = Operation::Update;
                        fixture_rename = Some(rename);
                    }
                },
                "$check" => {
                    let source = node.as_str().ok_or_else(|| {
                        Error::bad_input("failed to decode \"$check\" field: expected a string")
                    })?;
                    check = Some(Module::parse_check_fragment(source)?);
                }
                // Unknown pseudo-keys are stripped without error.
                _ => {}
            }
        }

        // Replace the placeholder before making any modifications, so the
        // fixture key reflects what the document author wrote.
        if let Some(rename) = fixture_rename {
            let placeholder = to_object(&tree.resolve()?)?;
            let found = fixture::global().matching(&placeholder).ok_or_else(|| {
                Error::FixtureNotFound(
                    fixture::FixtureKey::for_object(&placeholder).to_string(),
                )
            })?;

            let mut fixture_tree = found.tree()?;
            if let Some(target) = rename {
                let (namespace, name) = split_object_name(&target);
                fixture_tree.set_string(&["metadata", "name"], name)?;
                fixture_tree.set_string(&["metadata", "namespace"], namespace)?;
            }

            tree = fixture_tree;
        }

        let mut value = tree.resolve()?;
        inject_metadata(&mut value, self.unique_id())?;

        Ok(HydratedObject {
            object: to_object(&value)?,
            check,
            operation,
        })
    }
}

/// Decode the `$apply` value. Two syntaxes are supported for fixtures:
///
/// ```yaml
/// $apply: fixture
/// ```
///
/// and
///
/// ```yaml
/// $apply:
///   fixture:
///     as: some-other-name
/// ```
fn decode_apply(node: &Node) -> Result<ApplyOp> {
    if let Some(what) = node.as_str() {
        return match what {
            "update" => Ok(ApplyOp::Operation(Operation::Update)),
            "delete" => Ok(ApplyOp::Operation(Operation::Delete)),
            "fixture" => Ok(ApplyOp::Fixture { rename: None }),
            other => Err(Error::bad_input(format!(
                "unsupported operation {other:?} for \"$apply\" field"
            ))),
        };
    }

    if let Some(fixture) = node.get("fixture") {
        let rename = fixture
            .get("as")
            .and_then(Node::as_str)
            .map(str::to_string);
        return Ok(ApplyOp::Fixture { rename });
    }

    Err(Error::bad_input("unable to decode YAML field \"$apply\""))
}

/// Split a `[namespace/]name` rename target.
fn split_object_name(full: &str) -> (&str, &str) {
    match full.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => ("default", full),
    }
}

/// Navigate to the mapping at the given path, creating missing elements.
fn ensure_mapping<'a>(value: &'a mut Value, path: &[&str]) -> Result<&'a mut Map<String, Value>> {
    let mut current = value;

    for segment in path {
        let map = current
            .as_object_mut()
            .ok_or_else(|| Error::bad_input(format!("object field {segment:?} is not a mapping")))?;

        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    current
        .as_object_mut()
        .ok_or_else(|| Error::bad_input(format!("object field {:?} is not a mapping", path.join("."))))
}

/// Inject tracking metadata: the managed-by label and the run id
/// annotation. Objects with a pod template get the same metadata mirrored
/// into the template so child pods inherit tracking.
fn inject_metadata(value: &mut Value, run_id: &str) -> Result<()> {
    ensure_mapping(value, &["metadata", "labels"])?
        .insert(LABEL_MANAGED_BY.to_string(), Value::String(PROGNAME.to_string()));

    ensure_mapping(value, &["metadata", "annotations"])?
        .insert(ANNOTATION_RUN_ID.to_string(), Value::String(run_id.to_string()));

    if value.pointer("/spec/template/spec/containers").is_some() {
        ensure_mapping(value, &["spec", "template", "metadata", "labels"])?
            .insert(LABEL_MANAGED_BY.to_string(), Value::String(PROGNAME.to_string()));

        ensure_mapping(value, &["spec", "template", "metadata", "annotations"])?
            .insert(ANNOTATION_RUN_ID.to_string(), Value::String(run_id.to_string()));
    }

    Ok(())
}

/// Convert a resolved value into an unstructured object. Objects must
/// carry both apiVersion and kind.
fn to_object(value: &Value) -> Result<DynamicObject> {
    let non_empty = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    };

    if !non_empty("apiVersion") || !non_empty("kind") {
        return Err(Error::InvalidObject(
            "object must specify apiVersion and kind".to_string(),
        ));
    }

    serde_json::from_value(value.clone())
        .map_err(|e| Error::InvalidObject(format!("failed to decode object: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Fixture, FixtureKey};

    fn env() -> Environment {
        Environment::new()
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(env().unique_id(), env().unique_id());
    }

    #[test]
    fn test_hydrate_injects_tracking_metadata() {
        let hydrated = env()
            .hydrate_object("apiVersion: v1\nkind: Service\nmetadata:\n  name: echo\n")
            .unwrap();

        let labels = hydrated.object.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some(PROGNAME));

        let annotations = hydrated.object.metadata.annotations.as_ref().unwrap();
        assert!(annotations.contains_key(ANNOTATION_RUN_ID));
    }

    #[test]
    fn test_hydrate_mirrors_metadata_into_pod_templates() {
        let source = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: httpbin
spec:
  template:
    spec:
      containers:
      - name: httpbin
        image: docker.io/kennethreitz/httpbin
"#;

        let hydrated = env().hydrate_object(source).unwrap();
        let data = &hydrated.object.data;

        assert_eq!(
            data.pointer(&format!("/spec/template/metadata/labels/{}", LABEL_MANAGED_BY.replace('/', "~1")))
                .and_then(Value::as_str),
            Some(PROGNAME)
        );
        assert!(data
            .pointer(&format!(
                "/spec/template/metadata/annotations/{}",
                ANNOTATION_RUN_ID.replace('/', "~1")
            ))
            .is_some());
    }

    #[test]
    fn test_hydrate_default_operation_is_update() {
        let hydrated = env()
            .hydrate_object("apiVersion: v1\nkind: Service\nmetadata:\n  name: echo\n")
            .unwrap();
        assert_eq!(hydrated.operation, Operation::Update);
    }

    #[test]
    fn test_hydrate_delete_operation() {
        let hydrated = env()
            .hydrate_object("$apply: delete\napiVersion: v1\nkind: Service\nmetadata:\n  name: echo\n")
            .unwrap();
        assert_eq!(hydrated.operation, Operation::Delete);
    }

    #[test]
    fn test_hydrate_rejects_unsupported_operation() {
        let err = env()
            .hydrate_object("$apply: explode\napiVersion: v1\nkind: Service\n")
            .unwrap_err();
        assert!(err.to_string().contains("unsupported operation"));
    }

    #[test]
    fn test_hydrate_strips_unknown_pseudo_keys() {
        let hydrated = env()
            .hydrate_object(
                "$bogus: whatever\napiVersion: v1\nkind: Service\nmetadata:\n  name: echo\n",
            )
            .unwrap();

        assert!(hydrated.object.data.get("$bogus").is_none());
    }

    #[test]
    fn test_hydrate_parses_inline_check() {
        let source = r#"
$check: |
  error[msg] {
    input.error
    msg := "operation failed"
  }
apiVersion: v1
kind: Service
metadata:
  name: echo
"#;

        let hydrated = env().hydrate_object(source).unwrap();
        let check = hydrated.check.unwrap();
        assert_eq!(check.assertion_rules(), vec!["error"]);
    }

    #[test]
    fn test_hydrate_requires_api_version_and_kind() {
        let err = env()
            .hydrate_object("metadata:\n  name: incomplete\n")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidObject(_)));
    }

    #[test]
    fn test_hydrate_missing_fixture() {
        let err = env()
            .hydrate_object(
                "$apply: fixture\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: no-such-fixture\n",
            )
            .unwrap_err();
        assert!(matches!(err, Error::FixtureNotFound(_)));
    }

    #[test]
    fn test_hydrate_fixture_rename_tracks_anchors() {
        // The fixture anchors its name and aliases it into a label, so a
        // rename must update both.
        let fixture_source = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: &name httpbin
  labels:
    app: *name
spec:
  selector:
    matchLabels:
      app: *name
"#;

        let placeholder: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "httpbin"},
        }))
        .unwrap();

        fixture::global().insert(
            FixtureKey::for_object(&placeholder),
            Fixture::new(fixture_source),
        );

        let source = r#"
$apply:
  fixture:
    as: ns2/httpbin2
apiVersion: apps/v1
kind: Deployment
metadata:
  name: httpbin
"#;

        let hydrated = env().hydrate_object(source).unwrap();
        let object = &hydrated.object;

        assert_eq!(object.metadata.name.as_deref(), Some("httpbin2"));
        assert_eq!(object.metadata.namespace.as_deref(), Some("ns2"));
        assert_eq!(
            object.metadata.labels.as_ref().unwrap().get("app").map(String::as_str),
            Some("httpbin2")
        );
        assert_eq!(
            object.data.pointer("/spec/selector/matchLabels/app").and_then(Value::as_str),
            Some("httpbin2")
        );
    }

    #[test]
    fn test_split_object_name() {
        assert_eq!(split_object_name("httpbin"), ("default", "httpbin"));
        assert_eq!(split_object_name("ns2/httpbin2"), ("ns2", "httpbin2"));
    }
}
