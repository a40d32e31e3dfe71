//! Reusable object fixtures
//!
//! A fixture is a Kubernetes object template stored as opaque YAML bytes,
//! so it can be copied succinctly and rewritten losslessly. Test documents
//! reference fixtures with `$apply: fixture`, matching on the placeholder
//! object's apiVersion, kind, name, and namespace.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use kube::api::DynamicObject;

use crate::document;
use crate::error::Error;
use crate::Result;

/// The indexing key for the fixture set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FixtureKey {
    api_version: String,
    kind: String,
    name: String,
    namespace: String,
}

impl FixtureKey {
    /// The key that indexes the given object.
    pub fn for_object(object: &DynamicObject) -> FixtureKey {
        let types = object.types.as_ref();

        FixtureKey {
            api_version: types.map(|t| t.api_version.clone()).unwrap_or_default(),
            kind: types.map(|t| t.kind.clone()).unwrap_or_default(),
            name: object.metadata.name.clone().unwrap_or_default(),
            namespace: object.metadata.namespace.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for FixtureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} '{}/{}'",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

/// A single fixture object, stored as YAML text.
#[derive(Debug, Clone)]
pub struct Fixture {
    source: String,
}

impl Fixture {
    /// Wrap YAML text as a fixture.
    pub fn new(source: impl Into<String>) -> Self {
        Fixture {
            source: source.into(),
        }
    }

    /// The fixture's YAML text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parse the fixture into a node tree, retaining anchors so that a
    /// rename propagates to aliased fields.
    pub fn tree(&self) -> Result<crate::yaml::Node> {
        crate::yaml::parse_node(&self.source)
    }
}

/// A named collection of fixtures.
#[derive(Debug, Default)]
pub struct FixtureSet {
    fixtures: Mutex<HashMap<FixtureKey, Fixture>>,
}

impl FixtureSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fixture under the given key, replacing any previous entry.
    pub fn insert(&self, key: FixtureKey, fixture: Fixture) {
        self.fixtures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, fixture);
    }

    /// Match the given placeholder object to a fixture.
    pub fn matching(&self, object: &DynamicObject) -> Option<Fixture> {
        self.fixtures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&FixtureKey::for_object(object))
            .cloned()
    }

    /// Parse all the YAML objects in the given file and add each as a
    /// fixture.
    pub fn add_from_file(&self, path: &Path) -> Result<()> {
        let mut doc = document::read_file(path)?;

        for (i, fragment) in doc.fragments_mut().iter_mut().enumerate() {
            let kind = fragment.decode().map_err(|e| {
                Error::bad_input(format!(
                    "failed to parse document fragment {i} of {}: {e}",
                    path.display()
                ))
            })?;

            if kind == document::FragmentKind::Object {
                if let Some(object) = fragment.object() {
                    self.insert(
                        FixtureKey::for_object(object),
                        Fixture::new(fragment.source()),
                    );
                }
            }
        }

        Ok(())
    }
}

/// The process-wide fixture set. Fixtures are loaded once at startup and
/// shared by every document in the run.
pub fn global() -> &'static FixtureSet {
    static SET: OnceLock<FixtureSet> = OnceLock::new();
    SET.get_or_init(FixtureSet::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(api_version: &str, kind: &str, name: &str, namespace: Option<&str>) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {
                "name": name,
                "namespace": namespace,
            },
        }))
        .unwrap()
    }

    #[test]
    fn test_fixture_key_matches_on_identity() {
        let a = FixtureKey::for_object(&object("apps/v1", "Deployment", "httpbin", None));
        let b = FixtureKey::for_object(&object("apps/v1", "Deployment", "httpbin", None));
        let c = FixtureKey::for_object(&object("apps/v1", "Deployment", "httpbin", Some("prod")));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_insert_and_match() {
        let set = FixtureSet::new();
        let placeholder = object("apps/v1", "Deployment", "httpbin", None);

        assert!(set.matching(&placeholder).is_none());

        set.insert(
            FixtureKey::for_object(&placeholder),
            Fixture::new("apiVersion: apps/v1\nkind: Deployment"),
        );

        let found = set.matching(&placeholder).unwrap();
        assert!(found.source().contains("Deployment"));
    }

    #[test]
    fn test_add_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: echo\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: conf\n"
        )
        .unwrap();

        let set = FixtureSet::new();
        set.add_from_file(file.path()).unwrap();

        assert!(set.matching(&object("v1", "Service", "echo", None)).is_some());
        assert!(set.matching(&object("v1", "ConfigMap", "conf", None)).is_some());
        assert!(set.matching(&object("v1", "Service", "other", None)).is_none());
    }
}
