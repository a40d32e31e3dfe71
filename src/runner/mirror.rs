//! Resource mirror maintenance
//!
//! Informer events are mirrored into the policy data document so checks
//! can see live cluster state:
//!
//! - `/resources/<resource>/<name>` for cluster-scoped or
//!   default-namespace objects
//! - `/resources/<namespace>/<resource>/<name>` for namespaced objects
//! - `/resources/<resource>/.versions` for the group/version/kind list
//!   each resource is served as
//! - `/resources/applied/last` for the most recent operation result

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::discovery::{ApiCapabilities, ApiResource};
use serde_json::{json, Value};

use crate::cluster::driver::ObjectEvent;
use crate::error::Error;
use crate::policy::PolicyDriver;
use crate::Result;

/// Where the most recent apply/delete operation result is stored.
pub const APPLIED_LAST_PATH: &str = "/resources/applied/last";

/// The key under each resource holding its supported versions. The
/// leading dot keeps it clear of legitimate object names.
const VERSIONS_KEY: &str = ".versions";

/// The mirror path for an object of the given resource.
pub fn path_for_object(resource: &str, object: &DynamicObject) -> String {
    let name = object.metadata.name.as_deref().unwrap_or_default();

    match object.metadata.namespace.as_deref() {
        Some(ns) if !ns.is_empty() && ns != "default" => {
            format!("/resources/{ns}/{resource}/{name}")
        }
        _ => format!("/resources/{resource}/{name}"),
    }
}

/// Store a value, creating missing ancestor paths.
///
/// A write that fails because an intermediate element doesn't exist
/// creates the path and retries exactly once.
pub fn store_item(driver: &dyn PolicyDriver, path: &str, value: &Value) -> Result<()> {
    match driver.store_item(path, value) {
        Err(Error::StoreNotFound(_)) => {
            driver.store_path(path)?;
            driver.store_item(path, value)
        }
        other => other,
    }
}

/// Mirror one informer event into the data document.
pub fn apply_event(driver: &dyn PolicyDriver, event: &ObjectEvent) -> Result<()> {
    match event {
        ObjectEvent::Applied(object, resource) => {
            // The object content goes in directly, not wrapped in any
            // envelope, so policies address fields the way kubectl shows
            // them.
            let content = serde_json::to_value(object)
                .map_err(|e| Error::serialization(format!("failed to encode object: {e}")))?;

            store_item(driver, &path_for_object(&resource.plural, object), &content)
        }

        ObjectEvent::Deleted(object, resource) => {
            match driver.remove_path(&path_for_object(&resource.plural, object)) {
                // A delete for an object that was never mirrored (or was
                // already removed) is not worth failing over.
                Err(Error::StoreNotFound(_)) => Ok(()),
                other => other,
            }
        }
    }
}

/// Store the supported versions of every resource at
/// `/resources/<resource>/.versions`, so documents can probe whether the
/// facilities they need exist in this cluster.
pub fn store_resource_versions(
    driver: &dyn PolicyDriver,
    resources: &[(ApiResource, ApiCapabilities)],
) -> Result<()> {
    let mut versions: BTreeMap<&str, Vec<Value>> = BTreeMap::new();

    for (resource, _caps) in resources {
        // Subresource names contain a '/', which would mangle the path.
        if resource.plural.contains('/') {
            continue;
        }

        let entry = json!({
            "group": resource.group,
            "version": resource.version,
            "kind": resource.kind,
        });

        let list = versions.entry(resource.plural.as_str()).or_default();
        if !list.contains(&entry) {
            list.push(entry);
        }
    }

    for (plural, list) in versions {
        let path = format!("/resources/{plural}/{VERSIONS_KEY}");
        store_item(driver, &path, &Value::Array(list))
            .map_err(|e| Error::serialization(format!("failed to store {path:?}: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RegoDriver;
    use std::sync::Arc;

    fn object(ns: Option<&str>, name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": name, "namespace": ns},
        }))
        .unwrap()
    }

    fn resource(plural: &str) -> Arc<ApiResource> {
        Arc::new(ApiResource {
            group: String::new(),
            version: "v1".into(),
            api_version: "v1".into(),
            kind: "Service".into(),
            plural: plural.into(),
        })
    }

    #[test]
    fn test_path_for_object() {
        assert_eq!(
            path_for_object("services", &object(None, "web")),
            "/resources/services/web"
        );
        assert_eq!(
            path_for_object("services", &object(Some("default"), "web")),
            "/resources/services/web"
        );
        assert_eq!(
            path_for_object("services", &object(Some("prod"), "web")),
            "/resources/prod/services/web"
        );
    }

    #[test]
    fn test_store_item_creates_missing_ancestors() {
        let driver = RegoDriver::new();

        store_item(&driver, "/resources/prod/services/web", &json!({"ok": true})).unwrap();

        let module = crate::policy::Module::parse_check_fragment(
            "error[msg] { not data.resources.prod.services.web.ok; msg := \"missing\" }",
        )
        .unwrap();
        let evaluation = driver
            .eval(&module, &crate::policy::EvalOptions::default())
            .unwrap();
        assert!(evaluation.results.is_empty());
    }

    #[test]
    fn test_apply_event_stores_and_removes() {
        let driver = RegoDriver::new();
        let services = resource("services");

        apply_event(
            &driver,
            &ObjectEvent::Applied(object(Some("prod"), "web"), Arc::clone(&services)),
        )
        .unwrap();

        apply_event(
            &driver,
            &ObjectEvent::Deleted(object(Some("prod"), "web"), Arc::clone(&services)),
        )
        .unwrap();

        // Deleting an object that was never mirrored is tolerated.
        apply_event(
            &driver,
            &ObjectEvent::Deleted(object(Some("prod"), "other"), services),
        )
        .unwrap();
    }

    #[test]
    fn test_versions_index_deduplicates() {
        let driver = RegoDriver::new();

        let ar = |group: &str, version: &str, kind: &str, plural: &str| ApiResource {
            group: group.into(),
            version: version.into(),
            api_version: if group.is_empty() {
                version.to_string()
            } else {
                format!("{group}/{version}")
            },
            kind: kind.into(),
            plural: plural.into(),
        };

        let caps = ApiCapabilities {
            scope: kube::discovery::Scope::Namespaced,
            subresources: Vec::new(),
            operations: Vec::new(),
        };

        let resources = vec![
            (ar("apps", "v1", "Deployment", "deployments"), caps.clone()),
            (ar("apps", "v1beta1", "Deployment", "deployments"), caps.clone()),
            (ar("apps", "v1", "Deployment", "deployments"), caps.clone()),
            (ar("", "v1", "Pod", "pods/status"), caps),
        ];

        store_resource_versions(&driver, &resources).unwrap();

        let snapshot_probe = crate::policy::Module::parse_check_fragment(
            "error[msg] { count(data.resources.deployments[\".versions\"]) != 2; msg := \"bad count\" }",
        )
        .unwrap();
        let evaluation = driver
            .eval(&snapshot_probe, &crate::policy::EvalOptions::default())
            .unwrap();
        assert!(evaluation.results.is_empty(), "{:?}", evaluation.results);
    }
}
