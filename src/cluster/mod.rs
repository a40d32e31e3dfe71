//! Kubernetes cluster access
//!
//! [`ClusterContext`] collects the client and discovery surfaces the
//! driver needs: kind resolution, resource enumeration, and label-based
//! selection, all over the dynamic API. [`driver::ObjectDriver`] layers
//! object lifecycle management on top.

pub mod driver;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ErrorResponse, GroupVersionKind};
use kube::discovery::{verbs, ApiCapabilities, ApiResource, Scope};
use kube::{Client, Discovery};
use serde::Serialize;
use tracing::debug;

use crate::error::Error;
use crate::{Result, ANNOTATION_RUN_ID};

/// The namespace objects land in when they don't specify one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Uniquely identifies a Kubernetes API object.
///
/// The group/version/kind triple is spelled out (rather than borrowing a
/// client type) so the serialized form uses lowercase field names in the
/// policy data store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectReference {
    /// The object name.
    pub name: String,
    /// The object namespace, or empty for cluster-scoped objects.
    pub namespace: String,
    /// The object type.
    pub meta: ObjectReferenceMeta,
}

/// The type portion of an [`ObjectReference`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectReferenceMeta {
    /// API group; empty for the core group.
    pub group: String,
    /// API version.
    pub version: String,
    /// Object kind.
    pub kind: String,
}

impl ObjectReference {
    /// Build a reference from an unstructured object.
    pub fn for_object(object: &DynamicObject) -> ObjectReference {
        let (group, version) = object
            .types
            .as_ref()
            .map(|t| parse_api_version(&t.api_version))
            .unwrap_or_default();

        ObjectReference {
            name: object.metadata.name.clone().unwrap_or_default(),
            namespace: object.metadata.namespace.clone().unwrap_or_default(),
            meta: ObjectReferenceMeta {
                group,
                version,
                kind: object
                    .types
                    .as_ref()
                    .map(|t| t.kind.clone())
                    .unwrap_or_default(),
            },
        }
    }
}

/// The result of an attempt to apply or delete a Kubernetes object.
///
/// A status returned by the API server is data, not an error: it lands in
/// `error` for the object's check to accept or reject. Absent fields are
/// omitted from the serialized form so policies can test presence.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    /// The server status when the operation was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
    /// The latest observed version of the object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<DynamicObject>,
    /// What the operation targeted.
    pub target: ObjectReference,
}

impl OperationResult {
    /// True if the operation was accepted by the server.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Split an apiVersion into (group, version).
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// The group/version/kind of an unstructured object. Objects without
/// apiVersion and kind can't be driven anywhere.
pub fn gvk_of(object: &DynamicObject) -> Result<GroupVersionKind> {
    let types = object.types.as_ref().ok_or_else(|| {
        Error::InvalidObject("object must specify apiVersion and kind".to_string())
    })?;

    if types.api_version.is_empty() || types.kind.is_empty() {
        return Err(Error::InvalidObject(
            "object must specify apiVersion and kind".to_string(),
        ));
    }

    let (group, version) = parse_api_version(&types.api_version);
    Ok(GroupVersionKind {
        group,
        version,
        kind: types.kind.clone(),
    })
}

/// The object's namespace, or "default" when it has none.
pub fn namespace_or_default(object: &DynamicObject) -> &str {
    object
        .metadata
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(DEFAULT_NAMESPACE)
}

/// A label selector matching all the labels on the object.
pub fn selector_from_labels(object: &DynamicObject) -> String {
    let mut pairs: Vec<String> = object
        .metadata
        .labels
        .as_ref()
        .map(|labels| labels.iter().map(|(k, v)| format!("{k}={v}")).collect())
        .unwrap_or_default();

    pairs.sort();
    pairs.join(",")
}

/// The run id annotation on the object, if present.
pub fn run_id_for(object: &DynamicObject) -> Option<&str> {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_RUN_ID))
        .map(String::as_str)
}

/// A v1/Namespace expressed as an unstructured object.
pub fn namespace_object(name: &str) -> Result<DynamicObject> {
    // Round-trip through the typed Namespace so the shape stays honest.
    let namespace = Namespace {
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    let mut value = serde_json::to_value(&namespace)
        .map_err(|e| Error::serialization(format!("namespace conversion failed: {e}")))?;

    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".to_string(), "v1".into());
        map.insert("kind".to_string(), "Namespace".into());
    }

    serde_json::from_value(value)
        .map_err(|e| Error::serialization(format!("namespace conversion failed: {e}")))
}

/// Only built-in API groups support strategic merge patching; everything
/// else gets a JSON merge patch. The scheme membership check the typed
/// clients use isn't available over the dynamic API, so group names stand
/// in for it.
pub fn is_builtin_group(group: &str) -> bool {
    matches!(
        group,
        "" | "apps" | "autoscaling" | "batch" | "extensions" | "policy"
    ) || group.ends_with(".k8s.io")
}

/// Collected Kubernetes client interfaces.
pub struct ClusterContext {
    client: Client,
    discovery: tokio::sync::RwLock<Discovery>,
}

impl ClusterContext {
    /// Run discovery against the cluster and collect the interfaces.
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(|e| Error::transport(format!("failed to discover API resources: {e}")))?;

        Ok(ClusterContext {
            client,
            discovery: tokio::sync::RwLock::new(discovery),
        })
    }

    /// The underlying client.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Resolve a kind to its API resource and capabilities.
    ///
    /// Discovery is cached from startup; a miss refreshes it once so that
    /// kinds installed during the run (say, by an applied CRD) resolve.
    pub async fn resolve_kind(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<(ApiResource, ApiCapabilities)> {
        if let Some(found) = self.discovery.read().await.resolve_gvk(gvk) {
            return Ok(found);
        }

        debug!(kind = %gvk.kind, group = %gvk.group, "kind not in cached discovery, refreshing");

        {
            let mut discovery = self.discovery.write().await;
            *discovery = Discovery::new(self.client.clone())
                .run()
                .await
                .map_err(|e| Error::transport(format!("failed to refresh discovery: {e}")))?;
        }

        self.discovery
            .read()
            .await
            .resolve_gvk(gvk)
            .ok_or_else(|| {
                Error::transport(format!(
                    "no resource for kind {}/{} {}",
                    gvk.group, gvk.version, gvk.kind
                ))
            })
    }

    /// All resources for the given plural resource name, across every
    /// group and version that serves it.
    pub async fn resources_for_name(&self, name: &str) -> Vec<(ApiResource, ApiCapabilities)> {
        self.server_resources()
            .await
            .into_iter()
            .filter(|(ar, _)| ar.plural == name)
            .collect()
    }

    /// Every resource the API server supports, in every served version.
    pub async fn server_resources(&self) -> Vec<(ApiResource, ApiCapabilities)> {
        let discovery = self.discovery.read().await;
        let mut resources = Vec::new();

        for group in discovery.groups() {
            for version in group.versions() {
                resources.extend(group.versioned_resources(version));
            }
        }

        resources
    }

    /// The preferred-version resources the API server supports.
    pub async fn preferred_resources(&self) -> Vec<(ApiResource, ApiCapabilities)> {
        let discovery = self.discovery.read().await;
        let mut resources = Vec::new();

        for group in discovery.groups() {
            resources.extend(group.recommended_resources());
        }

        resources
    }

    /// Whether the given namespace exists.
    pub async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());

        match api.get(name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(status)) if status.code == 404 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// The dynamic API for a resource, scoped to a namespace when the
    /// resource is namespaced and a namespace is given.
    pub fn dynamic_api(
        &self,
        ar: &ApiResource,
        caps: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if caps.scope == Scope::Namespaced => {
                Api::namespaced_with(self.client.clone(), ns, ar)
            }
            _ => Api::all_with(self.client.clone(), ar),
        }
    }

    /// List the objects of the given kind matching a label selector,
    /// across all namespaces.
    pub async fn select_objects(
        &self,
        gvk: &GroupVersionKind,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let (ar, _caps) = self.resolve_kind(gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);

        let params = ListParams::default().labels(selector).limit(10000);

        match api.list(&params).await {
            Ok(list) => Ok(list.items),
            Err(kube::Error::Api(status)) if status.code == 404 => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// List every object in the cluster carrying the given label,
    /// scanning all listable preferred resources.
    pub async fn select_objects_by_label(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<DynamicObject>> {
        let selector = format!("{label}={value}");
        let mut results = Vec::new();

        for (ar, caps) in self.preferred_resources().await {
            if !caps.supports_operation(verbs::LIST) {
                continue;
            }

            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
            let params = ListParams::default().labels(&selector).limit(10000);

            match api.list(&params).await {
                Ok(list) => results.extend(list.items),
                Err(kube::Error::Api(status)) if status.code == 404 => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(results)
    }
}
