//! Object lifecycle management
//!
//! The driver applies, watches, and deletes Kubernetes objects. Every
//! server-confirmed object is *adopted* into a UID-indexed pool so it
//! participates in cleanup; per-resource informers keep the pool fresh
//! and fan watch events out to registered handlers.
//!
//! # Concurrency
//!
//! Informer streams run on their own tasks. One lock guards the watcher
//! set and is held for the whole of each event delivery, so delivery is
//! serialized with respect to handler registration; a separate lock
//! guards the object pool. Handlers must not block: anything slow belongs
//! on a channel or a spawned task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::{ApiResource, Scope};
use kube::runtime::watcher;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{gvk_of, is_builtin_group, ClusterContext, ObjectReference, OperationResult};
use crate::error::Error;
use crate::Result;

/// An event observed by one of the driver's informers. Events carry the
/// resource they were observed on, so consumers never need a discovery
/// round-trip of their own.
#[derive(Clone)]
pub enum ObjectEvent {
    /// The object was added or updated.
    Applied(DynamicObject, Arc<ApiResource>),
    /// The object was deleted.
    Deleted(DynamicObject, Arc<ApiResource>),
}

/// A handler for informer events. Handlers run under the watcher lock and
/// must not block.
pub type WatchHandler = Arc<dyn Fn(&ObjectEvent) + Send + Sync>;

/// Unregisters a watch handler when passed back to
/// [`ObjectDriver::unwatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchToken(usize);

#[derive(Default)]
struct WatcherSet {
    next_index: usize,
    handlers: HashMap<usize, WatchHandler>,
}

impl WatcherSet {
    fn add(&mut self, handler: WatchHandler) -> WatchToken {
        let index = self.next_index;
        self.next_index += 1;
        self.handlers.insert(index, handler);
        WatchToken(index)
    }

    fn remove(&mut self, token: WatchToken) {
        self.handlers.remove(&token.0);
    }

    fn deliver(&self, event: &ObjectEvent) {
        for handler in self.handlers.values() {
            handler(event);
        }
    }
}

/// The set of objects the driver has adopted, keyed by server-assigned
/// UID. An entry exists only for objects confirmed by the API server, and
/// updates are monotonic in `metadata.generation`.
#[derive(Default)]
struct ObjectPool {
    objects: HashMap<String, DynamicObject>,
}

fn generation_of(object: &DynamicObject) -> i64 {
    object.metadata.generation.unwrap_or(0)
}

impl ObjectPool {
    /// Insert or update by generation monotonicity.
    fn adopt(&mut self, object: &DynamicObject) -> Result<()> {
        let uid = object
            .metadata
            .uid
            .clone()
            .filter(|uid| !uid.is_empty())
            .ok_or(Error::MissingUid)?;

        match self.objects.get(&uid) {
            Some(previous) if generation_of(object) <= generation_of(previous) => {}
            _ => {
                self.objects.insert(uid, object.clone());
            }
        }

        Ok(())
    }

    /// Refresh an already-adopted object from an informer event. Objects
    /// the driver never adopted are not picked up here: watching a
    /// resource type must not make the driver own every object of that
    /// type.
    fn refresh(&mut self, object: &DynamicObject) {
        let uid = match object.metadata.uid.as_deref() {
            Some(uid) => uid,
            None => return,
        };

        if let Some(previous) = self.objects.get(uid) {
            if generation_of(object) > generation_of(previous) {
                self.objects.insert(uid.to_string(), object.clone());
            }
        }
    }

    fn remove(&mut self, object: &DynamicObject) {
        if let Some(uid) = object.metadata.uid.as_deref() {
            self.objects.remove(uid);
        }
    }

    fn remove_uid(&mut self, uid: &str) {
        self.objects.remove(uid);
    }

    /// The adopted view of an object matched by name, namespace, and
    /// kind. Callers don't always hold a complete server object, so UID
    /// matching is not an option.
    fn find_latest(&self, object: &DynamicObject) -> Option<DynamicObject> {
        let kind = object.types.as_ref().map(|t| t.kind.as_str());

        self.objects
            .values()
            .find(|adopted| {
                adopted.metadata.name == object.metadata.name
                    && adopted.metadata.namespace == object.metadata.namespace
                    && adopted.types.as_ref().map(|t| t.kind.as_str()) == kind
            })
            .cloned()
    }

    fn snapshot(&self) -> Vec<DynamicObject> {
        self.objects.values().cloned().collect()
    }

    fn clear(&mut self) {
        self.objects.clear();
    }

    fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

struct Informer {
    synced: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives the lifecycle of Kubernetes objects for one test run.
pub struct ObjectDriver {
    cluster: Arc<ClusterContext>,
    cancel: CancellationToken,
    dry_run: bool,

    watchers: Arc<Mutex<WatcherSet>>,
    pool: Arc<Mutex<ObjectPool>>,
    informers: Mutex<HashMap<String, Informer>>,
}

impl ObjectDriver {
    /// Create a driver. With `dry_run` set, apply and delete skip the
    /// cluster write and fabricate a successful result.
    pub fn new(cluster: Arc<ClusterContext>, dry_run: bool) -> Self {
        ObjectDriver {
            cluster,
            cancel: CancellationToken::new(),
            dry_run,
            watchers: Arc::new(Mutex::new(WatcherSet::default())),
            pool: Arc::new(Mutex::new(ObjectPool::default())),
            informers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler for events from every informer the driver
    /// manages. Registration is serialized with event delivery.
    pub fn watch(&self, handler: WatchHandler) -> WatchToken {
        lock(&self.watchers).add(handler)
    }

    /// Unregister a handler.
    pub fn unwatch(&self, token: WatchToken) {
        lock(&self.watchers).remove(token);
    }

    /// Take ownership of a server-confirmed object so it participates in
    /// cleanup. Fails with `MissingUid` for objects that never came back
    /// from the API server.
    pub fn adopt(&self, object: &DynamicObject) -> Result<()> {
        lock(&self.pool).adopt(object)
    }

    /// The number of adopted objects.
    pub fn adopted_count(&self) -> usize {
        lock(&self.pool).objects.len()
    }

    /// Establish an informer for the given resource. Idempotent: the
    /// first call per resource starts a watch task; later calls are
    /// no-ops.
    pub async fn inform_on(&self, resource: &ApiResource) -> Result<()> {
        let key = format!("{}/{}/{}", resource.group, resource.version, resource.plural);

        if lock(&self.informers).contains_key(&key) {
            return Ok(());
        }

        debug!(resource = %key, "starting informer");

        let synced = Arc::new(AtomicBool::new(false));
        let api: Api<DynamicObject> = Api::all_with(self.cluster.client(), resource);

        let task = tokio::spawn(run_informer(
            api,
            Arc::new(resource.clone()),
            Arc::clone(&self.watchers),
            Arc::clone(&self.pool),
            Arc::clone(&synced),
            self.cancel.clone(),
        ));

        lock(&self.informers).insert(key, Informer { synced, task });
        Ok(())
    }

    /// Wait for every informer to finish its initial list.
    pub async fn wait_for_cache_sync(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let synced = lock(&self.informers)
                .values()
                .all(|informer| informer.synced.load(Ordering::SeqCst));

            if synced {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::CacheSyncTimeout);
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Create or update the given object.
    ///
    /// A Create that hits `AlreadyExists` retries as a patch: strategic
    /// merge for built-in types, JSON merge otherwise. The server
    /// confirming the operation adopts the result; a server status
    /// rejection lands in the result's `error` rather than failing.
    pub async fn apply(&self, object: &DynamicObject) -> Result<OperationResult> {
        let mut object = object.clone();
        let gvk = gvk_of(&object)?;

        let (resource, caps) = self.cluster.resolve_kind(&gvk).await.map_err(|e| {
            Error::transport(format!(
                "failed to resolve resource for kind {}:{}: {e}",
                gvk.group, gvk.kind
            ))
        })?;

        self.inform_on(&resource).await?;

        if caps.scope == Scope::Namespaced && object.metadata.namespace.is_none() {
            object.metadata.namespace = Some(super::DEFAULT_NAMESPACE.to_string());
        }

        let mut result = OperationResult {
            error: None,
            latest: Some(object.clone()),
            target: ObjectReference::for_object(&object),
        };

        if self.dry_run {
            return Ok(result);
        }

        let api = self
            .cluster
            .dynamic_api(&resource, &caps, object.metadata.namespace.as_deref());

        let name = object.metadata.name.clone().unwrap_or_default();
        let mut outcome = api.create(&PostParams::default(), &object).await;

        // The object may already exist; fall back to patching, the same
        // shortcut kubectl apply takes.
        if matches!(&outcome, Err(kube::Error::Api(status)) if status.reason == "AlreadyExists") {
            let data = serde_json::to_value(&object)
                .map_err(|e| Error::serialization(format!("failed to encode object: {e}")))?;

            outcome = if is_builtin_group(&gvk.group) {
                api.patch(&name, &PatchParams::default(), &Patch::Strategic(data))
                    .await
            } else {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(data))
                    .await
            };
        }

        match outcome {
            Ok(latest) => {
                self.adopt(&latest)?;
                result.latest = Some(latest);
            }
            Err(kube::Error::Api(status)) => result.error = Some(status),
            Err(err) => {
                return Err(Error::transport(format!(
                    "failed to apply {} {:?}: {err}",
                    gvk.kind, name
                )))
            }
        }

        Ok(result)
    }

    /// Delete the given object.
    ///
    /// Deletion is foreground with no grace period, except Services which
    /// delete in the background to dodge endpoint-controller races. The
    /// result's `latest` is the adopted view when the driver has one.
    pub async fn delete(&self, object: &DynamicObject) -> Result<OperationResult> {
        let mut object = object.clone();
        let gvk = gvk_of(&object)?;

        let (resource, caps) = self.cluster.resolve_kind(&gvk).await.map_err(|e| {
            Error::transport(format!(
                "failed to resolve resource for kind {}:{}: {e}",
                gvk.group, gvk.kind
            ))
        })?;

        // Default the namespace before checking the object pool.
        if caps.scope == Scope::Namespaced && object.metadata.namespace.is_none() {
            object.metadata.namespace = Some(super::DEFAULT_NAMESPACE.to_string());
        }

        let mut result = OperationResult {
            error: None,
            latest: Some(object.clone()),
            target: ObjectReference::for_object(&object),
        };

        if let Some(adopted) = lock(&self.pool).find_latest(&object) {
            result.latest = Some(adopted);
        }

        if self.dry_run {
            return Ok(result);
        }

        let params = if gvk.kind == "Service" {
            DeleteParams::background().grace_period(0)
        } else {
            DeleteParams::foreground().grace_period(0)
        };

        let api = self
            .cluster
            .dynamic_api(&resource, &caps, object.metadata.namespace.as_deref());
        let name = object.metadata.name.clone().unwrap_or_default();

        match api.delete(&name, &params).await {
            Ok(_) => {}
            Err(kube::Error::Api(status)) => result.error = Some(status),
            Err(err) => {
                return Err(Error::transport(format!(
                    "failed to delete {} {:?}: {err}",
                    gvk.kind, name
                )))
            }
        }

        Ok(result)
    }

    /// Delete every adopted object, waiting out deletion cascades.
    ///
    /// Objects the server no longer knows are purged from the pool
    /// directly, since no informer event will do it. Any other failure
    /// ends the pass with a `PartialCleanup` chaining every cause.
    pub async fn delete_all(&self) -> Result<()> {
        loop {
            let targets = lock(&self.pool).snapshot();
            if targets.is_empty() {
                return Ok(());
            }

            let mut causes = Vec::new();

            for target in targets {
                match self.delete(&target).await {
                    Err(err) => causes.push(err),
                    Ok(result) => {
                        if let Some(status) = result.error {
                            match status.reason.as_str() {
                                "NotFound" | "Gone" => {
                                    if let Some(uid) = target.metadata.uid.as_deref() {
                                        lock(&self.pool).remove_uid(uid);
                                    }
                                }
                                _ => causes.push(Error::Kube(kube::Error::Api(status))),
                            }
                        }
                    }
                }
            }

            if !causes.is_empty() {
                return Err(Error::PartialCleanup { causes });
            }

            // Give ownership cascades a moment before rechecking the pool.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// End the driver session: stop informers, unregister watchers, and
    /// forget adopted objects.
    pub fn done(&self) {
        self.cancel.cancel();

        lock(&self.watchers).handlers.clear();
        lock(&self.pool).clear();

        let mut informers = lock(&self.informers);
        for informer in informers.values() {
            informer.task.abort();
        }
        informers.clear();
    }
}

async fn run_informer(
    api: Api<DynamicObject>,
    resource: Arc<ApiResource>,
    watchers: Arc<Mutex<WatcherSet>>,
    pool: Arc<Mutex<ObjectPool>>,
    synced: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let stream = watcher::watcher(api, watcher::Config::default());
    let mut stream = std::pin::pin!(stream);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                None => break,
                Some(Ok(event)) => {
                    handle_watch_event(event, &resource, &watchers, &pool, &synced);
                }
                Some(Err(err)) => {
                    warn!(resource = %resource.plural, error = %err, "watch stream error");
                }
            },
        }
    }
}

fn handle_watch_event(
    event: watcher::Event<DynamicObject>,
    resource: &Arc<ApiResource>,
    watchers: &Mutex<WatcherSet>,
    pool: &Mutex<ObjectPool>,
    synced: &AtomicBool,
) {
    match event {
        watcher::Event::Init => {}
        watcher::Event::InitDone => synced.store(true, Ordering::SeqCst),

        watcher::Event::InitApply(object) | watcher::Event::Apply(object) => {
            lock(pool).refresh(&object);

            let event = ObjectEvent::Applied(object, Arc::clone(resource));
            lock(watchers).deliver(&event);
        }

        watcher::Event::Delete(object) => {
            lock(pool).remove(&object);

            let event = ObjectEvent::Deleted(object, Arc::clone(resource));
            lock(watchers).deliver(&event);
        }

        _ => {}
    }
}
