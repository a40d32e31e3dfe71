//! The test runner
//!
//! Processes document fragments sequentially: object fragments are
//! hydrated and applied (or deleted), module fragments are evaluated by
//! the check loop. Cluster state observed by informers is mirrored into
//! the policy data document as the run progresses, and everything the
//! driver created is garbage-collected at the end.

pub mod check;
pub mod mirror;

use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::driver::ObjectDriver;
use crate::cluster::{
    gvk_of, namespace_or_default, namespace_object, run_id_for, selector_from_labels,
    ClusterContext, OperationResult,
};
use crate::document::{Document, Fragment, FragmentKind};
use crate::error::Error;
use crate::hydrate::{Environment, HydratedObject, Operation};
use crate::policy::{builtin_modules, Compiler, Module, ModuleSet, RegoDriver};
use crate::report::{CheckResult, Recorder};
use crate::Result;

/// Options for a test run.
pub struct RunOptions {
    /// How long each check may take to converge.
    pub check_timeout: Duration,
    /// Skip object deletion at the end of the run.
    pub preserve: bool,
    /// Simulate apply and delete without cluster writes.
    pub dry_run: bool,
    /// Emit policy trace output.
    pub trace_policy: bool,
    /// Extra parameters stored under `/test/params`.
    pub params: Vec<(String, String)>,
    /// Extra resources to start informers for.
    pub watch: Vec<ApiResource>,
    /// Operator-supplied policy modules compiled into every document.
    pub policy_modules: Vec<Module>,
    /// Cancels in-flight checks when triggered.
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            check_timeout: Duration::from_secs(30),
            preserve: false,
            dry_run: false,
            trace_policy: false,
            params: Vec::new(),
            watch: Vec::new(),
            policy_modules: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// How a document run ended.
pub struct DocumentOutcome {
    /// Whether the document passed, judged before teardown. Teardown
    /// failures are reported but do not re-classify a passing run.
    pub passed: bool,
}

/// Execute a test document. The caller is expected to have opened a
/// recorder document and validated (decoded) every fragment.
pub async fn run(
    cluster: Arc<ClusterContext>,
    recorder: Arc<dyn Recorder>,
    doc: &Document,
    options: RunOptions,
) -> Result<DocumentOutcome> {
    let driver = Arc::new(ObjectDriver::new(Arc::clone(&cluster), options.dry_run));
    let policy = Arc::new(RegoDriver::new());
    let env = Environment::new();

    if options.trace_policy {
        policy.trace(Box::new(|line| println!("{line}")));
    }

    let outcome = run_document(&cluster, &driver, &policy, &env, &recorder, doc, &options).await;

    driver.done();
    outcome
}

async fn run_document(
    cluster: &Arc<ClusterContext>,
    driver: &Arc<ObjectDriver>,
    policy: &Arc<RegoDriver>,
    env: &Environment,
    recorder: &Arc<dyn Recorder>,
    doc: &Document,
    options: &RunOptions,
) -> Result<DocumentOutcome> {
    // Mirror informer events into the data document. The store is
    // transactional, so no extra locking is needed on this path.
    let sink = Arc::clone(policy);
    let watch_token = driver.watch(Arc::new(move |event| {
        if let Err(err) = mirror::apply_event(sink.as_ref(), event) {
            warn!(error = %err, "failed to mirror cluster state");
        }
    }));

    for resource in &options.watch {
        driver.inform_on(resource).await?;
    }

    let resources = cluster.server_resources().await;
    mirror::store_resource_versions(policy.as_ref(), &resources)?;

    for (key, value) in &options.params {
        let path = format!("/test/params/{}", key.replace('.', "/"));
        mirror::store_item(policy.as_ref(), &path, &Value::String(value.clone()))?;
    }

    mirror::store_item(
        policy.as_ref(),
        "/test/params/run-id",
        &Value::String(env.unique_id().to_string()),
    )?;

    let mut compiler = None;
    {
        let closer = recorder.new_step("compiling test document");
        if recorder.should_continue() {
            match compile_document(doc, &options.policy_modules) {
                Ok(compiled) => compiler = Some(compiled),
                Err(err) => recorder.update(&[CheckResult::fatal(err.to_string())]),
            }
        } else {
            recorder.update(&[CheckResult::info("skipping")]);
        }
        closer.close();
    }

    for fragment in doc.fragments() {
        if !recorder.should_continue() {
            break;
        }

        let Some(compiler) = compiler.as_ref() else {
            break;
        };

        match fragment.kind() {
            FragmentKind::Object => {
                run_object_fragment(
                    cluster, driver, policy, env, recorder, compiler, fragment, options,
                )
                .await;
            }

            FragmentKind::Module => {
                let closer = recorder
                    .new_step(&format!("running policy check lines {}", fragment.location()));

                if !recorder.should_continue() {
                    recorder.update(&[CheckResult::info("skipping")]);
                } else if let Some(module) = fragment.module() {
                    match check::run_check(
                        policy.as_ref(),
                        module,
                        Some(compiler),
                        None,
                        options.check_timeout,
                        &options.cancel,
                    )
                    .await
                    {
                        Ok(results) => recorder.update(&results),
                        Err(err) => recorder.update(&[CheckResult::fatal(err.to_string())]),
                    }
                }

                closer.close();
            }

            // Unknown fragments are ignored; invalid fragments were
            // already reported fatally during document validation.
            FragmentKind::Unknown | FragmentKind::Invalid => {}
        }
    }

    driver.unwatch(watch_token);

    // Judge the document before teardown so cleanup trouble is reported
    // without failing an otherwise-passing run.
    let passed = !recorder.failed();

    if !options.preserve {
        debug!(objects = driver.adopted_count(), "deleting tracked objects");

        let closer = recorder.new_step("deleting Kubernetes objects");
        if let Err(err) = driver.delete_all().await {
            let mut message = err.to_string();
            for cause in err.chain().skip(1) {
                message.push('\n');
                message.push_str(&cause.to_string());
            }
            recorder.update(&[CheckResult::fatal(message)]);
        }
        closer.close();
    }

    Ok(DocumentOutcome { passed })
}

fn type_of(object: &DynamicObject) -> (String, String) {
    object
        .types
        .as_ref()
        .map(|t| (t.api_version.clone(), t.kind.clone()))
        .unwrap_or_default()
}

fn object_name(object: &DynamicObject) -> &str {
    object.metadata.name.as_deref().unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
async fn run_object_fragment(
    cluster: &Arc<ClusterContext>,
    driver: &Arc<ObjectDriver>,
    policy: &Arc<RegoDriver>,
    env: &Environment,
    recorder: &Arc<dyn Recorder>,
    compiler: &Compiler,
    fragment: &Fragment,
    options: &RunOptions,
) {
    let mut hydrated: Option<HydratedObject> = None;

    {
        let closer = recorder.new_step(&format!(
            "hydrating Kubernetes object lines {}",
            fragment.location()
        ));

        if !recorder.should_continue() {
            recorder.update(&[CheckResult::info("skipping")]);
        } else {
            match env.hydrate_object(fragment.source()) {
                Ok(object) => {
                    let (api_version, kind) = type_of(&object.object);

                    if object_name(&object.object).is_empty() {
                        recorder.update(&[CheckResult::info(format!(
                            "hydrated anonymous {api_version}:{kind} object"
                        ))]);
                    } else {
                        recorder.update(&[CheckResult::info(format!(
                            "hydrated {api_version}:{kind} object '{}/{}'",
                            namespace_or_default(&object.object),
                            object_name(&object.object),
                        ))]);
                    }

                    hydrated = Some(object);
                }
                Err(err) => recorder.update(&[CheckResult::fatal(format!(
                    "failed to hydrate object: {err}"
                ))]),
            }
        }

        closer.close();
    }

    // If the object has no name, select one by its labels. The candidates
    // may not have been created yet, which is one more reason checks
    // converge rather than assert.
    {
        let closer = recorder.new_step("matching anonymous Kubernetes object");

        if !recorder.should_continue() {
            recorder.update(&[CheckResult::info("skipping")]);
        } else if let Some(object) = hydrated.as_mut() {
            if object_name(&object.object).is_empty() {
                resolve_anonymous(cluster, env, recorder, object).await;
            }
        }

        closer.close();
    }

    let mut op_result: Option<OperationResult> = None;

    {
        let closer = recorder.new_step("updating Kubernetes object");

        if !recorder.should_continue() {
            recorder.update(&[CheckResult::info("skipping")]);
        } else if let Some(object) = hydrated.as_ref() {
            let (_, kind) = type_of(&object.object);

            recorder.update(&[CheckResult::info(format!(
                "performing {} operation on {} '{}/{}'",
                object.operation,
                kind,
                namespace_or_default(&object.object),
                object_name(&object.object),
            ))]);

            let attempted = match object.operation {
                Operation::Update => apply_object(cluster, driver, &object.object).await,
                Operation::Delete => driver.delete(&object.object).await,
            };

            match attempted {
                Err(err) => recorder.update(&[CheckResult::fatal(format!(
                    "unable to {} object: {err}",
                    object.operation
                ))]),
                Ok(result) => {
                    if let Some(latest) = &result.latest {
                        match serde_json::to_value(latest) {
                            Ok(content) => {
                                if let Err(err) = mirror::store_item(
                                    policy.as_ref(),
                                    mirror::APPLIED_LAST_PATH,
                                    &content,
                                ) {
                                    recorder.update(&[CheckResult::fatal(format!(
                                        "failed to store result: {err}"
                                    ))]);
                                }
                            }
                            Err(err) => recorder.update(&[CheckResult::fatal(format!(
                                "failed to store result: {err}"
                            ))]),
                        }
                    }

                    op_result = Some(result);
                }
            }
        }

        closer.close();
    }

    {
        let closer = recorder.new_step("running object update check");

        if !recorder.should_continue() {
            recorder.update(&[CheckResult::info("skipping")]);
        } else if let (Some(object), Some(result)) = (hydrated.as_ref(), op_result.as_ref()) {
            let (_, kind) = type_of(&object.object);

            recorder.update(&[CheckResult::info(format!(
                "checking {} of {} '{}/{}'",
                object.operation,
                kind,
                namespace_or_default(&object.object),
                object_name(&object.object),
            ))]);

            let module = match &object.check {
                Some(inline) => Ok(inline.clone()),
                None => check::default_check(object.operation),
            };

            match module {
                Err(err) => recorder.update(&[CheckResult::fatal(err.to_string())]),
                Ok(module) => match serde_json::to_value(result) {
                    Err(err) => recorder.update(&[CheckResult::fatal(format!(
                        "failed to encode operation result: {err}"
                    ))]),
                    Ok(input) => {
                        match check::run_check(
                            policy.as_ref(),
                            &module,
                            Some(compiler),
                            Some(&input),
                            options.check_timeout,
                            &options.cancel,
                        )
                        .await
                        {
                            Ok(results) => recorder.update(&results),
                            Err(err) => recorder.update(&[CheckResult::fatal(err.to_string())]),
                        }
                    }
                },
            }
        }

        closer.close();
    }
}

async fn resolve_anonymous(
    cluster: &Arc<ClusterContext>,
    env: &Environment,
    recorder: &Arc<dyn Recorder>,
    object: &mut HydratedObject,
) {
    let (api_version, kind) = type_of(&object.object);
    let selector = selector_from_labels(&object.object);

    recorder.update(&[
        CheckResult::info(format!("matching anonymous {api_version}:{kind} object")),
        CheckResult::info(format!("selector {selector:?}")),
    ]);

    let gvk = match gvk_of(&object.object) {
        Ok(gvk) => gvk,
        Err(err) => {
            recorder.update(&[CheckResult::fatal(err.to_string())]);
            return;
        }
    };

    let candidates = match cluster.select_objects(&gvk, &selector).await {
        Ok(candidates) => candidates,
        Err(err) => {
            recorder.update(&[CheckResult::fatal(format!(
                "listing {api_version}:{kind} objects: {err}"
            ))]);
            return;
        }
    };

    let matched = candidates
        .into_iter()
        .find(|candidate| run_id_for(candidate) == Some(env.unique_id()));

    match matched {
        None => recorder.update(&[CheckResult::fatal(
            Error::NoRunIdMatch(env.unique_id().to_string()).to_string(),
        )]),
        Some(found) => {
            recorder.update(&[CheckResult::info(format!(
                "matched {api_version}:{kind} object '{}/{}'",
                namespace_or_default(&found),
                object_name(&found),
            ))]);

            object.object = found;
        }
    }
}

/// Apply an object, implicitly creating its namespace first. Namespace
/// creation failure bubbles as the operation result, not as an internal
/// error: the namespace was synthesized, so the user still sees a check
/// against something that went wrong.
async fn apply_object(
    cluster: &Arc<ClusterContext>,
    driver: &Arc<ObjectDriver>,
    object: &DynamicObject,
) -> Result<OperationResult> {
    if let Some(ns) = object.metadata.namespace.as_deref() {
        if !ns.is_empty() {
            let exists = cluster
                .namespace_exists(ns)
                .await
                .map_err(|e| Error::transport(format!("failed check for namespace {ns:?}: {e}")))?;

            if !exists {
                let implicit = namespace_object(ns)?;
                let result = driver.apply(&implicit).await.map_err(|e| {
                    Error::transport(format!("failed to create implicit namespace {ns:?}: {e}"))
                })?;

                if !result.succeeded() {
                    return Ok(result);
                }
            }
        }
    }

    driver.apply(object).await
}

/// Compile every policy in the test document: built-in modules first,
/// then operator-supplied modules, then document fragments keyed under a
/// `doc/` prefix. Name collisions anywhere are fatal.
fn compile_document(doc: &Document, extra: &[Module]) -> Result<Compiler> {
    let mut set = ModuleSet::new();

    for module in builtin_modules()? {
        set.insert(module)?;
    }

    for module in extra {
        set.insert(module.clone())?;
    }

    for fragment in doc.fragments() {
        if let Some(module) = fragment.module() {
            set.insert(module.with_name(format!("doc/data.{}", module.package())))?;
        }
    }

    set.compile()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_document_includes_builtins_and_fragments() {
        let mut doc = crate::document::read_document(
            "error[msg] {\n  input.broken\n  msg := \"broken\"\n}",
        );
        doc.fragments_mut()[0].decode().unwrap();

        let compiler = compile_document(&doc, &[]).unwrap();

        assert!(compiler.contains("builtin/objectUpdateCheck.rego"));
        assert!(compiler.contains("builtin/objectDeleteCheck.rego"));

        let package = doc.fragments()[0].module().unwrap().package().to_string();
        assert!(compiler.contains(&format!("doc/data.{package}")));
        assert!(compiler.contains_package(&package));
    }

    #[test]
    fn test_compile_document_rejects_duplicate_modules() {
        let doc = crate::document::read_document("");

        let module = Module::parse("policies/a.rego", "package a\nx := 1\n").unwrap();
        let duplicate = Module::parse("policies/a.rego", "package b\ny := 2\n").unwrap();

        let err = compile_document(&doc, &[module, duplicate]).unwrap_err();
        assert!(matches!(err, Error::DuplicateModule(_)));
    }

    #[test]
    fn test_default_run_options() {
        let options = RunOptions::default();
        assert_eq!(options.check_timeout, Duration::from_secs(30));
        assert!(!options.preserve);
        assert!(!options.dry_run);
    }
}
