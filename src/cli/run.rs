//! The `run` subcommand

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterContext;
use crate::error::Error;
use crate::policy::Module;
use crate::report::{
    stack, CheckResult, Recorder, StateRecorder, SummaryWriter, TapWriter, TreeWriter,
};
use crate::runner::RunOptions;
use crate::{document, fixture, runner, Result};

/// Arguments for `run`.
///
/// Test documents are ordered fragments of YAML objects and policy
/// checks, separated by the YAML document separator `---`, executed
/// sequentially. Since both Kubernetes and the services in a cluster are
/// eventually consistent, checks are executed repeatedly until they
/// succeed or the check timeout expires.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Set execution tracing flags
    #[arg(long)]
    pub trace: Option<String>,

    /// Don't automatically delete Kubernetes objects
    #[arg(long)]
    pub preserve: bool,

    /// Don't actually create Kubernetes objects
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Timeout for evaluating check steps
    #[arg(long = "check-timeout", default_value = "30s", value_parser = super::parse_duration)]
    pub check_timeout: Duration,

    /// Additional policy parameter(s) in key=value format
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// Additional Kubernetes resources to monitor
    #[arg(long = "watch", value_name = "RESOURCE")]
    pub watch: Vec<String>,

    /// Additional Kubernetes resource fixtures
    #[arg(long = "fixtures", value_name = "PATH")]
    pub fixtures: Vec<PathBuf>,

    /// Additional policy packages
    #[arg(long = "policies", value_name = "PATH")]
    pub policies: Vec<PathBuf>,

    /// Test results output format (tree or tap)
    #[arg(long, default_value = "tree")]
    pub format: String,

    /// Test documents to execute
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,
}

/// Execute the `run` subcommand.
pub async fn run(args: RunArgs) -> Result<u8> {
    if args.files.is_empty() {
        return Err(Error::usage("no test file(s)"));
    }

    for path in &args.fixtures {
        super::walk_files(path, &mut |file| {
            fixture::global().add_from_file(file)
        })?;
    }

    let params = validate_params(&args.params)?;
    let policy_modules = load_policies(&args.policies)?;

    let state = Arc::new(StateRecorder::new());
    let summary = Arc::new(SummaryWriter::new());

    let recorder: Arc<dyn Recorder> = match args.format.as_str() {
        "tree" => stack(
            Arc::new(TreeWriter::new()),
            stack(summary.clone(), state.clone()),
        ),
        "tap" => stack(Arc::new(TapWriter::new()), state.clone()),
        other => {
            return Err(Error::usage(format!(
                "invalid test output format {other:?}"
            )))
        }
    };

    let client = kube::Client::try_default()
        .await
        .map_err(|e| Error::transport(format!("failed to initialize Kubernetes context: {e}")))?;
    let cluster = Arc::new(ClusterContext::new(client).await?);

    let mut watch = Vec::new();
    for name in &args.watch {
        for (resource, _caps) in cluster.resources_for_name(name).await {
            watch.push(resource);
        }
    }

    let trace_policy = args
        .trace
        .as_deref()
        .map(|flags| flags.split(',').any(|f| f == "rego"))
        .unwrap_or(false);

    let mut all_passed = true;

    for file in &args.files {
        let doc_closer = recorder.new_document(&file.display().to_string());

        let doc = validate_document(file, recorder.as_ref());

        if recorder.should_continue() {
            if let Some(doc) = doc {
                let options = RunOptions {
                    check_timeout: args.check_timeout,
                    preserve: args.preserve,
                    dry_run: args.dry_run,
                    trace_policy,
                    params: params.clone(),
                    watch: watch.clone(),
                    policy_modules: policy_modules.clone(),
                    cancel: CancellationToken::new(),
                };

                let outcome =
                    runner::run(Arc::clone(&cluster), Arc::clone(&recorder), &doc, options)
                        .await
                        .map_err(|e| Error::transport(format!("failed to run tests: {e}")))?;

                all_passed = all_passed && outcome.passed;
            } else {
                all_passed = false;
            }
        } else {
            all_passed = all_passed && !recorder.failed();
        }

        doc_closer.close();
    }

    if args.format == "tree" {
        summary.summarize(&mut std::io::stdout());
    }

    Ok(if all_passed { 0 } else { 1 })
}

/// Read a document and decode every fragment, reporting progress and any
/// syntax errors into the recorder. Execution is skipped for documents
/// that fail validation.
fn validate_document(path: &Path, recorder: &dyn Recorder) -> Option<document::Document> {
    let closer = recorder.new_step(&format!("validating document {:?}", path.display().to_string()));

    recorder.update(&[CheckResult::info(format!(
        "reading document from {}",
        path.display()
    ))]);

    let mut doc = match document::read_file(path) {
        Ok(doc) => doc,
        Err(err) => {
            recorder.update(&[CheckResult::fatal(err.to_string())]);
            closer.close();
            return None;
        }
    };

    recorder.update(&[CheckResult::info(format!(
        "decoding document with {} parts from {}",
        doc.fragments().len(),
        path.display()
    ))]);

    for (i, fragment) in doc.fragments_mut().iter_mut().enumerate() {
        match fragment.decode() {
            Ok(kind) => recorder.update(&[CheckResult::info(format!(
                "decoded part {i} as {kind} (lines {})",
                fragment.location()
            ))]),
            Err(err) => recorder.update(&[CheckResult::fatal(err.to_string())]),
        }
    }

    closer.close();
    Some(doc)
}

/// Parse repeated `key=value` parameters.
fn validate_params(params: &[String]) -> Result<Vec<(String, String)>> {
    params
        .iter()
        .map(|param| {
            param
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| {
                    Error::bad_input(format!("missing value for parameter {param:?}"))
                })
        })
        .collect()
}

/// Load policy modules from files or directories. Each file must parse on
/// its own; name collisions and cross-module resolution are reported when
/// the test document compiles, so they land in the test results rather
/// than aborting the invocation.
fn load_policies(paths: &[PathBuf]) -> Result<Vec<Module>> {
    let mut modules = Vec::new();

    for path in paths {
        super::walk_files(path, &mut |file| {
            modules.push(Module::parse_file(file)?);
            Ok(())
        })?;
    }

    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ModuleSet;

    #[test]
    fn test_validate_params() {
        let params =
            validate_params(&["foo=bar".to_string(), "a.b.c=value".to_string()]).unwrap();
        assert_eq!(
            params,
            vec![
                ("foo".to_string(), "bar".to_string()),
                ("a.b.c".to_string(), "value".to_string()),
            ]
        );
    }

    #[test]
    fn test_validate_params_requires_value() {
        let err = validate_params(&["novalue".to_string()]).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
        assert_eq!(err.exit_code(), 65);
    }

    #[test]
    fn test_load_policies_missing_file_exits_noinput() {
        let err = load_policies(&[PathBuf::from("/no/such/policy.rego")]).unwrap_err();
        assert_eq!(err.exit_code(), 66);
    }

    #[test]
    fn test_load_policies_keeps_duplicates_for_document_compile() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("common.rego");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "package common\n\nx := 1").unwrap();

        // The same file passed twice loads twice; the collision is the
        // document compiler's to report.
        let modules = load_policies(&[path.clone(), path]).unwrap();
        assert_eq!(modules.len(), 2);

        let mut set = ModuleSet::new();
        set.insert(modules[0].clone()).unwrap();
        let err = set.insert(modules[1].clone()).unwrap_err();
        assert!(matches!(err, Error::DuplicateModule(_)));
    }

    #[test]
    fn test_load_policies_rejects_syntax_errors() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.rego");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "package broken\n\nerror[msg] {{").unwrap();

        let err = load_policies(&[path]).unwrap_err();
        assert!(matches!(err, Error::PolicyCompile(_)));
        assert_eq!(err.exit_code(), 65);
    }

    #[test]
    fn test_validate_document_records_fragments() {
        use std::io::Write;

        let state = StateRecorder::new();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: echo\n---\nerror[msg] {{\n  input.broken\n  msg := \"broken\"\n}}\n"
        )
        .unwrap();

        let doc_closer = state.new_document("doc");
        let doc = validate_document(file.path(), &state).unwrap();
        doc_closer.close();

        assert_eq!(doc.fragments().len(), 2);
        assert!(doc.fragments().iter().all(|f| f.is_decoded()));
        assert!(!state.failed());
        assert!(state.should_continue());
    }

    #[test]
    fn test_validate_document_reports_syntax_errors() {
        use std::io::Write;

        let state = StateRecorder::new();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "error[msg] {{").unwrap();

        let doc_closer = state.new_document("doc");
        let _ = validate_document(file.path(), &state);
        assert!(!state.should_continue());
        doc_closer.close();

        assert!(state.failed());
    }
}
