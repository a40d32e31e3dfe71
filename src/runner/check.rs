//! The policy check convergence loop
//!
//! Kubernetes is eventually consistent, so the natural unit of
//! observation is "no assertion rules fire". A check is evaluated
//! repeatedly until its result set is empty, a skip appears, or the
//! timeout elapses. Skips short-circuit: a missing cluster feature does
//! not converge to present by waiting.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::hydrate::Operation;
use crate::policy::{
    builtin_module, Compiler, EvalOptions, Module, PolicyDriver, DELETE_CHECK_MODULE,
    UPDATE_CHECK_MODULE,
};
use crate::report::{contains_severity, CheckResult, Severity};
use crate::Result;

/// How long to wait between evaluation passes.
const CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// The built-in default check for the given object operation.
pub fn default_check(operation: Operation) -> Result<Module> {
    match operation {
        Operation::Update => builtin_module(UPDATE_CHECK_MODULE),
        Operation::Delete => builtin_module(DELETE_CHECK_MODULE),
    }
}

/// Evaluate a check until it converges.
///
/// Each iteration replaces the previous result set; results from
/// different evaluations are never merged. An evaluator failure (a
/// consumed builtin error) returns its single Error result without
/// looping, since retrying a broken policy cannot help. Cancellation ends
/// the loop early with the latest results.
pub async fn run_check(
    driver: &dyn PolicyDriver,
    module: &Module,
    compiler: Option<&Compiler>,
    input: Option<&serde_json::Value>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<CheckResult>> {
    let started = tokio::time::Instant::now();

    loop {
        let evaluation = driver.eval(
            module,
            &EvalOptions {
                compiler,
                input,
            },
        )?;

        if evaluation.errored {
            return Ok(evaluation.results);
        }

        if evaluation.results.is_empty() {
            return Ok(Vec::new());
        }

        // Skipping is a permanent status; waiting for the timeout makes
        // no sense.
        if contains_severity(&evaluation.results, Severity::Skip) {
            return Ok(evaluation.results);
        }

        if started.elapsed() >= timeout {
            return Ok(evaluation.results);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(evaluation.results),
            _ = tokio::time::sleep(CHECK_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RegoDriver;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_passing_check_returns_immediately() {
        let driver = RegoDriver::new();
        let module =
            Module::parse_check_fragment("error[msg] { false; msg := \"x\" }").unwrap();

        let results = run_check(
            &driver,
            &module,
            None,
            None,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_skip_short_circuits() {
        let driver = RegoDriver::new();
        let module =
            Module::parse_check_fragment("skip[m] { m := \"missing feature\" }").unwrap();

        let started = std::time::Instant::now();
        let results = run_check(
            &driver,
            &module,
            None,
            None,
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // One evaluation, no convergence wait.
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, Severity::Skip);
    }

    #[tokio::test]
    async fn test_failing_check_runs_until_timeout() {
        let driver = RegoDriver::new();
        let module =
            Module::parse_check_fragment("error[msg] { msg := \"always broken\" }").unwrap();

        let started = std::time::Instant::now();
        let results = run_check(
            &driver,
            &module,
            None,
            None,
            Duration::from_millis(700),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(700));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, Severity::Error);
    }

    /// Convergence: a check that fails against current state passes as
    /// soon as an update lands in the data document.
    #[tokio::test]
    async fn test_check_converges_when_state_appears() {
        let driver = Arc::new(RegoDriver::new());
        let module = Module::parse_check_fragment(
            "error[msg] { not data.resources.httpproxies.httpbin.status; msg := \"missing status\" }",
        )
        .unwrap();

        let writer = Arc::clone(&driver);
        let update = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(800)).await;
            crate::runner::mirror::store_item(
                writer.as_ref(),
                "/resources/httpproxies/httpbin",
                &json!({"status": {"currentStatus": "valid"}}),
            )
            .unwrap();
        });

        let results = run_check(
            driver.as_ref(),
            &module,
            None,
            None,
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        update.await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_ends_the_loop() {
        let driver = RegoDriver::new();
        let module =
            Module::parse_check_fragment("error[msg] { msg := \"never converges\" }").unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let results = run_check(
            &driver,
            &module,
            None,
            None,
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_default_checks_resolve() {
        assert_eq!(
            default_check(Operation::Update).unwrap().package(),
            "builtin.check.update"
        );
        assert_eq!(
            default_check(Operation::Delete).unwrap().package(),
            "builtin.check.delete"
        );
    }
}
