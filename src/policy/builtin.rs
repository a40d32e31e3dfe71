//! Built-in policy modules
//!
//! Rego assets embedded in the binary. Every asset joins the document
//! compiler under its asset name, and the default object checks are also
//! evaluated directly when an object fragment carries no inline check.

use super::Module;
use crate::Result;

/// Asset name of the default check for object updates.
pub const UPDATE_CHECK_MODULE: &str = "builtin/objectUpdateCheck.rego";

/// Asset name of the default check for object deletes.
pub const DELETE_CHECK_MODULE: &str = "builtin/objectDeleteCheck.rego";

const ASSETS: [(&str, &str); 2] = [
    (
        UPDATE_CHECK_MODULE,
        include_str!("builtin/objectUpdateCheck.rego"),
    ),
    (
        DELETE_CHECK_MODULE,
        include_str!("builtin/objectDeleteCheck.rego"),
    ),
];

/// Parse every built-in module.
pub fn builtin_modules() -> Result<Vec<Module>> {
    ASSETS
        .iter()
        .map(|(name, source)| Module::parse(*name, *source))
        .collect()
}

/// Parse the built-in module with the given asset name.
pub fn builtin_module(name: &str) -> Result<Module> {
    let (_, source) = ASSETS
        .iter()
        .find(|(asset, _)| *asset == name)
        .ok_or_else(|| crate::error::Error::bad_input(format!("unknown builtin module {name:?}")))?;

    Module::parse(name, *source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{EvalOptions, PolicyDriver, RegoDriver};
    use crate::report::Severity;
    use serde_json::json;

    #[test]
    fn test_builtin_modules_parse() {
        let modules = builtin_modules().unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].package(), "builtin.check.update");
        assert_eq!(modules[1].package(), "builtin.check.delete");
    }

    #[test]
    fn test_delete_check_flags_server_status() {
        let driver = RegoDriver::new();
        let module = builtin_module(DELETE_CHECK_MODULE).unwrap();

        let input = json!({
            "error": {"message": "services \"missing\" not found", "reason": "NotFound", "code": 404},
            "target": {
                "name": "missing",
                "namespace": "default",
                "meta": {"group": "", "version": "v1", "kind": "Service"},
            },
        });

        let evaluation = driver
            .eval(
                &module,
                &EvalOptions {
                    compiler: None,
                    input: Some(&input),
                },
            )
            .unwrap();

        assert_eq!(evaluation.results.len(), 1);
        assert_eq!(evaluation.results[0].severity, Severity::Fatal);
        assert!(evaluation.results[0]
            .message
            .contains("failed to delete Service 'default/missing'"));
    }

    #[test]
    fn test_delete_check_passes_without_status() {
        let driver = RegoDriver::new();
        let module = builtin_module(DELETE_CHECK_MODULE).unwrap();

        let input = json!({
            "target": {
                "name": "web",
                "namespace": "default",
                "meta": {"group": "", "version": "v1", "kind": "Service"},
            },
        });

        let evaluation = driver
            .eval(
                &module,
                &EvalOptions {
                    compiler: None,
                    input: Some(&input),
                },
            )
            .unwrap();

        assert!(evaluation.results.is_empty());
    }

    #[test]
    fn test_update_check_flags_server_status() {
        let driver = RegoDriver::new();
        let module = builtin_module(UPDATE_CHECK_MODULE).unwrap();

        let input = json!({
            "error": {"message": "admission denied", "reason": "Forbidden", "code": 403},
            "target": {
                "name": "web",
                "namespace": "default",
                "meta": {"group": "apps", "version": "v1", "kind": "Deployment"},
            },
        });

        let evaluation = driver
            .eval(
                &module,
                &EvalOptions {
                    compiler: None,
                    input: Some(&input),
                },
            )
            .unwrap();

        assert_eq!(evaluation.results.len(), 1);
        assert!(evaluation.results[0]
            .message
            .contains("failed to update Deployment 'default/web'"));
    }

    #[test]
    fn test_update_check_compares_against_applied_state() {
        let driver = RegoDriver::new();
        driver.store_path("/resources/applied").unwrap();
        driver
            .store_item(
                "/resources/applied/last",
                &json!({"metadata": {"uid": "uid-1", "resourceVersion": "10"}}),
            )
            .unwrap();

        let module = builtin_module(UPDATE_CHECK_MODULE).unwrap();

        let matching = json!({
            "latest": {"metadata": {"uid": "uid-1", "resourceVersion": "10"}},
            "target": {"name": "web", "namespace": "default",
                       "meta": {"group": "", "version": "v1", "kind": "Service"}},
        });
        let evaluation = driver
            .eval(&module, &EvalOptions { compiler: None, input: Some(&matching) })
            .unwrap();
        assert!(evaluation.results.is_empty());

        let stale = json!({
            "latest": {"metadata": {"uid": "uid-2", "resourceVersion": "10"}},
            "target": {"name": "web", "namespace": "default",
                       "meta": {"group": "", "version": "v1", "kind": "Service"}},
        });
        let evaluation = driver
            .eval(&module, &EvalOptions { compiler: None, input: Some(&stale) })
            .unwrap();
        assert_eq!(evaluation.results.len(), 1);
        assert_eq!(evaluation.results[0].severity, Severity::Fatal);
    }
}
