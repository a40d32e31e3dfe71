//! Policy compilation and evaluation
//!
//! Check policies are written in Rego and evaluated by the `regorus`
//! engine. This module wraps the engine behind a small driver interface:
//! a hierarchical data document with transactional writes, and an
//! evaluator that turns assertion-rule values into check results.
//!
//! # Assertion predicates
//!
//! A rule participates in a check when its name selects a severity
//! channel: `error`/`error_*`, `fatal`/`fatal_*`, `skip`/`skip_*`, or
//! `check`/`check_*`. Rules with other names are helpers and are never
//! queried directly.

mod builtin;
mod engine;
mod outcome;
mod store;

pub use builtin::{builtin_module, builtin_modules, DELETE_CHECK_MODULE, UPDATE_CHECK_MODULE};
pub use engine::{RegoDriver, TraceSink};
pub use outcome::{assertion_rules, extract_results, severity_for_rule};
pub use store::DataStore;

use std::collections::BTreeMap;

use rand::Rng;

use crate::error::Error;
use crate::report::CheckResult;
use crate::Result;

/// A named, parsed policy module.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    package: String,
    source: String,
}

impl Module {
    /// Parse a complete module. The source must carry a `package`
    /// declaration; syntax errors fail with `PolicyCompile`.
    pub fn parse(name: impl Into<String>, source: impl Into<String>) -> Result<Module> {
        let name = name.into();
        let source = source.into();

        let mut engine = scratch_engine();
        engine
            .add_policy(name.clone(), source.clone())
            .map_err(|e| Error::PolicyCompile(format!("{name}: {e}")))?;

        let package = package_of(&source)
            .ok_or_else(|| Error::PolicyCompile(format!("{name}: missing package declaration")))?;

        Ok(Module {
            name,
            package,
            source,
        })
    }

    /// Parse a check fragment that has no package declaration of its own.
    ///
    /// Rego requires a package to generate rules, so a package name unique
    /// to the fragment is prepended. The name doubles as a unique file
    /// placeholder.
    pub fn parse_check_fragment(source: &str) -> Result<Module> {
        let tag = random_module_tag(12);

        Module::parse(
            format!("internal/check/{tag}"),
            format!("package check.{tag}\n\n{source}"),
        )
    }

    /// Parse the module in the given file.
    pub fn parse_file(path: &std::path::Path) -> Result<Module> {
        let source = std::fs::read_to_string(path)?;
        Module::parse(path.to_string_lossy().into_owned(), source)
    }

    /// The module name (unique within a compiler).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared package path, without the `data.` prefix.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// The module source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// A copy of this module under a different name. The compiler keys
    /// modules by name, so document fragments are re-keyed under a
    /// `doc/` prefix without touching their package.
    pub fn with_name(&self, name: impl Into<String>) -> Module {
        Module {
            name: name.into(),
            package: self.package.clone(),
            source: self.source.clone(),
        }
    }

    /// Names of the assertion rules this module defines.
    pub fn assertion_rules(&self) -> Vec<String> {
        outcome::assertion_rules(&self.source)
    }

    /// True if the module defines any rules at all. Sources that parse but
    /// define nothing (say, a YAML scalar that happens to be valid Rego)
    /// are not useful as checks.
    pub fn has_rules(&self) -> bool {
        outcome::has_rules(&self.source)
    }
}

/// A set of uniquely named modules waiting to be compiled.
#[derive(Debug, Default)]
pub struct ModuleSet {
    modules: BTreeMap<String, Module>,
}

impl ModuleSet {
    /// Create an empty module set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module. Fails with `DuplicateModule` when the name is taken.
    pub fn insert(&mut self, module: Module) -> Result<()> {
        if self.modules.contains_key(module.name()) {
            return Err(Error::DuplicateModule(module.name().to_string()));
        }

        self.modules.insert(module.name().to_string(), module);
        Ok(())
    }

    /// Compile every module together so cross-module references resolve.
    pub fn compile(self) -> Result<Compiler> {
        let mut engine = scratch_engine();

        for module in self.modules.values() {
            engine
                .add_policy(module.name().to_string(), module.source().to_string())
                .map_err(|e| Error::PolicyCompile(format!("{}: {e}", module.name())))?;
        }

        Ok(Compiler {
            modules: self.modules,
            engine,
        })
    }
}

/// A compiled module set. Evaluations clone the base engine, so compiling
/// once amortizes parsing across every check in a document.
#[derive(Debug)]
pub struct Compiler {
    modules: BTreeMap<String, Module>,
    engine: regorus::Engine,
}

impl Compiler {
    /// True if a module with the given name was compiled in.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// True if a module with the given package was compiled in. Document
    /// fragments are compiled under rewritten names, so membership also
    /// goes by package.
    pub fn contains_package(&self, package: &str) -> bool {
        self.modules.values().any(|m| m.package() == package)
    }

    pub(crate) fn engine(&self) -> &regorus::Engine {
        &self.engine
    }
}

/// Options for one evaluation.
#[derive(Default)]
pub struct EvalOptions<'a> {
    /// Evaluate against this compiled module set. Modules not present in
    /// the compiler are added to a clone of its engine for the evaluation.
    pub compiler: Option<&'a Compiler>,
    /// The `input` document for the evaluation.
    pub input: Option<&'a serde_json::Value>,
}

/// The outcome of one evaluation pass.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Results for every assertion rule that fired.
    pub results: Vec<CheckResult>,
    /// True when the evaluator itself failed (typically a builtin such as
    /// an HTTP call inside a policy). The failure is already captured in
    /// `results` as an Error.
    pub errored: bool,
}

/// The policy evaluation surface consumed by the runner.
pub trait PolicyDriver: Send + Sync {
    /// Upsert the value at the given path in the data document.
    fn store_item(&self, path: &str, value: &serde_json::Value) -> Result<()>;

    /// Ensure every prefix of the path exists as a mapping.
    fn store_path(&self, path: &str) -> Result<()>;

    /// Remove the value at the given path in the data document.
    fn remove_path(&self, path: &str) -> Result<()>;

    /// Evaluate the assertion rules of the given module.
    fn eval(&self, module: &Module, options: &EvalOptions<'_>) -> Result<Evaluation>;
}

/// A fresh engine configured for the policy dialect test documents use.
fn scratch_engine() -> regorus::Engine {
    let mut engine = regorus::Engine::new();
    engine.set_rego_v1(false);
    engine
}

/// Extract the package path from a module source, without the leading
/// `data.` component.
fn package_of(source: &str) -> Option<String> {
    for line in source.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let rest = line.strip_prefix("package ")?;
        let package: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
            .collect();

        if package.is_empty() {
            return None;
        }

        return Some(package);
    }

    None
}

/// A random alphabetic tag for synthesized check packages.
fn random_module_tag(length: usize) -> String {
    const ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();

    (0..length)
        .map(|_| ALPHA[rng.gen_range(0..ALPHA.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_module_extracts_package() {
        let module = Module::parse(
            "policies/common.rego",
            "package common.helpers\n\nis_ready { input.ready }\n",
        )
        .unwrap();

        assert_eq!(module.package(), "common.helpers");
        assert_eq!(module.name(), "policies/common.rego");
    }

    #[test]
    fn test_parse_module_rejects_syntax_errors() {
        let result = Module::parse("bad.rego", "package bad\n\nerror[msg] {");
        assert!(matches!(result, Err(Error::PolicyCompile(_))));
    }

    #[test]
    fn test_check_fragment_gets_a_unique_package() {
        let a = Module::parse_check_fragment("error[msg] { false; msg := \"x\" }").unwrap();
        let b = Module::parse_check_fragment("error[msg] { false; msg := \"x\" }").unwrap();

        assert!(a.package().starts_with("check."));
        assert_ne!(a.package(), b.package());
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_duplicate_module_names_are_fatal() {
        let mut set = ModuleSet::new();
        set.insert(Module::parse("dup.rego", "package one\nx := 1\n").unwrap())
            .unwrap();

        let err = set
            .insert(Module::parse("dup.rego", "package two\nx := 2\n").unwrap())
            .unwrap_err();

        assert!(matches!(err, Error::DuplicateModule(name) if name == "dup.rego"));
    }

    #[test]
    fn test_compile_reports_modules() {
        let mut set = ModuleSet::new();
        set.insert(Module::parse("a.rego", "package a\nx := 1\n").unwrap())
            .unwrap();

        let compiler = set.compile().unwrap();
        assert!(compiler.contains("a.rego"));
        assert!(!compiler.contains("b.rego"));
    }

    #[test]
    fn test_package_of_skips_comments() {
        let source = "# a comment\n\npackage foo.bar # trailing\nx := 1\n";
        assert_eq!(package_of(source).as_deref(), Some("foo.bar"));
    }

    #[test]
    fn test_has_rules() {
        let module = Module::parse("a.rego", "package a\n\nerror[msg] { msg := \"x\" }\n").unwrap();
        assert!(module.has_rules());

        let module = Module::parse("b.rego", "package b\n").unwrap();
        assert!(!module.has_rules());
    }
}
