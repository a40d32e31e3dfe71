//! The regorus-backed policy driver
//!
//! Owns the data document and evaluates assertion rules against it. Each
//! evaluation clones the compiled base engine, loads a store snapshot and
//! the input document, and queries every assertion rule of the module.

use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;

use super::{outcome, EvalOptions, Evaluation, Module, PolicyDriver};
use crate::error::Error;
use crate::report::CheckResult;
use crate::Result;

/// A sink for policy trace output.
pub type TraceSink = Box<dyn Fn(&str) + Send + Sync>;

/// A driver for running Rego policy checks.
pub struct RegoDriver {
    store: super::DataStore,
    tracer: Mutex<Option<TraceSink>>,
}

impl Default for RegoDriver {
    fn default() -> Self {
        RegoDriver {
            store: super::DataStore::new(),
            tracer: Mutex::new(None),
        }
    }
}

impl RegoDriver {
    /// Create a driver with an empty data document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send policy trace output (the `print` builtin) to the given sink.
    pub fn trace(&self, sink: TraceSink) {
        *self
            .tracer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }

    fn tracing_enabled(&self) -> bool {
        self.tracer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    fn emit_trace(&self, lines: Vec<String>) {
        let tracer = self
            .tracer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(sink) = tracer.as_ref() {
            for line in lines {
                sink(&line);
            }
        }
    }
}

fn to_engine_value(value: &Value) -> Result<regorus::Value> {
    regorus::Value::from_json_str(&value.to_string())
        .map_err(|e| Error::serialization(format!("failed to convert value: {e}")))
}

impl PolicyDriver for RegoDriver {
    fn store_item(&self, path: &str, value: &Value) -> Result<()> {
        self.store.write_item(path, value)
    }

    fn store_path(&self, path: &str) -> Result<()> {
        self.store.create_path(path)
    }

    fn remove_path(&self, path: &str) -> Result<()> {
        self.store.remove(path)
    }

    fn eval(&self, module: &Module, options: &EvalOptions<'_>) -> Result<Evaluation> {
        let compiled_in = options
            .compiler
            .map(|c| c.contains(module.name()) || c.contains_package(module.package()))
            .unwrap_or(false);

        let mut engine = match options.compiler {
            Some(compiler) => compiler.engine().clone(),
            None => super::scratch_engine(),
        };

        // Inline checks and default checks are not part of the compiled
        // module set, so they join the evaluation as parsed modules.
        if !compiled_in {
            engine
                .add_policy(module.name().to_string(), module.source().to_string())
                .map_err(|e| Error::PolicyCompile(format!("{}: {e}", module.name())))?;
        }

        engine
            .add_data(to_engine_value(&self.store.snapshot())?)
            .map_err(|e| Error::serialization(format!("failed to load data document: {e}")))?;

        if let Some(input) = options.input {
            engine.set_input(to_engine_value(input)?);
        }

        let tracing = self.tracing_enabled();
        if tracing {
            engine.set_gather_prints(true);
        }

        let mut evaluation = Evaluation::default();

        for rule in module.assertion_rules() {
            let query = format!("data.{}.{}", module.package(), rule);

            match engine.eval_query(query.clone(), false) {
                Ok(output) => {
                    let output = serde_json::to_value(&output).map_err(|e| {
                        Error::serialization(format!("failed to decode query results: {e}"))
                    })?;

                    for entry in output["result"].as_array().into_iter().flatten() {
                        for expr in entry["expressions"].as_array().into_iter().flatten() {
                            evaluation
                                .results
                                .extend(outcome::extract_results(&rule, &expr["value"]));
                        }
                    }
                }

                // Failing builtins are typically those that reach outside
                // the cluster (e.g. HTTP). The failure is part of the
                // test, not of the driver, so it becomes a result.
                Err(err) => {
                    debug!(query = %query, error = %err, "policy query failed");
                    evaluation.errored = true;
                    evaluation.results.push(CheckResult::error(err.to_string()));
                }
            }
        }

        if tracing {
            if let Ok(prints) = engine.take_prints() {
                self.emit_trace(prints);
            }
        }

        Ok(evaluation)
    }
}
