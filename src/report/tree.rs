//! Tree-formatted terminal output

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Local;

use super::{lock, CheckResult, Closer, Recorder, Severity};

// Fixed-width boxing characters.
const BOX_BRANCH: &str = "├─ ";
const BOX_VERTICAL: &str = "│ ";
const BOX_ELBOW: &str = "└─ ";

#[derive(Default)]
struct TreeState {
    indent: usize,
    doc_count: usize,
    step_count: usize,
    step_errors: HashMap<Severity, usize>,
    all_errors: HashMap<Severity, usize>,
}

impl TreeState {
    fn counted(errors: &HashMap<Severity, usize>, severity: Severity) -> usize {
        errors.get(&severity).copied().unwrap_or(0)
    }

    fn failures(errors: &HashMap<Severity, usize>) -> usize {
        Self::counted(errors, Severity::Error) + Self::counted(errors, Severity::Fatal)
    }
}

fn format_fail_counters(errors: &HashMap<Severity, usize>) -> String {
    let n = TreeState::failures(errors);
    match n {
        1 => "1 error".to_string(),
        n => format!("{n} errors"),
    }
}

fn tab_printf(indent: usize, leader: &str, message: &str) {
    let timestamp = Local::now().format("%H:%M:%S%.4f");
    let pad = BOX_VERTICAL.repeat(indent);

    for (n, line) in message.split('\n').enumerate() {
        // The leader only decorates the first output line; continuation
        // lines get an extra indent instead.
        if n == 0 {
            println!("{timestamp}\t{pad}{leader}{line}");
        } else {
            println!("{timestamp}\t{} {line}", BOX_VERTICAL.repeat(indent + 1));
        }
    }
}

/// A recorder that writes test results to standard output in a
/// hierarchical tree notation suitable for terminals.
#[derive(Default)]
pub struct TreeWriter {
    state: Arc<Mutex<TreeState>>,
}

impl TreeWriter {
    /// Create a tree writer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Recorder for TreeWriter {
    fn should_continue(&self) -> bool {
        true
    }

    fn failed(&self) -> bool {
        false
    }

    fn new_document(&self, desc: &str) -> Closer {
        {
            let mut state = lock(&self.state);

            if state.doc_count > 0 {
                println!();
            }

            tab_printf(state.indent, "", &format!("Running: {desc}"));

            state.doc_count += 1;
            state.step_count = 0;
            state.all_errors.clear();
        }

        let state = Arc::clone(&self.state);
        Closer::new(move || {
            let state = lock(&state);

            if TreeState::counted(&state.all_errors, Severity::Skip) > 0 {
                tab_printf(
                    state.indent,
                    BOX_ELBOW,
                    &format!("Skipped after {} steps", state.step_count),
                );
            } else if TreeState::failures(&state.all_errors) > 0 {
                tab_printf(
                    state.indent,
                    BOX_ELBOW,
                    &format!("Failed with {}", format_fail_counters(&state.all_errors)),
                );
            } else {
                tab_printf(
                    state.indent,
                    BOX_ELBOW,
                    &format!("Pass with {} steps OK", state.step_count),
                );
            }
        })
    }

    fn new_step(&self, desc: &str) -> Closer {
        {
            let mut state = lock(&self.state);

            tab_printf(
                state.indent,
                BOX_BRANCH,
                &format!("Step {}: {desc}", state.step_count),
            );

            state.indent += 1;
            state.step_count += 1;
            state.step_errors.clear();
        }

        let state = Arc::clone(&self.state);
        Closer::new(move || {
            let mut state = lock(&state);

            if TreeState::counted(&state.step_errors, Severity::Skip) > 0 {
                tab_printf(state.indent, BOX_ELBOW, "Skipped");
            } else if TreeState::failures(&state.step_errors) > 0 {
                tab_printf(
                    state.indent,
                    BOX_ELBOW,
                    &format!("Failed with {}", format_fail_counters(&state.step_errors)),
                );
            } else {
                tab_printf(state.indent, BOX_ELBOW, "Pass");
            }

            state.indent -= 1;

            let counters: Vec<(Severity, usize)> =
                state.step_errors.drain().collect();
            for (severity, count) in counters {
                *state.all_errors.entry(severity).or_insert(0) += count;
            }
        })
    }

    fn update(&self, results: &[CheckResult]) {
        let mut state = lock(&self.state);

        for result in results {
            match result.severity {
                Severity::None => tab_printf(state.indent, BOX_BRANCH, &result.message),
                severity => {
                    *state.step_errors.entry(severity).or_insert(0) += 1;
                    tab_printf(
                        state.indent,
                        BOX_BRANCH,
                        &format!("{}: {}", severity.to_string().to_uppercase(), result.message),
                    );
                }
            }
        }
    }
}
