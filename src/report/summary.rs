//! Final run summary

use std::io::Write;
use std::sync::{Arc, Mutex};

use super::{lock, CheckResult, Closer, Recorder, Severity};

#[derive(Clone)]
struct DocSummary {
    doc: String,
    status: Severity,
}

#[derive(Default)]
struct SummaryState {
    current: Option<DocSummary>,
    results: Vec<DocSummary>,
}

/// A recorder that collects one status line per document for a final
/// summary table.
#[derive(Default)]
pub struct SummaryWriter {
    state: Arc<Mutex<SummaryState>>,
}

impl SummaryWriter {
    /// Create a summary writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the collected summary to `out`, one aligned row per document.
    pub fn summarize(&self, out: &mut dyn Write) {
        let state = lock(&self.state);

        let name_for = |status: Severity| match status {
            Severity::Error | Severity::Fatal => "FAILED",
            Severity::Skip => "SKIPPED",
            _ => "PASSED",
        };

        let width = state
            .results
            .iter()
            .map(|r| r.doc.len())
            .max()
            .unwrap_or(0);

        let _ = writeln!(out);
        for row in &state.results {
            let _ = writeln!(out, "{:<width$}    {}", row.doc, name_for(row.status));
        }
    }
}

impl Recorder for SummaryWriter {
    fn should_continue(&self) -> bool {
        true
    }

    fn failed(&self) -> bool {
        false
    }

    fn new_document(&self, desc: &str) -> Closer {
        lock(&self.state).current = Some(DocSummary {
            doc: desc.to_string(),
            status: Severity::None,
        });

        let state = Arc::clone(&self.state);
        Closer::new(move || {
            let mut state = lock(&state);
            if let Some(current) = state.current.take() {
                state.results.push(current);
            }
        })
    }

    fn new_step(&self, _desc: &str) -> Closer {
        Closer::noop()
    }

    fn update(&self, results: &[CheckResult]) {
        let mut state = lock(&self.state);

        for result in results {
            if let Severity::Fatal | Severity::Error | Severity::Skip = result.severity {
                if let Some(current) = state.current.as_mut() {
                    current.status = result.severity;
                }
            }
        }
    }
}
