//! Structured test reporting
//!
//! A [`Recorder`] is a hierarchical result sink: documents contain steps,
//! steps contain results. Multiple recorders can be stacked so that one
//! keeps authoritative state while others stream output to the terminal.

mod stack;
mod summary;
mod tap;
mod tree;

pub use stack::stack;
pub use summary::SummaryWriter;
pub use tap::TapWriter;
pub use tree::TreeWriter;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seriousness of a single check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Informational only.
    None,
    /// The check cannot apply in this cluster; stop the document.
    Skip,
    /// A failure that does not stop the document.
    Error,
    /// A failure that stops the document.
    Fatal,
    /// An explicit success.
    Pass,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::None => "None",
            Severity::Skip => "Skip",
            Severity::Error => "Error",
            Severity::Fatal => "Fatal",
            Severity::Pass => "Pass",
        };
        write!(f, "{name}")
    }
}

impl Severity {
    /// Parse a severity name as written in policy result mappings.
    pub fn parse(name: &str) -> Option<Severity> {
        match name {
            "Pass" => Some(Severity::Pass),
            "Error" => Some(Severity::Error),
            "Fatal" => Some(Severity::Fatal),
            "Skip" => Some(Severity::Skip),
            _ => None,
        }
    }
}

/// A single result posted to the current step.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// How serious this result is.
    pub severity: Severity,
    /// Human-readable message; may be empty or span multiple lines.
    pub message: String,
    /// When the result was produced.
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    /// Build a result with the given severity and message.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        CheckResult {
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// An informational result.
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::None, message)
    }

    /// An error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    /// A fatal result.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, message)
    }

    /// A skip result.
    pub fn skip(message: impl Into<String>) -> Self {
        Self::new(Severity::Skip, message)
    }

    /// True if this result should end the document.
    pub fn is_terminal(&self) -> bool {
        matches!(self.severity, Severity::Fatal | Severity::Skip)
    }

    /// True if this result is a test failure.
    pub fn is_failed(&self) -> bool {
        matches!(self.severity, Severity::Fatal | Severity::Error)
    }
}

/// True if any result in the slice has the wanted severity.
pub fn contains_severity(results: &[CheckResult], wanted: Severity) -> bool {
    results.iter().any(|r| r.severity == wanted)
}

/// Closes an implicitly opened document or step.
///
/// Closers must be invoked in reverse open order. Dropping a closer without
/// calling [`Closer::close`] closes it anyway, so early returns stay safe.
pub struct Closer(Option<Box<dyn FnOnce() + Send>>);

impl Closer {
    /// Wrap a close function.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Closer(Some(Box::new(f)))
    }

    /// A closer that does nothing.
    pub fn noop() -> Self {
        Closer(None)
    }

    /// Close now.
    pub fn close(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Closer {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// An object that records structured test information.
pub trait Recorder: Send + Sync {
    /// Whether a test harness should keep running tests. Returns false
    /// once a terminal (Fatal or Skip) result has been posted for the
    /// current document.
    fn should_continue(&self) -> bool;

    /// True if any failing results have been recorded.
    fn failed(&self) -> bool;

    /// Open a new test document. Close it with the returned closer.
    fn new_document(&self, desc: &str) -> Closer;

    /// Open a new step in the current document.
    fn new_step(&self, desc: &str) -> Closer;

    /// Post results to the current step.
    fn update(&self, results: &[CheckResult]);
}

/// A recorded step and its results.
#[derive(Debug, Clone, Default)]
pub struct StepRecord {
    /// The step description.
    pub description: String,
    /// Results posted while the step was open.
    pub results: Vec<CheckResult>,
}

/// A recorded document and its steps.
#[derive(Debug, Clone, Default)]
pub struct DocumentRecord {
    /// The document description.
    pub description: String,
    /// The steps in open order.
    pub steps: Vec<StepRecord>,
}

impl DocumentRecord {
    fn any_result(&self, pred: impl Fn(&CheckResult) -> bool) -> bool {
        self.steps
            .iter()
            .any(|s| s.results.iter().any(|r| pred(r)))
    }
}

/// Lock a recorder mutex, recovering from poisoning.
///
/// Misuse panics can unwind while a recorder lock is held; later closers
/// still need to run during that unwind.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct RecorderState {
    docs: Vec<DocumentRecord>,
    current_doc: Option<usize>,
    current_step: Option<usize>,
}

/// The authoritative recorder: keeps every document, step, and result in
/// memory and answers [`Recorder::should_continue`] and
/// [`Recorder::failed`] from that state.
#[derive(Default)]
pub struct StateRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl StateRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the recorded documents.
    pub fn documents(&self) -> Vec<DocumentRecord> {
        lock(&self.state).docs.clone()
    }
}

impl Recorder for StateRecorder {
    fn should_continue(&self) -> bool {
        let state = lock(&self.state);

        // Context-dependent: inside a document this asks whether to keep
        // going on the document, otherwise whether to keep going at all.
        let terminal = match state.current_doc {
            Some(i) => state.docs[i].any_result(CheckResult::is_terminal),
            None => state
                .docs
                .iter()
                .any(|d| d.any_result(CheckResult::is_terminal)),
        };

        !terminal
    }

    fn failed(&self) -> bool {
        let state = lock(&self.state);
        state.docs.iter().any(|d| d.any_result(CheckResult::is_failed))
    }

    fn new_document(&self, desc: &str) -> Closer {
        let index = {
            let mut state = lock(&self.state);
            if state.current_step.is_some() {
                panic!("recorder misuse: can't create a new document with an open step");
            }

            state.docs.push(DocumentRecord {
                description: desc.to_string(),
                steps: Vec::new(),
            });

            let index = state.docs.len() - 1;
            state.current_doc = Some(index);
            index
        };

        let state = Arc::clone(&self.state);
        Closer::new(move || {
            let mut state = lock(&state);
            if state.current_doc != Some(index) {
                panic!("recorder misuse: overlapping documents");
            }
            if state.current_step.is_some() {
                panic!("recorder misuse: closing a document with an open step");
            }
            state.current_doc = None;
        })
    }

    fn new_step(&self, desc: &str) -> Closer {
        let index = {
            let mut state = lock(&self.state);
            let doc = match state.current_doc {
                Some(i) => i,
                None => panic!("recorder misuse: no open document"),
            };

            state.docs[doc].steps.push(StepRecord {
                description: desc.to_string(),
                results: Vec::new(),
            });

            let index = state.docs[doc].steps.len() - 1;
            state.current_step = Some(index);
            index
        };

        let state = Arc::clone(&self.state);
        Closer::new(move || {
            let mut state = lock(&state);
            if state.current_step != Some(index) {
                panic!("recorder misuse: overlapping steps");
            }
            state.current_step = None;
        })
    }

    fn update(&self, results: &[CheckResult]) {
        let mut state = lock(&self.state);
        let doc = match state.current_doc {
            Some(i) => i,
            None => panic!("recorder misuse: no open document"),
        };
        let step = match state.current_step {
            Some(i) => i,
            None => panic!("recorder misuse: no open step"),
        };

        state.docs[doc].steps[step].results.extend_from_slice(results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("Pass"), Some(Severity::Pass));
        assert_eq!(Severity::parse("Fatal"), Some(Severity::Fatal));
        assert_eq!(Severity::parse("bogus"), None);
    }

    #[test]
    fn test_result_classification() {
        assert!(CheckResult::fatal("boom").is_terminal());
        assert!(CheckResult::skip("later").is_terminal());
        assert!(!CheckResult::error("oops").is_terminal());

        assert!(CheckResult::fatal("boom").is_failed());
        assert!(CheckResult::error("oops").is_failed());
        assert!(!CheckResult::skip("later").is_failed());
        assert!(!CheckResult::info("hello").is_failed());
    }

    #[test]
    fn test_recorder_tracks_results() {
        let recorder = StateRecorder::new();

        let doc = recorder.new_document("doc");
        let step = recorder.new_step("step one");
        recorder.update(&[CheckResult::info("hello")]);
        assert!(recorder.should_continue());
        assert!(!recorder.failed());
        step.close();

        let step = recorder.new_step("step two");
        recorder.update(&[CheckResult::error("oops")]);
        step.close();
        doc.close();

        assert!(recorder.failed());
        // Errors are not terminal, so the harness keeps going.
        assert!(recorder.should_continue());

        let docs = recorder.documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].steps.len(), 2);
        assert_eq!(docs[0].steps[0].description, "step one");
        assert_eq!(docs[0].steps[1].results.len(), 1);
    }

    #[test]
    fn test_fatal_stops_the_document() {
        let recorder = StateRecorder::new();

        let doc = recorder.new_document("doc");
        let step = recorder.new_step("step");
        recorder.update(&[CheckResult::fatal("boom")]);
        step.close();

        assert!(!recorder.should_continue());
        doc.close();
    }

    /// Story: a skipped document does not block later documents
    ///
    /// Skip is terminal for the current document only. After the document
    /// closes, the harness moves on; the overall run is not failed.
    #[test]
    fn story_skip_is_scoped_to_its_document() {
        let recorder = StateRecorder::new();

        let doc = recorder.new_document("doc");
        let step = recorder.new_step("step");
        recorder.update(&[CheckResult::skip("missing feature")]);
        assert!(!recorder.should_continue());
        step.close();
        doc.close();

        assert!(!recorder.failed());
    }

    #[test]
    #[should_panic(expected = "no open document")]
    fn test_step_requires_document() {
        let recorder = StateRecorder::new();
        let _ = recorder.new_step("step");
    }

    #[test]
    #[should_panic(expected = "open step")]
    fn test_document_close_requires_closed_steps() {
        let recorder = StateRecorder::new();
        let doc = recorder.new_document("doc");
        let step = recorder.new_step("step");
        doc.close();
        drop(step);
    }

    #[test]
    fn test_closer_runs_on_drop() {
        let recorder = StateRecorder::new();
        {
            let _doc = recorder.new_document("doc");
            let _step = recorder.new_step("step");
            // Dropped in reverse declaration order: step, then doc.
        }
        // Both closed; a new document can open.
        let doc = recorder.new_document("next");
        doc.close();
    }
}
