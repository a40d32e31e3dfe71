//! TAP (Test Anything Protocol) output
//!
//! See <https://testanything.org/tap-version-13-specification.html>.

use std::sync::{Arc, Mutex};

use super::{lock, CheckResult, Closer, Recorder, Severity};

#[derive(Default)]
struct TapState {
    doc_count: usize,
    step_count: usize,
    step_errors: Vec<CheckResult>,
    step_skips: Vec<CheckResult>,
}

fn indentf(indent: &str, message: &str) {
    for line in message.split('\n') {
        println!("{indent}{line}");
    }
}

/// A recorder that writes test records in TAP format.
#[derive(Default)]
pub struct TapWriter {
    state: Arc<Mutex<TapState>>,
}

impl TapWriter {
    /// Create a TAP writer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Recorder for TapWriter {
    fn should_continue(&self) -> bool {
        true
    }

    fn failed(&self) -> bool {
        false
    }

    fn new_document(&self, _desc: &str) -> Closer {
        {
            let mut state = lock(&self.state);

            // TAP has no notion of suites; separate documents visually.
            if state.doc_count == 0 {
                println!("TAP version 13");
            } else {
                println!("\nTAP version 13");
            }

            state.doc_count += 1;
            state.step_count = 0;
        }

        let state = Arc::clone(&self.state);
        Closer::new(move || {
            let state = lock(&state);
            // The plan line is a closed interval.
            println!("1..{}", state.step_count);
        })
    }

    fn new_step(&self, desc: &str) -> Closer {
        let step_num = {
            let mut state = lock(&self.state);
            state.step_count += 1;
            state.step_count
        };

        let desc = desc.to_string();
        let state = Arc::clone(&self.state);
        Closer::new(move || {
            let mut state = lock(&state);

            if !state.step_errors.is_empty() {
                println!("not ok {step_num} - {desc}");
            } else if !state.step_skips.is_empty() {
                println!("ok {step_num} - {desc} # skip");
            } else {
                println!("ok {step_num} - {desc}");
            }

            if !state.step_errors.is_empty() {
                let dump = serde_yaml::to_string(&state.step_errors)
                    .unwrap_or_else(|e| format!("failed to format results: {e}"));
                indentf("  ", "---");
                indentf("  ", dump.trim_end());
                indentf("  ", "...");
            }

            state.step_errors.clear();
            state.step_skips.clear();
        })
    }

    fn update(&self, results: &[CheckResult]) {
        let mut state = lock(&self.state);

        for result in results {
            match result.severity {
                Severity::None => indentf("# ", &result.message),
                Severity::Pass => {
                    indentf(&format!("# {} - ", result.severity), &result.message)
                }
                Severity::Skip => {
                    indentf(&format!("# {} - ", result.severity), &result.message);
                    state.step_skips.push(result.clone());
                }
                Severity::Error | Severity::Fatal => {
                    indentf(&format!("# {} - ", result.severity), &result.message);
                    state.step_errors.push(result.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_writer_is_not_authoritative() {
        let writer = TapWriter::new();
        assert!(writer.should_continue());
        assert!(!writer.failed());
    }

    #[test]
    fn test_step_buffers_reset_between_steps() {
        let writer = TapWriter::new();

        let doc = writer.new_document("doc");

        let step = writer.new_step("failing");
        writer.update(&[CheckResult::error("oops")]);
        step.close();
        assert!(lock(&writer.state).step_errors.is_empty());

        let step = writer.new_step("skipping");
        writer.update(&[CheckResult::skip("missing feature")]);
        step.close();
        assert!(lock(&writer.state).step_skips.is_empty());

        doc.close();
    }
}
