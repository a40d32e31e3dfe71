//! Recorder composition

use std::sync::Arc;

use super::{CheckResult, Closer, Recorder};

/// Stack two recorders. For each method, `top` is invoked first, then
/// `next`; `should_continue` is the conjunction and `failed` the
/// disjunction of the two; closers are composed in the same order.
pub fn stack(top: Arc<dyn Recorder>, next: Arc<dyn Recorder>) -> Arc<dyn Recorder> {
    Arc::new(StackedRecorder { top, next })
}

struct StackedRecorder {
    top: Arc<dyn Recorder>,
    next: Arc<dyn Recorder>,
}

impl Recorder for StackedRecorder {
    fn should_continue(&self) -> bool {
        self.top.should_continue() && self.next.should_continue()
    }

    fn failed(&self) -> bool {
        self.top.failed() || self.next.failed()
    }

    fn new_document(&self, desc: &str) -> Closer {
        let top = self.top.new_document(desc);
        let next = self.next.new_document(desc);

        Closer::new(move || {
            top.close();
            next.close();
        })
    }

    fn new_step(&self, desc: &str) -> Closer {
        let top = self.top.new_step(desc);
        let next = self.next.new_step(desc);

        Closer::new(move || {
            top.close();
            next.close();
        })
    }

    fn update(&self, results: &[CheckResult]) {
        self.top.update(results);
        self.next.update(results);
    }
}
