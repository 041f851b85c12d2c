//! Stop rules for the auto-fix loop.

use super::task::{IterationRun, StopReason};

/// Rule A: a pass that proposes no edits ends the loop without running
/// anything. It stops as `NoEdits` when the last run failed and as
/// `NothingToDo` when it was clean.
pub fn check_edits(edit_count: usize, previous: &IterationRun) -> Option<StopReason> {
    if edit_count > 0 {
        return None;
    }
    if previous.is_error() {
        Some(StopReason::NoEdits)
    } else {
        Some(StopReason::NothingToDo)
    }
}

/// Tracks run signatures across passes.
///
/// Rule B: once the same normalized error has come back `threshold` times in
/// a row, the loop stops. With the default threshold of 1 the loop stops at
/// the second consecutive occurrence.
#[derive(Debug, Clone)]
pub struct Critic {
    threshold: u32,
    last: Option<String>,
    repeats: u32,
}

impl Critic {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            last: None,
            repeats: 0,
        }
    }

    /// Record the run of a finished pass and decide whether to stop.
    pub fn observe(&mut self, run: &IterationRun) -> Option<StopReason> {
        let Some(signature) = run.signature.clone() else {
            self.last = None;
            self.repeats = 0;
            return Some(StopReason::Clean);
        };

        if self.last.as_deref() == Some(signature.as_str()) {
            self.repeats += 1;
        } else {
            self.repeats = 0;
            self.last = Some(signature.clone());
        }

        if self.repeats >= self.threshold {
            Some(StopReason::RepeatedError { signature })
        } else {
            None
        }
    }
}
