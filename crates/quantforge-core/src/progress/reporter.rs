//! Consumers of tracker events.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::parser::ProgressEvent;

/// Receives progress and log records from engine invocations.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);

    fn on_log(&self, label: &str, line: &str);

    /// Called once per invocation after the process exits.
    fn on_finish(&self, label: &str, success: bool);
}

/// Logs progress through `tracing`, one line per 10% step.
pub struct TracingReporter {
    state: Mutex<HashMap<String, ProgressEvent>>,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Latest event seen for `label`.
    pub fn get(&self, label: &str) -> Option<ProgressEvent> {
        let state = self.state.lock().expect("progress lock poisoned");
        state.get(label).cloned()
    }
}

impl Default for TracingReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn decile(current: u64, total: u64) -> u64 {
    if total == 0 {
        return 10;
    }
    current.saturating_mul(10) / total
}

impl ProgressReporter for TracingReporter {
    fn on_progress(&self, event: &ProgressEvent) {
        let mut state = self.state.lock().expect("progress lock poisoned");
        let previous = state
            .insert(event.label.clone(), event.clone())
            .map(|p| decile(p.current, p.total));

        if previous != Some(decile(event.current, event.total)) {
            info!(
                "[{}] {}/{} ({}%)",
                event.label,
                event.current,
                event.total,
                decile(event.current, event.total) * 10
            );
        }
    }

    fn on_log(&self, label: &str, line: &str) {
        debug!("[{}] {}", label, line);
    }

    fn on_finish(&self, label: &str, success: bool) {
        let mut state = self.state.lock().expect("progress lock poisoned");
        state.remove(label);
        if success {
            debug!("[{}] finished", label);
        } else {
            warn!("[{}] failed", label);
        }
    }
}
