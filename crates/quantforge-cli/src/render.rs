//! Progress bars for engine invocations.

use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use quantforge::{ProgressEvent, ProgressReporter};
use tracing::debug;

const BAR_TEMPLATE: &str = "{prefix:>8} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})";

/// One bar per running task, keyed by its label.
pub struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl IndicatifReporter {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template(BAR_TEMPLATE)
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }

    #[cfg(test)]
    fn position(&self, label: &str) -> Option<(u64, Option<u64>)> {
        let bars = self.bars.lock().expect("progress lock poisoned");
        bars.get(label).map(|bar| (bar.position(), bar.length()))
    }
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for IndicatifReporter {
    fn on_progress(&self, event: &ProgressEvent) {
        let mut bars = self.bars.lock().expect("progress lock poisoned");
        let bar = bars.entry(event.label.clone()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(event.total));
            bar.set_style(Self::style());
            bar.set_prefix(event.label.clone());
            bar
        });
        if bar.length() != Some(event.total) {
            bar.set_length(event.total);
        }
        bar.set_position(event.current);
    }

    fn on_log(&self, label: &str, line: &str) {
        debug!("[{}] {}", label, line);
    }

    fn on_finish(&self, label: &str, success: bool) {
        let mut bars = self.bars.lock().expect("progress lock poisoned");
        if let Some(bar) = bars.remove(label) {
            if success {
                bar.finish();
            } else {
                bar.abandon_with_message("failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(label: &str, current: u64, total: u64) -> ProgressEvent {
        ProgressEvent {
            label: label.to_string(),
            current,
            total,
            advance: 0,
        }
    }

    #[test]
    fn test_bar_tracks_latest_event() {
        let reporter = IndicatifReporter::with_target(ProgressDrawTarget::hidden());
        reporter.on_progress(&event("Q4_0", 10, 291));
        reporter.on_progress(&event("Q4_0", 120, 291));
        assert_eq!(reporter.position("Q4_0"), Some((120, Some(291))));
    }

    #[test]
    fn test_tasks_get_separate_bars() {
        let reporter = IndicatifReporter::with_target(ProgressDrawTarget::hidden());
        reporter.on_progress(&event("imatrix", 3, 100));
        reporter.on_progress(&event("Q8_0", 1, 291));
        assert_eq!(reporter.position("imatrix"), Some((3, Some(100))));
        assert_eq!(reporter.position("Q8_0"), Some((1, Some(291))));
    }

    #[test]
    fn test_finish_releases_bar() {
        let reporter = IndicatifReporter::with_target(ProgressDrawTarget::hidden());
        reporter.on_progress(&event("Q8_0", 291, 291));
        reporter.on_finish("Q8_0", true);
        reporter.on_finish("never-started", false);
        assert_eq!(reporter.position("Q8_0"), None);
    }
}
