//! Operator prompt used when the planned outputs do not fit on disk.

use std::time::Duration;

use async_trait::async_trait;

/// One type the operator may drop, with its estimated size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalChoice {
    pub quant: &'static str,
    pub estimated_bytes: u64,
}

impl RemovalChoice {
    /// Label shown to the operator, e.g. `Q8_0 (5.42 GB)`.
    pub fn label(&self) -> String {
        format!("{} ({:.2} GB)", self.quant, self.estimated_bytes as f64 / 1e9)
    }
}

/// Result of a deadline-bounded prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// Identifiers the operator chose to drop (possibly empty).
    Selected(Vec<String>),
    /// The deadline passed without an answer.
    TimedOut,
}

/// Asks the operator which quantization types to drop.
///
/// Implementations must return [`PromptOutcome::TimedOut`] once `deadline`
/// elapses; any work still waiting on input is abandoned, not awaited.
#[async_trait]
pub trait RemediationPrompt: Send + Sync {
    async fn prompt_with_deadline(
        &self,
        choices: &[RemovalChoice],
        deadline: Duration,
    ) -> PromptOutcome;
}
