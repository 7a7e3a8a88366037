//! Disk-space admission control.
//!
//! Before any conversion or quantization starts, the planned outputs are
//! sized with the [`CompressionTable`] and compared against free space on the
//! output volume. When they do not fit the operator gets exactly one chance,
//! bounded by a deadline, to drop types.

mod disk;
mod prompt;

pub use disk::{DiskProbe, SysinfoDiskProbe};
pub use prompt::{PromptOutcome, RemediationPrompt, RemovalChoice};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::catalog::CompressionTable;
use crate::config::AdmissionConfig;
use crate::error::{QuantError, Result};
use crate::resolver::TypeSet;

/// Estimated output bytes per quantization type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeEstimate {
    /// Types with a known ratio, keyed by identifier.
    pub sized: BTreeMap<&'static str, u64>,
    /// Types whose size cannot be bounded (counted as zero).
    pub unsized_types: Vec<&'static str>,
}

impl SizeEstimate {
    pub fn compute(table: &CompressionTable, input_size: u64, types: &TypeSet) -> Self {
        let mut estimate = SizeEstimate::default();
        for quant in types.iter() {
            match table.estimate(input_size, *quant) {
                Some(bytes) => {
                    estimate.sized.insert(quant.name(), bytes);
                }
                None => estimate.unsized_types.push(quant.name()),
            }
        }
        estimate
    }

    pub fn total(&self) -> u64 {
        self.sized.values().sum()
    }

    /// Types the operator may drop, in the order of `types`.
    fn removal_choices(&self, types: &TypeSet) -> Vec<RemovalChoice> {
        types
            .iter()
            .filter_map(|q| {
                self.sized.get(q.name()).map(|bytes| RemovalChoice {
                    quant: q.name(),
                    estimated_bytes: *bytes,
                })
            })
            .collect()
    }
}

/// Admits a [`TypeSet`] against the free space of a target volume.
pub struct DiskSpaceAdmissionController {
    table: CompressionTable,
    disk: Arc<dyn DiskProbe>,
    prompt: Arc<dyn RemediationPrompt>,
    timeout: Duration,
}

impl DiskSpaceAdmissionController {
    pub fn new(
        table: CompressionTable,
        disk: Arc<dyn DiskProbe>,
        prompt: Arc<dyn RemediationPrompt>,
    ) -> Self {
        Self {
            table,
            disk,
            prompt,
            timeout: AdmissionConfig::REMEDIATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn table(&self) -> &CompressionTable {
        &self.table
    }

    /// Return `types` unchanged if it fits, otherwise a subset the operator chose.
    ///
    /// # Errors
    ///
    /// - [`QuantError::RemediationTimedOut`] if the operator did not answer in time.
    /// - [`QuantError::InsufficientDiskSpace`] if the remaining set still does not fit.
    pub async fn admit(
        &self,
        input_model_size: u64,
        types: TypeSet,
        target_volume: &Path,
    ) -> Result<TypeSet> {
        let estimate = SizeEstimate::compute(&self.table, input_model_size, &types);
        let free_space = self.disk.free_space(target_volume)?;
        let total = estimate.total();

        info!("Total free space: {:.2} GB", free_space as f64 * 1e-9);
        info!(
            "Total estimated size of quantized models: {:.2} GB",
            total as f64 * 1e-9
        );
        if !estimate.unsized_types.is_empty() {
            warn!(
                "No size estimate for {}; the total above is a lower bound",
                estimate.unsized_types.join(", ")
            );
        }

        if total <= free_space {
            return Ok(types);
        }

        warn!("Not enough free space on disk for all selected quants.");
        let choices = estimate.removal_choices(&types);

        // The deadline holds even for prompts that answer late.
        let answer = tokio::time::timeout(
            self.timeout,
            self.prompt.prompt_with_deadline(&choices, self.timeout),
        )
        .await
        .unwrap_or(PromptOutcome::TimedOut);

        let selection = match answer {
            PromptOutcome::Selected(selection) => selection,
            PromptOutcome::TimedOut => {
                warn!("No user input received within {:?}.", self.timeout);
                return Err(QuantError::RemediationTimedOut(self.timeout));
            }
        };

        let mut remaining = types;
        for name in &selection {
            let name = name.trim().to_uppercase();
            if !choices.iter().any(|c| c.quant == name) || !remaining.remove(&name) {
                warn!("Ignoring removal of {}: not a removable planned type", name);
            }
        }

        let remaining_total = SizeEstimate::compute(&self.table, input_model_size, &remaining).total();
        if remaining_total > free_space {
            warn!("Still not enough free space on disk. Please free up some space and try again.");
            return Err(QuantError::InsufficientDiskSpace {
                required: remaining_total,
                available: free_space,
            });
        }

        info!(
            "Proceeding with {} type(s), {:.2} GB estimated",
            remaining.len(),
            remaining_total as f64 * 1e-9
        );
        Ok(remaining)
    }
}
