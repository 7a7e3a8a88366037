//! Builder wiring a [`QuantizationPipeline`] from a run configuration.

use std::sync::Arc;

use crate::admission::{DiskProbe, DiskSpaceAdmissionController, RemediationPrompt, SysinfoDiskProbe};
use crate::cancel::CancellationToken;
use crate::catalog::CompressionTable;
use crate::config::GgufConfig;
use crate::engine::{EngineRunner, LlamaCppEngine, ProcessRunner};
use crate::error::Result;
use crate::gpu::{detect_gpu_probe, GpuProbe};
use crate::pipeline::QuantizationPipeline;
use crate::progress::{ProgressReporter, TracingReporter};
use crate::registry::{HuggingFaceRegistry, ModelRegistry};

/// Builder for a production [`QuantizationPipeline`].
///
/// Every collaborator defaults to the real implementation; override any of
/// them to run against fakes.
///
/// # Example
///
/// ```rust,ignore
/// use quantforge::{ConfigFile, PipelineBuilder, QuantizationJob};
///
/// let config = ConfigFile::load("quant.json".as_ref())?.gguf;
/// let pipeline = PipelineBuilder::new(&config, prompt).build()?;
/// let summary = pipeline.run(&QuantizationJob::from_config(&config)).await?;
/// ```
pub struct PipelineBuilder {
    engine: LlamaCppEngine,
    prompt: Arc<dyn RemediationPrompt>,
    remediation_timeout: std::time::Duration,
    table: CompressionTable,
    reporter: Option<Arc<dyn ProgressReporter>>,
    runner: Option<Arc<dyn EngineRunner>>,
    disk: Option<Arc<dyn DiskProbe>>,
    gpu: Option<Arc<dyn GpuProbe>>,
    registry: Option<Arc<dyn ModelRegistry>>,
    cancel: CancellationToken,
}

impl PipelineBuilder {
    pub fn new(config: &GgufConfig, prompt: Arc<dyn RemediationPrompt>) -> Self {
        Self {
            engine: LlamaCppEngine::from_config(config),
            prompt,
            remediation_timeout: config.remediation_timeout(),
            table: CompressionTable::default(),
            reporter: None,
            runner: None,
            disk: None,
            gpu: None,
            registry: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn compression_table(mut self, table: CompressionTable) -> Self {
        self.table = table;
        self
    }

    /// Where progress goes when the default process runner is used.
    pub fn reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn EngineRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn disk_probe(mut self, disk: Arc<dyn DiskProbe>) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn gpu_probe(mut self, gpu: Arc<dyn GpuProbe>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<QuantizationPipeline> {
        let runner: Arc<dyn EngineRunner> = match self.runner {
            Some(runner) => runner,
            None => {
                let reporter: Arc<dyn ProgressReporter> = match self.reporter {
                    Some(reporter) => reporter,
                    None => Arc::new(TracingReporter::new()),
                };
                Arc::new(ProcessRunner::new(reporter, self.cancel.clone()))
            }
        };
        let disk: Arc<dyn DiskProbe> = match self.disk {
            Some(disk) => disk,
            None => Arc::new(SysinfoDiskProbe::new()),
        };
        let gpu: Arc<dyn GpuProbe> = match self.gpu {
            Some(gpu) => gpu,
            None => Arc::from(detect_gpu_probe()),
        };
        let registry: Arc<dyn ModelRegistry> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(HuggingFaceRegistry::new()?),
        };

        let admission = DiskSpaceAdmissionController::new(self.table, disk, self.prompt)
            .with_timeout(self.remediation_timeout);

        Ok(
            QuantizationPipeline::new(self.engine, runner, admission, gpu, registry)
                .with_cancellation(self.cancel),
        )
    }
}
