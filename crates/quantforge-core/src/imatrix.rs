//! Importance-matrix generation with GPU offload backoff.
//!
//! A precomputed `.dat` matrix is used as-is. A `.txt` calibration text is fed
//! to `llama-imatrix`; on the GPU path the number of offloaded layers starts at
//! an estimate derived from free VRAM and drops by one after each failed
//! attempt, down to and including zero.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::engine::{EngineRunner, LlamaCppEngine};
use crate::error::{QuantError, Result};
use crate::gpu::GpuProbe;
use crate::progress::ParserConfig;

/// Calibration input, classified by extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationInput {
    /// An importance matrix computed earlier (`.dat`).
    Precomputed(PathBuf),
    /// Calibration text to compute a matrix from (`.txt`).
    Raw(PathBuf),
}

impl CalibrationInput {
    pub fn classify(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("dat") => Ok(Self::Precomputed(path.to_path_buf())),
            Some("txt") => Ok(Self::Raw(path.to_path_buf())),
            _ => Err(QuantError::UnsupportedCalibration {
                path: path.to_path_buf(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Precomputed(path) | Self::Raw(path) => path,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}

/// An importance matrix and how it came to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImatrixArtifact {
    pub path: PathBuf,
    pub source_calibration: PathBuf,
    /// Layers offloaded on the successful attempt, `None` for CPU or precomputed.
    pub gpu_layers_used: Option<u32>,
    /// Engine invocations made, zero for a precomputed matrix.
    pub attempts: u32,
    /// Whether this run produced the file.
    pub computed: bool,
}

impl ImatrixArtifact {
    fn precomputed(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            source_calibration: path.to_path_buf(),
            gpu_layers_used: None,
            attempts: 0,
            computed: false,
        }
    }

    /// Only matrices computed by this run are ever deleted.
    pub fn should_delete(&self, delete_imatrix: bool) -> bool {
        delete_imatrix && self.computed
    }
}

/// Number of layers to try offloading first.
///
/// Each layer is assumed to take an equal share of the model size plus a
/// fixed margin; the result is capped at the layer count.
pub fn initial_gpu_layers(free_vram: u64, model_size: u64, layers: u32) -> u32 {
    if layers == 0 {
        return 0;
    }
    let per_layer = (model_size + EngineConfig::GPU_MODEL_MARGIN_BYTES) as f64 / layers as f64;
    let fitting = (free_vram as f64 / per_layer).floor();
    fitting.clamp(0.0, layers as f64) as u32
}

/// Produces [`ImatrixArtifact`]s through an [`EngineRunner`].
pub struct ImatrixGenerator {
    engine: LlamaCppEngine,
    runner: Arc<dyn EngineRunner>,
    gpu: Arc<dyn GpuProbe>,
}

impl ImatrixGenerator {
    pub fn new(engine: LlamaCppEngine, runner: Arc<dyn EngineRunner>, gpu: Arc<dyn GpuProbe>) -> Self {
        Self { engine, runner, gpu }
    }

    pub async fn generate(
        &self,
        input_model: &Path,
        calibration: &CalibrationInput,
        output_path: &Path,
        use_gpu: bool,
    ) -> Result<ImatrixArtifact> {
        let text = match calibration {
            CalibrationInput::Precomputed(path) => {
                info!("Using precomputed importance matrix {}", path.display());
                return Ok(ImatrixArtifact::precomputed(path));
            }
            CalibrationInput::Raw(path) => path,
        };

        if !text.is_file() {
            return Err(QuantError::Config {
                message: format!("calibration file {} does not exist", text.display()),
            });
        }
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| QuantError::io("creating imatrix output directory", parent, e))?;
        }

        info!("Processing imatrix file. This will take a while.");
        let candidate = if use_gpu {
            self.gpu_candidate(input_model).await?
        } else {
            None
        };

        match candidate {
            Some(layers) => self.generate_with_backoff(input_model, text, output_path, layers).await,
            None => {
                let command = self.engine.imatrix_command(input_model, text, output_path, None);
                self.runner.run(&command, ParserConfig::imatrix("imatrix")).await?;
                Ok(ImatrixArtifact {
                    path: output_path.to_path_buf(),
                    source_calibration: text.clone(),
                    gpu_layers_used: None,
                    attempts: 1,
                    computed: true,
                })
            }
        }
    }

    /// Initial offload estimate, or `None` to fall back to the CPU path.
    async fn gpu_candidate(&self, input_model: &Path) -> Result<Option<u32>> {
        if !self.gpu.is_available() {
            warn!("GPU offload requested but no GPU was detected; computing on CPU");
            return Ok(None);
        }
        let Some(free_vram) = self.gpu.free_memory()? else {
            warn!("Could not read free GPU memory; computing on CPU");
            return Ok(None);
        };

        let model_size = std::fs::metadata(input_model)
            .map_err(|e| QuantError::io("reading model size", input_model, e))?
            .len();

        let probe = self.engine.probe_command(input_model);
        let layers = match self.runner.probe_layer_count(&probe).await? {
            Some(layers) if layers > 0 => layers,
            _ => {
                warn!("Could not determine layer count of {}; computing on CPU", input_model.display());
                return Ok(None);
            }
        };

        let candidate = initial_gpu_layers(free_vram, model_size, layers);
        info!(
            "{} layers, {:.2} GB free VRAM: starting with {} layers on the GPU",
            layers,
            free_vram as f64 * 1e-9,
            candidate
        );
        Ok(Some(candidate))
    }

    async fn generate_with_backoff(
        &self,
        input_model: &Path,
        text: &Path,
        output_path: &Path,
        start: u32,
    ) -> Result<ImatrixArtifact> {
        let mut layers = start;
        let mut attempts = 0;

        loop {
            attempts += 1;
            info!("Using {} layers on the GPU.", layers);
            let command = self.engine.imatrix_command(input_model, text, output_path, Some(layers));

            match self.runner.run(&command, ParserConfig::imatrix("imatrix")).await {
                Ok(()) => {
                    return Ok(ImatrixArtifact {
                        path: output_path.to_path_buf(),
                        source_calibration: text.to_path_buf(),
                        gpu_layers_used: Some(layers),
                        attempts,
                        computed: true,
                    });
                }
                Err(e @ QuantError::ProcessFailure { .. }) if layers > 0 => {
                    warn!("imatrix failed with {} GPU layers ({}); retrying with {}", layers, e, layers - 1);
                    layers -= 1;
                }
                Err(e) => {
                    error!("imatrix creation failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineCommand;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const GIB: u64 = 1024 * 1024 * 1024;

    struct FixedGpu(Option<u64>);

    impl GpuProbe for FixedGpu {
        fn is_available(&self) -> bool {
            self.0.is_some()
        }

        fn free_memory(&self) -> Result<Option<u64>> {
            Ok(self.0)
        }
    }

    /// Fails every imatrix run offloading more than `max_layers`.
    struct OffloadLimitRunner {
        layers: Option<u32>,
        max_layers: Option<u32>,
        runs: Mutex<Vec<EngineCommand>>,
    }

    impl OffloadLimitRunner {
        fn new(layers: Option<u32>, max_layers: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                layers,
                max_layers,
                runs: Mutex::new(Vec::new()),
            })
        }

        fn offloads(&self) -> Vec<Option<u32>> {
            self.runs
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.arg_value("-ngl").map(|v| v.to_string_lossy().parse().unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl EngineRunner for OffloadLimitRunner {
        async fn run(&self, command: &EngineCommand, _parser: ParserConfig) -> Result<()> {
            self.runs.lock().unwrap().push(command.clone());
            let requested: u32 = command
                .arg_value("-ngl")
                .map(|v| v.to_string_lossy().parse().unwrap())
                .unwrap_or(0);
            match self.max_layers {
                Some(max) if requested <= max => Ok(()),
                _ => Err(QuantError::ProcessFailure {
                    program: "llama-imatrix".into(),
                    status: Some(1),
                }),
            }
        }

        async fn probe_layer_count(&self, _command: &EngineCommand) -> Result<Option<u32>> {
            Ok(self.layers)
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        model: PathBuf,
        calibration: CalibrationInput,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"GGUF").unwrap();
        let text = dir.path().join("calibration.txt");
        std::fs::write(&text, "some calibration text").unwrap();
        let output = dir.path().join("artifacts").join("imatrix-test.dat");
        Fixture {
            dir,
            model,
            calibration: CalibrationInput::Raw(text),
            output,
        }
    }

    fn generator(runner: Arc<OffloadLimitRunner>, free_vram: Option<u64>) -> ImatrixGenerator {
        ImatrixGenerator::new(
            LlamaCppEngine::new("/opt/llama.cpp"),
            runner,
            Arc::new(FixedGpu(free_vram)),
        )
    }

    #[test]
    fn test_classify_calibration() {
        assert!(matches!(
            CalibrationInput::classify(Path::new("a/imatrix.dat")).unwrap(),
            CalibrationInput::Precomputed(_)
        ));
        assert!(CalibrationInput::classify(Path::new("wiki.txt")).unwrap().is_raw());
        let err = CalibrationInput::classify(Path::new("wiki.csv")).unwrap_err();
        assert!(matches!(err, QuantError::UnsupportedCalibration { .. }));
        assert!(err.is_fatal_config());
    }

    #[test]
    fn test_initial_gpu_layers() {
        // (15 GiB + 1 GiB) / 32 layers = 0.5 GiB per layer.
        assert_eq!(initial_gpu_layers(8 * GIB, 15 * GIB, 32), 16);
        assert_eq!(initial_gpu_layers(64 * GIB, 15 * GIB, 32), 32);
        assert_eq!(initial_gpu_layers(0, 15 * GIB, 32), 0);
        assert_eq!(initial_gpu_layers(8 * GIB, 15 * GIB, 0), 0);
    }

    #[tokio::test]
    async fn test_precomputed_matrix_passes_through() {
        let runner = OffloadLimitRunner::new(Some(32), Some(32));
        let gen = generator(runner.clone(), Some(64 * GIB));
        let dat = CalibrationInput::Precomputed(PathBuf::from("prior/imatrix.dat"));

        let artifact = gen
            .generate(Path::new("model.gguf"), &dat, Path::new("unused.dat"), true)
            .await
            .unwrap();

        assert_eq!(artifact.path, PathBuf::from("prior/imatrix.dat"));
        assert!(!artifact.computed);
        assert!(!artifact.should_delete(true));
        assert!(runner.offloads().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_stops_at_first_success() {
        let fx = fixture();
        let runner = OffloadLimitRunner::new(Some(32), Some(30));
        let gen = generator(runner.clone(), Some(64 * GIB));

        let artifact = gen
            .generate(&fx.model, &fx.calibration, &fx.output, true)
            .await
            .unwrap();

        assert_eq!(runner.offloads(), vec![Some(32), Some(31), Some(30)]);
        assert_eq!(artifact.attempts, 3);
        assert_eq!(artifact.gpu_layers_used, Some(30));
        assert!(artifact.computed);
        assert!(fx.output.parent().unwrap().is_dir());
        drop(fx.dir);
    }

    #[tokio::test]
    async fn test_backoff_is_bounded_by_layer_count() {
        let fx = fixture();
        let runner = OffloadLimitRunner::new(Some(4), None);
        let gen = generator(runner.clone(), Some(64 * GIB));

        let err = gen
            .generate(&fx.model, &fx.calibration, &fx.output, true)
            .await
            .unwrap_err();

        assert!(matches!(err, QuantError::ProcessFailure { .. }));
        assert_eq!(
            runner.offloads(),
            vec![Some(4), Some(3), Some(2), Some(1), Some(0)]
        );
    }

    #[tokio::test]
    async fn test_cpu_path_when_gpu_not_requested() {
        let fx = fixture();
        let runner = OffloadLimitRunner::new(Some(32), Some(0));
        let gen = generator(runner.clone(), Some(64 * GIB));

        let artifact = gen
            .generate(&fx.model, &fx.calibration, &fx.output, false)
            .await
            .unwrap();

        assert_eq!(runner.offloads(), vec![None]);
        assert_eq!(artifact.gpu_layers_used, None);
        assert_eq!(artifact.attempts, 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_cpu_without_gpu() {
        let fx = fixture();
        let runner = OffloadLimitRunner::new(Some(32), Some(0));
        let gen = generator(runner.clone(), None);

        gen.generate(&fx.model, &fx.calibration, &fx.output, true)
            .await
            .unwrap();
        assert_eq!(runner.offloads(), vec![None]);
    }

    #[tokio::test]
    async fn test_falls_back_to_cpu_without_layer_count() {
        let fx = fixture();
        let runner = OffloadLimitRunner::new(None, Some(0));
        let gen = generator(runner.clone(), Some(64 * GIB));

        gen.generate(&fx.model, &fx.calibration, &fx.output, true)
            .await
            .unwrap();
        assert_eq!(runner.offloads(), vec![None]);
    }

    #[tokio::test]
    async fn test_cpu_failure_is_fatal() {
        let fx = fixture();
        let runner = OffloadLimitRunner::new(Some(32), None);
        let gen = generator(runner.clone(), None);

        let err = gen
            .generate(&fx.model, &fx.calibration, &fx.output, false)
            .await
            .unwrap_err();
        assert!(matches!(err, QuantError::ProcessFailure { .. }));
        assert_eq!(runner.offloads().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_calibration_text() {
        let fx = fixture();
        let runner = OffloadLimitRunner::new(Some(32), Some(32));
        let gen = generator(runner, None);
        let missing = CalibrationInput::Raw(fx.dir.path().join("nope.txt"));

        let err = gen
            .generate(&fx.model, &missing, &fx.output, false)
            .await
            .unwrap_err();
        assert!(err.is_fatal_config());
    }
}
