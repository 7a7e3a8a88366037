//! Top-level quantization run.
//!
//! A run resolves and admits the requested types before doing any expensive
//! work, converts non-GGUF inputs, computes the importance matrix if asked to,
//! then quantizes each type in catalog order. Each output is written to a
//! `.part` file and renamed only after the engine exits successfully, so the
//! output directory never holds a truncated `.gguf`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::admission::DiskSpaceAdmissionController;
use crate::cancel::CancellationToken;
use crate::catalog::QuantType;
use crate::config::{EngineConfig, GgufConfig};
use crate::engine::{EngineRunner, LlamaCppEngine};
use crate::error::{QuantError, Result};
use crate::gpu::GpuProbe;
use crate::imatrix::{CalibrationInput, ImatrixArtifact, ImatrixGenerator};
use crate::progress::ParserConfig;
use crate::registry::{ModelRegistry, UploadReceipt, UploadTarget};
use crate::resolver::{resolve, FrozenTypeSet};

/// Where the input model comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A `.gguf` file the engine reads directly.
    GgufFile(PathBuf),
    /// A local Hugging Face model directory (has `config.json`).
    LocalDirectory(PathBuf),
    /// A registry repository id to download.
    Remote(String),
}

impl ModelSource {
    /// Classify `input`, checking local paths before treating it as a repo id.
    pub fn classify(input: &str) -> Result<Self> {
        let path = Path::new(input);
        if path.is_file() {
            if has_extension(path, "gguf") {
                return Ok(Self::GgufFile(path.to_path_buf()));
            }
            return Err(QuantError::InvalidModelPath {
                path: path.to_path_buf(),
                message: "expected a .gguf file".to_string(),
            });
        }
        if path.is_dir() {
            if path.join("config.json").is_file() {
                return Ok(Self::LocalDirectory(path.to_path_buf()));
            }
            return Err(QuantError::InvalidModelPath {
                path: path.to_path_buf(),
                message: "directory has no config.json".to_string(),
            });
        }
        Ok(Self::Remote(input.trim().to_string()))
    }

    pub fn needs_conversion(&self) -> bool {
        !matches!(self, Self::GgufFile(_))
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn sum_with_extension(dir: &Path, ext: &str) -> Result<Option<u64>> {
    let entries = std::fs::read_dir(dir).map_err(|e| QuantError::io("listing model directory", dir, e))?;
    let mut total = None;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && has_extension(&path, ext) {
            let len = std::fs::metadata(&path)
                .map_err(|e| QuantError::io("reading weight file size", &path, e))?
                .len();
            total = Some(total.unwrap_or(0) + len);
        }
    }
    Ok(total)
}

/// Size of the model weights in bytes.
///
/// A `.gguf` file counts as-is; a directory counts its `*.safetensors`, or
/// its `*.bin` files when there are no safetensors.
pub fn model_size(path: &Path) -> Result<u64> {
    if path.is_file() && has_extension(path, "gguf") {
        return Ok(std::fs::metadata(path)
            .map_err(|e| QuantError::io("reading model size", path, e))?
            .len());
    }
    if path.is_dir() {
        if let Some(size) = sum_with_extension(path, "safetensors")? {
            return Ok(size);
        }
        if let Some(size) = sum_with_extension(path, "bin")? {
            return Ok(size);
        }
        return Err(QuantError::InvalidModelPath {
            path: path.to_path_buf(),
            message: "no .safetensors or .bin weight files".to_string(),
        });
    }
    Err(QuantError::InvalidModelPath {
        path: path.to_path_buf(),
        message: "not a GGUF file or a directory containing Hugging Face model files".to_string(),
    })
}

/// Everything one run needs to know.
#[derive(Debug, Clone)]
pub struct QuantizationJob {
    pub input_model: String,
    pub output_directory: PathBuf,
    pub output_base_name: String,
    pub requested_types: Vec<String>,
    pub calibration: Option<PathBuf>,
    pub use_gpu: bool,
    /// Keep the converted intermediate GGUF.
    pub keep_intermediate: bool,
    pub delete_imatrix: bool,
    pub imatrix_output: PathBuf,
    pub download_dir: PathBuf,
    pub upload: Option<UploadTarget>,
}

impl QuantizationJob {
    pub fn from_config(config: &GgufConfig) -> Self {
        Self {
            input_model: config.input_model.clone(),
            output_directory: config.output_directory.clone(),
            output_base_name: config.output_base_name.clone(),
            requested_types: config.gguf_types.clone(),
            calibration: config.imatrix.clone(),
            use_gpu: config.imatrix_gpu,
            keep_intermediate: config.keep_gguf,
            delete_imatrix: config.delete_imatrix,
            imatrix_output: config.imatrix_output_path(),
            download_dir: config.resolved_download_dir(),
            upload: config.upload_to_hub.then(|| UploadTarget::from_config(config)),
        }
    }

    /// Final path of the output for `quant`.
    pub fn output_path(&self, quant: QuantType) -> PathBuf {
        self.output_directory
            .join(format!("{}.{}.gguf", self.output_base_name, quant.name()))
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Finished outputs in the order they were written.
    pub outputs: Vec<PathBuf>,
    pub imatrix: Option<ImatrixArtifact>,
    /// Converted intermediate, when kept.
    pub intermediate: Option<PathBuf>,
    pub upload: Option<UploadReceipt>,
}

/// Drives one [`QuantizationJob`] from input to published artifacts.
pub struct QuantizationPipeline {
    engine: LlamaCppEngine,
    runner: Arc<dyn EngineRunner>,
    admission: DiskSpaceAdmissionController,
    imatrix: ImatrixGenerator,
    registry: Arc<dyn ModelRegistry>,
    cancel: CancellationToken,
}

impl QuantizationPipeline {
    pub fn new(
        engine: LlamaCppEngine,
        runner: Arc<dyn EngineRunner>,
        admission: DiskSpaceAdmissionController,
        gpu: Arc<dyn GpuProbe>,
        registry: Arc<dyn ModelRegistry>,
    ) -> Self {
        let imatrix = ImatrixGenerator::new(engine.clone(), runner.clone(), gpu);
        Self {
            engine,
            runner,
            admission,
            imatrix,
            registry,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the caller.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, job: &QuantizationJob) -> Result<RunSummary> {
        let calibration = job
            .calibration
            .as_deref()
            .map(CalibrationInput::classify)
            .transpose()?;

        let source = ModelSource::classify(&job.input_model)?;
        let model_path = match &source {
            ModelSource::GgufFile(path) | ModelSource::LocalDirectory(path) => path.clone(),
            ModelSource::Remote(repo_id) => self.registry.download(repo_id, &job.download_dir).await?,
        };

        std::fs::create_dir_all(&job.output_directory)
            .map_err(|e| QuantError::io("creating output directory", &job.output_directory, e))?;

        let types = resolve(&job.requested_types, calibration.is_some())?;
        let size = model_size(&model_path)?;
        let frozen = self
            .admission
            .admit(size, types, &job.output_directory)
            .await?
            .freeze();

        if frozen.is_empty() {
            warn!("No quantization types left to process");
            return Ok(RunSummary::default());
        }
        ensure_imatrix_for_all(&frozen, calibration.is_some())?;
        info!("Quantizing to: {}", frozen.names().join(", "));

        self.cancel.check()?;
        let converted = if source.needs_conversion() {
            Some(self.convert(&model_path, &job.output_directory).await?)
        } else {
            None
        };
        let gguf_input = converted.as_deref().unwrap_or(&model_path);

        let produced = self
            .produce(job, &frozen, calibration.as_ref(), gguf_input)
            .await;
        let mut summary = match produced {
            Ok(summary) => summary,
            Err(e) => {
                // Failed runs leave no converted model behind for a later upload.
                if let Some(converted) = converted.as_deref().filter(|_| !job.keep_intermediate) {
                    warn!("Removing temporary GGUF file after failure.");
                    std::fs::remove_file(converted).ok();
                }
                return Err(e);
            }
        };

        if let Some(converted) = converted {
            if job.keep_intermediate {
                summary.intermediate = Some(converted);
            } else {
                info!("Removing temporary GGUF file.");
                std::fs::remove_file(&converted)
                    .map_err(|e| QuantError::io("removing converted model", &converted, e))?;
            }
        }

        if let Some(artifact) = &summary.imatrix {
            if artifact.should_delete(job.delete_imatrix) {
                info!("Removing importance matrix {}", artifact.path.display());
                std::fs::remove_file(&artifact.path)
                    .map_err(|e| QuantError::io("removing importance matrix", &artifact.path, e))?;
            }
        }

        if let Some(target) = &job.upload {
            info!("Uploading to the Hugging Face Hub.");
            summary.upload = Some(self.registry.upload(&job.output_directory, target).await?);
        }

        info!("Finished {} quantization(s)", summary.outputs.len());
        Ok(summary)
    }

    /// Importance matrix then every admitted type, in catalog order.
    async fn produce(
        &self,
        job: &QuantizationJob,
        frozen: &FrozenTypeSet,
        calibration: Option<&CalibrationInput>,
        gguf_input: &Path,
    ) -> Result<RunSummary> {
        self.cancel.check()?;
        let imatrix = match calibration {
            Some(calibration) => Some(
                self.imatrix
                    .generate(gguf_input, calibration, &job.imatrix_output, job.use_gpu)
                    .await?,
            ),
            None => None,
        };

        let mut summary = RunSummary {
            imatrix,
            ..RunSummary::default()
        };

        for quant in frozen.iter() {
            self.cancel.check()?;
            let imatrix_path = summary.imatrix.as_ref().map(|a| a.path.as_path());
            if quant.requires_imatrix() && imatrix_path.is_none() {
                return Err(QuantError::MissingImatrix {
                    quant: quant.name().to_string(),
                });
            }
            let output = self
                .quantize_one(job, *quant, gguf_input, imatrix_path)
                .await?;
            summary.outputs.push(output);
        }
        Ok(summary)
    }

    async fn convert(&self, model_dir: &Path, output_dir: &Path) -> Result<PathBuf> {
        info!("Exporting Hugging Face model to GGUF. This may take a while depending on model size.");
        let outfile = output_dir.join(EngineConfig::CONVERTED_FILENAME);
        let command = self.engine.convert_command(model_dir, &outfile);
        if let Err(e) = self
            .runner
            .run(&command, ParserConfig::log_only("convert"))
            .await
        {
            error!("Conversion failed: {}", e);
            if outfile.exists() {
                std::fs::remove_file(&outfile).ok();
            }
            return Err(e);
        }

        if !outfile.is_file() {
            return Err(QuantError::InvalidModelPath {
                path: outfile,
                message: "conversion finished without writing a GGUF file".to_string(),
            });
        }
        Ok(outfile)
    }

    async fn quantize_one(
        &self,
        job: &QuantizationJob,
        quant: QuantType,
        input: &Path,
        imatrix: Option<&Path>,
    ) -> Result<PathBuf> {
        let output = job.output_path(quant);
        let partial = partial_path(&output);
        info!("Quantizing {}", quant);

        let command = self.engine.quantize_command(imatrix, input, &partial, quant);
        if let Err(e) = self
            .runner
            .run(&command, ParserConfig::quantize(quant.name()))
            .await
        {
            error!("Quantization to {} failed: {}", quant, e);
            if partial.exists() {
                std::fs::remove_file(&partial).ok();
            }
            return Err(e);
        }

        std::fs::rename(&partial, &output)
            .map_err(|e| QuantError::io("finalizing quantized model", &partial, e))?;
        info!("Wrote {}", output.display());
        Ok(output)
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(EngineConfig::PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Reject imatrix types that slipped past the resolver without a matrix.
fn ensure_imatrix_for_all(types: &FrozenTypeSet, has_imatrix: bool) -> Result<()> {
    if has_imatrix {
        return Ok(());
    }
    match types.iter().find(|q| q.requires_imatrix()) {
        Some(quant) => Err(QuantError::MissingImatrix {
            quant: quant.name().to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::TypeSet;

    #[test]
    fn test_classify_sources() {
        let dir = tempfile::tempdir().unwrap();
        let gguf = dir.path().join("m.gguf");
        std::fs::write(&gguf, b"GGUF").unwrap();
        let hf = dir.path().join("hf");
        std::fs::create_dir(&hf).unwrap();
        std::fs::write(hf.join("config.json"), b"{}").unwrap();

        assert_eq!(
            ModelSource::classify(gguf.to_str().unwrap()).unwrap(),
            ModelSource::GgufFile(gguf.clone())
        );
        assert_eq!(
            ModelSource::classify(hf.to_str().unwrap()).unwrap(),
            ModelSource::LocalDirectory(hf.clone())
        );
        assert_eq!(
            ModelSource::classify("meta-llama/Llama-3.2-1B").unwrap(),
            ModelSource::Remote("meta-llama/Llama-3.2-1B".into())
        );
        assert!(!ModelSource::GgufFile(gguf).needs_conversion());
    }

    #[test]
    fn test_classify_rejects_unusable_local_paths() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("model.bin");
        std::fs::write(&other, b"x").unwrap();

        assert!(matches!(
            ModelSource::classify(other.to_str().unwrap()),
            Err(QuantError::InvalidModelPath { .. })
        ));
        assert!(matches!(
            ModelSource::classify(dir.path().to_str().unwrap()),
            Err(QuantError::InvalidModelPath { .. })
        ));
    }

    #[test]
    fn test_model_size_prefers_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.safetensors"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("b.safetensors"), vec![0u8; 5]).unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), vec![0u8; 100]).unwrap();
        assert_eq!(model_size(dir.path()).unwrap(), 15);
    }

    #[test]
    fn test_model_size_falls_back_to_bin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("config.json"), b"{}").unwrap();
        assert_eq!(model_size(dir.path()).unwrap(), 100);
    }

    #[test]
    fn test_model_size_without_weights_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            model_size(dir.path()),
            Err(QuantError::InvalidModelPath { .. })
        ));
        assert!(model_size(&dir.path().join("missing.gguf")).is_err());
    }

    #[test]
    fn test_output_paths() {
        let config = crate::config::ConfigFile::parse(
            r#"{"gguf": {"input_model": "m.gguf", "output_directory": "out",
                "output_base_name": "llama", "gguf_types": ["Q8_0"]}}"#,
        )
        .unwrap()
        .gguf;
        let job = QuantizationJob::from_config(&config);
        let output = job.output_path(QuantType::parse("q8_0").unwrap());
        assert_eq!(output, PathBuf::from("out/llama.Q8_0.gguf"));
        assert_eq!(partial_path(&output), PathBuf::from("out/llama.Q8_0.gguf.part"));
        assert!(job.upload.is_none());
    }

    #[test]
    fn test_imatrix_types_rejected_without_matrix() {
        let types = TypeSet::from_types([
            QuantType::parse("Q4_0").unwrap(),
            QuantType::parse("IQ2_M").unwrap(),
        ])
        .freeze();
        let err = ensure_imatrix_for_all(&types, false).unwrap_err();
        assert!(matches!(err, QuantError::MissingImatrix { ref quant } if quant == "IQ2_M"));
        assert!(ensure_imatrix_for_all(&types, true).is_ok());
    }
}
