//! Centralized configuration for quantforge.
//!
//! Static tuning constants live on unit structs; the per-run configuration is
//! read from a JSON file shaped like `{ "gguf": { ... } }`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};

/// llama.cpp engine layout and invocation constants.
pub struct EngineConfig;

impl EngineConfig {
    pub const DEFAULT_LLAMA_CPP_DIR: &'static str = "third_party/llama.cpp";
    pub const QUANTIZE_BINARY: &'static str = "llama-quantize";
    pub const IMATRIX_BINARY: &'static str = "llama-imatrix";
    pub const CONVERT_SCRIPT: &'static str = "convert_hf_to_gguf.py";
    pub const DEFAULT_PYTHON: &'static str = "python3";
    pub const CONVERTED_FILENAME: &'static str = "converted.gguf";
    pub const PARTIAL_SUFFIX: &'static str = ".part";
    /// Extra bytes added to the model size when sizing GPU layers.
    pub const GPU_MODEL_MARGIN_BYTES: u64 = 1024 * 1024 * 1024;
    /// Bounded channel capacity between output readers and the record consumer.
    pub const RECORD_CHANNEL_CAPACITY: usize = 256;
    pub const READ_CHUNK_SIZE: usize = 4096;
}

/// Disk-space admission constants.
pub struct AdmissionConfig;

impl AdmissionConfig {
    pub const REMEDIATION_TIMEOUT: Duration = Duration::from_secs(20);
    /// Multiplier applied to every size estimate (2% wiggle room).
    pub const SIZE_SAFETY_MARGIN: f64 = 1.02;
}

/// Model registry (Hugging Face Hub) constants.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const HUB_BASE: &'static str = "https://huggingface.co";
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const UPLOAD_MAX_ATTEMPTS: u32 = 3;
    pub const UPLOAD_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const UPLOAD_PATTERN_EXTENSION: &'static str = "gguf";
    /// Extensions never fetched when downloading a model snapshot.
    pub const DOWNLOAD_IGNORED_EXTENSIONS: &'static [&'static str] = &["pth", "pt", "h5", "msgpack"];
    pub const DOWNLOAD_CHUNK_LOG_INTERVAL: u64 = 512 * 1024 * 1024;
    pub const USER_AGENT: &'static str = "quantforge/0.2";
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub gguf: GgufConfig,
}

impl ConfigFile {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| QuantError::io("reading config file", path, e))?;
        Self::parse(&content)
    }

    /// A disabled section is accepted without checking its run settings.
    pub fn parse(content: &str) -> Result<Self> {
        let config: ConfigFile = serde_json::from_str(content)?;
        if config.gguf.enabled {
            config.gguf.validate()?;
        }
        Ok(config)
    }
}

fn default_true() -> bool {
    true
}

fn default_base_name() -> String {
    "gguf-model".to_string()
}

fn default_llama_cpp_dir() -> PathBuf {
    PathBuf::from(EngineConfig::DEFAULT_LLAMA_CPP_DIR)
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_python() -> String {
    EngineConfig::DEFAULT_PYTHON.to_string()
}

fn default_remediation_timeout() -> u64 {
    AdmissionConfig::REMEDIATION_TIMEOUT.as_secs()
}

/// GGUF quantization run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GgufConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A `.gguf` file, a local Hugging Face model directory, or a Hub repo id.
    #[serde(default)]
    pub input_model: String,
    #[serde(default)]
    pub output_directory: PathBuf,
    #[serde(default = "default_base_name")]
    pub output_base_name: String,
    /// Requested types; `"all"` expands to the full catalog.
    #[serde(default)]
    pub gguf_types: Vec<String>,
    /// Calibration input: `.txt` text to compute from or a precomputed `.dat`.
    #[serde(default)]
    pub imatrix: Option<PathBuf>,
    #[serde(default)]
    pub imatrix_gpu: bool,
    #[serde(default)]
    pub keep_gguf: bool,
    #[serde(default)]
    pub delete_imatrix: bool,
    #[serde(default)]
    pub upload_to_hub: bool,
    #[serde(default)]
    pub hf_token: Option<String>,
    #[serde(default)]
    pub hub_model_entity: Option<String>,
    #[serde(default = "default_base_name")]
    pub hub_model_name: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default = "default_llama_cpp_dir")]
    pub llama_cpp_dir: PathBuf,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_remediation_timeout")]
    pub remediation_timeout_secs: u64,
    /// Where remote models are downloaded; defaults to the Hugging Face cache.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

impl GgufConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_model.trim().is_empty() {
            return Err(QuantError::Config {
                message: "`input_model` must not be empty".to_string(),
            });
        }
        if self.output_directory.as_os_str().is_empty() {
            return Err(QuantError::Config {
                message: "`output_directory` must not be empty".to_string(),
            });
        }
        if self.gguf_types.is_empty() {
            return Err(QuantError::Config {
                message: "`gguf_types` must list at least one type (or \"all\")".to_string(),
            });
        }
        if self.output_base_name.contains(std::path::MAIN_SEPARATOR) {
            return Err(QuantError::Config {
                message: format!(
                    "`output_base_name` must be a file name, got {}",
                    self.output_base_name
                ),
            });
        }
        Ok(())
    }

    pub fn remediation_timeout(&self) -> Duration {
        Duration::from_secs(self.remediation_timeout_secs)
    }

    /// Path of the importance matrix computed by this run.
    pub fn imatrix_output_path(&self) -> PathBuf {
        self.artifacts_dir
            .join(format!("imatrix-{}.dat", self.output_base_name))
    }

    /// Directory remote models are downloaded into.
    pub fn resolved_download_dir(&self) -> PathBuf {
        self.download_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("huggingface")
                .join("quantforge")
        })
    }
}
