//! llama.cpp engine integration.
//!
//! [`LlamaCppEngine`] knows where the llama.cpp binaries and the conversion
//! script live and builds [`EngineCommand`]s for every invocation. Commands
//! are executed through the [`EngineRunner`] seam; [`ProcessRunner`] is the
//! production implementation that drives a [`TrackedProcess`].

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::catalog::QuantType;
use crate::config::{EngineConfig, GgufConfig};
use crate::error::Result;
use crate::progress::{ParserConfig, ProgressReporter, TrackedProcess, TrackerEvent};

/// Metadata lines reporting the layer count, old and new llama.cpp spelling.
const LAYER_COUNT_PREFIXES: &[&str] = &["llm_load_print_meta: n_layer", "print_info: n_layer"];

/// A program plus its argument vector, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl EngineCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// File name of the program, used in logs and errors.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Whether `flag` appears in the argument vector.
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// Value following `flag`, if present.
    pub fn arg_value(&self, flag: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(|a| a.as_os_str())
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Locations of the llama.cpp tools.
#[derive(Debug, Clone)]
pub struct LlamaCppEngine {
    llama_cpp_dir: PathBuf,
    python: String,
}

impl LlamaCppEngine {
    pub fn new(llama_cpp_dir: impl Into<PathBuf>) -> Self {
        Self {
            llama_cpp_dir: llama_cpp_dir.into(),
            python: EngineConfig::DEFAULT_PYTHON.to_string(),
        }
    }

    pub fn from_config(config: &GgufConfig) -> Self {
        Self::new(&config.llama_cpp_dir).with_python(&config.python)
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Path to the `llama-quantize` binary.
    pub fn quantize_binary(&self) -> PathBuf {
        self.locate(EngineConfig::QUANTIZE_BINARY)
    }

    /// Path to the `llama-imatrix` binary.
    pub fn imatrix_binary(&self) -> PathBuf {
        self.locate(EngineConfig::IMATRIX_BINARY)
    }

    /// Path to `convert_hf_to_gguf.py`.
    pub fn convert_script(&self) -> PathBuf {
        self.llama_cpp_dir.join(EngineConfig::CONVERT_SCRIPT)
    }

    /// CMake builds put binaries under `build/bin`; Makefile builds leave them
    /// in the checkout root.
    fn locate(&self, binary: &str) -> PathBuf {
        let cmake = self.llama_cpp_dir.join("build").join("bin").join(binary);
        if cmake.exists() {
            cmake
        } else {
            self.llama_cpp_dir.join(binary)
        }
    }

    /// Metadata probe: load the model against an empty calibration stream.
    pub fn probe_command(&self, model: &Path) -> EngineCommand {
        EngineCommand::new(self.imatrix_binary())
            .arg("-m")
            .arg(model)
            .arg("-f")
            .arg("/dev/null")
    }

    pub fn imatrix_command(
        &self,
        model: &Path,
        calibration: &Path,
        output: &Path,
        gpu_layers: Option<u32>,
    ) -> EngineCommand {
        let command = EngineCommand::new(self.imatrix_binary())
            .arg("-m")
            .arg(model)
            .arg("-f")
            .arg(calibration)
            .arg("-o")
            .arg(output);
        match gpu_layers {
            Some(layers) => command
                .arg("-ngl")
                .arg(layers.to_string())
                .arg("-sm")
                .arg("none"),
            None => command,
        }
    }

    pub fn quantize_command(
        &self,
        imatrix: Option<&Path>,
        input: &Path,
        output: &Path,
        quant: QuantType,
    ) -> EngineCommand {
        let mut command = EngineCommand::new(self.quantize_binary());
        if let Some(imatrix) = imatrix {
            command = command.arg("--imatrix").arg(imatrix);
        }
        command.arg(input).arg(output).arg(quant.name())
    }

    pub fn convert_command(&self, model_dir: &Path, outfile: &Path) -> EngineCommand {
        EngineCommand::new(&self.python)
            .arg(self.convert_script())
            .arg(model_dir)
            .arg("--outfile")
            .arg(outfile)
    }
}

/// Extract the layer count from one metadata record.
///
/// ```text
/// llm_load_print_meta: n_layer          = 32
/// ```
pub fn parse_layer_count(record: &str) -> Option<u32> {
    let record = record.trim();
    if !LAYER_COUNT_PREFIXES.iter().any(|p| record.starts_with(p)) {
        return None;
    }
    let (_, value) = record.split_once('=')?;
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Executes engine commands.
#[async_trait]
pub trait EngineRunner: Send + Sync {
    /// Run to completion, reporting progress parsed with `parser`.
    async fn run(&self, command: &EngineCommand, parser: ParserConfig) -> Result<()>;

    /// Run a metadata probe and return the model's layer count, if reported.
    async fn probe_layer_count(&self, command: &EngineCommand) -> Result<Option<u32>>;
}

/// [`EngineRunner`] that spawns real processes.
pub struct ProcessRunner {
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl ProcessRunner {
    pub fn new(reporter: Arc<dyn ProgressReporter>, cancel: CancellationToken) -> Self {
        Self { reporter, cancel }
    }
}

#[async_trait]
impl EngineRunner for ProcessRunner {
    async fn run(&self, command: &EngineCommand, parser: ParserConfig) -> Result<()> {
        let label = parser.label.clone();
        let mut process = TrackedProcess::spawn(command, parser, self.cancel.clone())?;

        loop {
            match process.next_event().await {
                Ok(Some(TrackerEvent::Progress(event))) => self.reporter.on_progress(&event),
                Ok(Some(TrackerEvent::Log(line))) => self.reporter.on_log(&label, &line),
                Ok(None) => break,
                Err(e) => {
                    self.reporter.on_finish(&label, false);
                    return Err(e);
                }
            }
        }

        let result = process.finish().await;
        self.reporter.on_finish(&label, result.is_ok());
        result
    }

    async fn probe_layer_count(&self, command: &EngineCommand) -> Result<Option<u32>> {
        let mut process =
            TrackedProcess::spawn(command, ParserConfig::log_only("probe"), self.cancel.clone())?;
        let mut layers = None;

        while let Some(event) = process.next_event().await? {
            if let TrackerEvent::Log(line) = event {
                if layers.is_none() {
                    layers = parse_layer_count(&line);
                }
            }
        }

        // An empty calibration stream makes the probe exit non-zero.
        if let Err(e) = process.finish().await {
            debug!("Metadata probe ended with: {}", e);
        }
        Ok(layers)
    }
}
