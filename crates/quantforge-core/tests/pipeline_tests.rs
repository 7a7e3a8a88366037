//! End-to-end pipeline runs against scripted engine, disk, prompt and registry.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quantforge::admission::DiskProbe;
use quantforge::gpu::NoGpu;
use quantforge::progress::ParserConfig;
use quantforge::{
    CancellationToken, ConfigFile, EngineCommand, EngineRunner, GgufConfig, ModelRegistry,
    PipelineBuilder, PromptOutcome, QuantError, QuantizationJob, QuantizationPipeline,
    RemediationPrompt, RemovalChoice, Result, UploadReceipt, UploadTarget,
};
use serde_json::json;
use tempfile::TempDir;

const GB: u64 = 1_000_000_000;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Writes the files each engine command would produce; quantization to any
/// type in `failing` leaves a partial file and exits non-zero.
#[derive(Default)]
struct ScriptedEngine {
    failing: Vec<&'static str>,
    calls: Mutex<Vec<EngineCommand>>,
}

impl ScriptedEngine {
    fn failing(types: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            failing: types.to_vec(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<EngineCommand> {
        self.calls.lock().unwrap().clone()
    }

    fn programs(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.program_name()).collect()
    }

    fn quantized_types(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.program_name() == "llama-quantize")
            .map(|c| c.args().last().unwrap().to_string_lossy().into_owned())
            .collect()
    }
}

#[async_trait]
impl EngineRunner for ScriptedEngine {
    async fn run(&self, command: &EngineCommand, _parser: ParserConfig) -> Result<()> {
        self.calls.lock().unwrap().push(command.clone());
        let args: Vec<String> = command
            .args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        match command.program_name().as_str() {
            "llama-quantize" => {
                let quant = args[args.len() - 1].as_str();
                let output = &args[args.len() - 2];
                std::fs::write(output, b"GGUF partial").unwrap();
                if self.failing.contains(&quant) {
                    return Err(QuantError::ProcessFailure {
                        program: "llama-quantize".into(),
                        status: Some(1),
                    });
                }
                Ok(())
            }
            "llama-imatrix" => {
                let output = command.arg_value("-o").unwrap();
                std::fs::write(output, b"imatrix").unwrap();
                Ok(())
            }
            _ => {
                let output = command.arg_value("--outfile").unwrap();
                std::fs::write(output, b"GGUF converted").unwrap();
                Ok(())
            }
        }
    }

    async fn probe_layer_count(&self, _command: &EngineCommand) -> Result<Option<u32>> {
        Ok(Some(32))
    }
}

struct FixedDisk(u64);

impl DiskProbe for FixedDisk {
    fn free_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.0)
    }
}

struct ScriptedPrompt {
    outcome: PromptOutcome,
    asked: Mutex<u32>,
}

impl ScriptedPrompt {
    fn new(outcome: PromptOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            asked: Mutex::new(0),
        })
    }

    fn times_asked(&self) -> u32 {
        *self.asked.lock().unwrap()
    }
}

#[async_trait]
impl RemediationPrompt for ScriptedPrompt {
    async fn prompt_with_deadline(
        &self,
        _choices: &[RemovalChoice],
        _deadline: Duration,
    ) -> PromptOutcome {
        *self.asked.lock().unwrap() += 1;
        self.outcome.clone()
    }
}

/// Materializes a tiny Hugging Face checkout and records uploads.
#[derive(Default)]
struct FakeRegistry {
    downloads: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(PathBuf, UploadTarget)>>,
}

#[async_trait]
impl ModelRegistry for FakeRegistry {
    async fn download(&self, repo_id: &str, cache_root: &Path) -> Result<PathBuf> {
        self.downloads.lock().unwrap().push(repo_id.to_string());
        let dir = cache_root.join(repo_id.replace('/', "--"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), b"{}").unwrap();
        std::fs::write(dir.join("model.safetensors"), vec![0u8; 1024]).unwrap();
        Ok(dir)
    }

    async fn upload(&self, directory: &Path, target: &UploadTarget) -> Result<UploadReceipt> {
        self.uploads
            .lock()
            .unwrap()
            .push((directory.to_path_buf(), target.clone()));
        Ok(UploadReceipt {
            repo_id: format!("me/{}", target.name),
            files: Vec::new(),
            attempts: 1,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    temp: TempDir,
    engine: Arc<ScriptedEngine>,
    prompt: Arc<ScriptedPrompt>,
    registry: Arc<FakeRegistry>,
    free_space: u64,
    cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            engine: ScriptedEngine::failing(&[]),
            prompt: ScriptedPrompt::new(PromptOutcome::TimedOut),
            registry: Arc::new(FakeRegistry::default()),
            free_space: 1000 * GB,
            cancel: CancellationToken::new(),
        }
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn out(&self) -> PathBuf {
        self.root().join("out")
    }

    /// A `.gguf` input of the given size (sparse).
    fn gguf_model(&self, size: u64) -> PathBuf {
        let path = self.root().join("model.gguf");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(size).unwrap();
        path
    }

    fn hf_directory(&self) -> PathBuf {
        let dir = self.root().join("hf-model");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), b"{}").unwrap();
        std::fs::write(dir.join("model.safetensors"), vec![0u8; 2048]).unwrap();
        dir
    }

    fn config(&self, input: &str, types: &[&str], extra: serde_json::Value) -> GgufConfig {
        let mut gguf = json!({
            "input_model": input,
            "output_directory": self.out(),
            "output_base_name": "m",
            "gguf_types": types,
            "artifacts_dir": self.root().join("artifacts"),
            "download_dir": self.root().join("hub-cache"),
            "llama_cpp_dir": self.root().join("llama.cpp"),
        });
        if let (Some(base), Some(extra)) = (gguf.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        ConfigFile::parse(&json!({ "gguf": gguf }).to_string())
            .unwrap()
            .gguf
    }

    fn pipeline(&self, config: &GgufConfig) -> QuantizationPipeline {
        PipelineBuilder::new(config, self.prompt.clone())
            .runner(self.engine.clone())
            .disk_probe(Arc::new(FixedDisk(self.free_space)))
            .gpu_probe(Arc::new(NoGpu))
            .registry(self.registry.clone())
            .cancellation(self.cancel.clone())
            .build()
            .unwrap()
    }

    async fn run(&self, config: &GgufConfig) -> Result<quantforge::RunSummary> {
        self.pipeline(config)
            .run(&QuantizationJob::from_config(config))
            .await
    }

    fn out_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.out())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn s(path: &Path) -> &str {
    path.to_str().unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_gguf_input_quantizes_each_type_in_catalog_order() {
    let h = Harness::new();
    let model = h.gguf_model(10 * GB);
    let config = h.config(s(&model), &["q8_0", "Q4_K_M"], json!({}));

    let summary = h.run(&config).await.unwrap();

    assert_eq!(h.engine.quantized_types(), vec!["Q4_K_M", "Q8_0"]);
    assert_eq!(
        summary.outputs,
        vec![h.out().join("m.Q4_K_M.gguf"), h.out().join("m.Q8_0.gguf")]
    );
    assert_eq!(h.out_files(), vec!["m.Q4_K_M.gguf", "m.Q8_0.gguf"]);
    assert_eq!(h.prompt.times_asked(), 0);
    assert!(summary.imatrix.is_none());
    assert!(summary.upload.is_none());
}

#[tokio::test]
async fn test_failed_type_aborts_run_without_leaving_output() {
    let mut h = Harness::new();
    h.engine = ScriptedEngine::failing(&["Q4_K_M"]);
    let model = h.gguf_model(GB);
    let config = h.config(s(&model), &["Q4_0", "Q4_K_M", "Q8_0"], json!({}));

    let err = h.run(&config).await.unwrap_err();

    assert!(matches!(err, QuantError::ProcessFailure { status: Some(1), .. }));
    assert_eq!(h.engine.quantized_types(), vec!["Q4_0", "Q4_K_M"]);
    assert_eq!(h.out_files(), vec!["m.Q4_0.gguf"]);
}

#[tokio::test]
async fn test_operator_trims_types_when_disk_is_short() {
    let mut h = Harness::new();
    h.free_space = 5 * GB;
    h.prompt = ScriptedPrompt::new(PromptOutcome::Selected(vec!["Q8_0".into()]));
    let model = h.gguf_model(10 * GB);
    let config = h.config(s(&model), &["Q4_0", "Q8_0"], json!({}));

    let summary = h.run(&config).await.unwrap();

    assert_eq!(h.prompt.times_asked(), 1);
    assert_eq!(h.engine.quantized_types(), vec!["Q4_0"]);
    assert_eq!(summary.outputs.len(), 1);
}

#[tokio::test]
async fn test_remediation_timeout_stops_before_any_engine_work() {
    let mut h = Harness::new();
    h.free_space = GB;
    let model = h.gguf_model(10 * GB);
    let config = h.config(s(&model), &["Q8_0"], json!({}));

    let err = h.run(&config).await.unwrap_err();

    assert!(matches!(err, QuantError::RemediationTimedOut(_)));
    assert!(err.is_resource_exhaustion());
    assert!(h.engine.calls().is_empty());
}

#[tokio::test]
async fn test_local_directory_is_converted_then_cleaned_up() {
    let h = Harness::new();
    let dir = h.hf_directory();
    let config = h.config(s(&dir), &["Q8_0"], json!({}));

    let summary = h.run(&config).await.unwrap();

    assert_eq!(h.engine.programs(), vec!["python3", "llama-quantize"]);
    let quantize = &h.engine.calls()[1];
    assert!(quantize
        .args()
        .iter()
        .any(|a| Path::new(a) == h.out().join("converted.gguf")));
    assert!(summary.intermediate.is_none());
    assert_eq!(h.out_files(), vec!["m.Q8_0.gguf"]);
}

#[tokio::test]
async fn test_keep_gguf_retains_converted_model() {
    let h = Harness::new();
    let dir = h.hf_directory();
    let config = h.config(s(&dir), &["Q8_0"], json!({ "keep_gguf": true }));

    let summary = h.run(&config).await.unwrap();

    assert_eq!(summary.intermediate, Some(h.out().join("converted.gguf")));
    assert_eq!(h.out_files(), vec!["converted.gguf", "m.Q8_0.gguf"]);
}

#[tokio::test]
async fn test_failed_type_removes_converted_model() {
    let mut h = Harness::new();
    h.engine = ScriptedEngine::failing(&["Q8_0"]);
    let dir = h.hf_directory();
    let config = h.config(s(&dir), &["Q4_0", "Q8_0"], json!({}));

    let err = h.run(&config).await.unwrap_err();

    assert!(matches!(err, QuantError::ProcessFailure { .. }));
    assert_eq!(h.engine.programs(), vec!["python3", "llama-quantize", "llama-quantize"]);
    assert_eq!(h.out_files(), vec!["m.Q4_0.gguf"]);
}

#[tokio::test]
async fn test_failed_type_keeps_converted_model_when_asked() {
    let mut h = Harness::new();
    h.engine = ScriptedEngine::failing(&["Q8_0"]);
    let dir = h.hf_directory();
    let config = h.config(s(&dir), &["Q8_0"], json!({ "keep_gguf": true }));

    h.run(&config).await.unwrap_err();

    assert_eq!(h.out_files(), vec!["converted.gguf"]);
}

#[tokio::test]
async fn test_remote_model_is_downloaded_first() {
    let h = Harness::new();
    let config = h.config("org/tiny-model", &["Q4_0"], json!({}));

    h.run(&config).await.unwrap();

    assert_eq!(*h.registry.downloads.lock().unwrap(), vec!["org/tiny-model"]);
    let convert = &h.engine.calls()[0];
    assert!(convert
        .args()
        .iter()
        .any(|a| Path::new(a) == h.root().join("hub-cache").join("org--tiny-model")));
}

#[tokio::test]
async fn test_text_calibration_computes_imatrix_and_passes_it_to_every_type() {
    let h = Harness::new();
    let model = h.gguf_model(GB);
    let calibration = h.root().join("calibration.txt");
    std::fs::write(&calibration, "the quick brown fox").unwrap();
    let config = h.config(
        s(&model),
        &["IQ2_M", "Q4_K_M"],
        json!({ "imatrix": calibration }),
    );

    let summary = h.run(&config).await.unwrap();

    let imatrix_path = h.root().join("artifacts").join("imatrix-m.dat");
    assert_eq!(h.engine.programs()[0], "llama-imatrix");
    for quantize in h.engine.calls().iter().skip(1) {
        assert_eq!(quantize.arg_value("--imatrix"), Some(imatrix_path.as_os_str()));
    }
    let artifact = summary.imatrix.unwrap();
    assert!(artifact.computed);
    assert_eq!(artifact.path, imatrix_path);
    assert!(imatrix_path.exists());
}

#[tokio::test]
async fn test_delete_imatrix_removes_computed_matrix() {
    let h = Harness::new();
    let model = h.gguf_model(GB);
    let calibration = h.root().join("calibration.txt");
    std::fs::write(&calibration, "text").unwrap();
    let config = h.config(
        s(&model),
        &["Q4_K_M"],
        json!({ "imatrix": calibration, "delete_imatrix": true }),
    );

    h.run(&config).await.unwrap();
    assert!(!h.root().join("artifacts").join("imatrix-m.dat").exists());
}

#[tokio::test]
async fn test_precomputed_imatrix_is_never_deleted() {
    let h = Harness::new();
    let model = h.gguf_model(GB);
    let dat = h.root().join("prior.dat");
    std::fs::write(&dat, b"imatrix").unwrap();
    let config = h.config(
        s(&model),
        &["IQ3_M"],
        json!({ "imatrix": dat, "delete_imatrix": true }),
    );

    h.run(&config).await.unwrap();

    assert_eq!(h.engine.programs(), vec!["llama-quantize"]);
    assert!(dat.exists());
}

#[tokio::test]
async fn test_wildcard_without_imatrix_skips_imatrix_types() {
    let h = Harness::new();
    let model = h.gguf_model(GB);
    let config = h.config(s(&model), &["all"], json!({}));

    h.run(&config).await.unwrap();

    let types = h.engine.quantized_types();
    assert_eq!(types.len(), 17);
    assert!(types.iter().all(|t| !t.starts_with("IQ") && t != "Q2_K_S"));
    assert!(!types.iter().any(|t| t == "F16" || t == "COPY"));
}

#[tokio::test]
async fn test_explicit_imatrix_type_without_matrix_is_rejected_up_front() {
    let h = Harness::new();
    let model = h.gguf_model(GB);
    let config = h.config(s(&model), &["Q4_0", "IQ2_XS"], json!({}));

    let err = h.run(&config).await.unwrap_err();

    assert!(matches!(err, QuantError::MissingImatrix { .. }));
    assert!(err.is_fatal_config());
    assert!(h.engine.calls().is_empty());
}

#[tokio::test]
async fn test_unsupported_calibration_is_fatal_config() {
    let h = Harness::new();
    let model = h.gguf_model(GB);
    let config = h.config(s(&model), &["Q4_0"], json!({ "imatrix": "cal.csv" }));

    let err = h.run(&config).await.unwrap_err();
    assert!(matches!(err, QuantError::UnsupportedCalibration { .. }));
}

#[tokio::test]
async fn test_upload_runs_after_quantization() {
    let h = Harness::new();
    let model = h.gguf_model(GB);
    let config = h.config(
        s(&model),
        &["Q8_0"],
        json!({ "upload_to_hub": true, "hub_model_name": "m-GGUF", "private": true }),
    );

    let summary = h.run(&config).await.unwrap();

    let uploads = h.registry.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, h.out());
    assert_eq!(uploads[0].1.name, "m-GGUF");
    assert!(uploads[0].1.private);
    assert_eq!(summary.upload.unwrap().repo_id, "me/m-GGUF");
}

#[tokio::test]
async fn test_cancelled_run_does_no_engine_work() {
    let h = Harness::new();
    let model = h.gguf_model(GB);
    let config = h.config(s(&model), &["Q8_0"], json!({}));
    h.cancel.cancel();

    let err = h.run(&config).await.unwrap_err();
    assert!(matches!(err, QuantError::Cancelled));
    assert!(h.engine.calls().is_empty());
}
