//! quantforge - resource-aware batch GGUF quantization on top of llama.cpp.
//!
//! The library plans and drives a batch of `llama-quantize` runs for one
//! model: it resolves the requested quantization types, checks the planned
//! outputs against free disk space (with one bounded chance for the operator
//! to drop types), converts Hugging Face checkpoints to GGUF, computes an
//! importance matrix with GPU offload backoff, and publishes the results to
//! the Hugging Face Hub.
//!
//! # Example
//!
//! ```rust,ignore
//! use quantforge::{ConfigFile, PipelineBuilder, QuantizationJob};
//!
//! #[tokio::main]
//! async fn main() -> quantforge::Result<()> {
//!     let config = ConfigFile::load("quant.json".as_ref())?.gguf;
//!     let pipeline = PipelineBuilder::new(&config, my_prompt()).build()?;
//!
//!     let summary = pipeline.run(&QuantizationJob::from_config(&config)).await?;
//!     println!("Wrote {} files", summary.outputs.len());
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod imatrix;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod resolver;
pub mod retry;

mod builder;

// Re-export commonly used types
pub use admission::{DiskSpaceAdmissionController, PromptOutcome, RemediationPrompt, RemovalChoice};
pub use builder::PipelineBuilder;
pub use cancel::CancellationToken;
pub use catalog::{CompressionTable, QuantType};
pub use config::{ConfigFile, GgufConfig};
pub use engine::{EngineCommand, EngineRunner, LlamaCppEngine};
pub use error::{QuantError, Result};
pub use imatrix::{CalibrationInput, ImatrixArtifact};
pub use pipeline::{ModelSource, QuantizationJob, QuantizationPipeline, RunSummary};
pub use progress::{ProgressEvent, ProgressReporter};
pub use registry::{ModelRegistry, UploadReceipt, UploadTarget};
pub use resolver::{resolve, FrozenTypeSet, TypeSet};
