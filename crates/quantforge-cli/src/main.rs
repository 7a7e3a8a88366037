//! quantforge - batch GGUF quantization with llama.cpp.
//!
//! Reads a JSON run configuration, quantizes the model to every requested
//! type that fits on disk, and optionally publishes the results to the
//! Hugging Face Hub.

mod prompt;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use quantforge::{CancellationToken, ConfigFile, PipelineBuilder, QuantizationJob, RunSummary};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::prompt::TerminalPrompt;
use crate::render::IndicatifReporter;

#[derive(Parser, Debug)]
#[command(name = "quantforge")]
#[command(about = "Resource-aware batch GGUF quantization")]
struct Args {
    /// Path to the JSON run configuration
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = ConfigFile::load(&args.config)?.gguf;
    if !config.enabled {
        info!("No quantizers enabled.");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping the running step");
            on_interrupt.cancel();
        }
    });

    let pipeline = PipelineBuilder::new(&config, Arc::new(TerminalPrompt::new()))
        .reporter(Arc::new(IndicatifReporter::new()))
        .cancellation(cancel)
        .build()?;

    match pipeline.run(&QuantizationJob::from_config(&config)).await {
        Ok(summary) => {
            report(&summary, args.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("{}", e);
            if let Some(hint) = e.remediation() {
                info!("{}", hint);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn report(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    for output in &summary.outputs {
        info!("Created {}", output.display());
    }
    if let Some(intermediate) = &summary.intermediate {
        info!("Kept converted model {}", intermediate.display());
    }
    if let Some(upload) = &summary.upload {
        info!(
            "Uploaded {} file(s) to https://huggingface.co/{}",
            upload.files.len(),
            upload.repo_id
        );
    }
    Ok(())
}
