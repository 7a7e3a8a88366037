//! GPU free-memory probing.
//!
//! Only NVIDIA GPUs are detected, via `nvidia-smi`. The imatrix generator uses
//! the first device's free memory to size its layer offload.

use std::process::Command;

use tracing::debug;

use crate::error::Result;

/// Source of GPU availability and free memory.
pub trait GpuProbe: Send + Sync {
    fn is_available(&self) -> bool;

    /// Free memory of the first GPU in bytes, `None` if it cannot be read.
    fn free_memory(&self) -> Result<Option<u64>>;
}

/// NVIDIA GPU probe using nvidia-smi.
pub struct NvidiaSmiProbe {
    available: bool,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        let available = Command::new("nvidia-smi")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);

        if !available {
            debug!("nvidia-smi not available - GPU offload disabled");
        }

        Self { available }
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe for NvidiaSmiProbe {
    fn is_available(&self) -> bool {
        self.available
    }

    fn free_memory(&self) -> Result<Option<u64>> {
        if !self.available {
            return Ok(None);
        }

        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(parse_free_memory(&stdout))
            }
            Ok(output) => {
                debug!(
                    "nvidia-smi returned non-zero: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                Ok(None)
            }
            Err(e) => {
                debug!("Failed to run nvidia-smi: {}", e);
                Ok(None)
            }
        }
    }
}

/// First line of `memory.free` CSV output, MiB converted to bytes.
fn parse_free_memory(stdout: &str) -> Option<u64> {
    let line = stdout.lines().next()?.trim();
    match line.parse::<u64>() {
        Ok(mib) => Some(mib * 1024 * 1024),
        Err(_) => {
            debug!("Unexpected nvidia-smi output format: {}", line);
            None
        }
    }
}

/// Probe for systems without a usable GPU.
pub struct NoGpu;

impl GpuProbe for NoGpu {
    fn is_available(&self) -> bool {
        false
    }

    fn free_memory(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Create the appropriate GPU probe for the current system.
pub fn detect_gpu_probe() -> Box<dyn GpuProbe> {
    let nvidia = NvidiaSmiProbe::new();
    if nvidia.is_available() {
        Box::new(nvidia)
    } else {
        Box::new(NoGpu)
    }
}
