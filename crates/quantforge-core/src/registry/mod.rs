//! Remote model registry: snapshot download and artifact upload.
//!
//! # Module Organization
//!
//! - [`auth`] - Token resolution (config, `HF_TOKEN`, CLI cache)
//! - [`hf`] - Hugging Face Hub client over HTTP

pub mod auth;
mod hf;

pub use hf::HuggingFaceRegistry;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{GgufConfig, RegistryConfig};
use crate::error::{QuantError, Result};

/// Where and how to publish finished artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Explicit token; falls back to the environment when `None`.
    pub token: Option<String>,
    /// Repository owner; the token's user when `None`.
    pub owner: Option<String>,
    pub name: String,
    pub private: bool,
}

impl UploadTarget {
    pub fn from_config(config: &GgufConfig) -> Self {
        Self {
            token: config.hf_token.clone(),
            owner: config.hub_model_entity.clone(),
            name: config.hub_model_name.clone(),
            private: config.private,
        }
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub repo_id: String,
    /// Repository paths committed.
    pub files: Vec<String>,
    pub attempts: u32,
}

/// A model registry the pipeline can pull inputs from and push outputs to.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Fetch a snapshot of `repo_id` under `cache_root`; returns its local directory.
    async fn download(&self, repo_id: &str, cache_root: &Path) -> Result<PathBuf>;

    /// Publish every `*.gguf` file directly inside `directory`.
    async fn upload(&self, directory: &Path, target: &UploadTarget) -> Result<UploadReceipt>;
}

/// Local directory name for a downloaded repository (`org/model` → `org--model`).
pub fn snapshot_dir_name(repo_id: &str) -> String {
    repo_id.replace('/', "--")
}

/// Whether a repository file is skipped on download.
pub fn is_ignored_download(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| RegistryConfig::DOWNLOAD_IGNORED_EXTENSIONS.contains(&ext))
}

/// `*.gguf` files directly inside `directory`, sorted by name.
pub fn upload_candidates(directory: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(directory)
        .map_err(|e| QuantError::io("listing upload directory", directory, e))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_gguf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == RegistryConfig::UPLOAD_PATTERN_EXTENSION);
        if is_gguf && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
