//! Hugging Face token resolution.

use std::path::{Path, PathBuf};

use crate::error::{QuantError, Result};

/// Environment variable holding a Hugging Face token.
const HF_TOKEN_ENV_VAR: &str = "HF_TOKEN";

/// Where a resolved token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Config,
    EnvVar,
    HfCache,
}

impl TokenSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenSource::Config => "config",
            TokenSource::EnvVar => "env_var",
            TokenSource::HfCache => "hf_cache",
        }
    }
}

/// Token file written by `huggingface-cli login`.
fn hf_cache_token_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cache").join("huggingface").join("token"))
}

fn non_empty(token: &str) -> Option<String> {
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Resolve a token from the explicit value, then `HF_TOKEN`, then the CLI cache.
pub fn resolve_token(explicit: Option<&str>) -> Option<(String, TokenSource)> {
    resolve_token_from(
        explicit,
        std::env::var(HF_TOKEN_ENV_VAR).ok().as_deref(),
        hf_cache_token_path().as_deref(),
    )
}

fn resolve_token_from(
    explicit: Option<&str>,
    env: Option<&str>,
    cache_file: Option<&Path>,
) -> Option<(String, TokenSource)> {
    if let Some(token) = explicit.and_then(non_empty) {
        return Some((token, TokenSource::Config));
    }
    if let Some(token) = env.and_then(non_empty) {
        return Some((token, TokenSource::EnvVar));
    }
    cache_file
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|token| non_empty(&token))
        .map(|token| (token, TokenSource::HfCache))
}

/// Like [`resolve_token`] but a missing token is an error.
pub fn require_token(explicit: Option<&str>) -> Result<String> {
    resolve_token(explicit)
        .map(|(token, source)| {
            tracing::debug!("Hugging Face token resolved from {}", source.as_str());
            token
        })
        .ok_or_else(|| QuantError::MissingCredential {
            what: "Hugging Face token (needed to upload to the hub)".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_token_wins() {
        let resolved = resolve_token_from(Some(" hf_cfg "), Some("hf_env"), None);
        assert_eq!(resolved, Some(("hf_cfg".to_string(), TokenSource::Config)));
    }

    #[test]
    fn test_env_used_when_config_blank() {
        let resolved = resolve_token_from(Some("  "), Some("hf_env"), None);
        assert_eq!(resolved, Some(("hf_env".to_string(), TokenSource::EnvVar)));
    }

    #[test]
    fn test_cache_file_is_last_resort() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("token");
        std::fs::write(&path, "hf_cached\n").unwrap();

        let resolved = resolve_token_from(None, None, Some(&path));
        assert_eq!(resolved, Some(("hf_cached".to_string(), TokenSource::HfCache)));
    }

    #[test]
    fn test_nothing_found() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("token");
        assert_eq!(resolve_token_from(None, Some(""), Some(&missing)), None);
    }
}
