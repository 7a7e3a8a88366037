//! Hugging Face Hub client.
//!
//! Downloads walk the repository tree API and fetch files from
//! `resolve/main`. Uploads use the Hub commit protocol:
//!
//! 1. `preupload` decides per file between LFS and inline content
//! 2. the LFS batch API hands out upload URLs (single PUT or multipart)
//! 3. one NDJSON `commit` references every uploaded object
//!
//! The whole upload is retried as a unit on transient failures.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LINK};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{
    auth, is_ignored_download, snapshot_dir_name, upload_candidates, ModelRegistry, UploadReceipt,
    UploadTarget,
};
use crate::config::RegistryConfig;
use crate::error::{QuantError, Result};
use crate::retry::{retry_transient, RetryPolicy};

/// Bytes of each file sent to `preupload` so the Hub can sniff its type.
const PREUPLOAD_SAMPLE_BYTES: usize = 512;

/// Read size for streamed request bodies.
const BODY_CHUNK_SIZE: usize = 1024 * 1024;

const LFS_CONTENT_TYPE: &str = "application/vnd.git-lfs+json";

const COMMIT_SUMMARY: &str = "Upload GGUF quantizations";

// ---------------------------------------------------------------------------
// API payloads
// ---------------------------------------------------------------------------

/// Entry from `api/models/{id}/tree/main`.
#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    lfs: Option<LfsPointer>,
}

impl TreeEntry {
    fn expected_size(&self) -> u64 {
        self.lfs.as_ref().map(|l| l.size).unwrap_or(self.size)
    }
}

#[derive(Debug, Deserialize)]
struct LfsPointer {
    size: u64,
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PreuploadResponse {
    files: Vec<PreuploadVerdict>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreuploadVerdict {
    path: String,
    upload_mode: String,
    #[serde(default)]
    should_ignore: bool,
}

#[derive(Debug, Deserialize)]
struct LfsBatchResponse {
    objects: Vec<LfsBatchObject>,
}

#[derive(Debug, Deserialize)]
struct LfsBatchObject {
    oid: String,
    size: u64,
    #[serde(default)]
    actions: Option<LfsActions>,
    #[serde(default)]
    error: Option<LfsObjectError>,
}

#[derive(Debug, Deserialize)]
struct LfsActions {
    #[serde(default)]
    upload: Option<LfsAction>,
    #[serde(default)]
    verify: Option<LfsAction>,
}

#[derive(Debug, Deserialize)]
struct LfsAction {
    href: String,
    #[serde(default)]
    header: HashMap<String, Value>,
}

impl LfsAction {
    /// Part size when the Hub asks for a multipart upload.
    fn chunk_size(&self) -> Option<u64> {
        match self.header.get("chunk_size")? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    /// Presigned part URLs, ordered by part number.
    fn part_urls(&self) -> Vec<String> {
        let mut parts: Vec<(u32, String)> = self
            .header
            .iter()
            .filter_map(|(key, value)| {
                let number = key.parse::<u32>().ok()?;
                Some((number, value.as_str()?.to_string()))
            })
            .collect();
        parts.sort_by_key(|(number, _)| *number);
        parts.into_iter().map(|(_, url)| url).collect()
    }

    /// Plain string headers to forward on a single PUT.
    fn forwarded_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.header
            .iter()
            .filter(|(key, _)| key.as_str() != "chunk_size" && key.parse::<u32>().is_err())
            .filter_map(|(key, value)| Some((key.as_str(), value.as_str()?)))
    }
}

#[derive(Debug, Deserialize)]
struct LfsObjectError {
    code: i64,
    message: String,
}

/// One operation in a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CommitOperation {
    Lfs { path: String, oid: String, size: u64 },
    Inline { path: String, content: Vec<u8> },
}

/// NDJSON body for `api/models/{id}/commit/main`.
fn commit_payload(summary: &str, operations: &[CommitOperation]) -> Result<String> {
    let mut lines = vec![serde_json::to_string(&json!({
        "key": "header",
        "value": { "summary": summary, "description": "" },
    }))?];

    for operation in operations {
        let line = match operation {
            CommitOperation::Lfs { path, oid, size } => json!({
                "key": "lfsFile",
                "value": { "path": path, "algo": "sha256", "oid": oid, "size": size },
            }),
            CommitOperation::Inline { path, content } => json!({
                "key": "file",
                "value": {
                    "content": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, content),
                    "path": path,
                    "encoding": "base64",
                },
            }),
        };
        lines.push(serde_json::to_string(&line)?);
    }

    Ok(lines.join("\n"))
}

/// `next` target of an RFC 8288 `Link` header.
fn next_page(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let start = part.find('<')? + 1;
            let end = part.find('>')?;
            (start < end).then(|| part[start..end].to_string())
        })
}

/// Percent-encode each segment of a repository path.
fn encode_repo_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Turn a non-2xx response into [`QuantError::Upstream`].
async fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(QuantError::Upstream {
        status: status.as_u16(),
        message: format!("{what}: {}", body.trim()),
    })
}

/// Stream `reader` as a request body.
fn stream_body<R>(reader: R) -> reqwest::Body
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = futures::stream::unfold(reader, |mut reader| async move {
        let mut buf = vec![0u8; BODY_CHUNK_SIZE];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<Bytes, std::io::Error>(Bytes::from(buf)), reader))
            }
            Err(e) => Some((Err(e), reader)),
        }
    });
    reqwest::Body::wrap_stream(stream)
}

async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file =
            std::fs::File::open(&path).map_err(|e| QuantError::io("opening file for hashing", &path, e))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| QuantError::io("hashing file", &path, e))?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| QuantError::Io {
        context: "joining hash task".to_string(),
        path: None,
        source: std::io::Error::other(e),
    })?
}

async fn read_sample(path: &Path) -> Result<Vec<u8>> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| QuantError::io("opening file for upload", path, e))?;
    let mut sample = Vec::with_capacity(PREUPLOAD_SAMPLE_BYTES);
    file.take(PREUPLOAD_SAMPLE_BYTES as u64)
        .read_to_end(&mut sample)
        .await
        .map_err(|e| QuantError::io("reading upload sample", path, e))?;
    Ok(sample)
}

/// A local file staged for upload.
#[derive(Debug)]
struct LocalFile {
    path: PathBuf,
    repo_path: String,
    size: u64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`ModelRegistry`] backed by the Hugging Face Hub HTTP API.
pub struct HuggingFaceRegistry {
    /// Client for API requests (has total timeout)
    client: Client,
    /// Client for file transfers (connect timeout only)
    transfer_client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for HuggingFaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HuggingFaceRegistry")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish()
    }
}

impl HuggingFaceRegistry {
    pub fn new() -> Result<Self> {
        Self::with_base_url(RegistryConfig::HUB_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(RegistryConfig::REQUEST_TIMEOUT)
            .user_agent(RegistryConfig::USER_AGENT)
            .build()
            .map_err(|e| QuantError::Network {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        // Multi-gigabyte transfers outlive any total timeout.
        let transfer_client = Client::builder()
            .connect_timeout(RegistryConfig::REQUEST_TIMEOUT)
            .user_agent(RegistryConfig::USER_AGENT)
            .build()
            .map_err(|e| QuantError::Network {
                message: format!("Failed to create transfer HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            transfer_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::upload(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn authorized(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    // -- Account and repository ---------------------------------------------

    async fn whoami(&self, token: &str) -> Result<String> {
        let url = format!("{}/api/whoami-v2", self.base_url);
        let response = self.client.get(&url).bearer_auth(token).send().await?;
        let whoami: WhoAmI = check(response, "resolving token owner").await?.json().await?;
        Ok(whoami.name)
    }

    async fn create_repo(&self, token: &str, owner: &str, name: &str, private: bool) -> Result<()> {
        let url = format!("{}/api/repos/create", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&json!({
                "type": "model",
                "name": name,
                "organization": owner,
                "private": private,
            }))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            info!("Repository {}/{} already exists", owner, name);
            return Ok(());
        }
        check(response, "creating repository").await?;
        info!("Created repository {}/{}", owner, name);
        Ok(())
    }

    // -- Download ------------------------------------------------------------

    async fn list_files(&self, repo_id: &str, token: Option<&str>) -> Result<Vec<TreeEntry>> {
        let mut next = Some(format!(
            "{}/api/models/{}/tree/main?recursive=true",
            self.base_url, repo_id
        ));
        let mut entries = Vec::new();

        while let Some(url) = next.take() {
            let response = Self::authorized(self.client.get(&url), token).send().await?;
            let response = check(response, "listing repository files").await?;
            next = next_page(response.headers());
            let page: Vec<TreeEntry> = response.json().await?;
            entries.extend(page);
        }
        Ok(entries)
    }

    async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
        token: Option<&str>,
    ) -> Result<()> {
        let part = dest.with_extension(match dest.extension() {
            Some(ext) => format!("{}.part", ext.to_string_lossy()),
            None => "part".to_string(),
        });

        let response = Self::authorized(self.transfer_client.get(url), token).send().await?;
        let response = check(response, "downloading file").await?;

        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| QuantError::io("creating download file", &part, e))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut next_log = RegistryConfig::DOWNLOAD_CHUNK_LOG_INTERVAL;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| QuantError::io("writing download", &part, e))?;
            downloaded += chunk.len() as u64;
            if downloaded >= next_log {
                debug!(
                    "{}: {:.2} / {:.2} GB",
                    dest.display(),
                    downloaded as f64 * 1e-9,
                    expected_size as f64 * 1e-9
                );
                next_log += RegistryConfig::DOWNLOAD_CHUNK_LOG_INTERVAL;
            }
        }
        file.flush()
            .await
            .map_err(|e| QuantError::io("flushing download", &part, e))?;
        drop(file);

        if expected_size > 0 && downloaded != expected_size {
            tokio::fs::remove_file(&part).await.ok();
            return Err(QuantError::Network {
                message: format!(
                    "Incomplete download of {}: got {} of {} bytes",
                    dest.display(),
                    downloaded,
                    expected_size
                ),
            });
        }

        tokio::fs::rename(&part, dest)
            .await
            .map_err(|e| QuantError::io("finalizing download", dest, e))?;
        Ok(())
    }

    // -- Upload --------------------------------------------------------------

    async fn preupload(
        &self,
        token: &str,
        repo_id: &str,
        files: &[LocalFile],
    ) -> Result<HashMap<String, PreuploadVerdict>> {
        let mut payload = Vec::with_capacity(files.len());
        for file in files {
            let sample = read_sample(&file.path).await?;
            payload.push(json!({
                "path": file.repo_path,
                "size": file.size,
                "sample": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &sample),
            }));
        }

        let url = format!("{}/api/models/{}/preupload/main", self.base_url, repo_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "files": payload }))
            .send()
            .await?;
        let verdicts: PreuploadResponse = check(response, "preupload").await?.json().await?;

        Ok(verdicts
            .files
            .into_iter()
            .map(|v| (v.path.clone(), v))
            .collect())
    }

    async fn lfs_batch(&self, token: &str, repo_id: &str, objects: &[(String, u64)]) -> Result<Vec<LfsBatchObject>> {
        let url = format!("{}/{}.git/info/lfs/objects/batch", self.base_url, repo_id);
        let objects: Vec<Value> = objects
            .iter()
            .map(|(oid, size)| json!({ "oid": oid, "size": size }))
            .collect();

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header(ACCEPT, LFS_CONTENT_TYPE)
            .header(CONTENT_TYPE, LFS_CONTENT_TYPE)
            .body(serde_json::to_vec(&json!({
                "operation": "upload",
                "transfers": ["basic", "multipart"],
                "objects": objects,
                "hash_algo": "sha256",
            }))?)
            .send()
            .await?;
        let batch: LfsBatchResponse = check(response, "LFS batch").await?.json().await?;
        Ok(batch.objects)
    }

    async fn put_single(&self, action: &LfsAction, file: &LocalFile) -> Result<()> {
        let handle = tokio::fs::File::open(&file.path)
            .await
            .map_err(|e| QuantError::io("opening file for upload", &file.path, e))?;

        let mut request = self
            .transfer_client
            .put(&action.href)
            .header(CONTENT_LENGTH, file.size)
            .body(stream_body(handle));
        for (key, value) in action.forwarded_headers() {
            request = request.header(key, value);
        }
        check(request.send().await?, "uploading LFS object").await?;
        Ok(())
    }

    async fn put_multipart(&self, action: &LfsAction, chunk_size: u64, oid: &str, file: &LocalFile) -> Result<()> {
        let urls = action.part_urls();
        let mut etags = Vec::with_capacity(urls.len());

        for (index, url) in urls.iter().enumerate() {
            let offset = index as u64 * chunk_size;
            let length = chunk_size.min(file.size.saturating_sub(offset));

            let mut handle = tokio::fs::File::open(&file.path)
                .await
                .map_err(|e| QuantError::io("opening file for upload", &file.path, e))?;
            handle
                .seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| QuantError::io("seeking upload part", &file.path, e))?;

            let response = self
                .transfer_client
                .put(url)
                .header(CONTENT_LENGTH, length)
                .body(stream_body(handle.take(length)))
                .send()
                .await?;
            let response = check(response, "uploading LFS part").await?;
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            debug!("{}: part {}/{} uploaded", file.repo_path, index + 1, urls.len());
            etags.push(json!({ "partNumber": index + 1, "etag": etag }));
        }

        let response = self
            .transfer_client
            .post(&action.href)
            .json(&json!({ "oid": oid, "parts": etags }))
            .send()
            .await?;
        check(response, "completing multipart upload").await?;
        Ok(())
    }

    async fn verify(&self, token: &str, action: &LfsAction, oid: &str, size: u64) -> Result<()> {
        let response = self
            .client
            .post(&action.href)
            .bearer_auth(token)
            .json(&json!({ "oid": oid, "size": size }))
            .send()
            .await?;
        check(response, "verifying LFS object").await?;
        Ok(())
    }

    async fn commit(&self, token: &str, repo_id: &str, operations: &[CommitOperation]) -> Result<()> {
        let url = format!("{}/api/models/{}/commit/main", self.base_url, repo_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(commit_payload(COMMIT_SUMMARY, operations)?)
            .send()
            .await?;
        check(response, "committing files").await?;
        Ok(())
    }

    /// One full upload attempt; returns the committed repository paths.
    async fn upload_files(&self, token: &str, repo_id: &str, paths: &[PathBuf]) -> Result<Vec<String>> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let size = tokio::fs::metadata(path)
                .await
                .map_err(|e| QuantError::io("reading upload file size", path, e))?
                .len();
            let repo_path = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            files.push(LocalFile {
                path: path.clone(),
                repo_path,
                size,
            });
        }

        let verdicts = self.preupload(token, repo_id, &files).await?;
        let mut operations = Vec::with_capacity(files.len());
        let mut lfs_files = Vec::new();

        for file in &files {
            match verdicts.get(&file.repo_path) {
                Some(v) if v.should_ignore => {
                    warn!("Hub ignores {}; skipping", file.repo_path);
                }
                Some(v) if v.upload_mode == "regular" => {
                    let content = tokio::fs::read(&file.path)
                        .await
                        .map_err(|e| QuantError::io("reading upload file", &file.path, e))?;
                    operations.push(CommitOperation::Inline {
                        path: file.repo_path.clone(),
                        content,
                    });
                }
                _ => {
                    debug!("Hashing {}", file.path.display());
                    let oid = sha256_file(&file.path).await?;
                    lfs_files.push((oid, file));
                }
            }
        }

        if !lfs_files.is_empty() {
            let requested: Vec<(String, u64)> =
                lfs_files.iter().map(|(oid, f)| (oid.clone(), f.size)).collect();
            let objects = self.lfs_batch(token, repo_id, &requested).await?;

            for object in objects {
                if let Some(error) = &object.error {
                    return Err(QuantError::Upstream {
                        status: u16::try_from(error.code).unwrap_or(500),
                        message: format!("LFS object {}: {}", object.oid, error.message),
                    });
                }
                let Some((_, file)) = lfs_files.iter().find(|(oid, _)| *oid == object.oid) else {
                    continue;
                };
                let Some(actions) = &object.actions else {
                    debug!("{} already stored on the Hub", file.repo_path);
                    continue;
                };
                if let Some(upload) = &actions.upload {
                    info!("Uploading {} ({:.2} GB)", file.repo_path, file.size as f64 * 1e-9);
                    match upload.chunk_size() {
                        Some(chunk_size) if chunk_size > 0 => {
                            self.put_multipart(upload, chunk_size, &object.oid, file).await?
                        }
                        _ => self.put_single(upload, file).await?,
                    }
                }
                if let Some(verify) = &actions.verify {
                    self.verify(token, verify, &object.oid, object.size).await?;
                }
            }

            for (oid, file) in &lfs_files {
                operations.push(CommitOperation::Lfs {
                    path: file.repo_path.clone(),
                    oid: oid.clone(),
                    size: file.size,
                });
            }
        }

        if operations.is_empty() {
            return Ok(Vec::new());
        }
        self.commit(token, repo_id, &operations).await?;

        Ok(operations
            .iter()
            .map(|op| match op {
                CommitOperation::Lfs { path, .. } | CommitOperation::Inline { path, .. } => path.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl ModelRegistry for HuggingFaceRegistry {
    async fn download(&self, repo_id: &str, cache_root: &Path) -> Result<PathBuf> {
        info!("Model {} not found locally. Checking Hugging Face Hub.", repo_id);
        let token = auth::resolve_token(None).map(|(token, _)| token);
        let entries = self.list_files(repo_id, token.as_deref()).await?;

        let snapshot = cache_root.join(snapshot_dir_name(repo_id));
        let mut fetched = 0usize;
        let mut reused = 0usize;

        for entry in entries
            .iter()
            .filter(|e| e.entry_type == "file" && !is_ignored_download(&e.path))
        {
            let dest = snapshot.join(&entry.path);
            let expected = entry.expected_size();

            if let Ok(meta) = tokio::fs::metadata(&dest).await {
                if meta.len() == expected {
                    reused += 1;
                    continue;
                }
            }
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| QuantError::io("creating download directory", parent, e))?;
            }

            let url = format!(
                "{}/{}/resolve/main/{}",
                self.base_url,
                repo_id,
                encode_repo_path(&entry.path)
            );
            debug!("Downloading {}", entry.path);
            self.download_file(&url, &dest, expected, token.as_deref()).await?;
            fetched += 1;
        }

        info!(
            "Snapshot of {} ready at {} ({} downloaded, {} already present)",
            repo_id,
            snapshot.display(),
            fetched,
            reused
        );
        Ok(snapshot)
    }

    async fn upload(&self, directory: &Path, target: &UploadTarget) -> Result<UploadReceipt> {
        let token = auth::require_token(target.token.as_deref())?;
        let owner = match &target.owner {
            Some(owner) => owner.clone(),
            None => self.whoami(&token).await?,
        };
        let repo_id = format!("{}/{}", owner, target.name);

        self.create_repo(&token, &owner, &target.name, target.private).await?;

        let paths = upload_candidates(directory)?;
        if paths.is_empty() {
            warn!("No .gguf files in {} to upload", directory.display());
            return Ok(UploadReceipt {
                repo_id,
                files: Vec::new(),
                attempts: 0,
            });
        }

        let (result, stats) =
            retry_transient(&self.retry, || self.upload_files(&token, &repo_id, &paths)).await;
        let files = result?;

        info!(
            "Uploaded {} file(s) to {} in {} attempt(s)",
            files.len(),
            repo_id,
            stats.attempts
        );
        if !stats.waited.is_zero() {
            debug!("Spent {:?} backing off between upload attempts", stats.waited);
        }
        Ok(UploadReceipt {
            repo_id,
            files,
            attempts: stats.attempts,
        })
    }
}
