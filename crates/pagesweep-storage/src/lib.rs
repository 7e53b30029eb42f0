//! HTTP transport + snapshot export utilities for pagesweep.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use pagesweep_core::{pass_through_key, FetchError, Record};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pagesweep-storage";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub name: String,
    pub relative_path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub endpoint_id: String,
    pub exported_at: DateTime<Utc>,
    pub directory: PathBuf,
    pub files: Vec<StoredFile>,
}

/// Writes accumulated records and run summaries under `<root>/<endpoint_id>/<stamp>/`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_dir(&self, endpoint_id: &str, started_at: DateTime<Utc>) -> PathBuf {
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(endpoint_id).join(stamp)
    }

    /// Write bytes via a temp file in the target directory, then rename into place.
    pub async fn write_atomic(&self, relative_path: &Path, bytes: &[u8]) -> anyhow::Result<StoredFile> {
        let absolute_path = self.root.join(relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        let name = relative_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(StoredFile {
            name,
            relative_path: relative_path.to_path_buf(),
            sha256: Self::sha256_hex(bytes),
            bytes: bytes.len() as u64,
        })
    }

    /// Export records as JSON + CSV alongside a summary document and a manifest.
    pub async fn export<S: Serialize>(
        &self,
        endpoint_id: &str,
        started_at: DateTime<Utc>,
        records: &[Record],
        summary: &S,
    ) -> anyhow::Result<ExportManifest> {
        let dir = self.snapshot_relative_dir(endpoint_id, started_at);

        let records_json = serde_json::to_vec_pretty(records).context("serializing records")?;
        let records_csv = records_to_csv(records)?;
        let summary_json = serde_json::to_vec_pretty(summary).context("serializing summary")?;

        let files = vec![
            self.write_atomic(&dir.join("records.json"), &records_json).await?,
            self.write_atomic(&dir.join("records.csv"), &records_csv).await?,
            self.write_atomic(&dir.join("summary.json"), &summary_json).await?,
        ];

        let manifest = ExportManifest {
            endpoint_id: endpoint_id.to_string(),
            exported_at: Utc::now(),
            directory: self.root.join(&dir),
            files,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
        self.write_atomic(&dir.join("manifest.json"), &manifest_bytes).await?;
        Ok(manifest)
    }
}

/// Flattens records to CSV: `id` first, then the union of top-level fields in first-seen order.
/// A stray `id` field is written under its pass-through name.
pub fn records_to_csv(records: &[Record]) -> anyhow::Result<Vec<u8>> {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for key in record.fields.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push("id");
    header.extend(columns.iter().map(|column| pass_through_key(*column)));
    writer.write_record(&header).context("writing csv header")?;

    for record in records {
        let mut row = Vec::with_capacity(columns.len() + 1);
        row.push(record.id.to_string());
        for column in &columns {
            row.push(match record.fields.get(*column) {
                None | Some(JsonValue::Null) => String::new(),
                Some(JsonValue::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            });
        }
        writer
            .write_record(&row)
            .with_context(|| format!("writing csv row for record {}", record.id))?;
    }

    writer.into_inner().context("flushing csv writer")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_endpoint_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_endpoint_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// A fully resolved request: headers and body are the caller's concern.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestSpec {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub json_body: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("concurrency limiter closed")]
    LimiterClosed,
}

impl From<HttpError> for FetchError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::HttpStatus { status, url } => FetchError::HttpStatus { status, url },
            other => FetchError::transport(other),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_endpoint_limit: usize,
    per_endpoint: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_endpoint_limit: config.per_endpoint_concurrency.max(1),
            per_endpoint: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_endpoint_semaphore(&self, endpoint_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_endpoint.lock().await;
        map.entry(endpoint_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_endpoint_limit)))
            .clone()
    }

    fn build_request(&self, spec: &HttpRequestSpec) -> reqwest::RequestBuilder {
        let mut request = match spec.method {
            HttpMethod::Get => self.client.get(&spec.url),
            HttpMethod::Post => self.client.post(&spec.url),
        };
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        if let Some(body) = &spec.json_body {
            request = request.json(body);
        }
        request
    }

    pub async fn send(
        &self,
        run_id: Uuid,
        endpoint_id: &str,
        spec: &HttpRequestSpec,
    ) -> Result<FetchedResponse, HttpError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::LimiterClosed)?;
        let per_endpoint = self.per_endpoint_semaphore(endpoint_id).await;
        let _endpoint = per_endpoint
            .acquire()
            .await
            .map_err(|_| HttpError::LimiterClosed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", %run_id, endpoint_id, url = %spec.url);
        self.send_with_retries(spec).instrument(span).await
    }

    async fn send_with_retries(&self, spec: &HttpRequestSpec) -> Result<FetchedResponse, HttpError> {
        let mut attempt = 0usize;
        loop {
            match self.build_request(spec).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(
                            status = status.as_u16(),
                            url = %final_url,
                            bytes = body.len(),
                            "response received"
                        );
                        return Ok(FetchedResponse { body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retrying after http status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "retrying after request error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }
}
