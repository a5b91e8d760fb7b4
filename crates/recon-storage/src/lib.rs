//! HTTP fetch utilities, content fingerprints and checkpoint files for recon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use recon_core::{RecordKind, WorkspaceId};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint of a JSON document. Object keys serialize in sorted order, so
/// two documents that differ only in key order hash the same.
pub fn json_fingerprint(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_hex(&bytes)
}

/// Write `bytes` to `path` through a temp file in the same directory and an
/// atomic rename, so readers never observe a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Progress marker for one workspace + record kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub workspace_id: WorkspaceId,
    pub kind: RecordKind,
    pub last_processed_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, workspace_id: &WorkspaceId, kind: RecordKind) -> PathBuf {
        let safe_workspace = workspace_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect::<String>();
        self.root
            .join(safe_workspace)
            .join(format!("{}.json", kind.as_str()))
    }

    pub async fn load(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
    ) -> anyhow::Result<Option<Checkpoint>> {
        let path = self.path_for(workspace_id, kind);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking checkpoint path {}", path.display()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        let checkpoint = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing checkpoint {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<PathBuf> {
        let path = self.path_for(&checkpoint.workspace_id, checkpoint.kind);
        let bytes = serde_json::to_vec_pretty(checkpoint).context("serializing checkpoint")?;
        write_atomic(&path, &bytes).await?;
        debug!(
            workspace_id = %checkpoint.workspace_id,
            kind = %checkpoint.kind,
            last_processed_id = %checkpoint.last_processed_id,
            "checkpoint saved"
        );
        Ok(path)
    }

    pub async fn clear(&self, workspace_id: &WorkspaceId, kind: RecordKind) -> anyhow::Result<()> {
        let path = self.path_for(workspace_id, kind);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing checkpoint {}", path.display()))
            }
        }
    }
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
    /// No in-client retries; callers retry at a coarser level.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

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
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
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

    pub fn from_config(config: TokenBucketConfig) -> Self {
        Self::new(config.capacity, config.refill_every)
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

/// One outbound request, described independently of the client.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub json_body: Option<serde_json::Value>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            json_body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            json_body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("http client closed")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Closed => RetryDisposition::NonRetryable,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Closed => None,
        }
    }
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

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    fn build_request(&self, spec: &RequestSpec) -> reqwest::RequestBuilder {
        let mut request = self.client.request(spec.method.clone(), &spec.url);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.json_body {
            request = request.json(body);
        }
        request
    }

    /// Sends `spec`, retrying transient failures per the configured backoff.
    /// Non-2xx responses come back as [`FetchError::HttpStatus`] with the body.
    pub async fn send(
        &self,
        run_id: Uuid,
        source_id: &str,
        spec: RequestSpec,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, source_id, method = %spec.method, url = %spec.url);
        self.send_with_retries(&spec).instrument(span).await
    }

    async fn send_with_retries(&self, spec: &RequestSpec) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let error = match self.build_request(spec).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();

                    if status.is_success() {
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: String::from_utf8_lossy(&body).into_owned(),
                    }
                }
                Err(err) => FetchError::Request(err),
            };

            if error.disposition() == RetryDisposition::Retryable
                && attempt < self.backoff.max_retries
            {
                let delay = self.backoff.delay_for_attempt(attempt);
                debug!(attempt, ?delay, error = %error, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn json_fingerprint_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":[1,2]}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":[1,2],"a":1}"#).unwrap();
        assert_eq!(json_fingerprint(&a), json_fingerprint(&b));
        assert_ne!(json_fingerprint(&a), json_fingerprint(&json!({"a": 2})));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_separates_transient_failures() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn checkpoints_round_trip_and_clear() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        let workspace = WorkspaceId::new("ws/alpha");

        assert!(store
            .load(&workspace, RecordKind::Person)
            .await
            .expect("load")
            .is_none());

        let checkpoint = Checkpoint {
            run_id: Uuid::new_v4(),
            workspace_id: workspace.clone(),
            kind: RecordKind::Person,
            last_processed_id: "p-0042".into(),
            updated_at: Utc::now(),
        };
        let path = store.save(&checkpoint).await.expect("save");
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        let loaded = store
            .load(&workspace, RecordKind::Person)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded, checkpoint);
        assert!(store
            .load(&workspace, RecordKind::Company)
            .await
            .expect("load")
            .is_none());

        store.clear(&workspace, RecordKind::Person).await.expect("clear");
        store.clear(&workspace, RecordKind::Person).await.expect("clear twice");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn send_posts_json_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("apikey", "secret"))
            .and(body_json(json!({"q": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2])))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let spec = RequestSpec::post_json(format!("{}/search", server.uri()), json!({"q": 1}))
            .header("apikey", "secret");
        let resp = fetcher
            .send(Uuid::new_v4(), "coresignal", spec)
            .await
            .expect("response");
        assert_eq!(resp.json().expect("json"), json!([1, 2]));
    }

    #[tokio::test]
    async fn transient_statuses_are_retried_until_budget_is_spent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .expect("fetcher");

        let err = fetcher
            .send(
                Uuid::new_v4(),
                "coresignal",
                RequestSpec::get(format!("{}/flaky", server.uri())),
            )
            .await
            .expect_err("should fail");
        match err {
            FetchError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "busy");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_retry_policy_makes_a_single_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy::none(),
            ..Default::default()
        })
        .expect("fetcher");
        let err = fetcher
            .send(
                Uuid::new_v4(),
                "coresignal",
                RequestSpec::get(format!("{}/down", server.uri())),
            )
            .await
            .expect_err("should fail");
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
    }
}
