//! Object store, dedup markers, secrets and retrying HTTP for subdigest.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod dedup;
mod secrets;

pub use dedup::{DedupStore, DedupStoreError, MemoryDedupStore, PgDedupStore};
pub use secrets::{
    CredentialProvider, EnvSecretSource, FileSecretSource, ForumCredentials, SecretError,
    SecretSource, DEFAULT_USER_AGENT,
};

pub const CRATE_NAME: &str = "subdigest-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub location: String,
    pub sha256: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Whole-object put with atomic visibility: readers see either no object or the full bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StoredObject, ObjectStoreError>;
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    /// Writes to a sibling temp file and renames it into place.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StoredObject, ObjectStoreError> {
        let absolute_path = self.resolve(key)?;
        let parent = absolute_path
            .parent()
            .ok_or_else(|| ObjectStoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating object directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write_result: anyhow::Result<()> = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp object file {}", temp_path.display()))?;
            file.write_all(bytes)
                .await
                .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
            file.sync_all()
                .await
                .with_context(|| format!("syncing temp object file {}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &absolute_path).await.with_context(|| {
                format!(
                    "atomically renaming temp object {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            })
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        Ok(StoredObject {
            key: key.to_string(),
            location: absolute_path.display().to_string(),
            sha256: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
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

/// Seconds-form `Retry-After`; HTTP-date form is ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
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
    /// No sleeping between attempts; used by tests and dry runs.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `base_delay` doubled once per earlier attempt, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        u32::try_from(attempt_index)
            .ok()
            .and_then(|doublings| 2u32.checked_pow(doublings))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Provider-signalled delay wins when longer, bounded by `MAX_RETRY_AFTER`.
    pub fn delay_with_hint(&self, attempt_index: usize, hint: Option<Duration>) -> Duration {
        let own = self.delay_for_attempt(attempt_index);
        match hint {
            Some(hint) => own.max(hint.min(MAX_RETRY_AFTER)),
            None => own,
        }
    }

    /// Like `delay_with_hint`, but `None` when sleeping would use up `remaining`.
    /// Callers with a run deadline give up instead of waking after it.
    pub fn delay_within(
        &self,
        attempt_index: usize,
        hint: Option<Duration>,
        remaining: Option<Duration>,
    ) -> Option<Duration> {
        let delay = self.delay_with_hint(attempt_index, hint);
        match remaining {
            Some(remaining) if delay >= remaining => None,
            _ => Some(delay),
        }
    }
}

const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
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

/// Paces outgoing requests: `capacity` requests back to back, then one more per
/// `refill_every`. A caller with no token sleeps until the next one is due.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    next_token_at: Instant,
}

impl BucketState {
    fn full(capacity: u32, refill_every: Duration, now: Instant) -> Self {
        Self {
            tokens: capacity,
            next_token_at: now + refill_every,
        }
    }

    /// Credits every token that came due by `now`. A full bucket does not bank
    /// time, so the next token is a whole interval after the bucket drains.
    fn refill(&mut self, capacity: u32, refill_every: Duration, now: Instant) {
        if refill_every.is_zero() {
            self.tokens = capacity;
            return;
        }
        while self.tokens < capacity && self.next_token_at <= now {
            self.tokens += 1;
            self.next_token_at += refill_every;
        }
        if self.tokens == capacity && self.next_token_at < now {
            self.next_token_at = now + refill_every;
        }
    }

    /// Takes a token, or reports how long until one is due.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        if self.tokens > 0 {
            self.tokens -= 1;
            Ok(())
        } else {
            Err(self.next_token_at.saturating_duration_since(now))
        }
    }
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(BucketState::full(
                config.capacity.max(1),
                config.refill_every,
                Instant::now(),
            )),
        }
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refill(self.capacity, self.refill_every, now);
                match state.try_take(now) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    pub fn is_throttled(&self) -> bool {
        self.status() == Some(429)
    }
}

/// Shared reqwest client with a concurrency cap, optional token bucket and bounded retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<TokenBucket>>,
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
            .map(|c| Arc::new(TokenBucket::new(c)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Sends the request built by `build` until it succeeds, fails permanently or
    /// exhausts the retry budget. `build` is called once per attempt.
    pub async fn send<F>(&self, label: &str, build: F) -> Result<HttpResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.send_with_backoff(label, self.backoff, build).await
    }

    pub async fn send_with_backoff<F>(
        &self,
        label: &str,
        backoff: BackoffPolicy,
        build: F,
    ) -> Result<HttpResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_send", label);
        async {
            let mut attempt = 0usize;
            loop {
                let _permit = self.limit.acquire().await.expect("semaphore not closed");
                if let Some(bucket) = &self.token_bucket {
                    bucket.take().await;
                }

                match build(&self.client).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        let hint = retry_after(resp.headers());

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(HttpResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < backoff.max_retries
                        {
                            let delay = backoff.delay_with_hint(attempt, hint);
                            debug!(status = status.as_u16(), attempt, ?delay, "retrying");
                            drop(_permit);
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }

                        let body = resp.text().await.unwrap_or_default();
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            body: body.chars().take(300).collect(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < backoff.max_retries
                        {
                            let delay = backoff.delay_for_attempt(attempt);
                            debug!(error = %err, attempt, ?delay, "retrying");
                            drop(_permit);
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
