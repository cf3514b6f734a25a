//! Local feed archive cache + HTTP fetch utilities for nvdfeed.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use nvdfeed_core::FeedArchive;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nvdfeed-storage";

#[derive(Debug, Clone)]
pub struct StoredFeed {
    pub archive: FeedArchive,
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
    pub replaced: bool,
}

/// Directory holding downloaded NVD archives under their published file names.
#[derive(Debug, Clone)]
pub struct FeedCache {
    root: PathBuf,
}

impl FeedCache {
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

    pub fn path_for(&self, archive: &FeedArchive) -> PathBuf {
        self.root.join(archive.file_name())
    }

    pub async fn contains(&self, archive: &FeedArchive) -> anyhow::Result<bool> {
        let path = self.path_for(archive);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking feed archive {}", path.display()))
    }

    pub async fn read(&self, archive: &FeedArchive) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(archive);
        fs::read(&path)
            .await
            .with_context(|| format!("reading feed archive {}", path.display()))
    }

    /// Last write time of the cached archive, `None` when it is not cached.
    pub async fn modified_at(&self, archive: &FeedArchive) -> anyhow::Result<Option<DateTime<Utc>>> {
        let path = self.path_for(archive);
        match fs::metadata(&path).await {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .with_context(|| format!("reading mtime of {}", path.display()))?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
        }
    }

    /// Writes an archive via temp file + rename, replacing any existing copy.
    pub async fn store_bytes(&self, archive: &FeedArchive, bytes: &[u8]) -> anyhow::Result<StoredFeed> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking cache directory {}", self.root.display()))?
        {
            info!(dir = %self.root.display(), "feed cache directory missing; creating it");
            fs::create_dir_all(&self.root)
                .await
                .with_context(|| format!("creating cache directory {}", self.root.display()))?;
        }

        let path = self.path_for(archive);
        let replaced = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking feed archive {}", path.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp archive {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredFeed {
            archive: *archive,
            path,
            sha256: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
            replaced,
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
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
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
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// One request per `interval`; `None` when the interval is zero.
    pub fn spaced(interval: Duration) -> Option<Self> {
        if interval.is_zero() {
            None
        } else {
            Some(Self {
                capacity: 1,
                refill_every: interval,
            })
        }
    }
}

/// Paces archive downloads; NVD rate-limits clients that fetch back to back.
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
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
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

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            info!(wait_secs = sleep_for.as_secs(), "pacing NVD download");
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Starts the refill interval over from now, so the next token is due one
    /// full interval after a download finishes rather than after it started.
    pub async fn restart_refill(&self) {
        self.state.lock().await.last_refill = Instant::now();
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(attempt, status = status.as_u16(), "retrying NVD request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(attempt, error = %err, "retrying NVD request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
