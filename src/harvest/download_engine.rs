//! Download Engine for the story harvester
//!
//! This module provides the consuming side of the pipeline:
//! 1. A fixed pool of workers pulling `MediaRef`s off the bounded queue
//! 2. Skipping media whose destination file already exists
//! 3. Streaming bodies into a temp file and publishing it with an atomic
//!    create-if-absent, so racing workers never clobber each other
//! 4. Retrying transient failures with exponential backoff, honouring 429s
//! 5. Recording permanent failures and moving on
//!
//! Once shutdown is requested workers stop taking items. Pending jitter and
//! backoff sleeps are cut short; only a fetch already on the wire finishes.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::harvest::media::{MediaError, MediaRef};
use crate::harvest::pacing::{calculate_backoff, Jitter, MAX_BACKOFF};
use crate::harvest::queue::MediaReceiver;
use crate::harvest::shutdown::Shutdown;

/// Error types for the download engine
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP error: {0}")]
    Status(u16),

    #[error("Download interrupted by shutdown")]
    Interrupted,
}

impl DownloadError {
    /// Whether another attempt could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Request(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            DownloadError::RateLimited { .. } => true,
            DownloadError::Status(status) => *status >= 500,
            DownloadError::Io(_) | DownloadError::Media(_) | DownloadError::Interrupted => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DownloadError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Delay before retrying after `error`. A server-supplied `Retry-After` is
/// honoured but never beyond [`MAX_BACKOFF`].
fn retry_delay(error: &DownloadError, attempt: usize, base_delay: Duration) -> Duration {
    error
        .retry_after()
        .map(|delay| delay.min(MAX_BACKOFF))
        .unwrap_or_else(|| calculate_backoff(attempt, base_delay))
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// What happened to one media item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The body was fetched and published at `path`.
    Downloaded { path: PathBuf, bytes: u64 },
    /// A file already existed at the destination; nothing was written.
    Skipped(PathBuf),
}

/// Download statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadStats {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_downloaded: u64,
}

/// A media item that could not be downloaded. One entry per destination;
/// a repeat failure replaces the error and bumps `attempts`.
#[derive(Debug, Clone)]
pub struct FailedDownload {
    pub source_url: String,
    pub owner_handle: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    /// Maximum number of idle connections per host
    pub max_idle_per_host: usize,
    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,
    /// Keep-alive timeout in seconds
    pub keep_alive_timeout_secs: u64,
    /// TCP socket keep-alive
    pub tcp_keepalive: bool,
    /// TCP nodelay
    pub tcp_nodelay: bool,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            connection_timeout_secs: 30,
            keep_alive_timeout_secs: 90,
            tcp_keepalive: true,
            tcp_nodelay: true,
        }
    }
}

/// Download engine configuration
#[derive(Debug, Clone)]
pub struct DownloadEngineConfig {
    pub workers: usize,
    pub retry_attempts: usize,
    pub base_retry_delay_ms: u64,
    /// Upper bound of the random pause before each fetch.
    pub max_jitter: Duration,
    pub download_dir: PathBuf,
    pub user_agent: String,
    /// Whole-request timeout, body included.
    pub timeout_seconds: u64,
    pub connection_pool: ConnectionPoolConfig,
}

impl Default for DownloadEngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            retry_attempts: 3,
            base_retry_delay_ms: 1000,
            max_jitter: Duration::from_secs(60),
            download_dir: PathBuf::from("./downloads"),
            user_agent: format!("story_harvester/{}", env!("CARGO_PKG_VERSION")),
            timeout_seconds: 60,
            connection_pool: ConnectionPoolConfig::default(),
        }
    }
}

/// Download engine shared by all workers
pub struct DownloadEngine {
    config: DownloadEngineConfig,
    client: Client,
    jitter: Jitter,
    stats: Mutex<DownloadStats>,
    failures: Mutex<HashMap<String, FailedDownload>>,
}

impl DownloadEngine {
    /// Create a new download engine
    pub fn new(config: DownloadEngineConfig) -> DownloadResult<Self> {
        let pool = &config.connection_pool;
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .pool_max_idle_per_host(pool.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(pool.keep_alive_timeout_secs))
            .connect_timeout(Duration::from_secs(pool.connection_timeout_secs))
            .tcp_keepalive(if pool.tcp_keepalive { Some(Duration::from_secs(60)) } else { None })
            .tcp_nodelay(pool.tcp_nodelay)
            .build()?;

        info!(
            workers = config.workers,
            timeout_secs = config.timeout_seconds,
            "Initialized download client for {}",
            config.download_dir.display()
        );

        std::fs::create_dir_all(&config.download_dir)?;

        Ok(Self {
            jitter: Jitter::new(config.max_jitter),
            config,
            client,
            stats: Mutex::new(DownloadStats::default()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the worker pool. Workers exit once `receiver`'s queue is closed
    /// and empty, or as soon as `shutdown` fires.
    pub fn start(self: &Arc<Self>, receiver: MediaReceiver, shutdown: Shutdown) -> WorkerPool {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers.max(1) {
            let engine = Arc::clone(self);
            let receiver = receiver.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { engine.run_worker(worker_id, receiver, shutdown).await });
        }

        info!("Download engine started with {} workers", workers.len());
        WorkerPool { workers }
    }

    async fn run_worker(&self, worker_id: usize, receiver: MediaReceiver, shutdown: Shutdown) {
        let mut stop = shutdown.clone();
        loop {
            let media = tokio::select! {
                biased;
                _ = stop.triggered() => {
                    debug!(worker_id, pending = receiver.len(), "Shutdown requested, worker exiting");
                    return;
                }
                next = receiver.next() => match next {
                    Some(media) => media,
                    None => break,
                },
            };

            match self.download(&media, &shutdown).await {
                Ok(DownloadOutcome::Downloaded { path, bytes }) => {
                    info!(worker_id, bytes, "Downloaded: {}", path.display());
                    {
                        let mut stats = self.stats.lock();
                        stats.downloaded += 1;
                        stats.bytes_downloaded += bytes;
                    }
                    self.clear_failure(&media);
                }
                Ok(DownloadOutcome::Skipped(path)) => {
                    debug!(worker_id, "Skipping: {}", path.display());
                    self.stats.lock().skipped += 1;
                    self.clear_failure(&media);
                }
                Err(DownloadError::Interrupted) => {
                    debug!(worker_id, url = media.source_url(), "Dropped by shutdown");
                    return;
                }
                Err(e) => {
                    error!(worker_id, url = media.source_url(), "Failed to download media: {}", e);
                    self.record_failure(&media, &e);
                }
            }
        }

        debug!(worker_id, "Work queue closed, worker exiting");
    }

    /// Destination path when it resolves, the URL otherwise.
    fn failure_key(&self, media: &MediaRef) -> String {
        media
            .destination(&self.config.download_dir)
            .map(|path| path.display().to_string())
            .unwrap_or_else(|_| media.source_url().to_string())
    }

    fn record_failure(&self, media: &MediaRef, error: &DownloadError) {
        self.stats.lock().failed += 1;

        let key = self.failure_key(media);
        let mut failures = self.failures.lock();
        let attempts = failures.get(&key).map_or(0, |previous| previous.attempts) + 1;
        failures.insert(key, FailedDownload {
            source_url: media.source_url().to_string(),
            owner_handle: media.owner_handle().to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
            attempts,
        });
    }

    fn clear_failure(&self, media: &MediaRef) {
        self.failures.lock().remove(&self.failure_key(media));
    }

    /// Get the current download stats
    pub fn stats(&self) -> DownloadStats {
        self.stats.lock().clone()
    }

    /// Items still failing, oldest failure first
    pub fn failures(&self) -> Vec<FailedDownload> {
        let mut failures: Vec<_> = self.failures.lock().values().cloned().collect();
        failures.sort_by(|a, b| {
            a.failed_at
                .cmp(&b.failed_at)
                .then_with(|| a.source_url.cmp(&b.source_url))
        });
        failures
    }

    /// Download one media item unless its destination already exists.
    ///
    /// The jitter pause and retry backoffs give way to `shutdown`, returning
    /// [`DownloadError::Interrupted`]; a fetch in progress is not cut off.
    #[instrument(
        skip(self, media, shutdown),
        fields(owner = media.owner_handle(), category = %media.category(), url = media.source_url())
    )]
    pub async fn download(&self, media: &MediaRef, shutdown: &Shutdown) -> DownloadResult<DownloadOutcome> {
        let destination = media.destination(&self.config.download_dir)?;

        if fs::try_exists(&destination).await? {
            return Ok(DownloadOutcome::Skipped(destination));
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        interruptible(shutdown, self.jitter.pause()).await?;

        let base_delay = Duration::from_millis(self.config.base_retry_delay_ms);
        let max_attempts = self.config.retry_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            if attempts > 1 {
                info!("Retry attempt {}/{}", attempts, max_attempts);
            }

            match self.fetch_to_destination(media, &destination).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    let backoff = retry_delay(&e, attempts, base_delay);
                    warn!("Download error: {}. Backing off for {:?}", e, backoff);
                    interruptible(shutdown, sleep(backoff)).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_to_destination(
        &self,
        media: &MediaRef,
        destination: &Path,
    ) -> DownloadResult<DownloadOutcome> {
        let response = self.client.get(media.source_url()).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(DownloadError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        let temp_path = temp_path_for(destination);
        let result = async {
            let bytes = Self::stream_to_file(response, &temp_path).await?;
            Self::publish(&temp_path, destination, bytes).await
        }
        .await;

        if let Err(e) = fs::remove_file(&temp_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", temp_path.display(), e);
            }
        }

        result
    }

    /// Stream a response to a file, returning the number of bytes written
    async fn stream_to_file(response: Response, file_path: &Path) -> DownloadResult<u64> {
        let mut file = File::create(file_path).await?;
        let mut stream = response.bytes_stream();
        let mut bytes_written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(bytes_written)
    }

    /// Link the finished temp file into place, failing if the destination
    /// already exists. Losing that race means another worker already
    /// published the same file.
    async fn publish(temp_path: &Path, destination: &Path, bytes: u64) -> DownloadResult<DownloadOutcome> {
        match fs::hard_link(temp_path, destination).await {
            Ok(()) => Ok(DownloadOutcome::Downloaded {
                path: destination.to_path_buf(),
                bytes,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("Lost publish race for {}", destination.display());
                Ok(DownloadOutcome::Skipped(destination.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Race `future` against the shutdown signal.
async fn interruptible<F: Future>(shutdown: &Shutdown, future: F) -> DownloadResult<F::Output> {
    let mut shutdown = shutdown.clone();
    tokio::select! {
        biased;
        _ = shutdown.triggered() => Err(DownloadError::Interrupted),
        output = future => Ok(output),
    }
}

fn temp_path_for(destination: &Path) -> PathBuf {
    let file_name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.{}.part", file_name, Uuid::new_v4()))
}

/// Handle to the running download workers
pub struct WorkerPool {
    workers: JoinSet<()>,
}

impl WorkerPool {
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit: after the queue closes and empties,
    /// or after shutdown once in-flight fetches finish.
    pub async fn drain(mut self) {
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!("Download worker terminated abnormally: {}", e);
            }
        }
        info!("Download engine stopped");
    }
}
