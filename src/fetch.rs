#![forbid(unsafe_code)]

//! Fetch Worker: streams audio into the temp directory and pulls cover art,
//! both under the retry policy.

use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tempfile::TempPath;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineSettings;
use crate::error::FetchError;
use crate::transport::Transport;

/// Prefix of every temp file the pipeline creates; the start-up sweep keys on it.
pub const TEMP_PREFIX: &str = "bandfetch-";
pub const TEMP_SUFFIX: &str = ".part";
/// Byte progress is reported at most once per this many bytes.
pub const PROGRESS_STEP: u64 = 256 * 1024;
const MAX_BACKOFF: Duration = Duration::from_secs(8);
const SLEEP_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub retry_on_429: bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff_base: settings.backoff_base,
            retry_on_429: settings.retry_on_429,
        }
    }

    /// Delay after the `attempt`-th failure: base, 2×base, 4×base… capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(MAX_BACKOFF)
    }

    fn should_retry(&self, attempt: u32, err: &FetchError) -> bool {
        attempt < self.max_attempts.max(1) && err.is_retryable(self.retry_on_429)
    }
}

/// Blocking retry loop for callers already on the blocking pool. Returns the
/// value and the number of attempts it took.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: impl FnMut(u32, &FetchError),
    mut op: impl FnMut(u32) -> Result<T, FetchError>,
) -> Result<(T, u32), FetchError> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        attempt += 1;
        match op(attempt) {
            Ok(value) => return Ok((value, attempt)),
            Err(err) if policy.should_retry(attempt, &err) => {
                on_retry(attempt + 1, &err);
                if !sleep_unless_cancelled(policy.delay_for(attempt), cancel) {
                    return Err(FetchError::Cancelled);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    let mut remaining = delay;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    !cancel.is_cancelled()
}

/// What a running fetch tells its job owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchReport {
    Bytes(u64),
    Retrying { attempt: u32, error: FetchError },
}

pub type ReportFn = Arc<dyn Fn(FetchReport) + Send + Sync>;

/// A fully received audio stream. The temp file is removed when dropped.
#[derive(Debug)]
pub struct FetchedAudio {
    pub path: TempPath,
    pub bytes: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub error: FetchError,
    pub attempts: u32,
}

type ArtCache = HashMap<String, Arc<OnceCell<Option<Arc<Vec<u8>>>>>>;

pub struct Fetcher {
    transport: Arc<dyn Transport>,
    temp_dir: PathBuf,
    policy: RetryPolicy,
    art: Mutex<ArtCache>,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, temp_dir: PathBuf, policy: RetryPolicy) -> Self {
        Self {
            transport,
            temp_dir,
            policy,
            art: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Downloads `url` into a temp file. Backoff sleeps end early on
    /// cancellation; an attempt already running is allowed to finish.
    pub async fn fetch_audio(
        &self,
        url: &str,
        cancel: &CancellationToken,
        report: &ReportFn,
    ) -> Result<FetchedAudio, FetchFailure> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download_once(url, report.clone()).await {
                Ok((path, bytes)) => {
                    return Ok(FetchedAudio {
                        path,
                        bytes,
                        attempts: attempt,
                    });
                }
                Err(error) if self.policy.should_retry(attempt, &error) => {
                    warn!("Fetch of {url} failed (attempt {attempt}): {error}");
                    report(FetchReport::Retrying {
                        attempt: attempt + 1,
                        error,
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(FetchFailure { error: FetchError::Cancelled, attempts: attempt });
                        }
                        _ = tokio::time::sleep(self.policy.delay_for(attempt)) => {}
                    }
                }
                Err(error) => {
                    return Err(FetchFailure {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    async fn download_once(&self, url: &str, report: ReportFn) -> Result<(TempPath, u64), FetchError> {
        let transport = self.transport.clone();
        let temp_dir = self.temp_dir.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || -> Result<(TempPath, u64), FetchError> {
            std::fs::create_dir_all(&temp_dir)?;
            let mut file = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(TEMP_SUFFIX)
                .tempfile_in(&temp_dir)
                .map_err(|err| FetchError::Io(err.to_string()))?;

            let mut reported = 0u64;
            let info = {
                let mut writer = BufWriter::new(file.as_file_mut());
                let info = transport.download(&url, &mut writer, &mut |total| {
                    if total - reported >= PROGRESS_STEP {
                        reported = total;
                        report(FetchReport::Bytes(total));
                    }
                })?;
                writer
                    .flush()
                    .map_err(|err| FetchError::Io(err.to_string()))?;
                info
            };
            if info.bytes != reported {
                report(FetchReport::Bytes(info.bytes));
            }
            debug!("Fetched {} bytes from {url}", info.bytes);
            Ok((file.into_temp_path(), info.bytes))
        })
        .await
        .map_err(|err| FetchError::Io(format!("download task failed: {err}")))?
    }

    /// Cover art for `url`, shared between the tracks of an album. Callers
    /// arriving while the download is in flight wait for it instead of
    /// starting their own. Any failure yields `None`; art is never worth
    /// failing a track over.
    pub async fn fetch_art(&self, url: &str, cancel: &CancellationToken) -> Option<Arc<Vec<u8>>> {
        if url.is_empty() {
            return None;
        }
        let cell = self.art.lock().entry(url.to_string()).or_default().clone();
        // A cancelled download leaves the cell empty for a later batch.
        cell.get_or_try_init(|| self.download_art(url, cancel))
            .await
            .ok()
            .and_then(|art| art.clone())
    }

    async fn download_art(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Vec<u8>>>, FetchError> {
        let transport = self.transport.clone();
        let policy = self.policy;
        let cancel = cancel.clone();
        let owned_url = url.to_string();
        let result = tokio::task::spawn_blocking(move || {
            with_retry(
                &policy,
                &cancel,
                |_, _| {},
                |_| {
                    let mut bytes = Vec::new();
                    transport.download(&owned_url, &mut bytes, &mut |_: u64| {})?;
                    Ok(bytes)
                },
            )
        })
        .await;

        match result {
            Ok(Ok((bytes, _))) if !bytes.is_empty() => Ok(Some(Arc::new(bytes))),
            Ok(Ok(_)) => {
                warn!("Cover art at {url} is empty");
                Ok(None)
            }
            Ok(Err(FetchError::Cancelled)) => Err(FetchError::Cancelled),
            Ok(Err(err)) => {
                warn!("Cover art at {url} unavailable: {err}");
                Ok(None)
            }
            Err(err) => {
                warn!("Cover art task for {url} failed: {err}");
                Ok(None)
            }
        }
    }
}
