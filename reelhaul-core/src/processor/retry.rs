use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::config::{DownloadSection, StorageSection};

use super::error::{ProcessorError, ProcessorResult};

/// Bounded retry with a delay that grows linearly across the configured range.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_range_ms: [u64; 2],
    pub sleep_cap: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay_range_ms: [u64; 2]) -> Self {
        Self {
            attempts: attempts.max(1),
            delay_range_ms,
            sleep_cap: Duration::from_secs(60),
        }
    }

    pub fn immediate(attempts: u32) -> Self {
        Self::new(attempts, [0, 0])
    }

    pub fn with_sleep_cap(mut self, cap: Duration) -> Self {
        self.sleep_cap = cap;
        self
    }

    pub fn for_download(section: &DownloadSection) -> Self {
        Self::new(section.max_retries, section.retry_delay_ms)
            .with_sleep_cap(Duration::from_millis(section.retry_sleep_cap_ms))
    }

    pub fn for_storage(section: &StorageSection) -> Self {
        Self::new(section.max_retries, section.retry_delay_ms)
    }

    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let [min, max] = self.delay_range_ms;
        let (min, max) = (min.min(max), min.max(max));
        let base = if self.attempts <= 1 {
            min
        } else {
            let ratio = f64::from(attempt) / f64::from(self.attempts - 1);
            min + ((max - min) as f64 * ratio).round() as u64
        };
        let jitter = if base == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base / 10)
        };
        Duration::from_millis(base + jitter).min(self.sleep_cap)
    }

    /// Runs `operation` until it succeeds, fails permanently, or runs out of
    /// attempts. The last error is returned unchanged.
    pub async fn run<F, Fut, T>(&self, stage: &str, mut operation: F) -> ProcessorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProcessorResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() || attempt + 1 >= self.attempts => return Err(err),
                Err(err) => {
                    let wait = self.compute_delay(attempt);
                    warn!(attempt = attempt + 1, wait = ?wait, stage, error = %err, "retrying operation");
                    if !wait.is_zero() {
                        sleep(wait).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Plain-text trail of items that exhausted their retries.
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub const FILE_NAME: &'static str = "pipeline_failures.log";

    pub fn new(logs_dir: &Path) -> ProcessorResult<Self> {
        std::fs::create_dir_all(logs_dir).map_err(|source| ProcessorError::Io {
            path: logs_dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: logs_dir.join(Self::FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, stage: &str, error: &ProcessorError) {
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                writeln!(file, "{} [{}] {}", Utc::now().to_rfc3339(), stage, error)
            });
        if let Err(err) = written {
            warn!(path = %self.path.display(), error = %err, "failed to append failure log");
        }
    }
}
