use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IngestConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub download: DownloadSection,
    pub encoder: EncoderSection,
    pub storage: StorageSection,
    pub index: IndexSection,
    #[serde(default)]
    pub sources: SourcesSection,
}

impl IngestConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn videos_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.videos_db)
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.index_db)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.work_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.logs_dir)
    }

    pub fn blob_root(&self) -> PathBuf {
        self.resolve_path(&self.storage.root_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub work_dir: String,
    pub logs_dir: String,
    pub videos_db: String,
    pub index_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    pub max_retries: u32,
    pub retry_delay_ms: [u64; 2],
    #[serde(default = "default_retry_sleep_cap_ms")]
    pub retry_sleep_cap_ms: u64,
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub user_agent: String,
    /// Emit a download event for every reconciled record still lacking a blob.
    #[serde(default)]
    pub auto_enqueue: bool,
}

impl DownloadSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    Remux,
    Concat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    pub kind: EncoderKind,
    pub ffmpeg_path: String,
    pub faststart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub bucket: String,
    pub root_dir: String,
    pub max_retries: u32,
    pub retry_delay_ms: [u64; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexSection {
    pub chunk_size: usize,
    pub page_size: usize,
    /// Zero disables the periodic synchronizer.
    #[serde(default)]
    pub sync_interval_seconds: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesSection {
    pub json_feed: Option<SourceEntry>,
    pub m3u_index: Option<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub enabled: bool,
    pub base_url: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_retry_sleep_cap_ms() -> u64 {
    30_000
}

fn default_max_pages() -> u32 {
    1
}

pub fn load_ingest_config<P: AsRef<Path>>(path: P) -> Result<IngestConfig> {
    let path = path.as_ref();
    let config: IngestConfig = load_toml(path)?;
    config.validate(path)?;
    Ok(config)
}

impl IngestConfig {
    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            path: path.to_path_buf(),
            field,
            reason: reason.to_string(),
        };
        if self.download.max_retries == 0 {
            return Err(invalid("download.max_retries", "must be greater than zero"));
        }
        if self.storage.max_retries == 0 {
            return Err(invalid("storage.max_retries", "must be greater than zero"));
        }
        if self.index.chunk_size == 0 {
            return Err(invalid("index.chunk_size", "must be greater than zero"));
        }
        if self.index.page_size == 0 {
            return Err(invalid("index.page_size", "must be greater than zero"));
        }
        if self.storage.bucket.trim().is_empty() {
            return Err(invalid("storage.bucket", "must not be empty"));
        }
        Ok(())
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
