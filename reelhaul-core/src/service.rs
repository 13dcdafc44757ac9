//! Runtime assembly and the trigger surface exposed to outer layers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::{
    CatalogError, ErrorCategory, ErrorLog, ErrorRecord, ErrorSubject, SourceType,
    SqliteVideoStore, VideoRecord, VideoStore,
};
use crate::config::IngestConfig;
use crate::discovery::{DiscoveryError, DiscoveryParams, DiscoveryResult, StrategyRegistry};
use crate::events::{DispatchError, EventDispatcher, EventEmitter, PipelineEvent};
use crate::index::{
    IndexError, IndexPage, IndexQuery, IndexResult, IndexSynchronizer, SearchIndex,
    SqliteSearchIndex, SyncReport,
};
use crate::processor::{
    build_encoder, encode_url, split_stored_path, BlobUploader, DownloadHandler, Encoder,
    FailureLog, ManifestFetcher, ProcessorError, RetryPolicy, UploadHandler,
};
use crate::reconcile::{BatchReconciler, SaveBatchHandler};
use crate::sink::ErrorSinkHandler;
use crate::storage::{BlobStore, LocalBlobStore, StorageError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("video {0} not found")]
    VideoNotFound(i64),
    #[error("video {0} has no stored blob")]
    NoStoredBlob(i64),
    #[error("blob {path} recorded for video {video_id} is missing from the object store")]
    BlobMissing { video_id: i64, path: String },
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Bytes of a stored video, ready to be served or written out.
#[derive(Debug, Clone)]
pub struct PlayableMedia {
    pub video: VideoRecord,
    pub bucket: String,
    pub path: String,
    pub bytes: Vec<u8>,
}

impl PlayableMedia {
    pub fn content_type(&self) -> &'static str {
        match Path::new(&self.path).extension().and_then(|ext| ext.to_str()) {
            Some("mp4") => "video/mp4",
            Some("ts") => "video/mp2t",
            _ => "application/octet-stream",
        }
    }

    pub async fn write_to(&self, destination: &Path) -> IngestResult<()> {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| ProcessorError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }
        fs::write(destination, &self.bytes)
            .await
            .map_err(|source| ProcessorError::Io {
                path: destination.to_path_buf(),
                source,
            })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadTrigger {
    pub accepted: Vec<i64>,
    pub missing: Vec<i64>,
}

/// Collaborators the runtime wires together. Swap any of them to run the
/// pipeline against other backends.
pub struct IngestComponents {
    pub videos: Arc<dyn VideoStore>,
    pub errors: Arc<dyn ErrorLog>,
    pub blobs: Arc<dyn BlobStore>,
    pub index: Arc<dyn SearchIndex>,
    pub fetcher: Arc<ManifestFetcher>,
    pub encoder: Arc<dyn Encoder>,
    pub registry: StrategyRegistry,
}

impl IngestComponents {
    /// SQLite catalog and index, filesystem blobs, configured encoder.
    pub fn from_config(config: &IngestConfig) -> IngestResult<Self> {
        let catalog = SqliteVideoStore::new(config.videos_db_path())?;
        catalog.initialize()?;
        let catalog = Arc::new(catalog);
        let index = SqliteSearchIndex::new(config.index_db_path());
        index.initialize()?;
        Ok(Self {
            videos: catalog.clone(),
            errors: catalog,
            blobs: Arc::new(LocalBlobStore::new(config.blob_root())),
            index: Arc::new(index),
            fetcher: Arc::new(ManifestFetcher::new(config)?),
            encoder: build_encoder(&config.encoder),
            registry: StrategyRegistry::from_config(config)?,
        })
    }
}

pub struct IngestRuntime {
    config: Arc<IngestConfig>,
    dispatcher: EventDispatcher,
    service: IngestService,
    periodic_sync: Option<JoinHandle<()>>,
}

impl IngestRuntime {
    /// Must be called from inside a tokio runtime.
    pub fn start(config: IngestConfig) -> IngestResult<Self> {
        let components = IngestComponents::from_config(&config)?;
        Self::assemble(config, components)
    }

    pub fn assemble(config: IngestConfig, components: IngestComponents) -> IngestResult<Self> {
        let failures = FailureLog::new(&config.logs_dir())?;
        let reconciler = BatchReconciler::new(components.videos.clone());
        let uploader = Arc::new(BlobUploader::new(
            components.blobs.clone(),
            components.videos.clone(),
            config.storage.bucket.clone(),
            RetryPolicy::for_storage(&config.storage),
        ));

        let dispatcher = EventDispatcher::builder()
            .handler(SaveBatchHandler::new(
                reconciler,
                config.download.auto_enqueue,
            ))
            .handler(ErrorSinkHandler::new(components.errors.clone()))
            .handler(DownloadHandler::new(
                components.fetcher.clone(),
                components.encoder.clone(),
                config.work_dir().join("encoded"),
                failures.clone(),
            ))
            .handler(UploadHandler::new(uploader, failures))
            .start();

        let synchronizer = IndexSynchronizer::new(
            components.videos.clone(),
            components.index.clone(),
            config.index.chunk_size,
            config.index.page_size,
        )
        .with_emitter(dispatcher.emitter());
        let periodic_sync = match config.index.sync_interval_seconds {
            0 => None,
            seconds => Some(synchronizer.spawn_periodic(Duration::from_secs(seconds))),
        };

        let service = IngestService {
            videos: components.videos,
            errors: components.errors,
            blobs: components.blobs,
            index: components.index,
            fetcher: components.fetcher,
            encoder: components.encoder,
            registry: Arc::new(components.registry),
            emitter: dispatcher.emitter(),
            synchronizer,
        };
        info!(
            node = %config.system.node_name,
            sources = ?service.registry.sources(),
            periodic_sync = periodic_sync.is_some(),
            "ingest runtime started"
        );
        Ok(Self {
            config: Arc::new(config),
            dispatcher,
            service,
            periodic_sync,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn service(&self) -> &IngestService {
        &self.service
    }

    /// Resolves once every queued event has been handled.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    /// Stops periodic sync and drains the event lanes.
    pub async fn shutdown(self) {
        if let Some(handle) = self.periodic_sync {
            handle.abort();
        }
        self.dispatcher.shutdown().await;
        info!("ingest runtime stopped");
    }
}

/// Fire-and-forget triggers plus the direct read paths.
#[derive(Clone)]
pub struct IngestService {
    videos: Arc<dyn VideoStore>,
    errors: Arc<dyn ErrorLog>,
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn SearchIndex>,
    fetcher: Arc<ManifestFetcher>,
    encoder: Arc<dyn Encoder>,
    registry: Arc<StrategyRegistry>,
    emitter: EventEmitter,
    synchronizer: IndexSynchronizer,
}

impl IngestService {
    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Resolves the strategy now and runs discovery in the background.
    /// Failures of the background pass are also recorded as error events.
    pub fn trigger_discovery(
        &self,
        source_type: SourceType,
        params: DiscoveryParams,
    ) -> IngestResult<JoinHandle<DiscoveryResult<usize>>> {
        let strategy = match self.registry.get_strategy(source_type) {
            Ok(strategy) => strategy,
            Err(err) => {
                self.report(ErrorRecord::new(
                    ErrorCategory::UnknownSourceType,
                    err.to_string(),
                    ErrorSubject::Source { source_type },
                ));
                return Err(err.into());
            }
        };
        let emitter = self.emitter.clone();
        info!(source = %source_type, "discovery triggered");
        Ok(tokio::spawn(async move {
            let outcome = strategy.execute(&params, &emitter).await;
            if let Err(err) = &outcome {
                warn!(source = %source_type, error = %err, "discovery failed");
                let record = ErrorRecord::new(
                    ErrorCategory::Discovery,
                    err.to_string(),
                    ErrorSubject::Source { source_type },
                );
                if let Err(dispatch) = emitter.emit(PipelineEvent::Error(record)) {
                    warn!(source = %source_type, error = %dispatch, "could not report discovery failure");
                }
            }
            outcome
        }))
    }

    /// Emits one download event per known id. Unknown ids are reported back.
    pub async fn trigger_download(&self, ids: &[i64]) -> IngestResult<DownloadTrigger> {
        let mut trigger = DownloadTrigger::default();
        for &id in ids {
            match self.videos.get_one(id).await? {
                Some(video) => {
                    self.emitter.emit(PipelineEvent::Download { video })?;
                    trigger.accepted.push(id);
                }
                None => {
                    warn!(video_id = id, "download requested for unknown video");
                    trigger.missing.push(id);
                }
            }
        }
        Ok(trigger)
    }

    pub fn trigger_sync(&self) -> JoinHandle<IndexResult<SyncReport>> {
        info!("index sync triggered");
        self.synchronizer.sync()
    }

    pub async fn watch(&self, video_id: i64) -> IngestResult<PlayableMedia> {
        let video = self
            .videos
            .get_one(video_id)
            .await?
            .ok_or(IngestError::VideoNotFound(video_id))?;
        let stored_path = video
            .stored_path
            .clone()
            .filter(|path| !path.trim().is_empty())
            .ok_or(IngestError::NoStoredBlob(video_id))?;
        let (bucket, key) =
            split_stored_path(&stored_path).ok_or_else(|| IngestError::BlobMissing {
                video_id,
                path: stored_path.clone(),
            })?;
        let bytes = match self.blobs.get(bucket, key).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { .. }) => {
                return Err(IngestError::BlobMissing {
                    video_id,
                    path: stored_path.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        Ok(PlayableMedia {
            bucket: bucket.to_string(),
            path: key.to_string(),
            bytes,
            video,
        })
    }

    pub async fn search(&self, query: &IndexQuery) -> IngestResult<IndexPage> {
        Ok(self.index.query(query).await?)
    }

    pub async fn recent_errors(
        &self,
        category: Option<ErrorCategory>,
        limit: usize,
    ) -> IngestResult<Vec<ErrorRecord>> {
        Ok(self.errors.recent_errors(category, limit).await?)
    }

    /// Fetches and encodes an arbitrary URL straight to `destination`.
    pub async fn encode_to_file(&self, url: &str, destination: &Path) -> IngestResult<PathBuf> {
        Ok(encode_url(&self.fetcher, self.encoder.as_ref(), url, destination).await?)
    }

    fn report(&self, record: ErrorRecord) {
        if let Err(err) = self.emitter.emit(PipelineEvent::Error(record)) {
            warn!(error = %err, "could not report pipeline error");
        }
    }
}
