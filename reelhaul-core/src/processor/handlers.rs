use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::catalog::{ErrorCategory, ErrorRecord, VideoRecord};
use crate::events::{EventEmitter, EventHandler, EventKind, HandlerError, HandlerResult, PipelineEvent};

use super::encoder::Encoder;
use super::error::ProcessorError;
use super::fetcher::ManifestFetcher;
use super::retry::FailureLog;
use super::types::OutputDescriptor;
use super::uploader::BlobUploader;

fn report(
    emitter: &EventEmitter,
    handler: &'static str,
    category: ErrorCategory,
    video: &VideoRecord,
    error: &ProcessorError,
) -> HandlerResult {
    emitter
        .emit(PipelineEvent::Error(ErrorRecord::for_video(
            category,
            video,
            error.to_string(),
        )))
        .map(|_| ())
        .map_err(|err| HandlerError::new(handler, err))
}

/// Fetch then encode, handing the result to the upload stage.
pub struct DownloadHandler {
    fetcher: Arc<ManifestFetcher>,
    encoder: Arc<dyn Encoder>,
    output_dir: PathBuf,
    failures: FailureLog,
}

impl DownloadHandler {
    pub const NAME: &'static str = "download";

    pub fn new(
        fetcher: Arc<ManifestFetcher>,
        encoder: Arc<dyn Encoder>,
        output_dir: impl Into<PathBuf>,
        failures: FailureLog,
    ) -> Self {
        Self {
            fetcher,
            encoder,
            output_dir: output_dir.into(),
            failures,
        }
    }
}

#[async_trait]
impl EventHandler for DownloadHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn accepts(&self, kind: EventKind) -> bool {
        kind == EventKind::Download
    }

    async fn handle(&self, event: &PipelineEvent, emitter: &EventEmitter) -> HandlerResult {
        let PipelineEvent::Download { video } = event else {
            return Ok(());
        };
        if video.has_blob() {
            info!(video_id = video.id, "blob already stored, skipping download");
            return Ok(());
        }

        let stream = match self.fetcher.fetch(video.download_url()).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(video_id = video.id, error = %err, "download failed");
                self.failures.append("download", &err);
                return report(emitter, Self::NAME, ErrorCategory::Download, video, &err);
            }
        };

        let output = OutputDescriptor::for_video(&self.output_dir, video, self.encoder.extension());
        match self.encoder.encode(stream, &output).await {
            Ok(media) => emitter
                .emit(PipelineEvent::upload(video.clone(), media))
                .map(|_| ())
                .map_err(|err| HandlerError::new(Self::NAME, err)),
            Err(err) => {
                warn!(video_id = video.id, encoder = self.encoder.name(), error = %err, "encode failed");
                report(emitter, Self::NAME, ErrorCategory::Encode, video, &err)
            }
        }
    }
}

/// Claims the encoded file from an upload event and stores it.
pub struct UploadHandler {
    uploader: Arc<BlobUploader>,
    failures: FailureLog,
}

impl UploadHandler {
    pub const NAME: &'static str = "upload";

    pub fn new(uploader: Arc<BlobUploader>, failures: FailureLog) -> Self {
        Self { uploader, failures }
    }
}

#[async_trait]
impl EventHandler for UploadHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn accepts(&self, kind: EventKind) -> bool {
        kind == EventKind::Upload
    }

    async fn handle(&self, event: &PipelineEvent, emitter: &EventEmitter) -> HandlerResult {
        let PipelineEvent::Upload { video, media } = event else {
            return Ok(());
        };
        let Some(media) = media.claim() else {
            warn!(video_id = video.id, "upload event carried no media");
            return Ok(());
        };
        if let Err(err) = self.uploader.upload(video, media).await {
            warn!(video_id = video.id, error = %err, "upload failed");
            self.failures.append("upload", &err);
            return report(emitter, Self::NAME, ErrorCategory::Upload, video, &err);
        }
        Ok(())
    }
}
