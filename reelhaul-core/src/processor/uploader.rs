use std::sync::Arc;

use hex::encode as hex_encode;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::catalog::{VideoRecord, VideoStore};
use crate::storage::BlobStore;

use super::error::{ProcessorError, ProcessorResult};
use super::retry::RetryPolicy;
use super::types::EncodedMedia;

/// Object key for a video's blob. Depends only on identity, so repeated
/// uploads of the same video land on the same object.
pub fn object_path(video: &VideoRecord, extension: &str) -> String {
    format!("{}/{}.{extension}", video.source_type, video.id)
}

/// Splits a stored path of the form `bucket/key` back into its parts.
pub fn split_stored_path(stored_path: &str) -> Option<(&str, &str)> {
    stored_path
        .split_once('/')
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
}

#[derive(Clone)]
pub struct BlobUploader {
    blobs: Arc<dyn BlobStore>,
    videos: Arc<dyn VideoStore>,
    bucket: String,
    retry: RetryPolicy,
}

impl BlobUploader {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        videos: Arc<dyn VideoStore>,
        bucket: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            blobs,
            videos,
            bucket: bucket.into(),
            retry,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Stores the media and records where it went. The media file is released
    /// when this returns, whatever the outcome.
    pub async fn upload(
        &self,
        video: &VideoRecord,
        media: EncodedMedia,
    ) -> ProcessorResult<VideoRecord> {
        let failed = |cause: String| ProcessorError::UploadFailed {
            video_id: video.id,
            cause,
        };
        let key = object_path(video, media.extension());
        let stored_path = format!("{}/{key}", self.bucket);
        let bytes = media.read().await.map_err(|err| failed(err.to_string()))?;
        drop(media);
        let digest = hex_encode(Sha256::digest(&bytes));
        let size_bytes = bytes.len();

        let (blobs, bucket, object_key, payload) =
            (&self.blobs, self.bucket.as_str(), key.as_str(), &bytes);
        self.retry
            .run("upload", move || async move {
                blobs
                    .put(bucket, object_key, payload.clone())
                    .await
                    .map_err(ProcessorError::from)
            })
            .await
            .map_err(|err| failed(err.to_string()))?;

        let current = self
            .videos
            .get_one(video.id)
            .await
            .map_err(|err| failed(err.to_string()))?
            .ok_or_else(|| failed("video no longer exists in catalog".into()))?;
        if current.stored_path.as_deref() == Some(stored_path.as_str()) {
            debug!(video_id = video.id, path = %stored_path, "blob path already recorded");
            return Ok(current);
        }
        let (videos, video_id, path) = (&self.videos, video.id, &stored_path);
        let updated = self
            .retry
            .run("record_path", move || async move {
                videos
                    .set_stored_path(video_id, path.clone())
                    .await
                    .map_err(ProcessorError::from)
            })
            .await
            .map_err(|err| failed(err.to_string()))?;
        info!(
            video_id = video.id,
            path = %stored_path,
            size_bytes,
            sha256 = %digest,
            "blob uploaded"
        );
        Ok(updated)
    }
}
