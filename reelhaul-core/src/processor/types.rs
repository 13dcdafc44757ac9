use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::fs;
use tracing::warn;

use crate::catalog::VideoRecord;

use super::error::{ProcessorError, ProcessorResult};

/// Container family of the spooled bytes, inferred from segment names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaContainer {
    MpegTs,
    Mp4,
    Unknown,
}

impl MediaContainer {
    pub fn from_uri(uri: &str) -> Self {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        let extension = Path::new(path)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        match extension.as_deref() {
            Some("ts") => MediaContainer::MpegTs,
            Some("mp4" | "m4s" | "m4v" | "mov") => MediaContainer::Mp4,
            _ => MediaContainer::Unknown,
        }
    }
}

/// Segment bytes joined in manifest order, spooled to a temporary file.
///
/// Single owner: the file is removed when the stream is dropped, whichever
/// stage holds it at that point.
#[derive(Debug)]
pub struct MediaStream {
    container: MediaContainer,
    segments: usize,
    size_bytes: u64,
    file: NamedTempFile,
}

impl MediaStream {
    pub(crate) fn new(
        container: MediaContainer,
        segments: usize,
        file: NamedTempFile,
    ) -> ProcessorResult<Self> {
        let size_bytes = file
            .as_file()
            .metadata()
            .map_err(|source| ProcessorError::Io {
                path: file.path().to_path_buf(),
                source,
            })?
            .len();
        Ok(Self {
            container,
            segments,
            size_bytes,
            file,
        })
    }

    /// Spools in-memory bytes into a stream, for callers that already hold
    /// the media.
    pub fn from_bytes(
        spool_dir: &Path,
        container: MediaContainer,
        bytes: &[u8],
    ) -> ProcessorResult<Self> {
        let io_err = |source| ProcessorError::Io {
            path: spool_dir.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(spool_dir).map_err(io_err)?;
        let file = tempfile::Builder::new()
            .prefix("stream-")
            .suffix(".part")
            .tempfile_in(spool_dir)
            .map_err(io_err)?;
        std::fs::write(file.path(), bytes).map_err(|source| ProcessorError::Io {
            path: file.path().to_path_buf(),
            source,
        })?;
        Self::new(container, 1, file)
    }

    pub fn container(&self) -> MediaContainer {
        self.container
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Where an encoder should place its output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDescriptor {
    pub video_id: Option<i64>,
    pub path: PathBuf,
}

impl OutputDescriptor {
    pub fn for_video(dir: &Path, video: &VideoRecord, extension: &str) -> Self {
        Self {
            video_id: Some(video.id),
            path: dir.join(format!("{}-{}.{extension}", video.source_type, video.id)),
        }
    }

    pub fn ad_hoc(path: impl Into<PathBuf>) -> Self {
        Self {
            video_id: None,
            path: path.into(),
        }
    }
}

/// An encoded, playable file on local disk.
///
/// Deleted on drop unless `persist` moved it somewhere permanent.
#[derive(Debug)]
pub struct EncodedMedia {
    video_id: Option<i64>,
    path: PathBuf,
    size_bytes: u64,
    persisted: bool,
}

impl EncodedMedia {
    pub fn from_file(video_id: Option<i64>, path: impl Into<PathBuf>) -> ProcessorResult<Self> {
        let path = path.into();
        let size_bytes = std::fs::metadata(&path)
            .map_err(|source| ProcessorError::Io {
                path: path.clone(),
                source,
            })?
            .len();
        Ok(Self {
            video_id,
            path,
            size_bytes,
            persisted: false,
        })
    }

    pub fn video_id(&self) -> Option<i64> {
        self.video_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extension(&self) -> &str {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin")
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub async fn read(&self) -> ProcessorResult<Vec<u8>> {
        fs::read(&self.path)
            .await
            .map_err(|source| ProcessorError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Moves the file to `destination` and keeps it past drop.
    pub async fn persist(mut self, destination: &Path) -> ProcessorResult<PathBuf> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ProcessorError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        if fs::rename(&self.path, destination).await.is_err() {
            fs::copy(&self.path, destination)
                .await
                .map_err(|source| ProcessorError::Io {
                    path: destination.to_path_buf(),
                    source,
                })?;
            if let Err(err) = fs::remove_file(&self.path).await {
                warn!(path = %self.path.display(), error = %err, "failed to remove encoded source after copy");
            }
        }
        self.persisted = true;
        Ok(destination.to_path_buf())
    }
}

impl Drop for EncodedMedia {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to release encoded media");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_is_inferred_from_uri() {
        assert_eq!(MediaContainer::from_uri("seg-001.ts"), MediaContainer::MpegTs);
        assert_eq!(
            MediaContainer::from_uri("https://cdn.test/v/1.m4s?token=abc"),
            MediaContainer::Mp4
        );
        assert_eq!(MediaContainer::from_uri("playlist"), MediaContainer::Unknown);
    }

    #[test]
    fn stream_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let stream =
            MediaStream::from_bytes(dir.path(), MediaContainer::MpegTs, b"abc")
                .unwrap();
        let path = stream.path().to_path_buf();
        assert_eq!(stream.size_bytes(), 3);
        assert!(path.exists());
        drop(stream);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn encoded_media_is_released_unless_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("a.mp4");
        std::fs::write(&scratch, b"movie").unwrap();
        drop(EncodedMedia::from_file(Some(1), &scratch).unwrap());
        assert!(!scratch.exists());

        std::fs::write(&scratch, b"movie").unwrap();
        let media = EncodedMedia::from_file(Some(1), &scratch).unwrap();
        let kept = dir.path().join("out/kept.mp4");
        media.persist(&kept).await.unwrap();
        assert!(kept.exists());
        assert!(!scratch.exists());
    }
}
