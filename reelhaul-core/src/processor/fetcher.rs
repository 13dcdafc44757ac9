use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::Client;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};
use url::Url;

use crate::config::IngestConfig;

use super::error::{ProcessorError, ProcessorResult};
use super::manifest::{best_variant, Manifest};
use super::retry::RetryPolicy;
use super::types::{MediaContainer, MediaStream};

/// Resolves a video URL into one contiguous byte stream.
///
/// Accepts HLS media and master playlists, DASH `SegmentURL` manifests and
/// progressive files. `file://` URLs are read straight from disk.
#[derive(Debug, Clone)]
pub struct ManifestFetcher {
    client: Client,
    retry: RetryPolicy,
    spool_dir: PathBuf,
}

struct SegmentPlan {
    playlist_url: String,
    uris: Vec<String>,
    has_init: bool,
    duration: Option<f64>,
}

impl ManifestFetcher {
    pub fn new(config: &IngestConfig) -> ProcessorResult<Self> {
        let client = Client::builder()
            .user_agent(config.download.user_agent.clone())
            .timeout(config.download.timeout())
            .connect_timeout(config.download.connect_timeout())
            .build()
            .map_err(|err| ProcessorError::ClientSetup(err.to_string()))?;
        Ok(Self::with_client(
            client,
            RetryPolicy::for_download(&config.download),
            config.work_dir().join("spool"),
        ))
    }

    pub fn with_client(client: Client, retry: RetryPolicy, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            retry,
            spool_dir: spool_dir.into(),
        }
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Any failure, once retries are spent, surfaces as `DownloadFailed`.
    pub async fn fetch(&self, url: &str) -> ProcessorResult<MediaStream> {
        match self.fetch_stream(url).await {
            Ok(stream) => {
                info!(
                    url,
                    segments = stream.segments(),
                    size_bytes = stream.size_bytes(),
                    "media fetched"
                );
                Ok(stream)
            }
            Err(err) => Err(ProcessorError::DownloadFailed {
                url: url.to_string(),
                cause: err.to_string(),
            }),
        }
    }

    async fn fetch_stream(&self, url: &str) -> ProcessorResult<MediaStream> {
        if MediaContainer::from_uri(url) != MediaContainer::Unknown {
            return self.fetch_progressive(url).await;
        }
        let plan = self.plan_segments(url).await?;
        debug!(
            url,
            playlist = %plan.playlist_url,
            segments = plan.uris.len(),
            duration_secs = ?plan.duration,
            "segment plan ready"
        );
        let spool = self.create_spool()?;
        let mut offset = 0u64;
        for uri in &plan.uris {
            let segment_url = resolve_url(&plan.playlist_url, uri)?;
            let written = self
                .retry
                .run("segment", || self.append_once(&segment_url, spool.path(), offset))
                .await?;
            debug!(segment = %segment_url, bytes = written, "segment spooled");
            offset += written;
        }
        let first_media = plan
            .uris
            .get(usize::from(plan.has_init))
            .map(String::as_str)
            .unwrap_or_default();
        let container = if plan.has_init {
            MediaContainer::Mp4
        } else {
            MediaContainer::from_uri(first_media)
        };
        let segments = plan.uris.len() - usize::from(plan.has_init);
        MediaStream::new(container, segments, spool)
    }

    async fn plan_segments(&self, url: &str) -> ProcessorResult<SegmentPlan> {
        let manifest = self.fetch_manifest(url).await?;
        let (playlist_url, manifest) = match manifest {
            Manifest::HlsMaster(variants) => {
                let variant = best_variant(&variants).ok_or_else(|| {
                    ProcessorError::UnsupportedManifest {
                        url: url.to_string(),
                        reason: "master playlist lists no variants".into(),
                    }
                })?;
                let variant_url = resolve_url(url, &variant.uri)?;
                debug!(url, variant = %variant_url, bandwidth = variant.bandwidth, "following variant");
                let nested = self.fetch_manifest(&variant_url).await?;
                (variant_url, nested)
            }
            other => (url.to_string(), other),
        };
        match manifest {
            Manifest::HlsMedia(playlist) => {
                let duration = playlist.total_duration();
                let has_init = playlist.init_segment.is_some();
                let uris = playlist
                    .init_segment
                    .into_iter()
                    .chain(playlist.segments.into_iter().map(|segment| segment.uri))
                    .collect();
                Ok(SegmentPlan {
                    playlist_url,
                    uris,
                    has_init,
                    duration: Some(duration),
                })
            }
            Manifest::Dash(uris) => Ok(SegmentPlan {
                playlist_url,
                uris,
                has_init: false,
                duration: None,
            }),
            Manifest::HlsMaster(_) => Err(ProcessorError::UnsupportedManifest {
                url: playlist_url,
                reason: "nested master playlists are not supported".into(),
            }),
        }
    }

    async fn fetch_manifest(&self, url: &str) -> ProcessorResult<Manifest> {
        let contents = self
            .retry
            .run("manifest", || self.fetch_text_once(url))
            .await?;
        Manifest::parse(&contents).map_err(|reason| ProcessorError::UnsupportedManifest {
            url: url.to_string(),
            reason,
        })
    }

    async fn fetch_progressive(&self, url: &str) -> ProcessorResult<MediaStream> {
        let spool = self.create_spool()?;
        self.retry
            .run("progressive", || self.append_once(url, spool.path(), 0))
            .await?;
        MediaStream::new(MediaContainer::from_uri(url), 1, spool)
    }

    fn create_spool(&self) -> ProcessorResult<NamedTempFile> {
        let io_err = |source| ProcessorError::Io {
            path: self.spool_dir.clone(),
            source,
        };
        std::fs::create_dir_all(&self.spool_dir).map_err(io_err)?;
        tempfile::Builder::new()
            .prefix("fetch-")
            .suffix(".part")
            .tempfile_in(&self.spool_dir)
            .map_err(io_err)
    }

    async fn fetch_text_once(&self, url: &str) -> ProcessorResult<String> {
        if let Some(path) = file_url_path(url)? {
            return fs::read_to_string(&path)
                .await
                .map_err(|source| ProcessorError::Io { path, source });
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ProcessorError::network(url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProcessorError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .text()
            .await
            .map_err(|err| ProcessorError::network(url, err))
    }

    /// Writes the body of `url` into `path` starting at `offset`, discarding
    /// anything a previous failed attempt left past that point.
    async fn append_once(&self, url: &str, path: &Path, offset: u64) -> ProcessorResult<u64> {
        let io_err = |source| ProcessorError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(io_err)?;
        file.set_len(offset).await.map_err(io_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;

        let written = if let Some(source_path) = file_url_path(url)? {
            let mut reader = fs::File::open(&source_path)
                .await
                .map_err(|source| ProcessorError::Io {
                    path: source_path.clone(),
                    source,
                })?;
            tokio::io::copy(&mut reader, &mut file)
                .await
                .map_err(io_err)?
        } else {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| ProcessorError::network(url, err))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ProcessorError::Http {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            let mut body = response.bytes_stream();
            let mut written = 0u64;
            while let Some(chunk) = body.next().await {
                let data = chunk.map_err(|err| ProcessorError::network(url, err))?;
                file.write_all(&data).await.map_err(io_err)?;
                written += data.len() as u64;
            }
            written
        };
        file.flush().await.map_err(io_err)?;
        Ok(written)
    }
}

fn file_url_path(url: &str) -> ProcessorResult<Option<PathBuf>> {
    match Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => {
            parsed
                .to_file_path()
                .map(Some)
                .map_err(|_| ProcessorError::InvalidUrl {
                    url: url.to_string(),
                    reason: "not a local file path".into(),
                })
        }
        _ => Ok(None),
    }
}

pub(crate) fn resolve_url(base: &str, segment: &str) -> ProcessorResult<String> {
    if let Ok(parsed) = Url::parse(segment) {
        if matches!(parsed.scheme(), "file" | "http" | "https") {
            return Ok(segment.to_string());
        }
    }
    let invalid = |err: url::ParseError| ProcessorError::InvalidUrl {
        url: segment.to_string(),
        reason: err.to_string(),
    };
    let base = Url::parse(base).map_err(invalid)?;
    Ok(base.join(segment).map_err(invalid)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_resolve_against_playlist_location() {
        assert_eq!(
            resolve_url("https://cdn.example.test/v/1/index.m3u8", "seg-0.ts").unwrap(),
            "https://cdn.example.test/v/1/seg-0.ts"
        );
        assert_eq!(
            resolve_url("file:///srv/media/master.m3u8", "high/index.m3u8").unwrap(),
            "file:///srv/media/high/index.m3u8"
        );
        assert_eq!(
            resolve_url("https://a.test/x.m3u8", "https://b.test/y.ts").unwrap(),
            "https://b.test/y.ts"
        );
    }

    #[test]
    fn only_file_scheme_maps_to_disk() {
        assert_eq!(
            file_url_path("file:///tmp/a.m3u8").unwrap(),
            Some(PathBuf::from("/tmp/a.m3u8"))
        );
        assert_eq!(file_url_path("https://a.test/a.m3u8").unwrap(), None);
    }
}
