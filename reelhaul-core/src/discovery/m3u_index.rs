use futures::stream::{self, BoxStream, StreamExt};
use hex::encode as hex_encode;
use regex::Regex;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::catalog::{SourceType, VideoDescriptor};

use super::{fetch_document, resolve_link, DiscoveryError, DiscoveryParams, DiscoveryResult};

/// Single extended-M3U listing whose entries point at stream manifests.
#[derive(Debug, Clone)]
pub struct M3uIndexStrategy {
    client: Client,
    base_url: String,
}

impl M3uIndexStrategy {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub(super) fn discover(
        &self,
        params: &DiscoveryParams,
    ) -> BoxStream<'static, DiscoveryResult<VideoDescriptor>> {
        let url = params
            .base_url
            .clone()
            .unwrap_or_else(|| self.base_url.clone());
        let client = self.client.clone();
        stream::once(async move {
            let body = fetch_document(&client, &url).await?;
            let videos = parse_index(&url, &body)?;
            debug!(url = %url, found = videos.len(), "index read");
            Ok::<_, DiscoveryError>(videos)
        })
        .flat_map(|result| match result {
            Ok(videos) => stream::iter(videos.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(err) => stream::iter(vec![Err(err)]),
        })
        .boxed()
    }
}

fn parse_index(index_url: &str, body: &str) -> DiscoveryResult<Vec<VideoDescriptor>> {
    let parse_err = |message: &str| DiscoveryError::Parse {
        url: index_url.to_string(),
        message: message.to_string(),
    };
    if !body.trim_start().starts_with("#EXTM3U") {
        return Err(parse_err("missing #EXTM3U header"));
    }
    let id_attr = Regex::new(r#"tvg-id="([^"]*)""#).map_err(|err| parse_err(&err.to_string()))?;
    let mut videos = Vec::new();
    let mut pending: Option<(Option<String>, String)> = None;
    for line in body.lines().map(str::trim) {
        if let Some(info) = line.strip_prefix("#EXTINF:") {
            let (attributes, title) = info.split_once(',').unwrap_or((info, ""));
            let external_id = id_attr
                .captures(attributes)
                .and_then(|captures| captures.get(1))
                .map(|id| id.as_str().trim().to_string())
                .filter(|id| !id.is_empty());
            pending = Some((external_id, title.trim().to_string()));
        } else if line.starts_with('#') || line.is_empty() {
            continue;
        } else if let Some((external_id, title)) = pending.take() {
            let Some(stream_url) = resolve_link(index_url, line) else {
                continue;
            };
            let external_id = external_id.unwrap_or_else(|| url_digest(&stream_url));
            let title = if title.is_empty() {
                external_id.clone()
            } else {
                title
            };
            videos.push(
                VideoDescriptor::new(SourceType::M3uIndex, external_id, title, stream_url.clone())
                    .with_real_url(stream_url),
            );
        }
    }
    Ok(videos)
}

/// Stable identity for entries that carry no id of their own.
fn url_digest(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex_encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_use_tvg_id_or_url_digest() {
        let body = "#EXTM3U\n\
            #EXTINF:-1 tvg-id=\"news-1\" group-title=\"News\",Morning News\n\
            streams/news-1/index.m3u8\n\
            #EXTINF:-1,\n\
            https://cdn.test/raw/clip.m3u8\n";
        let videos = parse_index("https://lists.test/index.m3u", body).unwrap();
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].external_id, "news-1");
        assert_eq!(videos[0].title, "Morning News");
        assert_eq!(
            videos[0].real_url.as_deref(),
            Some("https://lists.test/streams/news-1/index.m3u8")
        );
        assert_eq!(videos[1].external_id.len(), 16);
        assert_eq!(videos[1].external_id, url_digest("https://cdn.test/raw/clip.m3u8"));
        assert_eq!(videos[1].title, videos[1].external_id);
    }

    #[test]
    fn non_playlist_body_is_a_parse_error() {
        let err = parse_index("https://lists.test/index.m3u", "<html/>").unwrap_err();
        assert!(matches!(err, DiscoveryError::Parse { .. }));
    }
}
