use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::catalog::{SourceType, VideoDescriptor};

use super::{fetch_document, resolve_link, DiscoveryError, DiscoveryParams, DiscoveryResult};

/// Paged JSON listing: `{"items": [...], "next": "page2.json"}`.
#[derive(Debug, Clone)]
pub struct JsonFeedStrategy {
    client: Client,
    base_url: String,
    max_pages: u32,
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    items: Vec<FeedItem>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedId {
    Text(String),
    Number(i64),
}

impl FeedId {
    fn into_string(self) -> String {
        match self {
            FeedId::Text(text) => text,
            FeedId::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    id: Option<FeedId>,
    title: Option<String>,
    url: Option<String>,
    #[serde(default)]
    stream_url: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

impl JsonFeedStrategy {
    pub fn new(client: Client, base_url: impl Into<String>, max_pages: u32) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            max_pages: max_pages.max(1),
        }
    }

    pub(super) fn discover(
        &self,
        params: &DiscoveryParams,
    ) -> BoxStream<'static, DiscoveryResult<VideoDescriptor>> {
        let start = params
            .base_url
            .clone()
            .unwrap_or_else(|| self.base_url.clone());
        let max_pages = params.max_pages.unwrap_or(self.max_pages).max(1);
        let client = self.client.clone();
        stream::try_unfold(
            (client, Some(start), 0u32),
            move |(client, next, pages)| async move {
                let Some(url) = next else {
                    return Ok::<_, DiscoveryError>(None);
                };
                if pages >= max_pages {
                    debug!(url = %url, max_pages, "page limit reached");
                    return Ok(None);
                }
                let body = fetch_document(&client, &url).await?;
                let page: FeedPage =
                    serde_json::from_str(&body).map_err(|err| DiscoveryError::Parse {
                        url: url.clone(),
                        message: err.to_string(),
                    })?;
                let following = page
                    .next
                    .filter(|link| !link.trim().is_empty())
                    .and_then(|link| resolve_link(&url, &link));
                let videos = page
                    .items
                    .into_iter()
                    .filter_map(|item| describe(&url, item))
                    .collect::<Vec<_>>();
                debug!(url = %url, found = videos.len(), "feed page read");
                Ok(Some((videos, (client, following, pages + 1))))
            },
        )
        .map_ok(|videos| stream::iter(videos.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }
}

fn describe(page_url: &str, item: FeedItem) -> Option<VideoDescriptor> {
    let (Some(id), Some(title), Some(url)) = (item.id, item.title, item.url) else {
        warn!(page = page_url, "feed item missing id, title or url");
        return None;
    };
    let source_url = resolve_link(page_url, &url)?;
    let mut descriptor = VideoDescriptor::new(SourceType::JsonFeed, id.into_string(), title, source_url);
    if let Some(stream_url) = item
        .stream_url
        .and_then(|stream_url| resolve_link(page_url, &stream_url))
    {
        descriptor = descriptor.with_real_url(stream_url);
    }
    descriptor.published_at = item.published_at;
    Some(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_without_identity_are_skipped() {
        let page: FeedPage = serde_json::from_str(
            r#"{"items":[
                {"id": 17, "title": "numbered", "url": "v/17", "stream_url": "v/17/index.m3u8",
                 "published_at": "2024-03-01T10:00:00Z"},
                {"title": "anonymous", "url": "v/x"}
            ]}"#,
        )
        .unwrap();
        let videos = page
            .items
            .into_iter()
            .filter_map(|item| describe("https://feeds.test/list.json", item))
            .collect::<Vec<_>>();
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].external_id, "17");
        assert_eq!(videos[0].source_url, "https://feeds.test/v/17");
        assert_eq!(
            videos[0].real_url.as_deref(),
            Some("https://feeds.test/v/17/index.m3u8")
        );
        assert!(videos[0].published_at.is_some());
    }
}
