mod json_feed;
mod m3u_index;

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::TryStreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use url::Url;

use crate::catalog::{SourceType, VideoDescriptor};
use crate::config::{IngestConfig, SourceEntry};
use crate::events::{DispatchError, EventEmitter, PipelineEvent};

pub use json_feed::JsonFeedStrategy;
pub use m3u_index::M3uIndexStrategy;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no strategy registered for source type {0}")]
    UnknownSourceType(SourceType),
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("failed to parse {url}: {message}")]
    Parse { url: String, message: String },
    #[error("http client setup failed: {0}")]
    ClientSetup(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Per-call overrides of a strategy's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryParams {
    pub base_url: Option<String>,
    pub max_pages: Option<u32>,
}

impl DiscoveryParams {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }
}

/// One crawler per source type. Adding a source means adding a variant here
/// and a registry entry, nothing else.
#[derive(Debug, Clone)]
pub enum RequestStrategy {
    JsonFeed(JsonFeedStrategy),
    M3uIndex(M3uIndexStrategy),
}

impl RequestStrategy {
    pub fn source_type(&self) -> SourceType {
        match self {
            RequestStrategy::JsonFeed(_) => SourceType::JsonFeed,
            RequestStrategy::M3uIndex(_) => SourceType::M3uIndex,
        }
    }

    /// A single lazy discovery pass. Pages are fetched as the stream is polled.
    pub fn discover(
        &self,
        params: &DiscoveryParams,
    ) -> BoxStream<'static, DiscoveryResult<VideoDescriptor>> {
        match self {
            RequestStrategy::JsonFeed(strategy) => strategy.discover(params),
            RequestStrategy::M3uIndex(strategy) => strategy.discover(params),
        }
    }

    /// Runs a full pass and hands everything found to the pipeline as one batch.
    pub async fn execute(
        &self,
        params: &DiscoveryParams,
        emitter: &EventEmitter,
    ) -> DiscoveryResult<usize> {
        let source_type = self.source_type();
        let videos: Vec<VideoDescriptor> = self.discover(params).try_collect().await?;
        let discovered = videos.len();
        if videos.is_empty() {
            info!(source = %source_type, "discovery found nothing");
            return Ok(0);
        }
        emitter.emit(PipelineEvent::SaveBatch {
            source_type,
            videos,
        })?;
        info!(source = %source_type, discovered, "discovery batch emitted");
        Ok(discovered)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<SourceType, Arc<RequestStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every enabled source from the configuration.
    pub fn from_config(config: &IngestConfig) -> DiscoveryResult<Self> {
        let client = Client::builder()
            .user_agent(config.download.user_agent.clone())
            .timeout(config.download.timeout())
            .connect_timeout(config.download.connect_timeout())
            .build()
            .map_err(|err| DiscoveryError::ClientSetup(err.to_string()))?;
        let mut registry = Self::new();
        let enabled = |entry: &Option<SourceEntry>| entry.clone().filter(|entry| entry.enabled);
        if let Some(entry) = enabled(&config.sources.json_feed) {
            registry.register(RequestStrategy::JsonFeed(JsonFeedStrategy::new(
                client.clone(),
                entry.base_url,
                entry.max_pages,
            )));
        }
        if let Some(entry) = enabled(&config.sources.m3u_index) {
            registry.register(RequestStrategy::M3uIndex(M3uIndexStrategy::new(
                client,
                entry.base_url,
            )));
        }
        Ok(registry)
    }

    pub fn register(&mut self, strategy: RequestStrategy) {
        self.strategies
            .insert(strategy.source_type(), Arc::new(strategy));
    }

    pub fn get_strategy(&self, source_type: SourceType) -> DiscoveryResult<Arc<RequestStrategy>> {
        self.strategies
            .get(&source_type)
            .cloned()
            .ok_or(DiscoveryError::UnknownSourceType(source_type))
    }

    pub fn sources(&self) -> Vec<SourceType> {
        let mut sources = self.strategies.keys().copied().collect::<Vec<_>>();
        sources.sort_by_key(|source| source.as_str());
        sources
    }
}

/// Reads a listing document over http(s) or from a `file://` URL.
async fn fetch_document(client: &Client, url: &str) -> DiscoveryResult<String> {
    let fetch_err = |message: String| DiscoveryError::Fetch {
        url: url.to_string(),
        message,
    };
    if let Ok(parsed) = Url::parse(url) {
        if parsed.scheme() == "file" {
            let path = parsed
                .to_file_path()
                .map_err(|_| fetch_err("not a local file path".into()))?;
            return fs::read_to_string(&path)
                .await
                .map_err(|err| fetch_err(format!("{}: {err}", path.display())));
        }
    }
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| fetch_err(err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(fetch_err(format!("status {status}")));
    }
    response.text().await.map_err(|err| fetch_err(err.to_string()))
}

/// Resolves `link` relative to the document it was found in.
fn resolve_link(document_url: &str, link: &str) -> Option<String> {
    if let Ok(absolute) = Url::parse(link) {
        return Some(absolute.to_string());
    }
    match Url::parse(document_url).and_then(|base| base.join(link)) {
        Ok(joined) => Some(joined.to_string()),
        Err(err) => {
            warn!(document = document_url, link, error = %err, "unresolvable link");
            None
        }
    }
}
