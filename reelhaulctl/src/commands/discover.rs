use clap::Args;
use serde::Serialize;

use reelhaul_core::{DiscoveryParams, IngestService, SourceType};

use crate::{parse_source, DisplayFallback, Result};

/// Runs one discovery pass for a source and persists what it finds.
#[derive(Args, Debug, Clone)]
pub struct DiscoverArgs {
    /// Source to crawl (json_feed | m3u_index)
    #[arg(value_parser = parse_source)]
    pub source: SourceType,

    /// Start from this listing instead of the configured one
    #[arg(long)]
    pub base_url: Option<String>,

    /// Upper bound on listing pages walked in this pass
    #[arg(long)]
    pub max_pages: Option<u32>,
}

impl DiscoverArgs {
    fn params(&self) -> DiscoveryParams {
        let mut params = DiscoveryParams::default();
        if let Some(base_url) = &self.base_url {
            params = params.with_base_url(base_url);
        }
        if let Some(max_pages) = self.max_pages {
            params = params.with_max_pages(max_pages);
        }
        params
    }
}

#[derive(Debug, Serialize)]
pub struct DiscoverOutcome {
    pub source: SourceType,
    pub discovered: usize,
}

impl DisplayFallback for DiscoverOutcome {
    fn display(&self) -> String {
        format!("{}: {} videos discovered", self.source, self.discovered)
    }
}

pub async fn run(service: &IngestService, args: &DiscoverArgs) -> Result<DiscoverOutcome> {
    let handle = service.trigger_discovery(args.source, args.params())?;
    let discovered = handle.await??;
    Ok(DiscoverOutcome {
        source: args.source,
        discovered,
    })
}
