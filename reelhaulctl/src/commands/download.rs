use clap::Args;

use reelhaul_core::{DownloadTrigger, IngestService};

use crate::{DisplayFallback, Result};

/// Fetches, encodes and stores the given catalog videos.
#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Internal video ids
    #[arg(required = true, num_args = 1..)]
    pub ids: Vec<i64>,
}

impl DisplayFallback for DownloadTrigger {
    fn display(&self) -> String {
        let mut lines = vec![format!("queued: {}", join_ids(&self.accepted))];
        if !self.missing.is_empty() {
            lines.push(format!("unknown: {}", join_ids(&self.missing)));
        }
        lines.join("\n")
    }
}

fn join_ids(ids: &[i64]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub async fn run(service: &IngestService, args: &DownloadArgs) -> Result<DownloadTrigger> {
    Ok(service.trigger_download(&args.ids).await?)
}
