use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use reelhaul_core::IngestService;

use crate::{DisplayFallback, Result};

/// Copies a stored video out of the object store.
#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    pub id: i64,
    /// Where to write the media
    #[arg(short, long)]
    pub output: PathBuf,
}

/// Fetches and encodes a stream URL without touching the catalog.
#[derive(Args, Debug, Clone)]
pub struct EncodeArgs {
    /// HLS or DASH manifest, or a direct media URL
    #[arg(long)]
    pub url: String,
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct MediaWritten {
    pub video_id: Option<i64>,
    pub source: String,
    pub output: PathBuf,
    pub bytes: u64,
    pub content_type: Option<&'static str>,
}

impl DisplayFallback for MediaWritten {
    fn display(&self) -> String {
        let subject = match self.video_id {
            Some(id) => format!("video {id}"),
            None => self.source.clone(),
        };
        format!(
            "{subject} -> {} ({} bytes)",
            self.output.display(),
            self.bytes
        )
    }
}

pub async fn watch(service: &IngestService, args: &WatchArgs) -> Result<MediaWritten> {
    let media = service.watch(args.id).await?;
    media.write_to(&args.output).await?;
    Ok(MediaWritten {
        video_id: Some(media.video.id),
        source: format!("{}/{}", media.bucket, media.path),
        output: args.output.clone(),
        bytes: media.bytes.len() as u64,
        content_type: Some(media.content_type()),
    })
}

pub async fn encode(service: &IngestService, args: &EncodeArgs) -> Result<MediaWritten> {
    let written = service.encode_to_file(&args.url, &args.output).await?;
    let bytes = tokio::fs::metadata(&written).await?.len();
    Ok(MediaWritten {
        video_id: None,
        source: args.url.clone(),
        output: written,
        bytes,
        content_type: None,
    })
}
