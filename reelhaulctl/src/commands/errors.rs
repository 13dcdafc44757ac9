use clap::Args;
use serde::Serialize;

use reelhaul_core::{ErrorCategory, ErrorRecord, IngestService};

use crate::{DisplayFallback, Result};

/// Lists recorded pipeline failures, newest first.
#[derive(Args, Debug, Clone)]
pub struct ErrorsArgs {
    /// Only this category (download, encode, upload, batch_write, ...)
    #[arg(long, value_parser = parse_category)]
    pub category: Option<ErrorCategory>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

fn parse_category(raw: &str) -> std::result::Result<ErrorCategory, String> {
    raw.parse().map_err(|err: reelhaul_core::CatalogError| err.to_string())
}

#[derive(Debug, Serialize)]
pub struct ErrorList {
    pub rows: Vec<ErrorRecord>,
}

impl DisplayFallback for ErrorList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no errors recorded".to_string();
        }
        self.rows
            .iter()
            .map(|record| {
                format!(
                    "{at} [{category}] {message}",
                    at = record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    category = record.category,
                    message = record.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub async fn run(service: &IngestService, args: &ErrorsArgs) -> Result<ErrorList> {
    let rows = service.recent_errors(args.category, args.limit).await?;
    Ok(ErrorList { rows })
}
