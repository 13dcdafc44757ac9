use clap::{Args, ValueEnum};

use reelhaul_core::{
    IndexPage, IndexQuery, IngestService, SortDirection, SortField, SourceType, SyncReport,
};

use crate::{parse_source, DisplayFallback, Result};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SortArg {
    Published,
    Created,
    Updated,
    Title,
    Id,
}

impl From<SortArg> for SortField {
    fn from(value: SortArg) -> Self {
        match value {
            SortArg::Published => SortField::PublishedAt,
            SortArg::Created => SortField::CreatedAt,
            SortArg::Updated => SortField::UpdatedAt,
            SortArg::Title => SortField::Title,
            SortArg::Id => SortField::Id,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DirectionArg {
    Asc,
    Desc,
}

impl From<DirectionArg> for SortDirection {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Asc => SortDirection::Asc,
            DirectionArg::Desc => SortDirection::Desc,
        }
    }
}

/// Queries the search index.
#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Case-insensitive substring of the title
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long, value_parser = parse_source)]
    pub source: Option<SourceType>,
    #[arg(long, value_enum, default_value_t = SortArg::Published)]
    pub sort: SortArg,
    #[arg(long, value_enum, default_value_t = DirectionArg::Desc)]
    pub direction: DirectionArg,
    /// 1-based page number
    #[arg(long, default_value_t = 1)]
    pub page: usize,
    #[arg(long, default_value_t = 20)]
    pub size: usize,
}

impl SearchArgs {
    pub fn query(&self) -> IndexQuery {
        IndexQuery {
            title: self.title.clone(),
            source_type: self.source,
            sort: self.sort.into(),
            direction: self.direction.into(),
            page: self.page.max(1),
            size: self.size.max(1),
        }
    }
}

impl DisplayFallback for SyncReport {
    fn display(&self) -> String {
        let mut line = format!(
            "scanned {} records, indexed {} in {} chunks",
            self.scanned, self.indexed, self.chunks
        );
        if !self.failed_chunks.is_empty() {
            let failed = self
                .failed_chunks
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            line.push_str(&format!(" (failed chunks: {failed})"));
        }
        line
    }
}

impl DisplayFallback for IndexPage {
    fn display(&self) -> String {
        if self.records.is_empty() {
            return format!("no matches (total {})", self.total);
        }
        let mut lines = vec![format!(
            "page {} of {} results",
            self.page, self.total
        )];
        for record in &self.records {
            lines.push(format!(
                "#{id} [{source}] {title} | published={published} | blob={blob}",
                id = record.id,
                source = record.source_type,
                title = record.title,
                published = record.published_at.format("%Y-%m-%d %H:%M"),
                blob = record.stored_path.as_deref().unwrap_or("-"),
            ));
        }
        lines.join("\n")
    }
}

pub async fn sync(service: &IngestService) -> Result<SyncReport> {
    Ok(service.trigger_sync().await??)
}

pub async fn search(service: &IngestService, args: &SearchArgs) -> Result<IndexPage> {
    Ok(service.search(&args.query()).await?)
}
