//! CLI `search` and `similar` subcommands.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use mosaic::config::MosaicConfig;
use mosaic::search::{Caller, SearchFilters, SearchHit, SearchResult};
use mosaic::service::{LocalStack, QueryInput, SearchParams};

/// Scope, filter and paging flags shared by `search` and `similar`.
#[derive(Args, Debug, Clone)]
pub struct QueryOptions {
    /// all, shared, my_images, owner:<id> or collection:<id>
    #[arg(long, default_value = "all")]
    pub scope: String,
    /// Run as this user id (anonymous if omitted)
    #[arg(long)]
    pub as_user: Option<String>,
    /// Run with elevated privileges
    #[arg(long)]
    pub elevated: bool,
    /// Restrict to a content type (repeatable)
    #[arg(long = "content-type")]
    pub content_types: Vec<String>,
    /// Restrict to media carrying any of these tags (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    /// Uploaded on or after (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub from: Option<String>,
    /// Uploaded on or before (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub to: Option<String>,
    /// Minimum cosine similarity
    #[arg(long)]
    pub threshold: Option<f32>,
    #[arg(long)]
    pub page: Option<usize>,
    #[arg(long)]
    pub page_size: Option<usize>,
    /// Print the raw result as JSON
    #[arg(long)]
    pub json: bool,
}

impl QueryOptions {
    fn caller(&self) -> Caller {
        match &self.as_user {
            Some(user) => Caller::user(user.clone()),
            None => Caller::anonymous(),
        }
        .with_elevated(self.elevated)
    }

    fn params(&self) -> Result<SearchParams> {
        let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());
        let filters = SearchFilters {
            content_types: non_empty(&self.content_types),
            tags: non_empty(&self.tags),
            uploaded_from: self
                .from
                .as_deref()
                .map(|raw| super::parse_date_bound(raw, false))
                .transpose()?,
            uploaded_to: self
                .to
                .as_deref()
                .map(|raw| super::parse_date_bound(raw, true))
                .transpose()?,
        };
        Ok(SearchParams {
            scope: self.scope.clone(),
            filters,
            threshold: self.threshold,
            page: self.page,
            page_size: self.page_size,
        })
    }
}

pub async fn search(
    config: &MosaicConfig,
    image: Option<PathBuf>,
    text: Option<String>,
    opts: &QueryOptions,
) -> Result<()> {
    let input = match (image, text) {
        (Some(path), None) => QueryInput::Image(
            tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?,
        ),
        (None, Some(text)) => QueryInput::Text(text),
        _ => anyhow::bail!("pass exactly one of --image or --text"),
    };

    let stack = LocalStack::open(config)?;
    let result = stack
        .service
        .search(input, opts.params()?, &opts.caller())
        .await?;
    print_result(&result, opts.json)
}

pub async fn similar(config: &MosaicConfig, media_id: &str, opts: &QueryOptions) -> Result<()> {
    let stack = LocalStack::open(config)?;
    let result = stack
        .service
        .search_similar_to(media_id, opts.params()?, &opts.caller())
        .await?;
    print_result(&result, opts.json)
}

fn print_result(result: &SearchResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if result.hits.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!(
        "Page {} ({} per page), {} total matches, {}ms\n",
        result.page, result.page_size, result.total, result.elapsed_ms
    );

    let offset = (result.page - 1) * result.page_size;
    for (i, hit) in result.hits.iter().enumerate() {
        println!("{}", describe_hit(offset + i + 1, hit));
    }

    Ok(())
}

fn describe_hit(position: usize, hit: &SearchHit) -> String {
    let record = &hit.record;
    let mut out = format!(
        "  {position}. [{} {}] {:.4}  {}\n     id: {} | owner: {} | {} | {} | {}",
        record.media_kind(),
        record.content_type,
        hit.score,
        record.filename,
        hit.media_id,
        record.owner_id.as_deref().unwrap_or("-"),
        record.visibility,
        super::format_bytes(record.file_size),
        record.upload_date.format("%Y-%m-%d")
    );
    if !record.tags.is_empty() {
        out.push_str(&format!("\n     tags: {}", record.tags.join(", ")));
    }
    out
}
