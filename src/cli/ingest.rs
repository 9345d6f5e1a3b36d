//! CLI `ingest` and `delete`: the local upload path.
//!
//! Stands in for the application's upload handler: write the record and the
//! bytes first, then hand the item to the indexing pipeline.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

use mosaic::config::MosaicConfig;
use mosaic::ingest::IndexRequest;
use mosaic::service::LocalStack;
use mosaic::store::{MediaRecord, Visibility};

pub struct IngestOptions {
    pub owner: Option<String>,
    pub visibility: Visibility,
    pub tags: Vec<String>,
}

pub async fn ingest(config: &MosaicConfig, paths: &[PathBuf], opts: IngestOptions) -> Result<()> {
    anyhow::ensure!(!paths.is_empty(), "no files given");
    anyhow::ensure!(
        opts.owner.is_some() || opts.visibility == Visibility::Public,
        "media without an owner must be public"
    );

    let stack = LocalStack::open(config)?;

    let pb = ProgressBar::new(paths.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );

    let mut lines = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let content_type = super::content_type_for(path);
        let id = uuid::Uuid::now_v7().to_string();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.clone());

        stack
            .store
            .insert_media(MediaRecord {
                id: id.clone(),
                owner_id: opts.owner.clone(),
                visibility: opts.visibility,
                content_type: content_type.to_string(),
                filename: filename.clone(),
                file_size: bytes.len() as u64,
                tags: opts.tags.clone(),
                upload_date: chrono::Utc::now(),
                embedding_indexed: false,
            })
            .await?;
        stack.bytes.put_bytes(&id, &bytes).await?;

        pb.set_message(filename.clone());
        let outcome = stack
            .service
            .index_media_outcome(IndexRequest {
                media_id: id.clone(),
                content_type: content_type.to_string(),
                bytes,
            })
            .await;
        pb.inc(1);

        lines.push(format!("{id}  {:<10}  {filename}", outcome.status().as_str()));
    }
    pb.finish_and_clear();

    for line in lines {
        println!("{line}");
    }
    Ok(())
}

pub async fn delete(config: &MosaicConfig, media_id: &str) -> Result<()> {
    let stack = LocalStack::open(config)?;

    let existed = stack.store.delete_media(media_id).await?;
    stack.bytes.remove_bytes(media_id).await?;
    stack.service.delete_media_index(media_id).await;

    if existed {
        println!("Deleted {media_id}");
    } else {
        println!("No media record {media_id}; index entry removed if present");
    }
    Ok(())
}
