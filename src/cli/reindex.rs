//! CLI `reindex` command: rebuild every vector with the current model.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use mosaic::config::MosaicConfig;
use mosaic::db::migrations;
use mosaic::service::LocalStack;
use mosaic::store::DocumentStore;

pub async fn reindex(config: &MosaicConfig) -> Result<()> {
    let stack = LocalStack::open(config)?;

    let total = stack.store.list_media_ids().await?.len();
    if total == 0 {
        println!("No media to reindex.");
        return Ok(());
    }

    println!(
        "Reindexing {total} media items with model '{}' into the {} index...",
        config.embedding.model, config.index.backend
    );

    // Fails fast on missing model files instead of marking every item processing.
    stack
        .service
        .encoder()
        .warm_up()
        .await
        .context("failed to load embedding model (try `mosaic model download`)")?;

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} ({eta})")?
            .progress_chars("##-"),
    );

    let report = stack
        .service
        .reindex_all(|_, _| pb.inc(1))
        .await?;
    pb.finish_and_clear();

    {
        let conn = stack
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
        migrations::set_embedding_model(&conn, &config.embedding.model)?;
    }

    println!(
        "Reindex complete: {} indexed, {} deferred, {} failed, {} missing bytes.",
        report.indexed, report.deferred, report.failed, report.missing_bytes
    );
    if report.failed > 0 {
        println!("Failed items stay in the processing state; check the logs and rerun.");
    }
    Ok(())
}
