//! CLI `doctor` command: database, model and index diagnostics.

use anyhow::{Context, Result};

use mosaic::config::{expand_tilde, MosaicConfig};
use mosaic::db;
use mosaic::embedding::clip::ModelFiles;
use mosaic::service::LocalStack;

pub async fn doctor(config: &MosaicConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `mosaic ingest <files>` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let stack = LocalStack::open(config).context("failed to open database (may be corrupt)")?;
    let report = {
        let conn = stack
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
        db::check_database_health(&conn).context("failed to run health check")?
    };
    let service = stack.service.health().await;

    let cache_dir = expand_tilde(&config.embedding.cache_dir);
    let files = ModelFiles::in_dir(&cache_dir, &config.embedding.model);

    println!("Mosaic Health Report");
    println!("====================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", super::format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        v{}", report.sqlite_vec_version);
    println!("Media directory:   {}", config.resolved_media_dir().display());
    println!();
    println!("Embedding model:");
    println!("  Stored:          {}", report.embedding_model.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {} ({}-d)", service.model, service.dimensions);
    println!(
        "  Files:           {}",
        if files.all_present() { "present" } else { "MISSING (run `mosaic model download`)" }
    );
    if let Some(ref stored) = report.embedding_model {
        if stored != &service.model {
            println!("  WARNING: model mismatch! Run `mosaic reindex` to rebuild vectors.");
        } else {
            println!("  Status:          OK (match)");
        }
    }
    println!();
    println!("Vector index:      {}", service.index_backend);
    match (service.vector_count, &service.index_error) {
        (Some(n), _) => println!("  Vectors:         {n}"),
        (None, Some(err)) => println!("  UNAVAILABLE:     {err}"),
        (None, None) => println!("  Vectors:         (unknown)"),
    }
    println!();
    println!("Row counts:");
    println!("  Media:           {}", report.media_count);
    println!("  Indexed:         {}", report.indexed_count);
    println!("  Processing:      {}", report.media_count - report.indexed_count);
    println!("  Collections:     {}", report.collection_count);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Restore from a backup: cp backup.db {}", db_path.display());
        println!("  2. Then rebuild vectors: mosaic reindex");
    }

    Ok(())
}
