//! Write path: keep the vector index loosely in step with the document store.
//!
//! The document store is authoritative and is written first by the upload
//! path. Everything here is best effort: a failure leaves the record in the
//! `processing` state (`embedding_indexed = false`) and is logged, but never
//! fails the upload that triggered it.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TimeoutConfig;
use crate::embedding::EncoderService;
use crate::index::{VectorIndex, VectorMetadata};
use crate::store::{is_image_content_type, ByteStore, DocumentStore, EmbeddingStatus};

/// A freshly stored media item to embed and index.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub media_id: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// What happened to one index request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOutcome {
    /// Vector written and the record flagged as indexed.
    Indexed,
    /// Content type is not embedded yet (video and other non-image media).
    Deferred,
    /// No document record exists for the id; nothing was written.
    MissingRecord,
    /// The encoder rejected the bytes or failed.
    EmbeddingFailed,
    /// The index upsert (or the follow-up flag write) failed.
    IndexWriteFailed,
}

impl IndexOutcome {
    pub fn status(&self) -> EmbeddingStatus {
        match self {
            Self::Indexed => EmbeddingStatus::Indexed,
            _ => EmbeddingStatus::Processing,
        }
    }

    pub fn is_indexed(&self) -> bool {
        *self == Self::Indexed
    }
}

/// Counts from a bulk reindex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub indexed: usize,
    pub deferred: usize,
    pub failed: usize,
    /// Records whose bytes are gone from the byte store.
    pub missing_bytes: usize,
}

pub struct IndexingPipeline {
    encoder: Arc<EncoderService>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn DocumentStore>,
    timeouts: TimeoutConfig,
}

impl IndexingPipeline {
    pub fn new(
        encoder: Arc<EncoderService>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn DocumentStore>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            encoder,
            index,
            store,
            timeouts,
        }
    }

    /// Embed and index a media item whose record is already in the store.
    pub async fn on_media_created(&self, request: IndexRequest) -> IndexOutcome {
        let started = Instant::now();
        let id = request.media_id.clone();

        if !is_image_content_type(&request.content_type) {
            debug!(
                media_id = %id,
                content_type = %request.content_type,
                "content type not embedded, deferring"
            );
            self.write_flag(&id, false).await;
            return IndexOutcome::Deferred;
        }

        let record = match tokio::time::timeout(self.timeouts.store(), self.store.get(&id)).await {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                warn!(media_id = %id, "no document record for index request, skipping");
                return IndexOutcome::MissingRecord;
            }
            Ok(Err(e)) => {
                warn!(
                    event = "index_write_failure",
                    op = "load_record",
                    media_id = %id,
                    error = %format!("{e:#}"),
                    "could not load record"
                );
                return IndexOutcome::IndexWriteFailed;
            }
            Err(_) => {
                warn!(
                    event = "index_write_failure",
                    op = "load_record",
                    media_id = %id,
                    "record lookup timed out"
                );
                return IndexOutcome::IndexWriteFailed;
            }
        };

        let vector = match self.encoder.embed_image(request.bytes).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(
                    event = "embedding_failure",
                    media_id = %id,
                    error = %e,
                    "embedding failed, record stays processing"
                );
                self.write_flag(&id, false).await;
                return IndexOutcome::EmbeddingFailed;
            }
        };

        let metadata = VectorMetadata::from(&record);
        let upsert = tokio::time::timeout(
            self.timeouts.index(),
            self.index.upsert(&id, &vector, &metadata),
        )
        .await;

        let outcome = match upsert {
            Ok(Ok(())) => {
                if self.write_flag(&id, true).await {
                    IndexOutcome::Indexed
                } else {
                    IndexOutcome::IndexWriteFailed
                }
            }
            Ok(Err(e)) => {
                warn!(
                    event = "index_write_failure",
                    op = "upsert",
                    media_id = %id,
                    error = %format!("{e:#}"),
                    "vector upsert failed"
                );
                self.write_flag(&id, false).await;
                IndexOutcome::IndexWriteFailed
            }
            Err(_) => {
                warn!(
                    event = "index_write_failure",
                    op = "upsert",
                    media_id = %id,
                    "vector upsert timed out"
                );
                self.write_flag(&id, false).await;
                IndexOutcome::IndexWriteFailed
            }
        };

        info!(
            media_id = %id,
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index request processed"
        );
        outcome
    }

    /// Remove the vector for a deleted media item. Never fails.
    pub async fn on_media_deleted(&self, media_id: &str) {
        match tokio::time::timeout(self.timeouts.index(), self.index.delete_by_id(media_id)).await {
            Ok(Ok(())) => debug!(media_id, "vector deleted"),
            Ok(Err(e)) => {
                warn!(
                    event = "index_write_failure",
                    op = "delete",
                    media_id,
                    error = %format!("{e:#}"),
                    "vector delete failed"
                )
            }
            Err(_) => {
                warn!(
                    event = "index_write_failure",
                    op = "delete",
                    media_id,
                    "vector delete timed out"
                )
            }
        }
    }

    /// Re-run the create path for every stored media item, reading bytes back
    /// from `bytes`. `on_item` is called once per record.
    pub async fn reindex_all<F>(
        &self,
        bytes: &dyn ByteStore,
        mut on_item: F,
    ) -> anyhow::Result<ReindexReport>
    where
        F: FnMut(&str, Option<IndexOutcome>),
    {
        let ids = self.store.list_media_ids().await?;
        info!(count = ids.len(), "reindexing media");

        let mut report = ReindexReport::default();
        for id in ids {
            let Some(record) = self.store.get(&id).await? else {
                continue;
            };

            let outcome = if !record.is_image() {
                Some(
                    self.on_media_created(IndexRequest {
                        media_id: id.clone(),
                        content_type: record.content_type.clone(),
                        bytes: vec![],
                    })
                    .await,
                )
            } else {
                match bytes.get_bytes(&id).await {
                    Ok(Some(data)) => Some(
                        self.on_media_created(IndexRequest {
                            media_id: id.clone(),
                            content_type: record.content_type.clone(),
                            bytes: data,
                        })
                        .await,
                    ),
                    Ok(None) => {
                        warn!(media_id = %id, "media bytes missing, cannot reindex");
                        None
                    }
                    Err(e) => {
                        warn!(
                            media_id = %id,
                            error = %format!("{e:#}"),
                            "failed to read media bytes"
                        );
                        None
                    }
                }
            };

            match outcome {
                Some(IndexOutcome::Indexed) => report.indexed += 1,
                Some(IndexOutcome::Deferred) => report.deferred += 1,
                Some(_) => report.failed += 1,
                None => report.missing_bytes += 1,
            }
            on_item(&id, outcome);
        }

        info!(
            indexed = report.indexed,
            deferred = report.deferred,
            failed = report.failed,
            missing_bytes = report.missing_bytes,
            "reindex complete"
        );
        Ok(report)
    }

    /// Best-effort flag write. Returns whether it landed.
    async fn write_flag(&self, media_id: &str, indexed: bool) -> bool {
        match tokio::time::timeout(
            self.timeouts.store(),
            self.store.set_indexed_flag(media_id, indexed),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(
                    event = "index_write_failure",
                    op = "set_indexed_flag",
                    media_id,
                    indexed,
                    error = %format!("{e:#}"),
                    "flag write failed"
                );
                false
            }
            Err(_) => {
                warn!(
                    event = "index_write_failure",
                    op = "set_indexed_flag",
                    media_id,
                    indexed,
                    "flag write timed out"
                );
                false
            }
        }
    }
}
