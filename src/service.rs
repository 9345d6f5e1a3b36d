//! Boundary API consumed by the surrounding application (and the CLI).
//!
//! Raw inputs are turned into typed values here exactly once: scope strings
//! become a [`ScopeSelector`], images and text become unit vectors, missing
//! paging parameters take their configured defaults.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::config::{MosaicConfig, SearchConfig, TimeoutConfig};
use crate::embedding::{l2_normalize, validate_embedding, EncoderService};
use crate::error::{MosaicError, Result};
use crate::index::{SimilarityMetric, VectorIndex};
use crate::ingest::{IndexOutcome, IndexRequest, IndexingPipeline, ReindexReport};
use crate::search::{
    Caller, ScopeSelector, SearchFilters, SearchOrchestrator, SearchQuery, SearchResult,
    SearchSettings,
};
use crate::store::bytes::FsByteStore;
use crate::store::sqlite::SqliteDocumentStore;
use crate::store::{ByteStore, DocumentStore, Visibility};

/// What to search with.
#[derive(Debug, Clone)]
pub enum QueryInput {
    /// A precomputed query vector; re-normalized before use.
    Embedding(Vec<f32>),
    /// Encoded image bytes.
    Image(Vec<u8>),
    Text(String),
}

/// Raw search parameters as they arrive at the boundary.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    /// Scope string (`all`, `shared`, `my_images`, `owner:<id>`, `collection:<id>`).
    pub scope: String,
    pub filters: SearchFilters,
    pub threshold: Option<f32>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub model: String,
    pub model_loaded: bool,
    pub dimensions: usize,
    pub index_backend: &'static str,
    pub vector_count: Option<usize>,
    pub index_error: Option<String>,
}

pub struct MosaicService {
    encoder: Arc<EncoderService>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn DocumentStore>,
    bytes: Arc<dyn ByteStore>,
    orchestrator: SearchOrchestrator,
    pipeline: IndexingPipeline,
    defaults: SearchConfig,
    timeouts: TimeoutConfig,
    schema_ready: OnceCell<()>,
}

impl MosaicService {
    pub fn new(
        config: &MosaicConfig,
        encoder: Arc<EncoderService>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn DocumentStore>,
        bytes: Arc<dyn ByteStore>,
    ) -> Self {
        let settings = SearchSettings {
            dimensions: encoder.dimensions(),
            ..SearchSettings::from_config(config)
        };
        let orchestrator =
            SearchOrchestrator::new(Arc::clone(&index), Arc::clone(&store), settings);
        let pipeline = IndexingPipeline::new(
            Arc::clone(&encoder),
            Arc::clone(&index),
            Arc::clone(&store),
            config.timeouts.clone(),
        );

        Self {
            encoder,
            index,
            store,
            bytes,
            orchestrator,
            pipeline,
            defaults: config.search.clone(),
            timeouts: config.timeouts.clone(),
            schema_ready: OnceCell::new(),
        }
    }

    pub fn encoder(&self) -> &EncoderService {
        &self.encoder
    }

    /// Create (or verify) the vector index schema. Runs once per service.
    pub async fn initialize(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                self.index
                    .ensure_schema(self.encoder.dimensions(), SimilarityMetric::Cosine)
                    .await
                    .map_err(|e| match e.downcast::<MosaicError>() {
                        Ok(known) => known,
                        Err(other) => MosaicError::SearchBackendUnavailable(format!("{other:#}")),
                    })
            })
            .await?;
        Ok(())
    }

    /// Scoped similarity search from an embedding, image, or text query.
    pub async fn search(
        &self,
        input: QueryInput,
        params: SearchParams,
        caller: &Caller,
    ) -> Result<SearchResult> {
        let scope = ScopeSelector::parse(&params.scope, caller)?;
        self.initialize().await?;
        let embedding = self.embed_query(input).await?;
        let query = self.build_query(embedding, scope, params);
        self.orchestrator.search(&query, caller).await
    }

    /// "More like this": search with the stored item's own image, excluding it.
    pub async fn search_similar_to(
        &self,
        media_id: &str,
        params: SearchParams,
        caller: &Caller,
    ) -> Result<SearchResult> {
        let scope = ScopeSelector::parse(&params.scope, caller)?;
        self.initialize().await?;

        let record = tokio::time::timeout(self.timeouts.store(), self.store.get(media_id))
            .await
            .map_err(|_| MosaicError::DocumentStoreUnavailable("record lookup timed out".into()))?
            .map_err(|e| MosaicError::DocumentStoreUnavailable(format!("{e:#}")))?
            .ok_or_else(|| MosaicError::MediaNotFound(media_id.to_string()))?;

        let visible = record.visibility == Visibility::Public
            || caller.elevated
            || (caller.user_id.is_some() && caller.user_id == record.owner_id);
        if !visible {
            return Err(MosaicError::MediaNotFound(media_id.to_string()));
        }
        if !record.is_image() {
            return Err(MosaicError::EmbeddingExtraction(format!(
                "{media_id} is {}, only images can seed a similarity search",
                record.content_type
            )));
        }

        let bytes = self
            .bytes
            .get_bytes(media_id)
            .await
            .map_err(|e| MosaicError::DocumentStoreUnavailable(format!("{e:#}")))?
            .ok_or_else(|| MosaicError::MediaNotFound(format!("{media_id}: bytes missing")))?;

        let embedding = self.encoder.embed_image(bytes).await?;
        let query = self.build_query(embedding, scope, params);
        self.orchestrator
            .search_excluding(&query, caller, media_id)
            .await
    }

    /// Index a stored media item. Returns whether it is now searchable;
    /// failures only leave the item in the processing state.
    pub async fn index_media(&self, request: IndexRequest) -> bool {
        self.index_media_outcome(request).await.is_indexed()
    }

    pub async fn index_media_outcome(&self, request: IndexRequest) -> IndexOutcome {
        if let Err(e) = self.initialize().await {
            tracing::warn!(
                event = "index_write_failure",
                op = "ensure_schema",
                media_id = %request.media_id,
                error = %e,
                "index unavailable"
            );
            return IndexOutcome::IndexWriteFailed;
        }
        self.pipeline.on_media_created(request).await
    }

    /// Remove a deleted item's vector. Never fails, including for unknown ids.
    pub async fn delete_media_index(&self, media_id: &str) {
        self.pipeline.on_media_deleted(media_id).await;
    }

    /// Rebuild every vector from the byte store. An index built for another
    /// dimension or metric is dropped and recreated first.
    pub async fn reindex_all<F>(&self, on_item: F) -> anyhow::Result<ReindexReport>
    where
        F: FnMut(&str, Option<IndexOutcome>),
    {
        match self.initialize().await {
            Ok(()) => {}
            Err(MosaicError::IncompatibleSchema(reason)) => self.rebuild_index(&reason).await?,
            Err(e) => return Err(e.into()),
        }
        self.pipeline.reindex_all(self.bytes.as_ref(), on_item).await
    }

    async fn rebuild_index(&self, reason: &str) -> anyhow::Result<()> {
        let dimension = self.encoder.dimensions();
        tracing::warn!(reason, dimension, "vector index does not fit the encoder, rebuilding");
        self.index
            .reset_schema(dimension, SimilarityMetric::Cosine)
            .await
            .context("failed to recreate vector index")?;
        let _ = self.schema_ready.set(());

        for id in self.store.list_media_ids().await? {
            self.store.set_indexed_flag(&id, false).await?;
        }
        Ok(())
    }

    pub async fn health(&self) -> ServiceHealth {
        let (vector_count, index_error) = match self.index.count().await {
            Ok(n) => (Some(n), None),
            Err(e) => (None, Some(format!("{e:#}"))),
        };
        ServiceHealth {
            model: self.encoder.model_name().to_string(),
            model_loaded: self.encoder.is_loaded(),
            dimensions: self.encoder.dimensions(),
            index_backend: self.index.backend_name(),
            vector_count,
            index_error,
        }
    }

    async fn embed_query(&self, input: QueryInput) -> Result<Vec<f32>> {
        match input {
            QueryInput::Embedding(v) => {
                validate_embedding(&v, self.encoder.dimensions())
                    .map_err(MosaicError::InvalidQuery)?;
                Ok(l2_normalize(&v))
            }
            QueryInput::Image(bytes) => self.encoder.embed_image(bytes).await,
            QueryInput::Text(text) => self.encoder.embed_text(text).await,
        }
    }

    fn build_query(
        &self,
        embedding: Vec<f32>,
        scope: ScopeSelector,
        params: SearchParams,
    ) -> SearchQuery {
        SearchQuery {
            embedding,
            scope,
            filters: params.filters,
            threshold: params.threshold.unwrap_or(self.defaults.default_threshold),
            page_size: params.page_size.unwrap_or(self.defaults.default_page_size),
            page: params.page.unwrap_or(1),
        }
    }
}

/// Everything needed to run Mosaic against local storage: one SQLite file for
/// records (and vectors, with the sqlite backend) plus a media directory.
pub struct LocalStack {
    pub service: MosaicService,
    pub db: Arc<Mutex<Connection>>,
    pub store: SqliteDocumentStore,
    pub bytes: FsByteStore,
    pub db_path: PathBuf,
}

impl LocalStack {
    pub fn open(config: &MosaicConfig) -> anyhow::Result<Self> {
        let db_path = config.resolved_db_path();
        let conn = crate::db::open_database(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        let encoder = Arc::new(EncoderService::from_config(config));
        Self::assemble(config, conn, encoder, db_path)
    }

    /// Assemble around an existing connection and encoder.
    pub fn assemble(
        config: &MosaicConfig,
        conn: Connection,
        encoder: Arc<EncoderService>,
        db_path: PathBuf,
    ) -> anyhow::Result<Self> {
        let db = Arc::new(Mutex::new(conn));
        let store = SqliteDocumentStore::new(Arc::clone(&db));
        let bytes = FsByteStore::new(config.resolved_media_dir());
        let index = crate::index::create_index(config, Arc::clone(&db))?;

        let service = MosaicService::new(
            config,
            encoder,
            index,
            Arc::new(store.clone()),
            Arc::new(bytes.clone()),
        );

        Ok(Self {
            service,
            db,
            store,
            bytes,
            db_path,
        })
    }
}
