//! Read path: predicate → k-NN → hydrate → threshold → window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::scope::ScopeResolver;
use super::types::{Caller, SearchHit, SearchQuery, SearchResult};
use crate::config::MosaicConfig;
use crate::error::{MosaicError, Result};
use crate::index::{KnnHit, Predicate, VectorIndex};
use crate::store::DocumentStore;

/// Limits and timeouts the orchestrator enforces on every query.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Dimension the index was created with.
    pub dimensions: usize,
    pub max_page_size: usize,
    pub candidate_multiplier: usize,
    /// Upper bound on `page × page_size`.
    pub max_result_window: usize,
    pub index_timeout: Duration,
    pub store_timeout: Duration,
}

impl SearchSettings {
    pub fn from_config(config: &MosaicConfig) -> Self {
        Self {
            dimensions: config.embedding.effective_dimensions(),
            max_page_size: config.search.max_page_size,
            candidate_multiplier: config.search.candidate_multiplier,
            max_result_window: config.search.max_result_window,
            index_timeout: config.timeouts.index(),
            store_timeout: config.timeouts.store(),
        }
    }
}

pub struct SearchOrchestrator {
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn DocumentStore>,
    resolver: ScopeResolver,
    settings: SearchSettings,
}

impl SearchOrchestrator {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn DocumentStore>,
        settings: SearchSettings,
    ) -> Self {
        let resolver = ScopeResolver::new(Arc::clone(&store), settings.store_timeout);
        Self {
            index,
            store,
            resolver,
            settings,
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub async fn search(&self, query: &SearchQuery, caller: &Caller) -> Result<SearchResult> {
        self.run(query, caller, None).await
    }

    /// Like [`search`](Self::search), but `exclude` never appears in the page
    /// and is not counted in `total`.
    pub async fn search_excluding(
        &self,
        query: &SearchQuery,
        caller: &Caller,
        exclude: &str,
    ) -> Result<SearchResult> {
        self.run(query, caller, Some(exclude)).await
    }

    fn validate(&self, query: &SearchQuery) -> Result<()> {
        if query.page == 0 {
            return Err(MosaicError::InvalidQuery("page is 1-indexed".into()));
        }
        if query.page_size == 0 || query.page_size > self.settings.max_page_size {
            return Err(MosaicError::InvalidQuery(format!(
                "page_size must be between 1 and {}, got {}",
                self.settings.max_page_size, query.page_size
            )));
        }
        if !query.threshold.is_finite() || !(-1.0..=1.0).contains(&query.threshold) {
            return Err(MosaicError::InvalidQuery(format!(
                "threshold must be within [-1, 1], got {}",
                query.threshold
            )));
        }
        if query.embedding.len() != self.settings.dimensions {
            return Err(MosaicError::InvalidQuery(format!(
                "query embedding has {} dimensions, index expects {}",
                query.embedding.len(),
                self.settings.dimensions
            )));
        }
        crate::embedding::validate_embedding(&query.embedding, self.settings.dimensions)
            .map_err(MosaicError::InvalidQuery)?;
        if let (Some(from), Some(to)) = (query.filters.uploaded_from, query.filters.uploaded_to) {
            if from > to {
                return Err(MosaicError::InvalidQuery(format!(
                    "upload date range is inverted: {from} > {to}"
                )));
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        query: &SearchQuery,
        caller: &Caller,
        exclude: Option<&str>,
    ) -> Result<SearchResult> {
        let started = Instant::now();
        self.validate(query)?;
        let k = self.depth(query, exclude.is_some())?;

        let predicate = self
            .resolver
            .resolve(&query.scope, &query.filters, caller)
            .await?;

        if predicate.matches_nothing() {
            debug!(scope = %query.scope, "scope matches nothing, skipping index");
            return Ok(SearchResult::empty(
                query.page,
                query.page_size,
                started.elapsed().as_millis() as u64,
            ));
        }

        let response = tokio::time::timeout(
            self.settings.index_timeout,
            self.index.knn_query(
                &query.embedding,
                k,
                &predicate,
                self.settings.candidate_multiplier,
            ),
        )
        .await
        .map_err(|_| {
            MosaicError::SearchBackendUnavailable(format!(
                "knn query timed out after {}ms",
                self.settings.index_timeout.as_millis()
            ))
        })?
        .map_err(|e| MosaicError::SearchBackendUnavailable(format!("{e:#}")))?;

        let knn_hits = response.hits.len();
        let mut excluded = 0;
        let candidates: Vec<KnnHit> = response
            .hits
            .into_iter()
            .filter(|hit| {
                let skip = exclude == Some(hit.id.as_str());
                excluded += usize::from(skip);
                !skip
            })
            .collect();

        let ranked: Vec<SearchHit> = self
            .hydrate(candidates, &predicate)
            .await
            .into_iter()
            .filter(|hit| hit.score >= query.threshold)
            .collect();

        let total = response
            .total_matches
            .map(|n| n.saturating_sub(excluded))
            .unwrap_or(ranked.len());

        let start = (query.page - 1) * query.page_size;
        let hits: Vec<SearchHit> = ranked
            .into_iter()
            .skip(start)
            .take(query.page_size)
            .collect();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            scope = %query.scope,
            page = query.page,
            page_size = query.page_size,
            knn_hits,
            returned = hits.len(),
            total,
            elapsed_ms,
            "search completed"
        );

        Ok(SearchResult {
            hits,
            total,
            elapsed_ms,
            page: query.page,
            page_size: query.page_size,
        })
    }

    /// Ranks needed from the index to fill the requested page.
    fn depth(&self, query: &SearchQuery, excluding: bool) -> Result<usize> {
        query
            .page
            .checked_mul(query.page_size)
            .and_then(|k| k.checked_add(usize::from(excluding)))
            .filter(|&k| k <= self.settings.max_result_window)
            .ok_or_else(|| {
                MosaicError::InvalidQuery(format!(
                    "page {} of size {} is past the result window of {}",
                    query.page, query.page_size, self.settings.max_result_window
                ))
            })
    }

    /// Attach authoritative records, preserving rank order. Hits whose record
    /// is missing, failed, timed out, or no longer satisfies the predicate
    /// (index metadata lagging the store) are dropped.
    async fn hydrate(&self, hits: Vec<KnnHit>, predicate: &Predicate) -> Vec<SearchHit> {
        let timeout = self.settings.store_timeout;
        let lookups = hits.into_iter().map(|hit| async move {
            let lookup = tokio::time::timeout(timeout, self.store.get(&hit.id)).await;
            let reason = match lookup {
                Ok(Ok(Some(record))) if predicate.matches_record(&record) => {
                    return Some(SearchHit {
                        media_id: hit.id,
                        score: hit.score,
                        record,
                    })
                }
                Ok(Ok(Some(_))) => "record no longer matches the query scope".to_string(),
                Ok(Ok(None)) => "record missing".to_string(),
                Ok(Err(e)) => format!("lookup failed: {e:#}"),
                Err(_) => format!("lookup timed out after {}ms", timeout.as_millis()),
            };
            warn!(
                event = "metadata_integrity_warning",
                media_id = %hit.id,
                reason = %reason,
                "index hit has no usable document record"
            );
            None
        });

        join_all(lookups).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::sqlite::SqliteVectorIndex;
    use crate::index::{SimilarityMetric, VectorMetadata};
    use crate::search::scope::ScopeSelector;
    use crate::search::types::SearchFilters;
    use crate::store::sqlite::SqliteDocumentStore;
    use crate::store::{MediaRecord, Visibility};
    use std::sync::Mutex;

    struct Fixture {
        orchestrator: SearchOrchestrator,
        index: Arc<SqliteVectorIndex>,
        store: SqliteDocumentStore,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Mutex::new(crate::db::open_memory_database().unwrap()));
        let index = Arc::new(SqliteVectorIndex::new(Arc::clone(&db), 100));
        index.ensure_schema(2, SimilarityMetric::Cosine).await.unwrap();
        let store = SqliteDocumentStore::new(db);
        let settings = SearchSettings {
            dimensions: 2,
            max_page_size: 10,
            candidate_multiplier: 10,
            max_result_window: 20,
            index_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
        };
        let orchestrator = SearchOrchestrator::new(
            Arc::clone(&index) as Arc<dyn VectorIndex>,
            Arc::new(store.clone()),
            settings,
        );
        Fixture {
            orchestrator,
            index,
            store,
        }
    }

    fn record(id: &str) -> MediaRecord {
        MediaRecord {
            id: id.into(),
            owner_id: None,
            visibility: Visibility::Public,
            content_type: "image/png".into(),
            filename: format!("{id}.png"),
            file_size: 1,
            tags: vec![],
            upload_date: chrono::Utc::now(),
            embedding_indexed: true,
        }
    }

    async fn add(f: &Fixture, id: &str, angle_deg: f32, in_store: bool) {
        let record = record(id);
        let rad = angle_deg.to_radians();
        f.index
            .upsert(id, &[rad.cos(), rad.sin()], &VectorMetadata::from(&record))
            .await
            .unwrap();
        if in_store {
            f.store.insert_media(record).await.unwrap();
        }
    }

    fn query(page: usize, page_size: usize, threshold: f32) -> SearchQuery {
        SearchQuery {
            embedding: vec![1.0, 0.0],
            scope: ScopeSelector::PublicOnly,
            filters: SearchFilters::default(),
            threshold,
            page_size,
            page,
        }
    }

    #[tokio::test]
    async fn rejects_invalid_queries() {
        let f = fixture().await;
        let caller = Caller::anonymous();
        for q in [
            query(0, 5, 0.0),
            query(1, 0, 0.0),
            query(1, 11, 0.0),
            query(1, 5, 1.5),
            query(1, 5, f32::NAN),
            SearchQuery {
                embedding: vec![1.0, 0.0, 0.0],
                ..query(1, 5, 0.0)
            },
        ] {
            let result = f.orchestrator.search(&q, &caller).await;
            assert!(matches!(result, Err(MosaicError::InvalidQuery(_))), "{q:?}");
        }
    }

    #[tokio::test]
    async fn rejects_pages_past_the_result_window() {
        let f = fixture().await;
        add(&f, "a", 0.0, true).await;
        let caller = Caller::anonymous();

        let past_window = [
            query(usize::MAX / 10, 10, 0.0),
            query(usize::MAX, 2, 0.0),
            query(3, 10, 0.0),
        ];
        for q in past_window {
            let result = f.orchestrator.search(&q, &caller).await;
            assert!(matches!(result, Err(MosaicError::InvalidQuery(_))), "{q:?}");
        }

        // Exactly at the window is fine; the exclusion slot pushes it over.
        assert!(f.orchestrator.search(&query(2, 10, 0.0), &caller).await.is_ok());
        assert!(matches!(
            f.orchestrator.search_excluding(&query(2, 10, 0.0), &caller, "a").await,
            Err(MosaicError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn drops_hits_whose_record_left_the_scope() {
        let f = fixture().await;
        add(&f, "still-public", 0.0, true).await;
        add(&f, "now-private", 5.0, true).await;

        // Store changed; the vector still carries the old public metadata.
        f.store
            .insert_media(MediaRecord {
                visibility: Visibility::Private,
                owner_id: Some("u1".into()),
                ..record("now-private")
            })
            .await
            .unwrap();

        let res = f
            .orchestrator
            .search(&query(1, 10, 0.0), &Caller::anonymous())
            .await
            .unwrap();
        let ids: Vec<_> = res.hits.iter().map(|h| h.media_id.as_str()).collect();
        assert_eq!(ids, ["still-public"]);
    }

    #[tokio::test]
    async fn ranks_thresholds_and_windows() {
        let f = fixture().await;
        for (id, angle) in [("a", 0.0), ("b", 30.0), ("c", 60.0), ("d", 120.0)] {
            add(&f, id, angle, true).await;
        }
        let caller = Caller::anonymous();

        let all = f.orchestrator.search(&query(1, 10, -1.0), &caller).await.unwrap();
        let ids: Vec<_> = all.hits.iter().map(|h| h.media_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c", "d"]);
        assert_eq!(all.total, 4);

        // cos(120°) = -0.5 falls below the default threshold.
        let positive = f.orchestrator.search(&query(1, 10, 0.0), &caller).await.unwrap();
        assert_eq!(positive.hits.len(), 3);

        let page2 = f.orchestrator.search(&query(2, 2, -1.0), &caller).await.unwrap();
        let ids: Vec<_> = page2.hits.iter().map(|h| h.media_id.as_str()).collect();
        assert_eq!(ids, ["c", "d"]);
        assert_eq!(page2.page, 2);
    }

    #[tokio::test]
    async fn drops_hits_without_records() {
        let f = fixture().await;
        add(&f, "kept", 0.0, true).await;
        add(&f, "orphan", 10.0, false).await;

        let res = f
            .orchestrator
            .search(&query(1, 10, 0.0), &Caller::anonymous())
            .await
            .unwrap();
        assert_eq!(res.hits.len(), 1);
        assert_eq!(res.hits[0].media_id, "kept");
        // The index still counts the orphan.
        assert_eq!(res.total, 2);
    }

    #[tokio::test]
    async fn excluding_source_removes_it_from_page_and_total() {
        let f = fixture().await;
        add(&f, "source", 0.0, true).await;
        add(&f, "other", 20.0, true).await;

        let res = f
            .orchestrator
            .search_excluding(&query(1, 1, 0.0), &Caller::anonymous(), "source")
            .await
            .unwrap();
        assert_eq!(res.hits.len(), 1);
        assert_eq!(res.hits[0].media_id, "other");
        assert_eq!(res.total, 1);
    }

    #[tokio::test]
    async fn empty_scope_short_circuits() {
        let f = fixture().await;
        add(&f, "a", 0.0, true).await;
        let q = SearchQuery {
            scope: ScopeSelector::CollectionMembers("missing".into()),
            ..query(1, 5, 0.0)
        };
        let res = f.orchestrator.search(&q, &Caller::anonymous()).await.unwrap();
        assert!(res.hits.is_empty());
        assert_eq!(res.total, 0);
    }
}
