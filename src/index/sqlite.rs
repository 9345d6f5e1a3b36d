//! sqlite-vec backed [`VectorIndex`].
//!
//! Vectors live in a plain `media_vectors` table next to the document store and
//! are scored with `vec_distance_cosine`. The predicate is compiled into the
//! `WHERE` clause of the same statement, so every match is considered (exact
//! search); the candidate pool only bounds the `LIMIT`.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::{
    candidate_pool, Field, KnnHit, KnnResponse, Predicate, SimilarityMetric, VectorIndex,
    VectorMetadata,
};
use crate::db::migrations;
use crate::error::MosaicError;
use crate::store::format_timestamp;

const VECTORS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS media_vectors (
    media_id     TEXT PRIMARY KEY,
    embedding    BLOB NOT NULL,
    owner_id     TEXT,
    visibility   TEXT NOT NULL,
    content_type TEXT NOT NULL,
    tags         TEXT NOT NULL DEFAULT '[]',
    upload_date  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_media_vectors_owner ON media_vectors(owner_id);
CREATE INDEX IF NOT EXISTS idx_media_vectors_visibility ON media_vectors(visibility);
"#;

pub struct SqliteVectorIndex {
    db: Arc<Mutex<Connection>>,
    max_candidates: usize,
    embedding_model: Option<String>,
}

impl SqliteVectorIndex {
    pub fn new(db: Arc<Mutex<Connection>>, max_candidates: usize) -> Self {
        Self {
            db,
            max_candidates,
            embedding_model: None,
        }
    }

    /// Model to record in `schema_meta` whenever the vector table is (re)created.
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            f(&mut conn)
        })
        .await
        .context("vector index task failed")?
    }
}

/// Stored `(dimension, metric)`, or `None` before the first `ensure_schema`.
fn stored_schema(conn: &Connection) -> Result<Option<(usize, String)>> {
    let read = |key: &str| -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    };

    match (read("vector_dimension")?, read("vector_metric")?) {
        (Some(dim), Some(metric)) => {
            let dim = dim
                .parse::<usize>()
                .with_context(|| format!("corrupt vector_dimension: {dim}"))?;
            Ok(Some((dim, metric)))
        }
        _ => Ok(None),
    }
}

/// Create `media_vectors` and record its shape (and model, when known).
fn create_vectors_table(
    conn: &mut Connection,
    dimension: usize,
    metric: SimilarityMetric,
    model: Option<&str>,
) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(VECTORS_DDL)?;
    tx.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('vector_dimension', ?1)",
        params![dimension.to_string()],
    )?;
    tx.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('vector_metric', ?1)",
        params![metric.as_str()],
    )?;
    if let Some(model) = model {
        migrations::set_embedding_model(&tx, model)?;
    }
    tx.commit()?;
    Ok(())
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// A compiled `WHERE` fragment with its bound values, numbered from an offset.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFilter {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Compile a predicate into SQL over `media_vectors`. Placeholders are
/// `?N` starting at `first_param`, so the caller can bind its own values first.
pub fn compile_predicate(predicate: &Predicate, first_param: usize) -> SqlFilter {
    let mut params = Vec::new();
    let sql = compile_into(predicate, first_param, &mut params);
    SqlFilter { sql, params }
}

fn compile_into(predicate: &Predicate, first_param: usize, params: &mut Vec<Value>) -> String {
    let bind = |value: &str, params: &mut Vec<Value>| -> String {
        params.push(Value::Text(value.to_string()));
        format!("?{}", first_param + params.len() - 1)
    };

    match predicate {
        Predicate::MatchAll => "1".into(),
        Predicate::MatchNone => "0".into(),
        Predicate::Eq(Field::Tags, value) => format!(
            "EXISTS (SELECT 1 FROM json_each(media_vectors.tags) WHERE json_each.value = {})",
            bind(value, params)
        ),
        Predicate::Eq(field, value) => format!("{} = {}", field.name(), bind(value, params)),
        Predicate::In(_, values) if values.is_empty() => "0".into(),
        Predicate::In(field, values) => {
            let placeholders: Vec<String> = values.iter().map(|v| bind(v, params)).collect();
            let list = placeholders.join(", ");
            if *field == Field::Tags {
                format!(
                    "EXISTS (SELECT 1 FROM json_each(media_vectors.tags) \
                     WHERE json_each.value IN ({list}))"
                )
            } else {
                format!("{} IN ({list})", field.name())
            }
        }
        Predicate::Range { field, gte, lte } => {
            let mut bounds = Vec::new();
            if let Some(lo) = gte {
                bounds.push(format!("{} >= {}", field.name(), bind(lo, params)));
            }
            if let Some(hi) = lte {
                bounds.push(format!("{} <= {}", field.name(), bind(hi, params)));
            }
            if bounds.is_empty() {
                "1".into()
            } else {
                format!("({})", bounds.join(" AND "))
            }
        }
        Predicate::And(parts) | Predicate::Or(parts) => {
            let (joiner, empty) = if matches!(predicate, Predicate::And(_)) {
                (" AND ", "1")
            } else {
                (" OR ", "0")
            };
            if parts.is_empty() {
                return empty.into();
            }
            let compiled: Vec<String> = parts
                .iter()
                .map(|p| compile_into(p, first_param, params))
                .collect();
            format!("({})", compiled.join(joiner))
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_schema(&self, dimension: usize, metric: SimilarityMetric) -> Result<()> {
        let model = self.embedding_model.clone();
        self.with_conn(move |conn| {
            if let Some((stored_dim, stored_metric)) = stored_schema(conn)? {
                if stored_dim != dimension || stored_metric != metric.as_str() {
                    return Err(MosaicError::IncompatibleSchema(format!(
                        "media_vectors holds {stored_dim}-d {stored_metric} vectors, \
                         requested {dimension}-d {metric}"
                    ))
                    .into());
                }
                conn.execute_batch(VECTORS_DDL)?;
                return Ok(());
            }

            create_vectors_table(conn, dimension, metric, model.as_deref())?;
            tracing::info!(dimension, metric = %metric, "vector index created");
            Ok(())
        })
        .await
    }

    async fn reset_schema(&self, dimension: usize, metric: SimilarityMetric) -> Result<()> {
        let model = self.embedding_model.clone();
        self.with_conn(move |conn| {
            conn.execute_batch(
                "DROP TABLE IF EXISTS media_vectors;
                 DELETE FROM schema_meta WHERE key IN ('vector_dimension', 'vector_metric');",
            )?;
            create_vectors_table(conn, dimension, metric, model.as_deref())?;
            tracing::warn!(dimension, metric = %metric, "vector index dropped and recreated");
            Ok(())
        })
        .await
    }

    async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<()> {
        let id = id.to_string();
        let blob = embedding_to_bytes(vector);
        let len = vector.len();
        let metadata = metadata.clone();

        self.with_conn(move |conn| {
            let (dimension, _) = stored_schema(conn)?
                .context("vector index not initialized; call ensure_schema first")?;
            anyhow::ensure!(
                len == dimension,
                "vector for {id} has {len} dimensions, index expects {dimension}"
            );

            conn.execute(
                "INSERT INTO media_vectors (media_id, embedding, owner_id, visibility, \
                                            content_type, tags, upload_date) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(media_id) DO UPDATE SET \
                     embedding = excluded.embedding, owner_id = excluded.owner_id, \
                     visibility = excluded.visibility, content_type = excluded.content_type, \
                     tags = excluded.tags, upload_date = excluded.upload_date",
                params![
                    id,
                    blob,
                    metadata.owner_id,
                    metadata.visibility.as_str(),
                    metadata.content_type,
                    serde_json::to_string(&metadata.tags)?,
                    format_timestamp(&metadata.upload_date),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            if stored_schema(conn)?.is_none() {
                return Ok(());
            }
            conn.execute("DELETE FROM media_vectors WHERE media_id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn knn_query(
        &self,
        vector: &[f32],
        k: usize,
        predicate: &Predicate,
        candidate_multiplier: usize,
    ) -> Result<KnnResponse> {
        if predicate.matches_nothing() {
            return Ok(KnnResponse {
                hits: vec![],
                total_matches: Some(0),
            });
        }

        let pool = candidate_pool(k, candidate_multiplier, self.max_candidates);
        let blob = embedding_to_bytes(vector);
        let len = vector.len();
        let predicate = predicate.clone();

        self.with_conn(move |conn| {
            let (dimension, _) = stored_schema(conn)?
                .context("vector index not initialized; call ensure_schema first")?;
            anyhow::ensure!(
                len == dimension,
                "query vector has {len} dimensions, index expects {dimension}"
            );

            // ?1 = query vector, ?2 = limit, predicate values from ?3.
            let filter = compile_predicate(&predicate, 3);
            let sql = format!(
                "SELECT media_id, vec_distance_cosine(embedding, ?1) AS distance \
                 FROM media_vectors WHERE {} ORDER BY distance ASC, rowid ASC LIMIT ?2",
                filter.sql
            );
            let mut values = vec![Value::Blob(blob), Value::Integer(pool as i64)];
            values.extend(filter.params);

            let mut stmt = conn.prepare(&sql)?;
            let mut hits = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    let id: String = row.get(0)?;
                    let distance: f64 = row.get(1)?;
                    Ok(KnnHit {
                        id,
                        score: (1.0 - distance) as f32,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            hits.truncate(k);

            let count_filter = compile_predicate(&predicate, 1);
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM media_vectors WHERE {}", count_filter.sql),
                params_from_iter(count_filter.params.iter()),
                |row| row.get(0),
            )?;

            tracing::debug!(k, pool, hits = hits.len(), total, "sqlite knn query");
            Ok(KnnResponse {
                hits,
                total_matches: Some(total.max(0) as usize),
            })
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            if stored_schema(conn)?.is_none() {
                return Ok(0);
            }
            let n: i64 =
                conn.query_row("SELECT COUNT(*) FROM media_vectors", [], |row| row.get(0))?;
            Ok(n.max(0) as usize)
        })
        .await
    }
}
