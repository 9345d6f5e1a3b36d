//! Elasticsearch 8 [`VectorIndex`] over its REST API.
//!
//! Vectors are stored in a `dense_vector` field with cosine similarity and
//! searched with the top-level `knn` option, the compiled predicate riding along
//! as the knn `filter` so Elasticsearch applies it during candidate selection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};

use super::{
    candidate_pool, Field, KnnHit, KnnResponse, Predicate, SimilarityMetric, VectorIndex,
    VectorMetadata,
};
use crate::config::IndexConfig;
use crate::error::MosaicError;
use crate::store::format_timestamp;

pub struct ElasticVectorIndex {
    client: Client,
    base_url: Url,
    index_name: String,
    username: Option<String>,
    password: Option<String>,
    max_candidates: usize,
}

impl ElasticVectorIndex {
    pub fn new(config: &IndexConfig, max_candidates: usize) -> Result<Self> {
        let base_url = Url::parse(&config.elasticsearch_url)
            .with_context(|| format!("invalid elasticsearch_url: {}", config.elasticsearch_url))?;
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            index_name: config.index_name.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            max_candidates,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("elasticsearch_url cannot be a base URL"))?
            .pop_if_empty()
            .push(&self.index_name)
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    async fn stored_schema(&self) -> Result<Option<(usize, String)>> {
        let response = self
            .request(reqwest::Method::GET, self.url(&["_mapping"])?)
            .send()
            .await
            .context("elasticsearch request failed")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = checked_json(response).await?;
        Ok(parse_vector_mapping(&body))
    }

    async fn count_matching(&self, filter: &Value) -> Result<usize> {
        let response = self
            .request(reqwest::Method::POST, self.url(&["_count"])?)
            .json(&json!({ "query": filter }))
            .send()
            .await
            .context("elasticsearch request failed")?;
        let body = checked_json(response).await?;
        body["count"]
            .as_u64()
            .map(|n| n as usize)
            .context("count response missing `count`")
    }
}

async fn checked_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("elasticsearch returned {status}: {body}");
    }
    response
        .json()
        .await
        .context("failed to parse elasticsearch response")
}

/// Index mapping for `dimension`-wide cosine vectors plus the filter fields.
pub fn index_mapping(dimension: usize, metric: SimilarityMetric) -> Value {
    json!({
        "mappings": {
            "properties": {
                "media_id": { "type": "keyword" },
                "embedding": {
                    "type": "dense_vector",
                    "dims": dimension,
                    "index": true,
                    "similarity": metric.as_str(),
                },
                "owner_id": { "type": "keyword" },
                "visibility": { "type": "keyword" },
                "content_type": { "type": "keyword" },
                "tags": { "type": "keyword" },
                "upload_date": { "type": "date" },
            }
        }
    })
}

/// Read `(dims, similarity)` out of a `GET <index>/_mapping` response.
fn parse_vector_mapping(body: &Value) -> Option<(usize, String)> {
    let (_, index) = body.as_object()?.iter().next()?;
    let embedding = &index["mappings"]["properties"]["embedding"];
    let dims = embedding["dims"].as_u64()? as usize;
    let similarity = embedding["similarity"].as_str().unwrap_or("cosine").to_string();
    Some((dims, similarity))
}

/// Compile a predicate into an Elasticsearch query clause.
pub fn compile_filter(predicate: &Predicate) -> Value {
    match predicate {
        Predicate::MatchAll => json!({ "match_all": {} }),
        Predicate::MatchNone => json!({ "match_none": {} }),
        Predicate::Eq(field, value) => field_clause("term", *field, json!(value)),
        Predicate::In(_, values) if values.is_empty() => json!({ "match_none": {} }),
        Predicate::In(field, values) => field_clause("terms", *field, json!(values)),
        Predicate::Range { field, gte, lte } => {
            let mut bounds = serde_json::Map::new();
            if let Some(lo) = gte {
                bounds.insert("gte".into(), json!(lo));
            }
            if let Some(hi) = lte {
                bounds.insert("lte".into(), json!(hi));
            }
            if bounds.is_empty() {
                json!({ "match_all": {} })
            } else {
                field_clause("range", *field, Value::Object(bounds))
            }
        }
        Predicate::And(parts) => {
            let clauses: Vec<Value> = parts.iter().map(compile_filter).collect();
            json!({ "bool": { "filter": clauses } })
        }
        Predicate::Or(parts) => {
            let clauses: Vec<Value> = parts.iter().map(compile_filter).collect();
            json!({ "bool": { "should": clauses, "minimum_should_match": 1 } })
        }
    }
}

/// `{ op: { field: value } }`
fn field_clause(op: &str, field: Field, value: Value) -> Value {
    let mut inner = serde_json::Map::new();
    inner.insert(field.name().to_string(), value);
    let mut outer = serde_json::Map::new();
    outer.insert(op.to_string(), Value::Object(inner));
    Value::Object(outer)
}

/// Elasticsearch reports cosine similarity as `(1 + cos) / 2`.
fn score_to_cosine(score: f64) -> f32 {
    (2.0 * score - 1.0) as f32
}

fn parse_hits(body: &Value) -> Result<Vec<KnnHit>> {
    let hits = body["hits"]["hits"]
        .as_array()
        .context("search response missing hits.hits")?;
    hits.iter()
        .map(|hit| {
            let id = hit["_id"].as_str().context("hit missing _id")?.to_string();
            let score = hit["_score"].as_f64().context("hit missing _score")?;
            Ok(KnnHit {
                id,
                score: score_to_cosine(score),
            })
        })
        .collect()
}

fn document(id: &str, vector: &[f32], metadata: &VectorMetadata) -> Value {
    json!({
        "media_id": id,
        "embedding": vector,
        "owner_id": metadata.owner_id,
        "visibility": metadata.visibility.as_str(),
        "content_type": metadata.content_type,
        "tags": metadata.tags,
        "upload_date": format_timestamp(&metadata.upload_date),
    })
}

#[async_trait]
impl VectorIndex for ElasticVectorIndex {
    fn backend_name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn ensure_schema(&self, dimension: usize, metric: SimilarityMetric) -> Result<()> {
        if self.stored_schema().await?.is_none() {
            let response = self
                .request(reqwest::Method::PUT, self.url(&[])?)
                .json(&index_mapping(dimension, metric))
                .send()
                .await
                .context("elasticsearch request failed")?;

            if response.status().is_success() {
                tracing::info!(
                    index = %self.index_name,
                    dimension,
                    metric = %metric,
                    "vector index created"
                );
                return Ok(());
            }
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // Lost a creation race; fall through and verify what the winner made.
            if !body.contains("resource_already_exists_exception") {
                anyhow::bail!("failed to create index {}: {status}: {body}", self.index_name);
            }
        }

        match self.stored_schema().await? {
            Some((dims, similarity)) if dims == dimension && similarity == metric.as_str() => {
                Ok(())
            }
            Some((dims, similarity)) => Err(MosaicError::IncompatibleSchema(format!(
                "index {} holds {dims}-d {similarity} vectors, requested {dimension}-d {metric}",
                self.index_name
            ))
            .into()),
            None => Err(MosaicError::IncompatibleSchema(format!(
                "index {} exists without a dense_vector `embedding` field",
                self.index_name
            ))
            .into()),
        }
    }

    async fn reset_schema(&self, dimension: usize, metric: SimilarityMetric) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, self.url(&[])?)
            .send()
            .await
            .context("elasticsearch request failed")?;
        if response.status() != StatusCode::NOT_FOUND {
            checked_json(response).await?;
        }
        tracing::warn!(index = %self.index_name, "vector index deleted");
        self.ensure_schema(dimension, metric).await
    }

    async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, self.url(&["_doc", id])?)
            .json(&document(id, vector, metadata))
            .send()
            .await
            .context("elasticsearch request failed")?;
        checked_json(response).await?;
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, self.url(&["_doc", id])?)
            .send()
            .await
            .context("elasticsearch request failed")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        checked_json(response).await?;
        Ok(())
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

        let filter = compile_filter(predicate);
        let num_candidates = candidate_pool(k, candidate_multiplier, self.max_candidates);
        let body = json!({
            "size": k,
            "_source": false,
            "knn": {
                "field": "embedding",
                "query_vector": vector,
                "k": k,
                "num_candidates": num_candidates,
                "filter": filter,
            },
        });

        let search = async {
            let response = self
                .request(reqwest::Method::POST, self.url(&["_search"])?)
                .json(&body)
                .send()
                .await
                .context("elasticsearch request failed")?;
            parse_hits(&checked_json(response).await?)
        };
        let (hits, total) = futures::try_join!(search, self.count_matching(&filter))?;

        tracing::debug!(k, num_candidates, hits = hits.len(), total, "elasticsearch knn query");
        Ok(KnnResponse {
            hits,
            total_matches: Some(total),
        })
    }

    async fn count(&self) -> Result<usize> {
        let response = self
            .request(reqwest::Method::GET, self.url(&["_count"])?)
            .send()
            .await
            .context("elasticsearch request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let body = checked_json(response).await?;
        body["count"]
            .as_u64()
            .map(|n| n as usize)
            .context("count response missing `count`")
    }
}
