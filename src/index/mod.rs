//! Vector index: ANN storage of media embeddings with filterable metadata.
//!
//! Each vector carries denormalized copies of the access and filter fields
//! (`owner_id`, `visibility`, `content_type`, `tags`, `upload_date`) so that
//! scope and filter predicates are evaluated inside the same query as the
//! similarity search instead of post-filtering a truncated candidate list.

pub mod elastic;
pub mod sqlite;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::MosaicConfig;
use crate::store::{format_timestamp, MediaRecord, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    Cosine,
}

impl SimilarityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
        }
    }
}

impl std::fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Self::Cosine),
            _ => Err(format!("unknown similarity metric: {s}")),
        }
    }
}

/// Filterable fields stored next to each vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    MediaId,
    OwnerId,
    Visibility,
    ContentType,
    /// Multi-valued: a predicate on tags matches if any stored tag matches.
    Tags,
    UploadDate,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MediaId => "media_id",
            Self::OwnerId => "owner_id",
            Self::Visibility => "visibility",
            Self::ContentType => "content_type",
            Self::Tags => "tags",
            Self::UploadDate => "upload_date",
        }
    }
}

/// A filter tree pushed down into the index query.
///
/// Values are strings; upload dates use the fixed-width form produced by
/// [`crate::store::format_timestamp`], so lexical and chronological order agree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    MatchAll,
    /// The empty predicate. Never sent to a backend.
    MatchNone,
    Eq(Field, String),
    In(Field, Vec<String>),
    Range {
        field: Field,
        gte: Option<String>,
        lte: Option<String>,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: Field, value: impl Into<String>) -> Self {
        Self::Eq(field, value.into())
    }

    /// Membership test. An empty set matches nothing.
    pub fn any_of(field: Field, values: Vec<String>) -> Self {
        if values.is_empty() {
            Self::MatchNone
        } else {
            Self::In(field, values)
        }
    }

    /// Conjunction, simplified: `MatchAll` terms vanish, any `MatchNone` wins.
    pub fn and(parts: Vec<Predicate>) -> Self {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                Self::MatchAll => {}
                Self::MatchNone => return Self::MatchNone,
                Self::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Self::MatchAll,
            1 => flat.remove(0),
            _ => Self::And(flat),
        }
    }

    /// Disjunction, simplified: `MatchNone` terms vanish, any `MatchAll` wins.
    pub fn or(parts: Vec<Predicate>) -> Self {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                Self::MatchNone => {}
                Self::MatchAll => return Self::MatchAll,
                Self::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Self::MatchNone,
            1 => flat.remove(0),
            _ => Self::Or(flat),
        }
    }

    /// True when no document can satisfy the predicate, whatever the index holds.
    pub fn matches_nothing(&self) -> bool {
        match self {
            Self::MatchNone => true,
            Self::In(_, values) => values.is_empty(),
            Self::And(parts) => parts.iter().any(Predicate::matches_nothing),
            Self::Or(parts) => parts.iter().all(Predicate::matches_nothing),
            Self::MatchAll | Self::Eq(..) | Self::Range { .. } => false,
        }
    }

    /// Evaluate against an authoritative record, with the same semantics the
    /// backends apply to the denormalized vector metadata.
    pub fn matches_record(&self, record: &MediaRecord) -> bool {
        match self {
            Self::MatchAll => true,
            Self::MatchNone => false,
            Self::Eq(field, value) => record_values(record, *field).iter().any(|v| v == value),
            Self::In(field, values) => record_values(record, *field)
                .iter()
                .any(|v| values.contains(v)),
            Self::Range { field, gte, lte } => record_values(record, *field).iter().any(|v| {
                gte.as_ref().map_or(true, |lo| v >= lo) && lte.as_ref().map_or(true, |hi| v <= hi)
            }),
            Self::And(parts) => parts.iter().all(|p| p.matches_record(record)),
            Self::Or(parts) => parts.iter().any(|p| p.matches_record(record)),
        }
    }
}

fn record_values(record: &MediaRecord, field: Field) -> Vec<String> {
    match field {
        Field::MediaId => vec![record.id.clone()],
        Field::OwnerId => record.owner_id.iter().cloned().collect(),
        Field::Visibility => vec![record.visibility.as_str().to_string()],
        Field::ContentType => vec![record.content_type.clone()],
        Field::Tags => record.tags.clone(),
        Field::UploadDate => vec![format_timestamp(&record.upload_date)],
    }
}

/// Metadata denormalized onto each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub owner_id: Option<String>,
    pub visibility: Visibility,
    pub content_type: String,
    pub tags: Vec<String>,
    pub upload_date: DateTime<Utc>,
}

impl From<&MediaRecord> for VectorMetadata {
    fn from(record: &MediaRecord) -> Self {
        Self {
            owner_id: record.owner_id.clone(),
            visibility: record.visibility,
            content_type: record.content_type.clone(),
            tags: record.tags.clone(),
            upload_date: record.upload_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnnHit {
    pub id: String,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnnResponse {
    /// At most `k` hits, descending score.
    pub hits: Vec<KnnHit>,
    /// Exact number of indexed vectors matching the predicate, if the backend reports it.
    pub total_matches: Option<usize>,
}

/// Candidate pool for approximate search: `k × multiplier` capped at
/// `max_candidates`, but never fewer than `k`.
pub fn candidate_pool(k: usize, multiplier: usize, max_candidates: usize) -> usize {
    k.saturating_mul(multiplier.max(1)).min(max_candidates).max(k)
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Create the index if absent. Fails with
    /// [`MosaicError::IncompatibleSchema`](crate::error::MosaicError::IncompatibleSchema)
    /// when an existing index disagrees on dimension or metric.
    async fn ensure_schema(&self, dimension: usize, metric: SimilarityMetric) -> Result<()>;

    /// Drop every stored vector and recreate the index for `dimension`/`metric`.
    /// Used when the encoder changed shape and a full reindex follows.
    async fn reset_schema(&self, dimension: usize, metric: SimilarityMetric) -> Result<()>;

    /// Insert or overwrite the vector for `id`.
    async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<()>;

    /// Remove the vector for `id`. Unknown ids succeed.
    async fn delete_by_id(&self, id: &str) -> Result<()>;

    /// Up to `k` nearest vectors satisfying `predicate`, descending score.
    /// Ties keep the index's insertion order.
    async fn knn_query(
        &self,
        vector: &[f32],
        k: usize,
        predicate: &Predicate,
        candidate_multiplier: usize,
    ) -> Result<KnnResponse>;

    /// Number of stored vectors.
    async fn count(&self) -> Result<usize>;
}

/// Build the backend named by `[index] backend`.
pub fn create_index(
    config: &MosaicConfig,
    db: Arc<Mutex<Connection>>,
) -> Result<Arc<dyn VectorIndex>> {
    match config.index.backend.as_str() {
        "sqlite" => Ok(Arc::new(
            sqlite::SqliteVectorIndex::new(db, config.search.max_candidates)
                .with_embedding_model(&config.embedding.model),
        )),
        "elasticsearch" => Ok(Arc::new(elastic::ElasticVectorIndex::new(
            &config.index,
            config.search.max_candidates,
        )?)),
        other => anyhow::bail!("unknown index backend: {other}. Supported: sqlite, elasticsearch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(u: &str) -> Predicate {
        Predicate::eq(Field::OwnerId, u)
    }

    #[test]
    fn and_drops_match_all_and_flattens() {
        let p = Predicate::and(vec![
            Predicate::MatchAll,
            owner("u1"),
            Predicate::and(vec![owner("u2"), Predicate::eq(Field::Visibility, "public")]),
        ]);
        match p {
            Predicate::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
        assert_eq!(Predicate::and(vec![]), Predicate::MatchAll);
        assert_eq!(Predicate::and(vec![owner("u1")]), owner("u1"));
    }

    #[test]
    fn and_with_match_none_is_match_none() {
        let p = Predicate::and(vec![owner("u1"), Predicate::MatchNone]);
        assert_eq!(p, Predicate::MatchNone);
        assert!(p.matches_nothing());
    }

    #[test]
    fn or_simplifies() {
        assert_eq!(
            Predicate::or(vec![Predicate::MatchNone, owner("u1")]),
            owner("u1")
        );
        assert_eq!(
            Predicate::or(vec![owner("u1"), Predicate::MatchAll]),
            Predicate::MatchAll
        );
        assert!(Predicate::or(vec![]).matches_nothing());
    }

    #[test]
    fn empty_membership_matches_nothing() {
        assert!(Predicate::any_of(Field::MediaId, vec![]).matches_nothing());
        assert!(Predicate::In(Field::Tags, vec![]).matches_nothing());
        let none = || Predicate::In(Field::MediaId, vec![]);
        assert!(Predicate::And(vec![owner("u1"), none()]).matches_nothing());
        assert!(!Predicate::Or(vec![owner("u1"), none()]).matches_nothing());
    }

    #[test]
    fn evaluates_against_records() {
        let record = MediaRecord {
            id: "m1".into(),
            owner_id: Some("u1".into()),
            visibility: Visibility::Private,
            content_type: "image/png".into(),
            filename: "m1.png".into(),
            file_size: 10,
            tags: vec!["beach".into(), "dog".into()],
            upload_date: "2024-05-01T12:00:00Z".parse().unwrap(),
            embedding_indexed: true,
        };
        let public = Predicate::eq(Field::Visibility, "public");

        assert!(Predicate::or(vec![public.clone(), owner("u1")]).matches_record(&record));
        assert!(!Predicate::or(vec![public, owner("u2")]).matches_record(&record));
        let pets = Predicate::In(Field::Tags, vec!["cat".into(), "dog".into()]);
        assert!(pets.matches_record(&record));
        assert!(!Predicate::eq(Field::Tags, "cat").matches_record(&record));
        assert!(Predicate::Range {
            field: Field::UploadDate,
            gte: Some("2024-05-01T00:00:00.000Z".into()),
            lte: None,
        }
        .matches_record(&record));
        assert!(!Predicate::Range {
            field: Field::UploadDate,
            gte: None,
            lte: Some("2024-04-30T23:59:59.999Z".into()),
        }
        .matches_record(&record));

        let system = MediaRecord {
            owner_id: None,
            ..record
        };
        assert!(!owner("u1").matches_record(&system));
        assert!(!Predicate::MatchNone.matches_record(&system));
    }

    #[test]
    fn candidate_pool_bounds() {
        assert_eq!(candidate_pool(10, 10, 100), 100);
        assert_eq!(candidate_pool(5, 10, 100), 50);
        assert_eq!(candidate_pool(200, 10, 100), 200);
        assert_eq!(candidate_pool(3, 0, 100), 3);
    }
}
