use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scope::ScopeSelector;
use crate::store::MediaRecord;

/// The identity a search or scope check runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// `None` for anonymous callers.
    pub user_id: Option<String>,
    /// Elevated callers may search other users' media.
    pub elevated: bool,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            elevated: false,
        }
    }

    pub fn with_elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Optional attribute filters, AND-ed with the scope. `None` (or an empty
/// list) means no constraint on that attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub content_types: Option<Vec<String>>,
    /// Any-of: a media item matches if it carries at least one listed tag.
    pub tags: Option<Vec<String>>,
    /// Inclusive lower bound on `upload_date`.
    pub uploaded_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `upload_date`.
    pub uploaded_to: Option<DateTime<Utc>>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.content_types.as_deref().unwrap_or_default().is_empty()
            && self.tags.as_deref().unwrap_or_default().is_empty()
            && self.uploaded_from.is_none()
            && self.uploaded_to.is_none()
    }
}

/// A fully parsed search request.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// Unit-length query vector.
    pub embedding: Vec<f32>,
    pub scope: ScopeSelector,
    pub filters: SearchFilters,
    /// Minimum cosine similarity; `0.0` keeps everything non-negative.
    pub threshold: f32,
    pub page_size: usize,
    /// 1-indexed.
    pub page: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub media_id: String,
    pub score: f32,
    pub record: MediaRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    /// Exact predicate match count from the index when it reports one,
    /// otherwise the number of hits that survived hydration and threshold.
    pub total: usize,
    pub elapsed_ms: u64,
    pub page: usize,
    pub page_size: usize,
}

impl SearchResult {
    pub fn empty(page: usize, page_size: usize, elapsed_ms: u64) -> Self {
        Self {
            hits: vec![],
            total: 0,
            elapsed_ms,
            page,
            page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lists_are_no_constraint() {
        let filters = SearchFilters {
            content_types: Some(vec![]),
            tags: None,
            ..Default::default()
        };
        assert!(filters.is_empty());

        let filters = SearchFilters {
            tags: Some(vec!["beach".into()]),
            ..Default::default()
        };
        assert!(!filters.is_empty());
    }

    #[test]
    fn caller_builders() {
        assert!(!Caller::anonymous().is_authenticated());
        let admin = Caller::user("a").with_elevated(true);
        assert!(admin.is_authenticated() && admin.elevated);
    }
}
