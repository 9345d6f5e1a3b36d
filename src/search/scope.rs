//! Scope selection and its translation into index predicates.
//!
//! A raw scope string is parsed once at the boundary into a [`ScopeSelector`];
//! from there on the selector is a closed enum and the resolver never sees
//! free-form text.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{Caller, SearchFilters};
use crate::error::{MosaicError, Result};
use crate::index::{Field, Predicate};
use crate::store::{format_timestamp, DocumentStore, Visibility};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeSelector {
    /// Everything the caller may see: public media plus their own.
    All,
    OwnedBy(String),
    PublicOnly,
    CollectionMembers(String),
}

impl ScopeSelector {
    /// Parse a boundary scope string.
    ///
    /// Accepts `all`, `shared` / `public`, `my_images` / `mine`,
    /// `owner:<user>`, and `collection:<id>`. `my_images` resolves to the
    /// caller and is forbidden for anonymous callers.
    pub fn parse(raw: &str, caller: &Caller) -> Result<Self> {
        let raw = raw.trim();
        match raw {
            "" | "all" => return Ok(Self::All),
            "shared" | "public" => return Ok(Self::PublicOnly),
            "my_images" | "mine" => {
                return caller.user_id.clone().map(Self::OwnedBy).ok_or_else(|| {
                    MosaicError::ScopeForbidden("my_images requires a signed-in caller".into())
                });
            }
            _ => {}
        }

        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| MosaicError::InvalidScope(raw.to_string()))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(MosaicError::InvalidScope(format!("{raw}: missing id")));
        }
        match kind {
            "owner" => Ok(Self::OwnedBy(id.to_string())),
            "collection" => Ok(Self::CollectionMembers(id.to_string())),
            _ => Err(MosaicError::InvalidScope(raw.to_string())),
        }
    }
}

impl std::fmt::Display for ScopeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::OwnedBy(user) => write!(f, "owner:{user}"),
            Self::PublicOnly => f.write_str("shared"),
            Self::CollectionMembers(id) => write!(f, "collection:{id}"),
        }
    }
}

/// Translates scope + filters into a single predicate.
pub struct ScopeResolver {
    store: Arc<dyn DocumentStore>,
    store_timeout: Duration,
}

impl ScopeResolver {
    pub fn new(store: Arc<dyn DocumentStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Scope predicate AND-ed with the filter predicate. An inaccessible or
    /// empty scope yields [`Predicate::MatchNone`] rather than an error.
    pub async fn resolve(
        &self,
        scope: &ScopeSelector,
        filters: &SearchFilters,
        caller: &Caller,
    ) -> Result<Predicate> {
        let scope_predicate = self.scope_predicate(scope, caller).await?;
        Ok(Predicate::and(vec![scope_predicate, filter_predicate(filters)]))
    }

    async fn scope_predicate(&self, scope: &ScopeSelector, caller: &Caller) -> Result<Predicate> {
        let public = || Predicate::eq(Field::Visibility, Visibility::Public.as_str());

        match scope {
            ScopeSelector::All => Ok(match &caller.user_id {
                Some(user) => {
                    Predicate::or(vec![public(), Predicate::eq(Field::OwnerId, user.as_str())])
                }
                None => public(),
            }),
            ScopeSelector::PublicOnly => Ok(public()),
            ScopeSelector::OwnedBy(user) => {
                let is_self = caller.user_id.as_deref() == Some(user.as_str());
                if !is_self && !caller.elevated {
                    return Err(MosaicError::ScopeForbidden(format!(
                        "cannot search media owned by {user}"
                    )));
                }
                Ok(Predicate::eq(Field::OwnerId, user.as_str()))
            }
            ScopeSelector::CollectionMembers(id) => {
                let lookup = self.store.get_collection(id);
                let collection = tokio::time::timeout(self.store_timeout, lookup)
                    .await
                    .map_err(|_| {
                        MosaicError::DocumentStoreUnavailable(format!(
                            "collection lookup timed out after {}ms",
                            self.store_timeout.as_millis()
                        ))
                    })?
                    .map_err(|e| MosaicError::DocumentStoreUnavailable(format!("{e:#}")))?;

                match collection {
                    Some(c) if c.visible_to(caller) => {
                        Ok(Predicate::any_of(Field::MediaId, c.media_ids))
                    }
                    Some(_) => {
                        tracing::debug!(collection = %id, "collection not visible to caller");
                        Ok(Predicate::MatchNone)
                    }
                    None => {
                        tracing::debug!(collection = %id, "collection not found");
                        Ok(Predicate::MatchNone)
                    }
                }
            }
        }
    }
}

/// Filters as a conjunction of field predicates. Empty lists are no constraint.
pub fn filter_predicate(filters: &SearchFilters) -> Predicate {
    if filters.is_empty() {
        return Predicate::MatchAll;
    }
    let mut parts = Vec::new();

    if let Some(types) = filters.content_types.as_ref().filter(|t| !t.is_empty()) {
        parts.push(Predicate::In(Field::ContentType, types.clone()));
    }
    if let Some(tags) = filters.tags.as_ref().filter(|t| !t.is_empty()) {
        parts.push(Predicate::In(Field::Tags, tags.clone()));
    }
    if filters.uploaded_from.is_some() || filters.uploaded_to.is_some() {
        let fmt = |ts: &DateTime<Utc>| format_timestamp(ts);
        parts.push(Predicate::Range {
            field: Field::UploadDate,
            gte: filters.uploaded_from.as_ref().map(fmt),
            lte: filters.uploaded_to.as_ref().map(fmt),
        });
    }

    Predicate::and(parts)
}
