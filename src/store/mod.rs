//! Document store and byte store: the authoritative side of the dual write.
//!
//! The search core only needs a narrow view of these collaborators: fetch a
//! [`MediaRecord`], list a collection's members, flip the `embedding_indexed`
//! flag, and read raw bytes back for re-embedding. Everything else (uploads,
//! collection CRUD) belongs to the surrounding application; the SQLite and
//! filesystem implementations expose just enough of it for the CLI and tests.

pub mod bytes;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::search::types::Caller;

/// Who may see a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            _ => Err(format!("unknown visibility: {s}")),
        }
    }
}

/// Searchability of a media record as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    /// A vector exists in the index.
    Indexed,
    /// Not yet searchable: deferred content type, or a failed embed/index write.
    Processing,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Indexed => "indexed",
            Self::Processing => "processing",
        }
    }
}

impl std::fmt::Display for EmbeddingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media record, matching the `media` table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    /// `None` for system media, which is only ever reachable through public visibility.
    pub owner_id: Option<String>,
    pub visibility: Visibility,
    pub content_type: String,
    pub filename: String,
    pub file_size: u64,
    pub tags: Vec<String>,
    pub upload_date: DateTime<Utc>,
    /// `true` implies a vector exists in the index. The converse may lag.
    pub embedding_indexed: bool,
}

impl MediaRecord {
    pub fn is_image(&self) -> bool {
        is_image_content_type(&self.content_type)
    }

    /// `"image"` or `"video"`, as surfaced to clients.
    pub fn media_kind(&self) -> &'static str {
        if self.is_image() {
            "image"
        } else {
            "video"
        }
    }

    pub fn embedding_status(&self) -> EmbeddingStatus {
        if self.embedding_indexed {
            EmbeddingStatus::Indexed
        } else {
            EmbeddingStatus::Processing
        }
    }
}

/// A collection with the access fields the scope resolver checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: String,
    pub owner_id: String,
    pub is_public: bool,
    pub media_ids: Vec<String>,
}

impl CollectionRecord {
    /// Public collections are visible to everyone; private ones to the owner
    /// and to elevated callers.
    pub fn visible_to(&self, caller: &Caller) -> bool {
        self.is_public
            || caller.elevated
            || caller.user_id.as_deref() == Some(self.owner_id.as_str())
    }
}

/// Read/flag access to authoritative media metadata.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<MediaRecord>>;

    /// Collection with its member ids, or `None` if it does not exist.
    async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>>;

    async fn set_indexed_flag(&self, id: &str, indexed: bool) -> Result<()>;

    /// Every media id, oldest first. Used by bulk reindexing.
    async fn list_media_ids(&self) -> Result<Vec<String>>;
}

/// Raw media bytes by id. Writes belong to the upload path.
#[async_trait]
pub trait ByteStore: Send + Sync {
    async fn get_bytes(&self, id: &str) -> Result<Option<Vec<u8>>>;
}

pub fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .trim()
        .to_ascii_lowercase()
        .starts_with("image/")
}

/// Canonical timestamp text. Fixed width, so string order equals time order
/// in both SQL comparisons and keyword filters.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
