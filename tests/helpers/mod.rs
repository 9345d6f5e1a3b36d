#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use mosaic::config::MosaicConfig;
use mosaic::db;
use mosaic::embedding::{EncoderService, MediaEncoder};
use mosaic::index::sqlite::SqliteVectorIndex;
use mosaic::index::{KnnResponse, Predicate, SimilarityMetric, VectorIndex, VectorMetadata};
use mosaic::ingest::IndexRequest;
use mosaic::service::{LocalStack, MosaicService};
use mosaic::store::bytes::FsByteStore;
use mosaic::store::sqlite::SqliteDocumentStore;
use mosaic::store::{MediaRecord, Visibility};

pub const DIMS: usize = 16;

/// Deterministic encoder. Bytes of the form `vec:x,y,z,...` decode to that
/// vector, zero-padded or cut to the encoder width; anything else hashes to a
/// pseudo-random one. Bytes starting with `bad` fail to decode, like a corrupt
/// image.
pub struct FakeEncoder {
    dims: usize,
}

impl FakeEncoder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn decode(&self, raw: &str) -> anyhow::Result<Vec<f32>> {
        if raw.starts_with("bad") {
            anyhow::bail!("failed to decode image");
        }
        if let Some(list) = raw.strip_prefix("vec:") {
            let mut v = list
                .split(',')
                .map(|x| x.trim().parse::<f32>().map_err(Into::into))
                .collect::<anyhow::Result<Vec<f32>>>()?;
            v.resize(self.dims, 0.0);
            return Ok(v);
        }
        Ok(hashed_vector(raw, self.dims))
    }
}

impl MediaEncoder for FakeEncoder {
    fn embed_image(&self, bytes: &[u8]) -> anyhow::Result<Vec<f32>> {
        self.decode(&String::from_utf8_lossy(bytes))
    }

    fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.decode(text)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "fake-clip"
    }
}

fn hashed_vector(seed: &str, dims: usize) -> Vec<f32> {
    (0..dims)
        .map(|i| {
            let mut h = DefaultHasher::new();
            (seed, i).hash(&mut h);
            (h.finish() % 2000) as f32 / 1000.0 - 1.0
        })
        .collect()
}

/// Unit-ish vector pointing mostly along `axis`, tilted towards `axis + 1`.
pub fn axis(axis: usize, tilt: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[axis % DIMS] = 1.0;
    v[(axis + 1) % DIMS] = tilt;
    v
}

/// Image bytes that [`FakeEncoder`] decodes to exactly `v`.
pub fn image_bytes(v: &[f32]) -> Vec<u8> {
    let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
    format!("vec:{}", parts.join(",")).into_bytes()
}

/// Wraps a real index and fails selected operations on demand.
pub struct FlakyIndex {
    inner: Arc<dyn VectorIndex>,
    pub fail_upsert: AtomicBool,
    pub fail_query: AtomicBool,
}

impl FlakyIndex {
    pub fn new(inner: Arc<dyn VectorIndex>) -> Self {
        Self {
            inner,
            fail_upsert: AtomicBool::new(false),
            fail_query: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn ensure_schema(
        &self,
        dimension: usize,
        metric: SimilarityMetric,
    ) -> anyhow::Result<()> {
        self.inner.ensure_schema(dimension, metric).await
    }

    async fn reset_schema(&self, dimension: usize, metric: SimilarityMetric) -> anyhow::Result<()> {
        self.inner.reset_schema(dimension, metric).await
    }

    async fn upsert(
        &self,
        id: &str,
        vector: &[f32],
        metadata: &VectorMetadata,
    ) -> anyhow::Result<()> {
        if self.fail_upsert.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        self.inner.upsert(id, vector, metadata).await
    }

    async fn delete_by_id(&self, id: &str) -> anyhow::Result<()> {
        self.inner.delete_by_id(id).await
    }

    async fn knn_query(
        &self,
        vector: &[f32],
        k: usize,
        predicate: &Predicate,
        candidate_multiplier: usize,
    ) -> anyhow::Result<KnnResponse> {
        if self.fail_query.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        self.inner.knn_query(vector, k, predicate, candidate_multiplier).await
    }

    async fn count(&self) -> anyhow::Result<usize> {
        self.inner.count().await
    }
}

pub struct TestEnv {
    pub service: MosaicService,
    pub store: SqliteDocumentStore,
    pub bytes: FsByteStore,
    pub flaky: Option<Arc<FlakyIndex>>,
    _media_dir: Option<TempDir>,
}

fn test_config(media_dir: &Path, dims: usize) -> MosaicConfig {
    let mut config = MosaicConfig::default();
    config.storage.media_dir = media_dir.to_string_lossy().into_owned();
    config.embedding.dimensions = dims;
    config
}

fn fake_encoder(dims: usize) -> Arc<EncoderService> {
    Arc::new(EncoderService::preloaded(
        Arc::new(FakeEncoder::new(dims)),
        Duration::from_secs(5),
    ))
}

/// In-memory database, sqlite-vec index, temp media directory.
pub fn setup() -> TestEnv {
    let media_dir = TempDir::new().unwrap();
    let config = test_config(media_dir.path(), DIMS);
    let conn = db::open_memory_database().unwrap();
    let stack = LocalStack::assemble(&config, conn, fake_encoder(DIMS), ":memory:".into()).unwrap();
    TestEnv {
        service: stack.service,
        store: stack.store,
        bytes: stack.bytes,
        flaky: None,
        _media_dir: Some(media_dir),
    }
}

/// Database file and media directory under `dir`, so a second env with
/// another encoder width can reopen the same data.
pub fn setup_in(dir: &TempDir, dims: usize) -> TestEnv {
    let config = test_config(&dir.path().join("media"), dims);
    let db_path = dir.path().join("mosaic.db");
    let conn = db::open_database(&db_path).unwrap();
    let stack = LocalStack::assemble(&config, conn, fake_encoder(dims), db_path).unwrap();
    TestEnv {
        service: stack.service,
        store: stack.store,
        bytes: stack.bytes,
        flaky: None,
        _media_dir: None,
    }
}

/// Like [`setup`], but the index can be made to fail.
pub fn setup_flaky() -> TestEnv {
    let media_dir = TempDir::new().unwrap();
    let config = test_config(media_dir.path(), DIMS);
    let conn = db::open_memory_database().unwrap();
    let db = Arc::new(std::sync::Mutex::new(conn));

    let store = SqliteDocumentStore::new(Arc::clone(&db));
    let bytes = FsByteStore::new(media_dir.path());
    let flaky = Arc::new(FlakyIndex::new(Arc::new(SqliteVectorIndex::new(db, 100))));
    let service = MosaicService::new(
        &config,
        fake_encoder(DIMS),
        flaky.clone(),
        Arc::new(store.clone()),
        Arc::new(bytes.clone()),
    );

    TestEnv {
        service,
        store,
        bytes,
        flaky: Some(flaky),
        _media_dir: Some(media_dir),
    }
}

pub fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

/// Builder for a media item going through the upload path.
pub struct Upload {
    pub id: String,
    pub owner: Option<String>,
    pub visibility: Visibility,
    pub content_type: String,
    pub tags: Vec<String>,
    pub upload_date: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn image(id: &str, owner: Option<&str>, visibility: Visibility, vector: &[f32]) -> Self {
        Self {
            id: id.into(),
            owner: owner.map(Into::into),
            visibility,
            content_type: "image/png".into(),
            tags: vec![],
            upload_date: day(2024, 6, 1),
            bytes: image_bytes(vector),
        }
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn uploaded(mut self, date: DateTime<Utc>) -> Self {
        self.upload_date = date;
        self
    }

    pub fn raw_bytes(mut self, bytes: &[u8]) -> Self {
        self.bytes = bytes.to_vec();
        self
    }
}

impl TestEnv {
    /// Store the record and bytes, then index. Returns whether it was indexed.
    pub async fn upload(&self, upload: Upload) -> bool {
        self.store
            .insert_media(MediaRecord {
                id: upload.id.clone(),
                owner_id: upload.owner,
                visibility: upload.visibility,
                content_type: upload.content_type.clone(),
                filename: format!("{}.png", upload.id),
                file_size: upload.bytes.len() as u64,
                tags: upload.tags,
                upload_date: upload.upload_date,
                embedding_indexed: false,
            })
            .await
            .unwrap();
        self.bytes.put_bytes(&upload.id, &upload.bytes).await.unwrap();
        self.service
            .index_media(IndexRequest {
                media_id: upload.id,
                content_type: upload.content_type,
                bytes: upload.bytes,
            })
            .await
    }
}
