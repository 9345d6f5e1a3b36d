use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MosaicConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub media_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    pub dimensions: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    /// `"sqlite"` (vectors live next to the document store) or `"elasticsearch"`.
    pub backend: String,
    pub elasticsearch_url: String,
    pub index_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub candidate_multiplier: usize,
    pub max_candidates: usize,
    pub default_threshold: f32,
    /// Deepest rank a query may reach (`page × page_size`). Matches
    /// Elasticsearch's default `index.max_result_window`.
    pub max_result_window: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    pub encoder_ms: u64,
    pub index_ms: u64,
    pub store_ms: u64,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_mosaic_dir();
        Self {
            db_path: dir.join("mosaic.db").to_string_lossy().into_owned(),
            media_dir: dir.join("media").to_string_lossy().into_owned(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_mosaic_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "clip".into(),
            model: "clip-vit-base-patch32".into(),
            cache_dir,
            dimensions: 512,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".into(),
            elasticsearch_url: "http://localhost:9200".into(),
            index_name: "media_embeddings".into(),
            username: None,
            password: None,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_page_size: 12,
            max_page_size: 100,
            candidate_multiplier: 10,
            max_candidates: 100,
            default_threshold: 0.0,
            max_result_window: 10_000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            encoder_ms: 30_000,
            index_ms: 5_000,
            store_ms: 2_000,
        }
    }
}

impl EmbeddingConfig {
    /// Output width of the configured model. Known models use the registry
    /// value; `dimensions` only applies to models outside the registry.
    pub fn effective_dimensions(&self) -> usize {
        crate::embedding::clip::model_info(&self.model)
            .map(|info| info.dims)
            .unwrap_or(self.dimensions)
    }
}

impl TimeoutConfig {
    pub fn encoder(&self) -> Duration {
        Duration::from_millis(self.encoder_ms)
    }

    pub fn index(&self) -> Duration {
        Duration::from_millis(self.index_ms)
    }

    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }
}

/// Returns `~/.mosaic/`, or `./.mosaic` when no home directory is available.
pub fn default_mosaic_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mosaic")
}

/// Returns the default config file path: `~/.mosaic/config.toml`
pub fn default_config_path() -> PathBuf {
    default_mosaic_dir().join("config.toml")
}

impl MosaicConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MosaicConfig::default()
        };

        config.apply_env_overrides();

        let dims = config.embedding.effective_dimensions();
        if dims != config.embedding.dimensions {
            tracing::warn!(
                model = %config.embedding.model,
                configured = config.embedding.dimensions,
                actual = dims,
                "[embedding] dimensions disagrees with the model, using the model's"
            );
            config.embedding.dimensions = dims;
        }
        Ok(config)
    }

    /// Apply environment variable overrides (MOSAIC_DB, MOSAIC_MEDIA_DIR, MOSAIC_LOG_LEVEL,
    /// MOSAIC_INDEX_BACKEND, MOSAIC_ELASTICSEARCH_URL, MOSAIC_MODEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MOSAIC_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MOSAIC_MEDIA_DIR") {
            self.storage.media_dir = val;
        }
        if let Ok(val) = std::env::var("MOSAIC_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MOSAIC_INDEX_BACKEND") {
            self.index.backend = val;
        }
        if let Ok(val) = std::env::var("MOSAIC_ELASTICSEARCH_URL") {
            self.index.elasticsearch_url = val;
        }
        if let Ok(val) = std::env::var("MOSAIC_MODEL") {
            self.embedding.model = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Resolve the media byte directory, expanding `~` if needed.
    pub fn resolved_media_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.media_dir)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
