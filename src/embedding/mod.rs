//! Image/text to vector embedding.
//!
//! [`MediaEncoder`] is the synchronous model interface (CLIP via ONNX Runtime in
//! production, deterministic fakes in tests). [`EncoderService`] wraps one
//! encoder for the async core: the model is loaded lazily behind a one-time
//! barrier, inference runs on the blocking pool under a timeout, and every
//! output is validated and re-normalized before it leaves this module.

pub mod clip;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::OnceCell;

use crate::config::{EmbeddingConfig, MosaicConfig};
use crate::error::MosaicError;

/// Maximum deviation from unit length accepted from a model before re-normalizing.
pub const NORM_TOLERANCE: f32 = 1e-3;

/// A loaded dual image/text encoder sharing one embedding space.
///
/// Implementations are synchronous; [`EncoderService`] moves calls onto the
/// blocking pool.
pub trait MediaEncoder: Send + Sync {
    /// Embed encoded image bytes (PNG, JPEG, WebP, ...).
    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>>;

    /// Embed a text phrase into the same space as images.
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;
}

type Loader = Arc<dyn Fn() -> Result<Arc<dyn MediaEncoder>> + Send + Sync>;

/// Shared handle to the process-wide encoder.
///
/// Cheap to share behind an `Arc`; the model itself is loaded at most once,
/// even when several requests race on the first call.
pub struct EncoderService {
    model_name: String,
    dimensions: usize,
    timeout: Duration,
    loader: Loader,
    encoder: OnceCell<Arc<dyn MediaEncoder>>,
}

impl EncoderService {
    /// Build a service that loads its encoder on first use.
    pub fn new<F>(
        model_name: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
        loader: F,
    ) -> Self
    where
        F: Fn() -> Result<Arc<dyn MediaEncoder>> + Send + Sync + 'static,
    {
        Self {
            model_name: model_name.into(),
            dimensions,
            timeout,
            loader: Arc::new(loader),
            encoder: OnceCell::new(),
        }
    }

    /// Wrap an already-loaded encoder.
    pub fn preloaded(encoder: Arc<dyn MediaEncoder>, timeout: Duration) -> Self {
        let fallback = Arc::clone(&encoder);
        Self {
            model_name: encoder.model_name().to_string(),
            dimensions: encoder.dimensions(),
            timeout,
            loader: Arc::new(move || Ok(Arc::clone(&fallback))),
            encoder: OnceCell::new_with(Some(encoder)),
        }
    }

    /// The configured model, loaded lazily from the model cache.
    pub fn from_config(config: &MosaicConfig) -> Self {
        let embedding = config.embedding.clone();
        Self::new(
            config.embedding.model.clone(),
            config.embedding.effective_dimensions(),
            config.timeouts.encoder(),
            move || create_encoder(&embedding),
        )
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Dimension every vector from this service has. Known before the model loads.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn is_loaded(&self) -> bool {
        self.encoder.initialized()
    }

    /// Load the model now instead of on the first request.
    pub async fn warm_up(&self) -> crate::error::Result<()> {
        self.encoder().await.map(|_| ())
    }

    async fn encoder(&self) -> crate::error::Result<Arc<dyn MediaEncoder>> {
        let encoder = self
            .encoder
            .get_or_try_init(|| async {
                let loader = Arc::clone(&self.loader);
                let started = std::time::Instant::now();
                let encoder = tokio::task::spawn_blocking(move || loader())
                    .await
                    .map_err(|e| {
                        MosaicError::EmbeddingExtraction(format!("model load task failed: {e}"))
                    })?
                    .map_err(|e| {
                        MosaicError::EmbeddingExtraction(format!("failed to load model: {e:#}"))
                    })?;

                if encoder.dimensions() != self.dimensions {
                    return Err(MosaicError::EmbeddingExtraction(format!(
                        "model {} produces {}-d vectors, configured for {}",
                        encoder.model_name(),
                        encoder.dimensions(),
                        self.dimensions
                    )));
                }

                tracing::info!(
                    model = encoder.model_name(),
                    dimensions = encoder.dimensions(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "encoder loaded"
                );
                Ok(encoder)
            })
            .await?;
        Ok(Arc::clone(encoder))
    }

    /// Embed raw image bytes. Never returns a partial or unnormalized vector.
    pub async fn embed_image(&self, bytes: Vec<u8>) -> crate::error::Result<Vec<f32>> {
        if bytes.is_empty() {
            return Err(MosaicError::EmbeddingExtraction("empty image payload".into()));
        }
        let encoder = self.encoder().await?;
        let raw = self
            .run_blocking("image", move || encoder.embed_image(&bytes))
            .await?;
        self.finalize(raw)
    }

    /// Embed a text query.
    pub async fn embed_text(&self, text: String) -> crate::error::Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(MosaicError::EmbeddingExtraction("empty text query".into()));
        }
        let encoder = self.encoder().await?;
        let raw = self
            .run_blocking("text", move || encoder.embed_text(&text))
            .await?;
        self.finalize(raw)
    }

    async fn run_blocking<F>(&self, input: &'static str, f: F) -> crate::error::Result<Vec<f32>>
    where
        F: FnOnce() -> Result<Vec<f32>> + Send + 'static,
    {
        let started = std::time::Instant::now();
        let joined = tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(f))
            .await
            .map_err(|_| {
                MosaicError::EmbeddingExtraction(format!(
                    "{input} encoder timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })?;

        let vector = joined
            .map_err(|e| {
                MosaicError::EmbeddingExtraction(format!("{input} encoder task failed: {e}"))
            })?
            .map_err(|e| MosaicError::EmbeddingExtraction(format!("{e:#}")))?;

        tracing::debug!(input, elapsed_ms = started.elapsed().as_millis() as u64, "embedded");
        Ok(vector)
    }

    fn finalize(&self, raw: Vec<f32>) -> crate::error::Result<Vec<f32>> {
        validate_embedding(&raw, self.dimensions).map_err(MosaicError::EmbeddingExtraction)?;
        Ok(l2_normalize(&raw))
    }
}

/// Reject vectors that would silently corrupt similarity scores.
pub fn validate_embedding(v: &[f32], dimensions: usize) -> Result<(), String> {
    if v.len() != dimensions {
        return Err(format!(
            "expected {dimensions}-d embedding, model returned {}",
            v.len()
        ));
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err("embedding contains non-finite values".into());
    }
    if norm(v) <= f32::EPSILON {
        return Err("embedding has zero norm".into());
    }
    Ok(())
}

pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// L2-normalize a vector. Returns the input unchanged if its norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let n = norm(v);
    if n > 0.0 {
        v.iter().map(|x| x / n).collect()
    } else {
        v.to_vec()
    }
}

pub fn is_unit_norm(v: &[f32]) -> bool {
    (norm(v) - 1.0).abs() <= NORM_TOLERANCE
}

/// Cosine similarity of two unit vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Create the encoder named by config.
///
/// Currently only `"clip"` is supported. Returns an error if model files are
/// missing; run `mosaic model download` first.
pub fn create_encoder(config: &EmbeddingConfig) -> Result<Arc<dyn MediaEncoder>> {
    match config.provider.as_str() {
        "clip" => Ok(Arc::new(clip::ClipEncoder::new(config)?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: clip"),
    }
}
