//! CLIP dual encoder on ONNX Runtime.
//!
//! Vision and text towers are exported as separate ONNX graphs (the Xenova
//! exports on Hugging Face) and share one embedding space. Images go through
//! the standard CLIP preprocessing: shortest-edge resize, center crop, and
//! per-channel mean/std normalization into an NCHW tensor.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{
    PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationDirection,
    TruncationParams, TruncationStrategy,
};

use super::{l2_normalize, MediaEncoder};
use crate::config::EmbeddingConfig;

/// CLIP text context length.
const CONTEXT_LENGTH: usize = 77;

/// `<|endoftext|>`, which CLIP also uses for padding.
const PAD_TOKEN: &str = "<|endoftext|>";
const PAD_ID: u32 = 49407;

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

#[derive(Debug, Clone)]
pub struct ClipModelInfo {
    pub name: &'static str,
    pub vision_url: &'static str,
    pub text_url: &'static str,
    pub tokenizer_url: &'static str,
    pub dims: usize,
    pub input_resolution: u32,
}

pub static CLIP_MODELS: &[ClipModelInfo] = &[
    ClipModelInfo {
        name: "clip-vit-base-patch32",
        vision_url: "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/onnx/vision_model.onnx",
        text_url: "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/onnx/text_model.onnx",
        tokenizer_url: "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/tokenizer.json",
        dims: 512,
        input_resolution: 224,
    },
    ClipModelInfo {
        name: "clip-vit-large-patch14",
        vision_url: "https://huggingface.co/Xenova/clip-vit-large-patch14/resolve/main/onnx/vision_model.onnx",
        text_url: "https://huggingface.co/Xenova/clip-vit-large-patch14/resolve/main/onnx/text_model.onnx",
        tokenizer_url: "https://huggingface.co/Xenova/clip-vit-large-patch14/resolve/main/tokenizer.json",
        dims: 768,
        input_resolution: 224,
    },
];

pub fn model_info(name: &str) -> Option<&'static ClipModelInfo> {
    CLIP_MODELS.iter().find(|m| m.name == name)
}

/// Local paths of one model's three files inside the cache directory.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub vision: PathBuf,
    pub text: PathBuf,
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    pub fn in_dir(cache_dir: &Path, model: &str) -> Self {
        Self {
            vision: cache_dir.join(format!("{model}_vision.onnx")),
            text: cache_dir.join(format!("{model}_text.onnx")),
            tokenizer: cache_dir.join(format!("{model}_tokenizer.json")),
        }
    }

    pub fn all_present(&self) -> bool {
        self.vision.exists() && self.text.exists() && self.tokenizer.exists()
    }
}

pub struct ClipEncoder {
    info: &'static ClipModelInfo,
    vision: Mutex<Session>,
    text: Mutex<Session>,
    tokenizer: Tokenizer,
}

// Safety: Tokenizer is Send+Sync. Both sessions are behind a Mutex, which
// guarantees exclusive access during run().
unsafe impl Send for ClipEncoder {}
unsafe impl Sync for ClipEncoder {}

impl ClipEncoder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let info = model_info(&config.model).with_context(|| {
            let known: Vec<_> = CLIP_MODELS.iter().map(|m| m.name).collect();
            format!("unknown CLIP model: {}. Known: {}", config.model, known.join(", "))
        })?;

        let cache_dir = crate::config::expand_tilde(&config.cache_dir);
        let files = ModelFiles::in_dir(&cache_dir, info.name);
        for path in [&files.vision, &files.text, &files.tokenizer] {
            anyhow::ensure!(
                path.exists(),
                "model file not found at {}. Run `mosaic model download` first.",
                path.display()
            );
        }

        let vision = load_session(&files.vision).context("failed to load vision model")?;
        let text = load_session(&files.text).context("failed to load text model")?;
        tracing::info!(model = info.name, dir = %cache_dir.display(), "CLIP sessions loaded");

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(CONTEXT_LENGTH),
            direction: PaddingDirection::Right,
            pad_to_multiple_of: None,
            pad_id: PAD_ID,
            pad_type_id: 0,
            pad_token: PAD_TOKEN.to_string(),
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: CONTEXT_LENGTH,
                strategy: TruncationStrategy::LongestFirst,
                stride: 0,
                direction: TruncationDirection::Right,
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;

        Ok(Self {
            info,
            vision: Mutex::new(vision),
            text: Mutex::new(text),
            tokenizer,
        })
    }

    pub fn info(&self) -> &'static ClipModelInfo {
        self.info
    }
}

fn load_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Resize the shortest edge to `size`, center-crop to `size`×`size`, and
/// normalize with the CLIP channel statistics. Output is `[1, 3, size, size]`.
pub fn preprocess_image(image: &DynamicImage, size: u32) -> Array4<f32> {
    let (w, h) = (image.width().max(1), image.height().max(1));
    let scale = size as f32 / w.min(h) as f32;
    let new_w = ((w as f32) * scale).round().max(size as f32) as u32;
    let new_h = ((h as f32) * scale).round().max(size as f32) as u32;
    let resized = image
        .resize_exact(new_w, new_h, FilterType::CatmullRom)
        .to_rgb8();

    let start_x = (new_w - size) / 2;
    let start_y = (new_h - size) / 2;

    let side = size as usize;
    let mut pixels = Array4::<f32>::zeros((1, 3, side, side));
    for y in 0..side {
        for x in 0..side {
            let pixel = resized.get_pixel(start_x + x as u32, start_y + y as u32);
            for c in 0..3 {
                pixels[[0, c, y, x]] = (pixel[c] as f32 / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
            }
        }
    }
    pixels
}

impl MediaEncoder for ClipEncoder {
    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let image = image::load_from_memory(bytes).context("failed to decode image")?;
        let size = self.info.input_resolution;
        let (data, _offset) = preprocess_image(&image, size).into_raw_vec_and_offset();

        let shape = vec![1i64, 3, size as i64, size as i64];
        let pixel_values = Tensor::from_array((shape, data.into_boxed_slice()))?;

        let mut session = self
            .vision
            .lock()
            .map_err(|e| anyhow::anyhow!("vision session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "pixel_values" => pixel_values,
        })?;

        let value = outputs.get("image_embeds").unwrap_or_else(|| &outputs[0]);
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .context("failed to extract image_embeds tensor")?;
        first_row(&shape, data, self.info.dims)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();

        let shape = vec![1i64, input_ids.len() as i64];
        let input_ids_tensor = Tensor::from_array((shape.clone(), input_ids.into_boxed_slice()))?;
        let attention_mask_tensor = Tensor::from_array((shape, attention_mask.into_boxed_slice()))?;

        let mut session = self
            .text
            .lock()
            .map_err(|e| anyhow::anyhow!("text session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids_tensor,
            "attention_mask" => attention_mask_tensor,
        })?;

        let value = outputs.get("text_embeds").unwrap_or_else(|| &outputs[0]);
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .context("failed to extract text_embeds tensor")?;
        first_row(&shape, data, self.info.dims)
    }

    fn dimensions(&self) -> usize {
        self.info.dims
    }

    fn model_name(&self) -> &str {
        self.info.name
    }
}

/// Take the single batch row of a `[1, dims]` projection output.
fn first_row(shape: &[i64], data: &[f32], dims: usize) -> Result<Vec<f32>> {
    anyhow::ensure!(
        shape.last() == Some(&(dims as i64)) && data.len() >= dims,
        "unexpected embedding shape: {shape:?}, expected [1, {dims}]"
    );
    let row = &data[..dims];
    anyhow::ensure!(
        row.iter().all(|v| v.is_finite()),
        "model output contains non-finite values"
    );
    Ok(l2_normalize(row))
}
