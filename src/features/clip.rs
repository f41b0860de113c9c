//! CLIP image embeddings for similarity clustering.
//!
//! Architecture: ViT-B/32 vision tower plus projection.
//! Output: 512 dimensions, L2-normalized.
//! Scoring: cosine distance.
//!
//! Weights come from the HuggingFace hub (or a local file) and are loaded on
//! the first extraction, then shared by every later one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use hf_hub::api::sync::ApiBuilder;
use image::imageops::FilterType;
use tokio::sync::OnceCell;
use tracing::info;

use super::{FeatureError, FeatureExtractor};

/// CLIP embedding dimension (ViT-B/32).
pub const CLIP_DIM: usize = 512;

/// CLIP image input size (224x224 pixels).
pub const CLIP_IMAGE_SIZE: usize = 224;

pub const DEFAULT_CLIP_MODEL: &str = "openai/clip-vit-base-patch32";

/// Cosine-distance cut for CLIP image embeddings: creatives closer than this
/// share a concept.
pub const CLIP_DISTANCE_THRESHOLD: f32 = 0.35;

const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];

#[derive(Debug, Clone)]
enum WeightSource {
    Hub(String),
    File(PathBuf),
}

pub struct ClipFeatureExtractor {
    source: WeightSource,
    device: Device,
    id: String,
    model: OnceCell<Arc<ClipModel>>,
}

impl ClipFeatureExtractor {
    /// ViT-B/32 weights fetched from the hub on first use.
    pub fn new() -> Self {
        Self::from_hub(DEFAULT_CLIP_MODEL)
    }

    pub fn from_hub(model_id: &str) -> Self {
        Self {
            source: WeightSource::Hub(model_id.to_string()),
            device: Device::Cpu,
            id: format!("clip-{}-v1", model_id.replace('/', "_")),
            model: OnceCell::new(),
        }
    }

    /// Local `.safetensors` or `.bin` weights in the ViT-B/32 layout.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("local")
            .to_string();
        Self {
            source: WeightSource::File(path),
            device: Device::Cpu,
            id: format!("clip-file-{stem}-v1"),
            model: OnceCell::new(),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    async fn model(&self) -> Result<Arc<ClipModel>, FeatureError> {
        self.model
            .get_or_try_init(|| async {
                let source = self.source.clone();
                let device = self.device.clone();
                let model = tokio::task::spawn_blocking(move || load_model(&source, &device))
                    .await
                    .map_err(|e| FeatureError::Join(e.to_string()))??;
                Ok::<_, FeatureError>(Arc::new(model))
            })
            .await
            .cloned()
    }
}

impl Default for ClipFeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn load_model(source: &WeightSource, device: &Device) -> Result<ClipModel, FeatureError> {
    let weights = match source {
        WeightSource::Hub(model_id) => {
            let api = ApiBuilder::new()
                .with_progress(false)
                .build()
                .map_err(|e| FeatureError::Model(format!("huggingface api: {e}")))?;
            let repo = api.model(model_id.clone());
            info!(model = %model_id, "fetching CLIP weights");
            repo.get("model.safetensors")
                .or_else(|_| repo.get("pytorch_model.bin"))
                .map_err(|e| FeatureError::Model(format!("{model_id}: {e}")))?
        }
        WeightSource::File(path) => path.clone(),
    };

    let vb = if weights
        .extension()
        .is_some_and(|ext| ext == "safetensors")
    {
        let bytes = std::fs::read(&weights)
            .map_err(|e| FeatureError::Model(format!("{}: {e}", weights.display())))?;
        VarBuilder::from_buffered_safetensors(bytes, DType::F32, device)?
    } else {
        VarBuilder::from_pth(&weights, DType::F32, device)?
    };
    let model = ClipModel::new(vb, &ClipConfig::vit_base_patch32())?;
    info!(weights = %weights.display(), "CLIP model loaded");
    Ok(model)
}

/// Resize to 224x224 and normalize with CLIP's mean/std, in CHW order.
pub fn clip_pixels(img: &image::DynamicImage) -> Vec<f32> {
    let rgb = img
        .resize_exact(
            CLIP_IMAGE_SIZE as u32,
            CLIP_IMAGE_SIZE as u32,
            FilterType::Triangle,
        )
        .to_rgb8();

    let mut data = Vec::with_capacity(3 * CLIP_IMAGE_SIZE * CLIP_IMAGE_SIZE);
    for c in 0..3 {
        for y in 0..CLIP_IMAGE_SIZE {
            for x in 0..CLIP_IMAGE_SIZE {
                let value = rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
                data.push((value - MEAN[c]) / STD[c]);
            }
        }
    }
    data
}

fn embed(model: &ClipModel, pixels: Vec<f32>, device: &Device) -> candle_core::Result<Vec<f32>> {
    let input = Tensor::from_vec(pixels, (1, 3, CLIP_IMAGE_SIZE, CLIP_IMAGE_SIZE), device)?;
    let features = model.get_image_features(&input)?;
    let norm = features.sqr()?.sum_keepdim(1)?.sqrt()?;
    let normalized = features.broadcast_div(&norm.clamp(1e-12, f64::MAX)?)?;
    normalized.squeeze(0)?.to_vec1::<f32>()
}

#[async_trait]
impl FeatureExtractor for ClipFeatureExtractor {
    fn id(&self) -> &str {
        &self.id
    }

    fn distance_threshold(&self) -> f32 {
        CLIP_DISTANCE_THRESHOLD
    }

    async fn extract(&self, path: &Path) -> Result<Vec<f32>, FeatureError> {
        let model = self.model().await?;
        let device = self.device.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let img = image::open(&path).map_err(|e| FeatureError::Decode {
                path: path.clone(),
                message: e.to_string(),
            })?;
            Ok(embed(&model, clip_pixels(&img), &device)?)
        })
        .await
        .map_err(|e| FeatureError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};

    #[test]
    fn pixels_are_chw_and_normalized() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 16, Rgb([255, 0, 255])));
        let data = clip_pixels(&img);
        let plane = CLIP_IMAGE_SIZE * CLIP_IMAGE_SIZE;
        assert_eq!(data.len(), 3 * plane);
        assert!((data[0] - (1.0 - MEAN[0]) / STD[0]).abs() < 1e-5);
        assert!((data[plane] - (0.0 - MEAN[1]) / STD[1]).abs() < 1e-5);
        assert!((data[2 * plane + plane - 1] - (1.0 - MEAN[2]) / STD[2]).abs() < 1e-5);
    }

    #[test]
    fn id_names_the_weights() {
        assert_eq!(
            ClipFeatureExtractor::new().id(),
            "clip-openai_clip-vit-base-patch32-v1"
        );
        assert_eq!(
            ClipFeatureExtractor::from_file("/models/clip.safetensors").id(),
            "clip-file-clip-v1"
        );
        assert_eq!(ClipFeatureExtractor::new().distance_threshold(), CLIP_DISTANCE_THRESHOLD);
    }

    #[tokio::test]
    async fn missing_weights_file_is_a_model_error() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = ClipFeatureExtractor::from_file(dir.path().join("absent.safetensors"));
        let err = extractor
            .extract(&dir.path().join("ad.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureError::Model(_)));
    }
}
