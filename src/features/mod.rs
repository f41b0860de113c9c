//! Per-item numeric feature vectors for similarity clustering.
//!
//! [`ClipFeatureExtractor`] is the default. [`ThumbnailFeatureExtractor`] is
//! an offline fallback that needs no model weights; its vectors live in a
//! different space, so it carries its own distance threshold.

pub mod cache;
pub mod clip;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use image::imageops::FilterType;
use tracing::{debug, info};

use crate::media::Item;

pub use cache::{CacheError, FeatureCache, FeatureKey, SqliteFeatureCache};
pub use clip::{ClipFeatureExtractor, CLIP_DISTANCE_THRESHOLD};

/// Cosine-distance cut for thumbnail vectors. Mean-centred pixel and palette
/// vectors of unrelated creatives sit near 1.0; near-duplicates fall well
/// under this.
pub const THUMBNAIL_DISTANCE_THRESHOLD: f32 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("could not decode {path}: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("feature worker failed: {0}")]
    Join(String),
    #[error("feature cache: {0}")]
    Cache(#[from] CacheError),
    #[error("feature model unavailable: {0}")]
    Model(String),
    #[error("feature model inference: {0}")]
    Inference(#[from] candle_core::Error),
}

#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    /// Stable identifier, part of every cache key. Bump it when the output
    /// changes.
    fn id(&self) -> &str;

    /// Cosine distance below which two items belong together, used when the
    /// config does not set one.
    fn distance_threshold(&self) -> f32 {
        CLIP_DISTANCE_THRESHOLD
    }

    async fn extract(&self, path: &Path) -> Result<Vec<f32>, FeatureError>;
}

/// Cheap local image descriptor: a downsampled RGB grid plus per-channel
/// colour histograms, mean-centred so cosine distance compares layout and
/// palette rather than overall brightness. Groups near-duplicates and shared
/// art direction, not concepts; use it when CLIP weights are unavailable.
#[derive(Debug, Clone)]
pub struct ThumbnailFeatureExtractor {
    grid: u32,
    bins: usize,
    id: String,
}

impl Default for ThumbnailFeatureExtractor {
    fn default() -> Self {
        Self::new(16, 8)
    }
}

impl ThumbnailFeatureExtractor {
    pub fn new(grid: u32, bins: usize) -> Self {
        let grid = grid.max(1);
        let bins = bins.max(1);
        Self {
            grid,
            bins,
            id: format!("thumb-g{grid}-b{bins}-v1"),
        }
    }

    /// Feature vector for already decoded pixels.
    pub fn features_for(&self, img: &image::DynamicImage) -> Vec<f32> {
        let small = img
            .resize_exact(self.grid, self.grid, FilterType::Triangle)
            .to_rgb8();
        let mut out: Vec<f32> =
            Vec::with_capacity((self.grid * self.grid * 3) as usize + self.bins * 3);
        out.extend(small.pixels().flat_map(|p| p.0).map(|c| c as f32 / 255.0));

        let rgb = img.to_rgb8();
        let mut hist = vec![0f32; self.bins * 3];
        for p in rgb.pixels() {
            for (channel, value) in p.0.iter().enumerate() {
                let bin = (*value as usize * self.bins) / 256;
                hist[channel * self.bins + bin] += 1.0;
            }
        }
        let total = (rgb.width() * rgb.height()).max(1) as f32;
        out.extend(hist.into_iter().map(|h| h / total));

        let mean = out.iter().sum::<f32>() / out.len().max(1) as f32;
        out.iter_mut().for_each(|x| *x -= mean);
        out
    }
}

#[async_trait]
impl FeatureExtractor for ThumbnailFeatureExtractor {
    fn id(&self) -> &str {
        &self.id
    }

    fn distance_threshold(&self) -> f32 {
        THUMBNAIL_DISTANCE_THRESHOLD
    }

    async fn extract(&self, path: &Path) -> Result<Vec<f32>, FeatureError> {
        let path = path.to_path_buf();
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let img = image::open(&path).map_err(|e| FeatureError::Decode {
                path: path.clone(),
                message: e.to_string(),
            })?;
            Ok(this.features_for(&img))
        })
        .await
        .map_err(|e| FeatureError::Join(e.to_string()))?
    }
}

/// Feature vectors for `items`, in order, computing only cache misses.
/// `workers` bounds concurrent extractions on the blocking pool.
pub async fn compute_features(
    items: &[Item],
    extractor: &dyn FeatureExtractor,
    cache: &dyn FeatureCache,
    workers: usize,
) -> Result<Vec<Vec<f32>>, FeatureError> {
    let vectors: Vec<(Vec<f32>, bool)> = stream::iter(items.iter().map(|item| async move {
        let key = FeatureKey::new(extractor.id(), item);
        if let Some(v) = cache.get(&key).await? {
            return Ok::<_, FeatureError>((v, true));
        }
        let v = extractor.extract(&item.path).await?;
        cache.put(&key, &v).await?;
        debug!(item = %item.id, dims = v.len(), "extracted features");
        Ok((v, false))
    }))
    .buffered(workers.max(1))
    .try_collect()
    .await?;

    let hits = vectors.iter().filter(|(_, hit)| *hit).count();
    info!(
        items = items.len(),
        cache_hits = hits,
        extracted = items.len() - hits,
        extractor = extractor.id(),
        "feature vectors ready"
    );
    Ok(vectors.into_iter().map(|(v, _)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};

    #[test]
    fn features_have_fixed_length_and_zero_mean() {
        let extractor = ThumbnailFeatureExtractor::new(4, 4);
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 7, Rgb([200, 10, 40])));
        let v = extractor.features_for(&img);
        assert_eq!(v.len(), 4 * 4 * 3 + 4 * 3);
        let mean: f32 = v.iter().sum::<f32>() / v.len() as f32;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn different_palettes_produce_different_vectors() {
        let extractor = ThumbnailFeatureExtractor::default();
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 0, 0])));
        let blue = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([0, 0, 255])));
        assert_ne!(extractor.features_for(&red), extractor.features_for(&blue));
    }
}
