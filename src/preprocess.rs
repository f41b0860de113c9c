//! Video preprocessing seam: keyframes, transcript and duration per video.
//!
//! Frame extraction and transcription are external tools; the pipeline only
//! needs [`VideoPreprocessor`] and bounds every call with [`preprocess_bounded`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::info;

use crate::media::{Item, VideoInfo};

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("preprocessing {item} exceeded {waited:?}")]
    Timeout { item: String, waited: Duration },
    #[error("preprocessing {item} failed: {message}")]
    Failed { item: String, message: String },
    #[error("io error preprocessing {item}: {source}")]
    Io {
        item: String,
        source: std::io::Error,
    },
}

#[async_trait]
pub trait VideoPreprocessor: Send + Sync {
    async fn preprocess(&self, item: &Item) -> Result<VideoInfo, PreprocessError>;
}

/// Run one preprocessing call, logging progress every `poll` and failing
/// with [`PreprocessError::Timeout`] after `timeout`.
pub async fn preprocess_bounded(
    preprocessor: &dyn VideoPreprocessor,
    item: &Item,
    timeout: Duration,
    poll: Duration,
) -> Result<VideoInfo, PreprocessError> {
    let started = Instant::now();
    let work = preprocessor.preprocess(item);
    tokio::pin!(work);
    let deadline = sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut work => return result,
            _ = &mut deadline => {
                return Err(PreprocessError::Timeout {
                    item: item.id.clone(),
                    waited: timeout,
                });
            }
            _ = ticker.tick() => {
                info!(
                    item = %item.id,
                    elapsed_secs = started.elapsed().as_secs(),
                    "still preprocessing video"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use std::path::PathBuf;

    struct SlowPreprocessor(Duration);

    #[async_trait]
    impl VideoPreprocessor for SlowPreprocessor {
        async fn preprocess(&self, item: &Item) -> Result<VideoInfo, PreprocessError> {
            sleep(self.0).await;
            Ok(VideoInfo {
                item_id: item.id.clone(),
                frames: vec![PathBuf::from("f0.jpg")],
                transcript: "hello".into(),
                duration_secs: 12.0,
            })
        }
    }

    fn video() -> Item {
        Item {
            id: "clip.mp4".into(),
            path: PathBuf::from("clip.mp4"),
            kind: MediaKind::Video,
            size_bytes: 1,
            modified_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finishes_within_bound() {
        let pre = SlowPreprocessor(Duration::from_secs(25));
        let info = preprocess_bounded(&pre, &video(), Duration::from_secs(600), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(info.item_id, "clip.mp4");
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_bound_is_an_error() {
        let pre = SlowPreprocessor(Duration::from_secs(700));
        let started = Instant::now();
        let err = preprocess_bounded(&pre, &video(), Duration::from_secs(600), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, PreprocessError::Timeout { .. }));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(600) && waited < Duration::from_secs(601));
    }
}
