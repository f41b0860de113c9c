//! Media inventory: scanning the input directory into immutable [`Item`]s.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::gateway::ImageData;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

/// One unit of work. Created by [`scan_media`], never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Filename; stable identifier across runs.
    pub id: String,
    pub path: PathBuf,
    pub kind: MediaKind,
    pub size_bytes: u64,
    /// Modification time, milliseconds since the epoch.
    pub modified_ms: i64,
}

/// Output of the external video preprocessor for one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub item_id: String,
    /// Keyframes; the first is the video's thumbnail.
    pub frames: Vec<PathBuf>,
    #[serde(default)]
    pub transcript: String,
    pub duration_secs: f64,
}

impl VideoInfo {
    pub fn thumbnail(&self) -> Option<&Path> {
        self.frames.first().map(PathBuf::as_path)
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("input directory not found: {0}")]
    MissingInput(PathBuf),
    #[error("no images or videos found in {0}")]
    Empty(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn kind_for(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// MIME type for an image path, defaulting to JPEG.
pub fn image_media_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Scan `dir` (non-recursively) for supported media.
///
/// Images come first sorted by filename, then videos sorted by filename. An
/// empty result is an error: a run with nothing to classify is a setup
/// mistake, not a valid empty output.
pub fn scan_media(dir: &Path) -> Result<Vec<Item>, MediaError> {
    if !dir.is_dir() {
        return Err(MediaError::MissingInput(dir.to_path_buf()));
    }
    let io_err = |source| MediaError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut images = Vec::new();
    let mut videos = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(kind) = kind_for(&path) else {
            continue;
        };
        let Some(id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            warn!(path = %path.display(), "skipping media file with a non-UTF-8 name");
            continue;
        };
        let meta = entry.metadata().map_err(|source| MediaError::Io {
            path: path.clone(),
            source,
        })?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let item = Item {
            id,
            path,
            kind,
            size_bytes: meta.len(),
            modified_ms,
        };
        match kind {
            MediaKind::Image => images.push(item),
            MediaKind::Video => videos.push(item),
        }
    }

    images.sort_by(|a, b| a.id.cmp(&b.id));
    videos.sort_by(|a, b| a.id.cmp(&b.id));
    images.extend(videos);

    if images.is_empty() {
        return Err(MediaError::Empty(dir.to_path_buf()));
    }
    Ok(images)
}

/// Read an image from disk and encode it for a vision request.
pub async fn load_image(path: &Path) -> Result<ImageData, std::io::Error> {
    let bytes = tokio::fs::read(path).await?;
    Ok(ImageData::from_bytes(image_media_type(path), &bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scan_orders_images_before_videos_and_skips_other_files() {
        let dir = tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "clip.mp4", "notes.txt", "a.mov"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.jpg")).unwrap();

        let items = scan_media(dir.path()).unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a.jpg", "b.PNG", "a.mov", "clip.mp4"]);
        assert_eq!(items[1].kind, MediaKind::Image);
        assert_eq!(items[2].kind, MediaKind::Video);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_names_are_skipped_not_fatal() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("ok.jpg"), b"x").unwrap();
        let odd = dir.path().join(OsStr::from_bytes(b"caf\xe9.jpg"));
        if std::fs::write(&odd, b"x").is_err() {
            // Filesystem refuses non-UTF-8 names; nothing to skip.
            return;
        }

        let items = scan_media(dir.path()).unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["ok.jpg"]);
    }

    #[test]
    fn empty_input_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(scan_media(dir.path()), Err(MediaError::Empty(_))));
        assert!(matches!(
            scan_media(&dir.path().join("missing")),
            Err(MediaError::MissingInput(_))
        ));
    }
}
