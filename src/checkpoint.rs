//! Per-pass checkpoint files.
//!
//! Each pass persists its output as `<dir>/<pass>.json`: a self-describing
//! envelope carrying the pass name, a format version, the fingerprint of the
//! inputs it was computed from and a digest of the payload. A file whose
//! envelope does not match the current pass, version or fingerprint is stale
//! and is ignored. Writes go to a temp file that is then renamed over the
//! target, so readers never observe a half-written checkpoint.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("checkpoint serialization error for {pass}: {source}")]
    Serialize {
        pass: String,
        source: serde_json::Error,
    },
    #[error("checkpoint directory {0} is locked by another run")]
    Locked(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub pass: String,
    pub format_version: u32,
    pub input_fingerprint: String,
    /// blake3 of the serialized payload.
    pub digest: String,
    pub written_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// A payload read back from a valid checkpoint.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    pub digest: String,
}

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct CheckpointLock {
    _file: std::fs::File,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, pass: &str) -> PathBuf {
        self.dir.join(format!("{pass}.json"))
    }

    /// Exclusive advisory lock on the checkpoint directory. Fails with
    /// [`CheckpointError::Locked`] instead of waiting when another run holds
    /// it, so no async worker ever parks on the lock.
    pub fn lock_exclusive(&self) -> Result<CheckpointLock, CheckpointError> {
        let lock_path = self.dir.join(".lock");
        let io_err = |source| CheckpointError::Io {
            path: lock_path.clone(),
            source,
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(io_err)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(CheckpointLock { _file: file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(CheckpointError::Locked(self.dir.clone()))
            }
            Err(source) => Err(io_err(source)),
        }
    }

    /// The checkpoint for `pass` if it exists and was computed from
    /// `fingerprint`. Missing files are `None`; stale or unreadable ones are
    /// logged and also `None`.
    pub async fn load<T: DeserializeOwned>(
        &self,
        pass: &str,
        fingerprint: &str,
    ) -> Result<Option<Loaded<T>>, CheckpointError> {
        let path = self.path_for(pass);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };

        let envelope: CheckpointEnvelope = match serde_json::from_slice(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(pass, path = %path.display(), error = %e, "unreadable checkpoint; recomputing");
                return Ok(None);
            }
        };
        if let Some(reason) = stale_reason(&envelope, pass, fingerprint) {
            warn!(pass, reason, "stale checkpoint; recomputing");
            return Ok(None);
        }

        let digest = payload_digest(&envelope.payload, pass)?;
        if digest != envelope.digest {
            warn!(pass, "checkpoint digest mismatch; recomputing");
            return Ok(None);
        }
        match serde_json::from_value(envelope.payload) {
            Ok(value) => {
                debug!(pass, written_at = %envelope.written_at, "loaded checkpoint");
                Ok(Some(Loaded { value, digest }))
            }
            Err(e) => {
                warn!(pass, error = %e, "checkpoint payload does not match schema; recomputing");
                Ok(None)
            }
        }
    }

    /// Persist `value` as the checkpoint for `pass`. Returns the payload
    /// digest, which downstream fingerprints are built from.
    pub async fn save<T: Serialize>(
        &self,
        pass: &str,
        fingerprint: &str,
        value: &T,
    ) -> Result<String, CheckpointError> {
        let payload = serde_json::to_value(value).map_err(|source| CheckpointError::Serialize {
            pass: pass.to_string(),
            source,
        })?;
        let digest = payload_digest(&payload, pass)?;
        let envelope = CheckpointEnvelope {
            pass: pass.to_string(),
            format_version: FORMAT_VERSION,
            input_fingerprint: fingerprint.to_string(),
            digest: digest.clone(),
            written_at: Utc::now(),
            payload,
        };
        let bytes =
            serde_json::to_vec_pretty(&envelope).map_err(|source| CheckpointError::Serialize {
                pass: pass.to_string(),
                source,
            })?;
        write_atomic(&self.path_for(pass), &bytes).await?;
        debug!(pass, bytes = bytes.len(), "saved checkpoint");
        Ok(digest)
    }

    /// Drop the checkpoint for `pass`, if any.
    pub async fn remove(&self, pass: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(pass);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }
}

fn stale_reason(envelope: &CheckpointEnvelope, pass: &str, fingerprint: &str) -> Option<&'static str> {
    if envelope.pass != pass {
        Some("pass name mismatch")
    } else if envelope.format_version != FORMAT_VERSION {
        Some("format version mismatch")
    } else if envelope.input_fingerprint != fingerprint {
        Some("inputs changed")
    } else {
        None
    }
}

fn payload_digest(payload: &serde_json::Value, pass: &str) -> Result<String, CheckpointError> {
    let bytes = serde_json::to_vec(payload).map_err(|source| CheckpointError::Serialize {
        pass: pass.to_string(),
        source,
    })?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Write `bytes` to `path` via a sibling temp file and rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|source| CheckpointError::Io {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Hash of `fields`, separated so that `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for field in fields {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_length_prefixed() {
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
        assert_eq!(fingerprint(&["x", "y"]), fingerprint(&["x", "y"]));
    }

    #[test]
    fn stale_reasons() {
        let envelope = CheckpointEnvelope {
            pass: "descriptions".into(),
            format_version: FORMAT_VERSION,
            input_fingerprint: "f1".into(),
            digest: String::new(),
            written_at: Utc::now(),
            payload: serde_json::Value::Null,
        };
        assert_eq!(stale_reason(&envelope, "descriptions", "f1"), None);
        assert_eq!(stale_reason(&envelope, "descriptions", "f2"), Some("inputs changed"));
        assert_eq!(stale_reason(&envelope, "output", "f1"), Some("pass name mismatch"));
    }
}
