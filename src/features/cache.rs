//! SQLite-backed, content-addressed cache of item feature vectors.
//!
//! Keys hash (extractor id, item id, size, modification time), so an edited
//! file or a different extractor never sees a stale vector.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::media::Item;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureKey {
    pub extractor: String,
    pub item_id: String,
    pub modified_ms: i64,
    pub key_hash: String,
}

impl FeatureKey {
    pub fn new(extractor: &str, item: &Item) -> Self {
        let size = item.size_bytes.to_string();
        let modified = item.modified_ms.to_string();
        let key_hash = hash_fields(&[extractor, &item.id, &size, &modified]);
        Self {
            extractor: extractor.to_string(),
            item_id: item.id.clone(),
            modified_ms: item.modified_ms,
            key_hash,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("corrupt cache entry {key}: {message}")]
    Corrupt { key: String, message: String },
}

#[async_trait]
pub trait FeatureCache: Send + Sync {
    async fn get(&self, key: &FeatureKey) -> Result<Option<Vec<f32>>, CacheError>;
    async fn put(&self, key: &FeatureKey, vector: &[f32]) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteFeatureCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFeatureCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             CREATE TABLE IF NOT EXISTS feature_cache ( \
               key_hash TEXT PRIMARY KEY, \
               extractor TEXT NOT NULL, \
               item_id TEXT NOT NULL, \
               modified_ms INTEGER NOT NULL, \
               dims INTEGER NOT NULL, \
               vector BLOB NOT NULL, \
               created_at INTEGER NOT NULL, \
               hit_count INTEGER NOT NULL DEFAULT 0 \
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> Result<usize, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM feature_cache", [], |row| row.get(0))?;
                Ok(count.max(0) as usize)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl FeatureCache for SqliteFeatureCache {
    async fn get(&self, key: &FeatureKey) -> Result<Option<Vec<f32>>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let row: Option<(i64, Vec<u8>)> = conn
                    .query_row(
                        "SELECT dims, vector FROM feature_cache WHERE key_hash = ?1",
                        params![key_hash],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((dims, blob)) = row else {
                    return Ok(None);
                };
                let vector = decode_vector(&blob).ok_or_else(|| CacheError::Corrupt {
                    key: key_hash.clone(),
                    message: format!("blob length {} is not a multiple of 4", blob.len()),
                })?;
                if vector.len() as i64 != dims {
                    return Err(CacheError::Corrupt {
                        key: key_hash,
                        message: format!("expected {dims} dims, found {}", vector.len()),
                    });
                }
                conn.execute(
                    "UPDATE feature_cache SET hit_count = hit_count + 1 WHERE key_hash = ?1",
                    params![key_hash],
                )?;
                Ok(Some(vector))
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &FeatureKey, vector: &[f32]) -> Result<(), CacheError> {
        let key = key.clone();
        let blob = encode_vector(vector);
        let dims = vector.len() as i64;
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO feature_cache ( \
                        key_hash, extractor, item_id, modified_ms, dims, vector, created_at \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        dims = excluded.dims, \
                        vector = excluded.vector",
                    params![
                        key.key_hash,
                        key.extractor,
                        key.item_id,
                        key.modified_ms,
                        dims,
                        blob,
                        now_epoch(),
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

pub(crate) fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    fn item(modified_ms: i64) -> Item {
        Item {
            id: "a.jpg".into(),
            path: PathBuf::from("a.jpg"),
            kind: MediaKind::Image,
            size_bytes: 10,
            modified_ms,
        }
    }

    #[test]
    fn key_changes_with_mtime_and_extractor() {
        let base = FeatureKey::new("thumb-v1", &item(1));
        assert_eq!(base, FeatureKey::new("thumb-v1", &item(1)));
        assert_ne!(base.key_hash, FeatureKey::new("thumb-v1", &item(2)).key_hash);
        assert_ne!(base.key_hash, FeatureKey::new("thumb-v2", &item(1)).key_hash);
    }

    #[tokio::test]
    async fn upsert_on_existing_key_replaces_the_vector() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqliteFeatureCache::new(dir.path().join("features.sqlite")).unwrap();
        let key = FeatureKey::new("thumb-v1", &item(1));

        cache.put(&key, &[1.0, 2.0]).await.unwrap();
        cache.put(&key, &[3.0]).await.unwrap();

        assert_eq!(cache.get(&key).await.unwrap(), Some(vec![3.0]));
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[test]
    fn vector_blob_round_trips_exactly() {
        let v = vec![0.0f32, -1.5, f32::MIN_POSITIVE, 3.25];
        assert_eq!(decode_vector(&encode_vector(&v)).unwrap(), v);
        assert!(decode_vector(&[0, 1, 2]).is_none());
    }
}
