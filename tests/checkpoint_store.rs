use creative_harness::checkpoint::{
    fingerprint, CheckpointEnvelope, CheckpointError, CheckpointStore,
};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Groups {
    names: Vec<String>,
    total: usize,
}

fn sample() -> Groups {
    Groups {
        names: vec!["ugc_selfie".into(), "studio_product".into()],
        total: 12,
    }
}

#[tokio::test]
async fn save_then_load_with_same_fingerprint() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoints")).unwrap();
    let fp = fingerprint(&["global_clusters", "inventory-digest"]);

    assert!(store.load::<Groups>("global_clusters", &fp).await.unwrap().is_none());

    let digest = store.save("global_clusters", &fp, &sample()).await.unwrap();
    let loaded = store
        .load::<Groups>("global_clusters", &fp)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.value, sample());
    assert_eq!(loaded.digest, digest);
    assert!(store.path_for("global_clusters").is_file());

    // Saving identical content yields the identical digest.
    assert_eq!(store.save("global_clusters", &fp, &sample()).await.unwrap(), digest);
}

#[tokio::test]
async fn changed_inputs_make_the_checkpoint_stale() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    let old = fingerprint(&["descriptions", "a.jpg@1"]);
    let new = fingerprint(&["descriptions", "a.jpg@2"]);
    assert_ne!(old, new);

    store.save("descriptions", &old, &sample()).await.unwrap();
    assert!(store.load::<Groups>("descriptions", &new).await.unwrap().is_none());
    assert!(store.load::<Groups>("descriptions", &old).await.unwrap().is_some());
}

#[tokio::test]
async fn tampered_or_corrupt_files_are_ignored() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    let fp = fingerprint(&["categories"]);
    store.save("categories", &fp, &sample()).await.unwrap();

    let path = store.path_for("categories");
    let mut envelope: CheckpointEnvelope =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    envelope.payload["total"] = serde_json::json!(13);
    std::fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();
    assert!(store.load::<Groups>("categories", &fp).await.unwrap().is_none());

    std::fs::write(&path, b"{\"pass\": \"categ").unwrap();
    assert!(store.load::<Groups>("categories", &fp).await.unwrap().is_none());

    // A valid envelope with the wrong payload shape is also a miss.
    store.save("categories", &fp, &vec![1, 2, 3]).await.unwrap();
    assert!(store.load::<Groups>("categories", &fp).await.unwrap().is_none());
}

#[tokio::test]
async fn remove_deletes_and_tolerates_missing() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    let fp = fingerprint(&["output"]);
    store.save("output", &fp, &sample()).await.unwrap();

    store.remove("output").await.unwrap();
    assert!(!store.path_for("output").exists());
    store.remove("output").await.unwrap();
}

#[test]
fn lock_is_exclusive_while_held() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    let lock_path = dir.path().join(".lock");

    let guard = store.lock_exclusive().unwrap();
    let other = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&lock_path)
        .unwrap();
    assert!(other.try_lock_exclusive().is_err());

    drop(guard);
    other.try_lock_exclusive().unwrap();
}

#[test]
fn second_lock_fails_fast_instead_of_waiting() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    let other_run = CheckpointStore::new(dir.path()).unwrap();

    let guard = store.lock_exclusive().unwrap();
    match other_run.lock_exclusive() {
        Err(CheckpointError::Locked(path)) => assert_eq!(path, dir.path()),
        other => panic!("expected Locked, got {other:?}"),
    }

    drop(guard);
    other_run.lock_exclusive().unwrap();
}
