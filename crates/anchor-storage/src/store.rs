//! Persistent JSON document store with atomic writes.

use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::models::StorageData;
use crate::schema;

/// File name of the main document.
pub const DOCUMENT_FILE: &str = "anchor.json";

/// Returns the per-user data directory.
pub fn default_data_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "anchor", "anchor")
        .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

    Ok(proj_dirs.data_dir().to_path_buf())
}

/// Owns the document on disk and its in-memory copy.
///
/// Reads are served from memory. Writers queue on one async mutex, so
/// overlapping `set` calls apply one after another and never interleave their
/// temp-file writes. Memory only changes after the file has been replaced.
pub struct PersistentStore {
    path: PathBuf,
    data: RwLock<StorageData>,
    write_lock: Mutex<()>,
}

impl PersistentStore {
    /// Opens (or creates) the document at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => schema::load_document(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No document at {:?}, starting from defaults", path);
                StorageData::default()
            }
            Err(e) => {
                warn!("Could not read {:?}, using defaults: {}", path, e);
                StorageData::default()
            }
        };

        let store = Self {
            path,
            data: RwLock::new(data.clone()),
            write_lock: Mutex::new(()),
        };

        // Write back the normalized form.
        store.persist(&data).await?;
        info!("Opened document at {:?}", store.path);
        Ok(store)
    }

    /// Opens the document in the default data directory.
    pub async fn open_default() -> Result<Self> {
        Self::open(default_data_dir()?.join(DOCUMENT_FILE)).await
    }

    /// Path of the document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the whole document.
    pub fn get_all(&self) -> StorageData {
        self.data.read().clone()
    }

    /// Shallow-merges the top-level keys of `partial` and persists.
    ///
    /// The merge is rejected, and nothing changes, if the result is not a
    /// valid document.
    pub async fn set(&self, partial: Value) -> Result<StorageData> {
        let Value::Object(partial) = partial else {
            return Err(StorageError::InvalidUpdate("expected a JSON object".into()));
        };

        let _guard = self.write_lock.lock().await;

        let mut merged = match serde_json::to_value(self.get_all())? {
            Value::Object(obj) => obj,
            _ => return Err(StorageError::InvalidUpdate("document is not an object".into())),
        };
        for (key, value) in partial {
            merged.insert(key, value);
        }

        let mut next: StorageData = serde_json::from_value(Value::Object(merged))
            .map_err(|e| StorageError::InvalidUpdate(e.to_string()))?;
        schema::normalize(&mut next);

        self.commit(next).await
    }

    /// Applies a typed mutation and persists.
    pub async fn update<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StorageData) -> R,
    {
        let _guard = self.write_lock.lock().await;

        let mut next = self.get_all();
        let result = f(&mut next);
        schema::normalize(&mut next);

        self.commit(next).await?;
        Ok(result)
    }

    /// Restores every field to its default.
    pub async fn reset(&self) -> Result<StorageData> {
        let _guard = self.write_lock.lock().await;
        info!("Resetting document to defaults");
        self.commit(StorageData::default()).await
    }

    /// Must be called with the write lock held.
    async fn commit(&self, next: StorageData) -> Result<StorageData> {
        self.persist(&next).await?;
        *self.data.write() = next.clone();
        Ok(next)
    }

    async fn persist(&self, data: &StorageData) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(data)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

/// Writes `bytes` to a temp file next to `path`, syncs it, and renames it over
/// `path`. If the rename fails, the stale target is removed and the rename
/// retried once.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.as_file_mut().write_all(bytes)?;
    temp.as_file_mut().sync_all()?;

    match temp.persist(path) {
        Ok(_) => Ok(()),
        Err(err) => {
            debug!("Rename over {:?} failed ({}), removing target and retrying", path, err.error);
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            err.file.persist(path).map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn open_creates_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(DOCUMENT_FILE);

        let store = PersistentStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.get_all(), StorageData::default());
    }

    #[tokio::test]
    async fn set_merges_without_losing_fields() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join(DOCUMENT_FILE)).await.unwrap();
        store.set(json!({"rewardMinutes": 10, "webPort": 9000})).await.unwrap();

        let before = store.get_all();
        let after = store.set(json!({"workMinutes": 25})).await.unwrap();

        assert_eq!(after.work_minutes, 25);
        assert_eq!(after.reward_minutes, 10);
        assert_eq!(after.web_port, 9000);
        assert_eq!(StorageData { work_minutes: 25, ..before }, store.get_all());
    }

    #[tokio::test]
    async fn set_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DOCUMENT_FILE);
        {
            let store = PersistentStore::open(&path).await.unwrap();
            store.set(json!({"workMinutes": 40})).await.unwrap();
        }
        let store = PersistentStore::open(&path).await.unwrap();
        assert_eq!(store.get_all().work_minutes, 40);
    }

    #[tokio::test]
    async fn invalid_set_is_rejected_and_harmless() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join(DOCUMENT_FILE)).await.unwrap();

        let err = store.set(json!({"workMinutes": "soon"})).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidUpdate(_)));
        assert!(store.set(json!([1, 2])).await.is_err());
        assert_eq!(store.get_all(), StorageData::default());
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DOCUMENT_FILE);
        std::fs::write(&path, "{{{{ definitely not json").unwrap();

        let store = PersistentStore::open(&path).await.unwrap();
        assert_eq!(store.get_all(), StorageData::default());

        // The repaired document was written back.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<Value>(&raw).is_ok());
    }

    #[tokio::test]
    async fn concurrent_updates_all_apply() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PersistentStore::open(dir.path().join(DOCUMENT_FILE)).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.update(|data| data.reward_minutes += 1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get_all().reward_minutes, 25);
        let reopened = PersistentStore::open(store.path()).await.unwrap();
        assert_eq!(reopened.get_all().reward_minutes, 25);
    }

    #[tokio::test]
    async fn reset_restores_defaults() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join(DOCUMENT_FILE)).await.unwrap();
        store.set(json!({"workMinutes": 90})).await.unwrap();

        let data = store.reset().await.unwrap();
        assert_eq!(data, StorageData::default());
        assert_eq!(store.get_all(), StorageData::default());
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
