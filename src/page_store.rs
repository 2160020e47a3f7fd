//! Crash-atomic storage for fetched pages.
//!
//! A page lives here only between its fetch step and its score step. Writes go
//! to a staging file in the same directory and are renamed into place, so a
//! reader sees either the complete page or nothing.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::StoreError;
use crate::models::PageResult;

/// Handle to a stored page. Orchestration state holds this, never the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLocation {
    pub run_id: String,
    pub page_index: u64,
    pub path: PathBuf,
}

/// Abstraction over page storage for testability.
/// Real implementation: `FilePageStore`.
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn put(
        &self,
        run_id: &str,
        page_index: u64,
        page: &PageResult,
    ) -> Result<PageLocation, StoreError>;

    async fn get(&self, location: &PageLocation) -> Result<PageResult, StoreError>;

    /// Best-effort removal. Deleting an absent page succeeds.
    async fn delete(&self, location: &PageLocation) -> Result<(), StoreError>;

    /// Remove everything left behind by a run, returning how many pages were reclaimed.
    async fn purge_run(&self, run_id: &str) -> Result<usize, StoreError>;
}

/// Page store backed by one JSON file per page under `<root>/<run_id>/`.
pub struct FilePageStore {
    root: PathBuf,
}

impl FilePageStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    fn page_path(&self, run_id: &str, page_index: u64) -> PathBuf {
        self.run_dir(run_id).join(format!("page-{:06}.json", page_index))
    }

    fn staging_path(path: &Path) -> PathBuf {
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        PathBuf::from(staging)
    }
}

fn unavailable(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Unavailable {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl PageStore for FilePageStore {
    async fn put(
        &self,
        run_id: &str,
        page_index: u64,
        page: &PageResult,
    ) -> Result<PageLocation, StoreError> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| unavailable(&dir, e))?;

        let path = self.page_path(run_id, page_index);
        let staging = Self::staging_path(&path);
        let payload = serde_json::to_vec(page).map_err(|e| StoreError::CorruptPayload {
            path: path.clone(),
            source: e,
        })?;

        let mut file = fs::File::create(&staging)
            .await
            .map_err(|e| unavailable(&staging, e))?;
        file.write_all(&payload)
            .await
            .map_err(|e| unavailable(&staging, e))?;
        file.sync_all()
            .await
            .map_err(|e| unavailable(&staging, e))?;
        drop(file);

        fs::rename(&staging, &path)
            .await
            .map_err(|e| unavailable(&path, e))?;

        tracing::debug!(run_id, page_index, path = %path.display(), "stored page");
        Ok(PageLocation {
            run_id: run_id.to_string(),
            page_index,
            path,
        })
    }

    async fn get(&self, location: &PageLocation) -> Result<PageResult, StoreError> {
        let bytes = match fs::read(&location.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::PageMissing {
                    path: location.path.clone(),
                });
            }
            Err(e) => return Err(unavailable(&location.path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptPayload {
            path: location.path.clone(),
            source: e,
        })
    }

    async fn delete(&self, location: &PageLocation) -> Result<(), StoreError> {
        match fs::remove_file(&location.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(&location.path, e)),
        }
    }

    async fn purge_run(&self, run_id: &str) -> Result<usize, StoreError> {
        let dir = self.run_dir(run_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(unavailable(&dir, e)),
        };

        let mut reclaimed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(&dir, e))?
        {
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => reclaimed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(unavailable(&path, e)),
            }
        }
        match fs::remove_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(unavailable(&dir, e)),
        }
        Ok(reclaimed)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReviewRecord;
    use tempfile::tempdir;

    fn sample_page() -> PageResult {
        PageResult {
            records: vec![
                ReviewRecord {
                    id: "r1".into(),
                    text: Some("Works great".into()),
                },
                ReviewRecord {
                    id: "r2".into(),
                    text: None,
                },
            ],
            has_more: true,
            total_known: Some(42),
            product_name: Some("Blender".into()),
            sale_price: Some(19.99),
        }
    }

    #[tokio::test]
    async fn test_put_then_get_returns_same_page() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::new(dir.path().to_path_buf());

        let location = store.put("run-a", 3, &sample_page()).await.unwrap();
        assert_eq!(location.page_index, 3);
        assert!(location.path.ends_with("run-a/page-000003.json"));

        let page = store.get(&location).await.unwrap();
        assert_eq!(page, sample_page());
    }

    #[tokio::test]
    async fn test_put_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::new(dir.path().to_path_buf());
        let location = store.put("run-a", 1, &sample_page()).await.unwrap();

        let staging = FilePageStore::staging_path(&location.path);
        assert!(!staging.exists());
        assert!(location.path.exists());
    }

    #[tokio::test]
    async fn test_partial_staging_file_is_never_observed() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::new(dir.path().to_path_buf());

        // A crash mid-write leaves only the staging file behind.
        let path = store.page_path("run-a", 2);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(FilePageStore::staging_path(&path), b"{\"records\":[{\"id\"").unwrap();

        let location = PageLocation {
            run_id: "run-a".into(),
            page_index: 2,
            path,
        };
        let err = store.get(&location).await.unwrap_err();
        assert!(matches!(err, StoreError::PageMissing { .. }));

        // Re-running the write replaces the debris with a whole page.
        let location = store.put("run-a", 2, &sample_page()).await.unwrap();
        assert_eq!(store.get(&location).await.unwrap(), sample_page());
    }

    #[tokio::test]
    async fn test_get_corrupt_payload() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::new(dir.path().to_path_buf());
        let location = store.put("run-a", 1, &sample_page()).await.unwrap();
        std::fs::write(&location.path, b"not json").unwrap();

        let err = store.get(&location).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptPayload { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::new(dir.path().to_path_buf());
        let location = store.put("run-a", 1, &sample_page()).await.unwrap();

        store.delete(&location).await.unwrap();
        assert!(!location.path.exists());
        store.delete(&location).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_run_reclaims_orphans() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::new(dir.path().to_path_buf());
        store.put("run-a", 1, &sample_page()).await.unwrap();
        store.put("run-a", 2, &sample_page()).await.unwrap();
        let other = store.put("run-b", 1, &sample_page()).await.unwrap();

        assert_eq!(store.purge_run("run-a").await.unwrap(), 2);
        assert!(!dir.path().join("run-a").exists());
        assert!(other.path.exists());
        assert_eq!(store.purge_run("run-a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_into_unwritable_root_is_unavailable() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not dir").unwrap();
        let store = FilePageStore::new(blocker);

        let err = store.put("run-a", 1, &sample_page()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }
}
