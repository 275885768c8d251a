//! Shared keyed store for cross-instance coordination
//!
//! The coordinated circuit breaker and the distributed metrics collector
//! persist their state through the [`StateStore`] trait so that several
//! pool instances (separate processes or hosts against the same backend)
//! converge on one judgment and one aggregate metrics view.
//!
//! Concurrent writers are expected, so the contract requires atomic
//! `incr` and `compare_and_swap`.
//!
//! | Store | Use case |
//! |-------|----------|
//! | [`MemoryStateStore`] | Tests, single-process deployments |
//! | [`FileStateStore`] | Multi-process deployments sharing a filesystem |

use crate::error::{PoolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;
use tracing::warn;

/// Shared keyed store with atomic read-modify-write primitives
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value unconditionally
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically add `delta` to an integer value (missing keys start at 0),
    /// returning the new value
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    /// Atomically replace the value if it currently equals `expected`
    /// (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool>;

    /// List keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory store for tests and single-process deployments
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(key)
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|e| PoolError::store(format!("non-integer value at '{}': {}", key, e)))?
            .unwrap_or(0);
        let next = current + delta;
        entries.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).map(String::as_str);
        if current == expected {
            entries.insert(key.to_string(), new.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ============================================================================
// File-based store
// ============================================================================

/// One persisted entry; the original key travels in the payload since the
/// filename encoding is lossy.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: String,
}

/// File-based store for pool processes sharing a filesystem.
///
/// One JSON file per key, written atomically (temp file + rename). A lock
/// file created with `create_new` serializes read-modify-write operations
/// across processes; an in-process mutex keeps tasks of the same process
/// off the lock file.
pub struct FileStateStore {
    dir: PathBuf,
    local: AsyncMutex<()>,
}

/// How long to keep retrying the cross-process lock file
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay between lock-file attempts
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(5);

impl FileStateStore {
    /// Create the store, creating the directory if needed
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PoolError::store(format!("failed to create store directory: {}", e)))?;
        Ok(Self {
            dir,
            local: AsyncMutex::new(()),
        })
    }

    /// Directory backing this store
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let encoded: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '.' })
            .collect();
        self.dir.join(format!("{}.json", encoded))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(".floodgate.lock")
    }

    /// Acquire the cross-process lock file. Stale locks are not broken
    /// automatically; the timeout surfaces them as store errors.
    async fn lock_file(&self) -> Result<FileLockGuard> {
        let path = self.lock_path();
        let deadline = tokio::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(FileLockGuard { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(PoolError::store(format!(
                            "timed out acquiring store lock {}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(PoolError::store(format!(
                        "failed to create store lock: {}",
                        e
                    )))
                }
            }
        }
    }

    async fn read_entry(&self, key: &str) -> Result<Option<String>> {
        let path = self.file_path(key);
        match fs::read_to_string(&path).await {
            Ok(content) => {
                let entry: StoredEntry = serde_json::from_str(&content)
                    .map_err(|e| PoolError::store(format!("corrupt entry {}: {}", key, e)))?;
                Ok(Some(entry.value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PoolError::store(format!("failed to read {}: {}", key, e))),
        }
    }

    /// Atomic write via temp file + rename
    async fn write_entry(&self, key: &str, value: &str) -> Result<()> {
        let path = self.file_path(key);
        let tmp = path.with_extension("json.tmp");
        let entry = StoredEntry {
            key: key.to_string(),
            value: value.to_string(),
        };
        let payload = serde_json::to_string(&entry)
            .map_err(|e| PoolError::store(format!("failed to encode {}: {}", key, e)))?;

        fs::write(&tmp, payload)
            .await
            .map_err(|e| PoolError::store(format!("failed to write {}: {}", key, e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| PoolError::store(format!("failed to commit {}: {}", key, e)))?;
        Ok(())
    }
}

/// Removes the lock file when the guard drops
struct FileLockGuard {
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read_entry(key).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let _local = self.local.lock().await;
        let _lock = self.lock_file().await?;
        self.write_entry(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _local = self.local.lock().await;
        let _lock = self.lock_file().await?;
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PoolError::store(format!("failed to delete {}: {}", key, e))),
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let _local = self.local.lock().await;
        let _lock = self.lock_file().await?;
        let current = self
            .read_entry(key)
            .await?
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|e| PoolError::store(format!("non-integer value at '{}': {}", key, e)))?
            .unwrap_or(0);
        let next = current + delta;
        self.write_entry(key, &next.to_string()).await?;
        Ok(next)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let _local = self.local.lock().await;
        let _lock = self.lock_file().await?;
        let current = self.read_entry(key).await?;
        if current.as_deref() == expected {
            self.write_entry(key, new).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PoolError::store(format!(
                    "failed to read store directory: {}",
                    e
                )))
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PoolError::store(format!("failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match fs::read_to_string(&path).await {
                    Ok(content) => {
                        if let Ok(stored) = serde_json::from_str::<StoredEntry>(&content) {
                            if stored.key.starts_with(prefix) {
                                keys.push(stored.key);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to read store entry");
                    }
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn check_store_contract(store: Arc<dyn StateStore>) {
        // get/put/delete
        assert_eq!(store.get("ns:a").await.unwrap(), None);
        store.put("ns:a", "hello").await.unwrap();
        assert_eq!(store.get("ns:a").await.unwrap(), Some("hello".into()));
        store.delete("ns:a").await.unwrap();
        assert_eq!(store.get("ns:a").await.unwrap(), None);
        // delete of a missing key is fine
        store.delete("ns:a").await.unwrap();

        // incr from absent starts at zero
        assert_eq!(store.incr("ns:counter", 3).await.unwrap(), 3);
        assert_eq!(store.incr("ns:counter", -1).await.unwrap(), 2);

        // CAS
        assert!(store
            .compare_and_swap("ns:state", None, "closed")
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("ns:state", Some("open"), "half_open")
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("ns:state", Some("closed"), "open")
            .await
            .unwrap());
        assert_eq!(store.get("ns:state").await.unwrap(), Some("open".into()));

        // prefix listing
        let mut keys = store.keys("ns:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ns:counter".to_string(), "ns:state".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        check_store_contract(Arc::new(MemoryStateStore::new())).await;
    }

    #[tokio::test]
    async fn test_file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();
        check_store_contract(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStateStore::new(dir.path()).await.unwrap();
            store.put("ns:breaker:state", "open").await.unwrap();
            store.incr("ns:failures", 5).await.unwrap();
        }
        let store = FileStateStore::new(dir.path()).await.unwrap();
        assert_eq!(
            store.get("ns:breaker:state").await.unwrap(),
            Some("open".into())
        );
        assert_eq!(store.incr("ns:failures", 0).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_file_store_concurrent_incr() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    store.incr("ns:hits", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.incr("ns:hits", 0).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_memory_store_incr_rejects_non_integer() {
        let store = MemoryStateStore::new();
        store.put("ns:text", "abc").await.unwrap();
        assert!(store.incr("ns:text", 1).await.is_err());
    }
}
