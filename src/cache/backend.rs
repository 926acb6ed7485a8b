//! Key-value storage for the result cache.

use std::{
    collections::HashMap,
    fmt,
    io,
    sync::Mutex,
};

use crate::prelude::*;

/// A simple string key-value store.
///
/// Backends report errors, but they don't need to be robust. The cache on top
/// of them treats every failure as a miss.
#[async_trait]
pub trait CacheBackend: fmt::Debug + Send + Sync + 'static {
    /// Fetch the value stored under `key`, if any.
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any existing value.
    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove_item(&self, key: &str) -> Result<()>;

    /// List all keys.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// A backend which lives in memory and vanishes with the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().expect("lock poisoned").get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items
            .lock()
            .expect("lock poisoned")
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().expect("lock poisoned").remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .items
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect())
    }
}

/// Extension of the files holding cache values.
const ITEM_EXTENSION: &str = "json";

/// A backend storing one file per key in a directory.
///
/// Writes go to a temporary file which is then renamed into place, so readers
/// never see a half-written value, and concurrent writers to the same key
/// resolve as last-write-wins.
#[derive(Debug)]
pub struct DirBackend {
    dir: PathBuf,
}

impl DirBackend {
    /// Use `dir` for storage. It will be created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn item_path(&self, key: &str) -> Result<PathBuf> {
        let is_safe = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !is_safe {
            return Err(anyhow!("Invalid cache key: {:?}", key));
        }
        Ok(self.dir.join(format!("{key}.{ITEM_EXTENSION}")))
    }
}

#[async_trait]
impl CacheBackend for DirBackend {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let path = self.item_path(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to read cache file {:?}", path.display())),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.item_path(key)?;
        tokio::fs::create_dir_all(&self.dir).await.with_context(|| {
            format!("Failed to create cache directory {:?}", self.dir.display())
        })?;
        let tmp_path = self
            .dir
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp_path, value)
            .await
            .with_context(|| format!("Failed to write cache file {:?}", tmp_path.display()))?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err)
                .with_context(|| format!("Failed to replace cache file {:?}", path.display()));
        }
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        let path = self.item_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to remove cache file {:?}", path.display())),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to list cache directory {:?}", self.dir.display())
                });
            }
        };
        let mut keys = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == ITEM_EXTENSION)
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && !stem.starts_with('.')
            {
                keys.push(stem.to_owned());
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_backend(backend: &dyn CacheBackend) -> Result<()> {
        assert_eq!(backend.get_item("missing").await?, None);

        backend.set_item("alpha", "1").await?;
        backend.set_item("beta", "2").await?;
        backend.set_item("alpha", "3").await?;
        assert_eq!(backend.get_item("alpha").await?.as_deref(), Some("3"));

        let mut keys = backend.keys().await?;
        keys.sort();
        assert_eq!(keys, vec!["alpha", "beta"]);

        backend.remove_item("alpha").await?;
        backend.remove_item("alpha").await?;
        assert_eq!(backend.get_item("alpha").await?, None);
        assert_eq!(backend.keys().await?, vec!["beta"]);
        Ok(())
    }

    #[tokio::test]
    async fn memory_backend_works() -> Result<()> {
        exercise_backend(&MemoryBackend::new()).await
    }

    #[tokio::test]
    async fn dir_backend_works() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("cache-backend")?;
        let backend = DirBackend::new(dir.path().join("nested"));
        assert!(backend.keys().await?.is_empty());
        exercise_backend(&backend).await
    }

    #[tokio::test]
    async fn dir_backend_rejects_unsafe_keys() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("cache-backend")?;
        let backend = DirBackend::new(dir.path());
        assert!(backend.set_item("../escape", "x").await.is_err());
        assert!(backend.get_item("").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn dir_backend_ignores_unrelated_files() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("cache-backend")?;
        tokio::fs::write(dir.path().join("notes.txt"), "hi").await?;
        tokio::fs::write(dir.path().join(".half.tmp"), "hi").await?;
        let backend = DirBackend::new(dir.path());
        backend.set_item("kept", "1").await?;
        assert_eq!(backend.keys().await?, vec!["kept"]);
        Ok(())
    }
}
