//! A best-effort, expiring cache of analysis results.
//!
//! Entries are keyed by image fingerprint _and_ output language, so a result
//! produced for one language is never served for another. Nothing in here
//! returns an error: storage problems are logged and treated as cache misses.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    fingerprint::Fingerprint,
    language::OutputLanguage,
    prelude::*,
    result::{AnalysisResult, RESULT_SCHEMA_VERSION},
};

pub use self::backend::{CacheBackend, DirBackend, MemoryBackend};

mod backend;

/// Prefix shared by every cached result.
pub const CACHE_PREFIX: &str = "ocr_cache_";

/// Key under which we remember the last output language. This does not start
/// with [`CACHE_PREFIX`], so clearing the cache leaves it alone.
const LANGUAGE_STATE_KEY: &str = "ocr_state_language";

/// How long entries stay valid by default.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// What we store for each cached result.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    result: AnalysisResult,

    /// Creation time, in milliseconds since the Unix epoch.
    timestamp: u64,

    language: OutputLanguage,

    #[serde(default)]
    schema_version: u32,
}

/// Result cache on top of a [`CacheBackend`].
#[derive(Clone, Debug)]
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl ResultCache {
    /// Create a cache using `backend`, with entries expiring after `ttl`.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Look up a cached result. Expired entries are removed as a side effect.
    #[instrument(level = "debug", skip(self), fields(fingerprint = %fingerprint))]
    pub async fn get(
        &self,
        fingerprint: &Fingerprint,
        language: OutputLanguage,
    ) -> Option<AnalysisResult> {
        let key = cache_key(fingerprint, language);
        let raw = match self.backend.get_item(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!("Error reading from cache: {err:?}");
                return None;
            }
        };

        let entry = match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%key, "Unreadable cache entry, removing: {err}");
                self.remove(&key).await;
                return None;
            }
        };

        if self.is_expired(&entry, now_millis()) {
            debug!(%key, "Cache entry expired");
            self.remove(&key).await;
            return None;
        }
        if entry.schema_version != RESULT_SCHEMA_VERSION {
            debug!(%key, version = entry.schema_version, "Cache entry has old schema");
            self.remove(&key).await;
            return None;
        }
        if entry.language != language {
            warn!(%key, stored = %entry.language, "Cache entry has wrong language");
            return None;
        }
        Some(entry.result)
    }

    /// Store a result, replacing any previous entry for the same key. Also
    /// sweeps out any other expired entries.
    #[instrument(level = "debug", skip(self, result), fields(fingerprint = %fingerprint))]
    pub async fn put(
        &self,
        fingerprint: &Fingerprint,
        language: OutputLanguage,
        result: &AnalysisResult,
    ) {
        let key = cache_key(fingerprint, language);
        let entry = CacheEntry {
            result: result.clone(),
            timestamp: now_millis(),
            language,
            schema_version: RESULT_SCHEMA_VERSION,
        };
        let stored = match serde_json::to_string(&entry) {
            Ok(raw) => self.backend.set_item(&key, &raw).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = stored {
            warn!("Error writing to cache: {err:?}");
            return;
        }
        self.purge_expired().await;
    }

    /// Remove every cached result.
    #[instrument(level = "debug", skip(self))]
    pub async fn clear_all(&self) {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("Error clearing cache: {err:?}");
                return;
            }
        };
        let mut removed = 0;
        for key in keys.iter().filter(|key| key.starts_with(CACHE_PREFIX)) {
            self.remove(key).await;
            removed += 1;
        }
        debug!(removed, "Cleared cache");
    }

    /// The output language recorded by [`Self::remember_language`], if any.
    pub async fn remembered_language(&self) -> Option<OutputLanguage> {
        match self.backend.get_item(LANGUAGE_STATE_KEY).await {
            Ok(Some(raw)) => raw
                .trim()
                .parse()
                .inspect_err(|err| warn!("Ignoring stored language: {err}"))
                .ok(),
            Ok(None) => None,
            Err(err) => {
                warn!("Error reading stored language: {err:?}");
                None
            }
        }
    }

    /// Record the current output language, so that a later process can tell
    /// whether it changed.
    pub async fn remember_language(&self, language: OutputLanguage) {
        if let Err(err) = self
            .backend
            .set_item(LANGUAGE_STATE_KEY, language.tag())
            .await
        {
            warn!("Error storing language: {err:?}");
        }
    }

    /// Remove all expired or unreadable entries.
    async fn purge_expired(&self) {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("Error cleaning cache: {err:?}");
                return;
            }
        };
        let now = now_millis();
        for key in keys.iter().filter(|key| key.starts_with(CACHE_PREFIX)) {
            let keep = match self.backend.get_item(key).await {
                Ok(Some(raw)) => serde_json::from_str::<CacheEntry>(&raw)
                    .is_ok_and(|entry| !self.is_expired(&entry, now)),
                Ok(None) => true,
                Err(err) => {
                    warn!(%key, "Error reading cache entry during cleanup: {err:?}");
                    true
                }
            };
            if !keep {
                trace!(%key, "Purging cache entry");
                self.remove(key).await;
            }
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        let age = Duration::from_millis(now.saturating_sub(entry.timestamp));
        age > self.ttl
    }

    async fn remove(&self, key: &str) {
        if let Err(err) = self.backend.remove_item(key).await {
            warn!(%key, "Error removing cache entry: {err:?}");
        }
    }
}

/// The backend key for a result.
fn cache_key(fingerprint: &Fingerprint, language: OutputLanguage) -> String {
    format!("{CACHE_PREFIX}{fingerprint}_{language}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A backend where everything fails.
    #[derive(Debug)]
    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn get_item(&self, _key: &str) -> Result<Option<String>> {
            Err(anyhow!("quota exceeded"))
        }
        async fn set_item(&self, _key: &str, _value: &str) -> Result<()> {
            Err(anyhow!("quota exceeded"))
        }
        async fn remove_item(&self, _key: &str) -> Result<()> {
            Err(anyhow!("quota exceeded"))
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Err(anyhow!("quota exceeded"))
        }
    }

    fn sample_result(description: &str) -> AnalysisResult {
        AnalysisResult {
            description: description.to_owned(),
            ..AnalysisResult::default()
        }
    }

    async fn fingerprint(data: &[u8]) -> Fingerprint {
        Fingerprint::from_bytes(data).await.unwrap()
    }

    fn memory_cache() -> (Arc<MemoryBackend>, ResultCache) {
        let backend = Arc::new(MemoryBackend::new());
        let cache = ResultCache::new(backend.clone(), DEFAULT_CACHE_TTL);
        (backend, cache)
    }

    /// Write an entry directly into the backend, with a chosen age.
    async fn insert_aged(
        backend: &MemoryBackend,
        fingerprint: &Fingerprint,
        language: OutputLanguage,
        age: Duration,
    ) {
        let entry = CacheEntry {
            result: sample_result("old"),
            timestamp: now_millis() - u64::try_from(age.as_millis()).unwrap(),
            language,
            schema_version: RESULT_SCHEMA_VERSION,
        };
        backend
            .set_item(
                &cache_key(fingerprint, language),
                &serde_json::to_string(&entry).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (backend, cache) = memory_cache();
        let fp = fingerprint(b"X").await;
        cache.put(&fp, OutputLanguage::En, &sample_result("a cat")).await;

        assert_eq!(
            cache.get(&fp, OutputLanguage::En).await,
            Some(sample_result("a cat"))
        );
        let keys = backend.keys().await.unwrap();
        assert_eq!(keys, vec![format!("ocr_cache_{fp}_en")]);
    }

    #[tokio::test]
    async fn entries_are_partitioned_by_language() {
        let (_backend, cache) = memory_cache();
        let fp = fingerprint(b"X").await;
        cache.put(&fp, OutputLanguage::En, &sample_result("a cat")).await;
        assert_eq!(cache.get(&fp, OutputLanguage::Ja).await, None);

        cache.put(&fp, OutputLanguage::Ja, &sample_result("猫")).await;
        assert_eq!(
            cache.get(&fp, OutputLanguage::En).await,
            Some(sample_result("a cat"))
        );
        assert_eq!(
            cache.get(&fp, OutputLanguage::Ja).await,
            Some(sample_result("猫"))
        );
    }

    #[tokio::test]
    async fn expired_entries_are_absent_and_removed() {
        let (backend, cache) = memory_cache();
        let fp = fingerprint(b"X").await;
        insert_aged(&backend, &fp, OutputLanguage::En, DEFAULT_CACHE_TTL * 2).await;

        assert_eq!(cache.get(&fp, OutputLanguage::En).await, None);
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fresh_entries_survive() {
        let (backend, cache) = memory_cache();
        let fp = fingerprint(b"X").await;
        insert_aged(&backend, &fp, OutputLanguage::En, Duration::from_secs(60)).await;
        assert_eq!(
            cache.get(&fp, OutputLanguage::En).await,
            Some(sample_result("old"))
        );
    }

    #[tokio::test]
    async fn put_sweeps_other_expired_entries() {
        let (backend, cache) = memory_cache();
        let stale = fingerprint(b"stale").await;
        let fresh = fingerprint(b"fresh").await;
        insert_aged(&backend, &stale, OutputLanguage::Ja, DEFAULT_CACHE_TTL * 2).await;
        backend
            .set_item("ocr_cache_garbage_en", "{not json")
            .await
            .unwrap();

        cache.put(&fresh, OutputLanguage::En, &sample_result("new")).await;

        let keys = backend.keys().await.unwrap();
        assert_eq!(keys, vec![cache_key(&fresh, OutputLanguage::En)]);
    }

    #[tokio::test]
    async fn corrupt_entries_are_misses() {
        let (backend, cache) = memory_cache();
        let fp = fingerprint(b"X").await;
        let key = cache_key(&fp, OutputLanguage::En);
        backend.set_item(&key, r#"{"result": 12}"#).await.unwrap();

        assert_eq!(cache.get(&fp, OutputLanguage::En).await, None);
        assert_eq!(backend.get_item(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn old_schema_versions_are_misses() {
        let (backend, cache) = memory_cache();
        let fp = fingerprint(b"X").await;
        let key = cache_key(&fp, OutputLanguage::En);
        let raw = json!({
            "result": {"description": "x"},
            "timestamp": now_millis(),
            "language": "en",
        });
        backend.set_item(&key, &raw.to_string()).await.unwrap();

        assert_eq!(cache.get(&fp, OutputLanguage::En).await, None);
    }

    #[tokio::test]
    async fn clear_all_keeps_language_state() {
        let (backend, cache) = memory_cache();
        let fp = fingerprint(b"X").await;
        cache.put(&fp, OutputLanguage::En, &sample_result("a")).await;
        cache.put(&fp, OutputLanguage::Ja, &sample_result("あ")).await;
        cache.remember_language(OutputLanguage::Ja).await;
        backend.set_item("unrelated", "keep me").await.unwrap();

        cache.clear_all().await;

        let mut keys = backend.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec![LANGUAGE_STATE_KEY, "unrelated"]);
        assert_eq!(cache.remembered_language().await, Some(OutputLanguage::Ja));
    }

    #[tokio::test]
    async fn backend_failures_are_swallowed() {
        let cache = ResultCache::new(Arc::new(FailingBackend), DEFAULT_CACHE_TTL);
        let fp = fingerprint(b"X").await;
        cache.put(&fp, OutputLanguage::En, &sample_result("a")).await;
        assert_eq!(cache.get(&fp, OutputLanguage::En).await, None);
        cache.clear_all().await;
        cache.remember_language(OutputLanguage::Ja).await;
        assert_eq!(cache.remembered_language().await, None);
    }

    #[tokio::test]
    async fn works_with_dir_backend() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("result-cache")?;
        let cache = ResultCache::new(Arc::new(DirBackend::new(dir.path())), DEFAULT_CACHE_TTL);
        let fp = fingerprint(b"X").await;
        cache.put(&fp, OutputLanguage::En, &sample_result("a cat")).await;

        // A second cache over the same directory sees the entry.
        let reopened =
            ResultCache::new(Arc::new(DirBackend::new(dir.path())), DEFAULT_CACHE_TTL);
        assert_eq!(
            reopened.get(&fp, OutputLanguage::En).await,
            Some(sample_result("a cat"))
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_to_one_key_leave_a_whole_entry() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("result-cache")?;
        let cache = ResultCache::new(Arc::new(DirBackend::new(dir.path())), DEFAULT_CACHE_TTL);
        let fp = fingerprint(b"X").await;

        let mut handles = vec![];
        for i in 0..32 {
            let cache = cache.clone();
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                let written = sample_result(&format!("writer {i}"));
                cache.put(&fp, OutputLanguage::En, &written).await;
                cache.get(&fp, OutputLanguage::En).await
            }));
        }
        for handle in handles {
            // Every reader sees some writer's complete entry, never a torn one.
            let seen = handle.await?.expect("entry should be readable");
            assert!(seen.description.starts_with("writer "), "{seen:?}");
        }

        let last = cache.get(&fp, OutputLanguage::En).await;
        assert!(last.is_some_and(|result| result.description.starts_with("writer ")));

        let mut names = vec![];
        let mut entries = tokio::fs::read_dir(dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert!(!names.iter().any(|name| name.ends_with(".tmp")), "{names:?}");
        assert_eq!(names, vec![format!("ocr_cache_{fp}_en.json")]);
        Ok(())
    }
}
