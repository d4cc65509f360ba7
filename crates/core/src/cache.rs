use crate::chunking::split_document;
use crate::embeddings::EmbeddingProvider;
use crate::error::EvalError;
use crate::extractor::{ExtractedText, TextExtractor};
use crate::locks::KeyedLocks;
use crate::models::{Configuration, Document, DocumentFingerprint, ProcessedDocument};
use crate::retry::CallContext;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Keyed storage for processed documents. `put_if_absent` is a
/// compare-and-swap: when an entry already exists it is returned unchanged
/// and the candidate is discarded.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Arc<ProcessedDocument>>, EvalError>;

    async fn put_if_absent(&self, entry: ProcessedDocument) -> Result<Arc<ProcessedDocument>, EvalError>;
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Arc<ProcessedDocument>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Arc<ProcessedDocument>>, EvalError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put_if_absent(&self, entry: ProcessedDocument) -> Result<Arc<ProcessedDocument>, EvalError> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .entry(entry.key.clone())
            .or_insert_with(|| Arc::new(entry))
            .clone())
    }
}

/// One JSON file per fingerprint key, fronted by an in-memory map. New
/// entries are written to a temp file and hard-linked into place, so a key
/// is published at most once and readers never see a partial file.
pub struct JsonFileCacheStore {
    directory: PathBuf,
    memory: MemoryCacheStore,
}

impl JsonFileCacheStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            memory: MemoryCacheStore::new(),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.json"))
    }

    async fn read_entry(&self, key: &str) -> Result<Option<ProcessedDocument>, EvalError> {
        match tokio::fs::read(self.entry_path(key)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|error| EvalError::Cache(format!("corrupt cache entry {key}: {error}"))),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(EvalError::Cache(format!("cannot read cache entry {key}: {error}"))),
        }
    }
}

#[async_trait]
impl CacheStore for JsonFileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Arc<ProcessedDocument>>, EvalError> {
        if let Some(hit) = self.memory.get(key).await? {
            return Ok(Some(hit));
        }
        match self.read_entry(key).await? {
            Some(entry) => Ok(Some(self.memory.put_if_absent(entry).await?)),
            None => Ok(None),
        }
    }

    async fn put_if_absent(&self, entry: ProcessedDocument) -> Result<Arc<ProcessedDocument>, EvalError> {
        let unavailable = |error: std::io::Error| EvalError::Cache(error.to_string());

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(unavailable)?;

        let key = entry.key.clone();
        let final_path = self.entry_path(&key);
        let temp_path = self
            .directory
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));

        tokio::fs::write(&temp_path, serde_json::to_vec(&entry)?)
            .await
            .map_err(unavailable)?;
        let linked = tokio::fs::hard_link(&temp_path, &final_path).await;
        let _ = tokio::fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => Ok(self.memory.put_if_absent(entry).await?),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                debug!(key = %key, "cache entry already published by another writer");
                let existing = self
                    .read_entry(&key)
                    .await?
                    .ok_or_else(|| EvalError::Cache(format!("cache entry {key} vanished")))?;
                self.memory.put_if_absent(existing).await
            }
            Err(error) => Err(unavailable(error)),
        }
    }
}

/// Memoizes extraction, splitting and embedding per fingerprint. Misses on
/// the same fingerprint are serialized so the work happens once.
pub struct DocumentCache {
    store: Arc<dyn CacheStore>,
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn EmbeddingProvider>,
    locks: KeyedLocks,
}

impl DocumentCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            extractor,
            embedder,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn get_or_create(
        &self,
        document: &Document,
        configuration: &Configuration,
        ctx: &CallContext,
    ) -> Result<Arc<ProcessedDocument>, EvalError> {
        let fingerprint = DocumentFingerprint::new(document, configuration);
        let key = fingerprint.key();

        if let Some(hit) = self.store.get(&key).await? {
            debug!(key = %key, document = %document.name, "processed document cache hit");
            return Ok(hit);
        }

        let _writer = self.locks.acquire(&key).await;
        if let Some(hit) = self.store.get(&key).await? {
            debug!(key = %key, document = %document.name, "processed document built by concurrent writer");
            return Ok(hit);
        }

        let extracted = ctx.call("extract", || self.extract(document)).await?;
        let chunks = split_document(configuration, &extracted)?;
        if chunks.is_empty() {
            return Err(EvalError::Configuration(format!(
                "document {} produced no chunks with {} chunking",
                document.name, configuration.chunking_strategy
            )));
        }

        let model = configuration.embedding_model.as_str();
        let embeddings = ctx
            .call("embed_chunks", || self.embedder.embed(&chunks, model))
            .await?;
        if embeddings.len() != chunks.len() {
            return Err(EvalError::parse(
                self.embedder.name(),
                format!("expected {} embeddings, got {}", chunks.len(), embeddings.len()),
            ));
        }

        info!(
            key = %key,
            document = %document.name,
            strategy = %configuration.chunking_strategy,
            chunk_count = chunks.len(),
            "processed document"
        );

        self.store
            .put_if_absent(ProcessedDocument {
                key,
                fingerprint,
                full_text: extracted.full_text,
                pages: extracted.pages,
                chunks,
                embeddings,
                created_at: Utc::now(),
            })
            .await
    }

    /// Runs the blocking extractor off the runtime. Dropping the future stops
    /// waiting on it, the blocking thread finishes on its own.
    async fn extract(&self, document: &Document) -> Result<ExtractedText, EvalError> {
        let extractor = Arc::clone(&self.extractor);
        let path = document.path.clone();
        tokio::task::spawn_blocking(move || extractor.extract(&path))
            .await
            .map_err(|error| EvalError::Io(std::io::Error::other(error.to_string())))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{ChunkSizes, ChunkingStrategy, SimilarityMetric};
    use crate::retry::RetryPolicy;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct CountingExtractor {
        calls: AtomicUsize,
    }

    impl TextExtractor for CountingExtractor {
        fn extract(&self, _path: &Path) -> Result<ExtractedText, EvalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            Ok(ExtractedText::from_pages(vec![
                "Intro page".to_string(),
                "The budget is ten million".to_string(),
                "Timeline page".to_string(),
            ]))
        }
    }

    struct StalledExtractor;

    impl TextExtractor for StalledExtractor {
        fn extract(&self, _path: &Path) -> Result<ExtractedText, EvalError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(ExtractedText::from_pages(vec!["late".to_string()]))
        }
    }

    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        fn name(&self) -> &str {
            "counting"
        }

        async fn embed(&self, texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>, EvalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let inner = CharacterNgramEmbedder { dimensions: 16 };
            Ok(texts.iter().map(|text| inner.embed_one(text)).collect())
        }
    }

    fn document() -> Document {
        Document {
            id: "doc-1".to_string(),
            name: "report.pdf".to_string(),
            path: PathBuf::from("report.pdf"),
            size: 3,
            extension: "pdf".to_string(),
        }
    }

    fn configuration(page_size: usize) -> Configuration {
        Configuration {
            id: "cfg-1".to_string(),
            chunking_strategy: ChunkingStrategy::Page,
            sizes: ChunkSizes {
                page_size: Some(page_size),
                ..Default::default()
            },
            embedding_model: "local-ngram".to_string(),
            similarity_metric: SimilarityMetric::Cosine,
            top_k: 2,
        }
    }

    fn ctx() -> CallContext {
        CallContext::new(
            RetryPolicy {
                timeout: Duration::from_secs(5),
                max_retries: 0,
                backoff: Duration::from_millis(1),
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let extractor = Arc::new(CountingExtractor::default());
        let embedder = Arc::new(CountingEmbedder::default());
        let cache = DocumentCache::new(
            Arc::new(MemoryCacheStore::new()),
            extractor.clone(),
            embedder.clone(),
        );

        let first = cache.get_or_create(&document(), &configuration(1), &ctx()).await.unwrap();
        let second = cache.get_or_create(&document(), &configuration(1), &ctx()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.chunks.len(), 3);
        assert_eq!(first.embeddings.len(), 3);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_writers_compute_once() {
        let extractor = Arc::new(CountingExtractor::default());
        let embedder = Arc::new(CountingEmbedder::default());
        let store = Arc::new(MemoryCacheStore::new());
        let cache = Arc::new(DocumentCache::new(store.clone(), extractor.clone(), embedder.clone()));

        let tasks = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    cache.get_or_create(&document(), &configuration(1), &ctx()).await
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn different_parameters_get_separate_entries() {
        let store = Arc::new(MemoryCacheStore::new());
        let cache = DocumentCache::new(
            store.clone(),
            Arc::new(CountingExtractor::default()),
            Arc::new(CountingEmbedder::default()),
        );

        let single = cache.get_or_create(&document(), &configuration(1), &ctx()).await.unwrap();
        let paired = cache.get_or_create(&document(), &configuration(2), &ctx()).await.unwrap();

        assert_eq!(single.chunks.len(), 3);
        assert_eq!(paired.chunks.len(), 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn file_store_persists_and_refuses_overwrite() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let cache = DocumentCache::new(
            Arc::new(JsonFileCacheStore::new(dir.path())),
            Arc::new(CountingExtractor::default()),
            Arc::new(CountingEmbedder::default()),
        );
        let created = cache.get_or_create(&document(), &configuration(1), &ctx()).await?;

        let reopened = JsonFileCacheStore::new(dir.path());
        let loaded = reopened.get(&created.key).await?.ok_or("entry missing")?;
        assert_eq!(loaded.chunks, created.chunks);
        assert_eq!(loaded.fingerprint, created.fingerprint);
        assert_eq!(loaded.embeddings.len(), created.embeddings.len());

        let mut rival = (*created).clone();
        rival.chunks = vec!["rival".to_string()];
        let kept = reopened.put_if_absent(rival).await?;
        assert_eq!(kept.chunks, created.chunks);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_context_skips_processing() {
        let extractor = Arc::new(CountingExtractor::default());
        let cache = DocumentCache::new(
            Arc::new(MemoryCacheStore::new()),
            extractor.clone(),
            Arc::new(CountingEmbedder::default()),
        );
        let ctx = ctx();
        ctx.cancel.cancel();

        let result = cache.get_or_create(&document(), &configuration(1), &ctx).await;
        assert!(matches!(result, Err(EvalError::Cancelled)));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stalled_extraction_times_out() {
        let embedder = Arc::new(CountingEmbedder::default());
        let cache = DocumentCache::new(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(StalledExtractor),
            embedder.clone(),
        );
        let ctx = CallContext::new(
            RetryPolicy {
                timeout: Duration::from_millis(20),
                max_retries: 0,
                backoff: Duration::from_millis(1),
            },
            CancellationToken::new(),
        );

        let result = cache.get_or_create(&document(), &configuration(1), &ctx).await;
        assert!(matches!(result, Err(EvalError::Timeout(_))));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }
}
