use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aria_media::{MediaByteSource, MediaSourceFactory, SpanStore, StreamCache};

const KEY: &str = "track-1:remote";

/// In-memory upstream that counts how many range reads reach it.
struct MemoryFactory {
    data: Vec<u8>,
    upstream_reads: Arc<AtomicUsize>,
}

impl MemoryFactory {
    fn new(len: usize) -> Self {
        Self {
            data: (0..len).map(|i| (i % 251) as u8).collect(),
            upstream_reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn reads(&self) -> usize {
        self.upstream_reads.load(Ordering::SeqCst)
    }
}

impl MediaSourceFactory for MemoryFactory {
    fn create(&self, _key: &str) -> Arc<dyn MediaByteSource> {
        Arc::new(MemorySource {
            data: self.data.clone(),
            reads: Arc::clone(&self.upstream_reads),
        })
    }
}

struct MemorySource {
    data: Vec<u8>,
    reads: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl MediaByteSource for MemorySource {
    async fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn read_range(&self, start: u64, len: u64) -> Result<Vec<u8>, String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let start = start as usize;
        if start >= self.data.len() {
            return Err("range out of bounds".to_string());
        }
        let end = (start + len as usize).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}

fn ready_cache(dir: &Path, max_bytes: u64) -> Arc<StreamCache> {
    let cache = Arc::new(StreamCache::new());
    cache.initialize(dir, max_bytes);
    cache
}

#[tokio::test]
async fn test_wrap_returns_none_before_initialize() {
    let cache = Arc::new(StreamCache::new());
    let factory = Arc::new(MemoryFactory::new(1024));
    assert!(cache.wrap(factory).is_none());
}

#[tokio::test]
async fn test_cached_reads_skip_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ready_cache(dir.path(), 1024 * 1024);
    let factory = Arc::new(MemoryFactory::new(64 * 1024));
    let wrapped = cache.wrap(factory.clone()).unwrap();

    let source = wrapped.create(KEY);
    let first = source.read_range(0, 1000).await.unwrap();
    assert_eq!(first.len(), 1000);
    assert_eq!(factory.reads(), 1);

    let second = source.read_range(0, 1000).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(factory.reads(), 1, "second read must come from the cache");

    assert!(cache.is_partially_cached(KEY));
    assert!(!cache.is_fully_cached(KEY));
    assert_eq!(cache.cached_length(KEY), 1000);
}

#[tokio::test]
async fn test_size_stays_bounded_and_lru_spans_evict_first() {
    let dir = tempfile::tempdir().unwrap();
    // Room for exactly three 10 KB spans.
    let cache = ready_cache(dir.path(), 30_000);
    let factory = Arc::new(MemoryFactory::new(200_000));
    let wrapped = cache.wrap(factory.clone()).unwrap();
    let source = wrapped.create(KEY);

    source.read_range(0, 10_000).await.unwrap();
    source.read_range(10_000, 10_000).await.unwrap();
    source.read_range(20_000, 10_000).await.unwrap();
    assert_eq!(cache.current_size_bytes(), 30_000);
    let reads_after_fill = factory.reads();

    // Touch the first span so the second becomes least recently used.
    source.read_range(0, 10_000).await.unwrap();
    assert_eq!(factory.reads(), reads_after_fill);
    assert_eq!(cache.current_size_bytes(), 30_000, "touching must not grow the cache");

    // A fourth span forces an eviction of the LRU span (10_000..20_000).
    source.read_range(30_000, 10_000).await.unwrap();
    assert!(cache.current_size_bytes() <= 30_000);

    let before = factory.reads();
    source.read_range(0, 10_000).await.unwrap();
    assert_eq!(factory.reads(), before, "recently touched span must survive");
    source.read_range(10_000, 10_000).await.unwrap();
    assert_eq!(factory.reads(), before + 1, "LRU span must have been evicted");
}

#[tokio::test]
async fn test_full_coverage_reports_fully_cached() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ready_cache(dir.path(), 1024 * 1024);
    let factory = Arc::new(MemoryFactory::new(30_000));
    let wrapped = cache.wrap(factory).unwrap();
    let source = wrapped.create(KEY);

    source.read_range(0, 10_000).await.unwrap();
    assert!(!cache.is_fully_cached(KEY));
    source.read_range(10_000, 10_000).await.unwrap();
    source.read_range(20_000, 10_000).await.unwrap();

    assert!(cache.is_fully_cached(KEY));
    assert_eq!(cache.cached_length(KEY), 30_000);
    assert_eq!(cache.content_length_of(KEY), Some(30_000));
    assert!(!cache.is_partially_cached("some-other-key"));
}

#[tokio::test]
async fn test_overfill_stays_under_bound() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ready_cache(dir.path(), 100_000);
    let factory = Arc::new(MemoryFactory::new(200_000));
    let wrapped = cache.wrap(factory).unwrap();
    let source = wrapped.create(KEY);

    // 150% of the bound in distinct spans.
    for i in 0..15u64 {
        source.read_range(i * 10_000, 10_000).await.unwrap();
        assert!(cache.current_size_bytes() <= 100_000);
    }
    let (size, spans) = cache.stats();
    assert!(size <= 100_000);
    assert!(spans <= 10);
}

#[tokio::test]
async fn test_corrupt_index_is_wiped_and_recreated() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("cache_index.json"), b"\x00\x01 not json").unwrap();

    let cache = ready_cache(dir.path(), 1024 * 1024);
    assert_eq!(cache.stats(), (0, 0));

    // Usable after recovery.
    let factory = Arc::new(MemoryFactory::new(4096));
    let wrapped = cache.wrap(factory).unwrap();
    wrapped.create(KEY).read_range(0, 1024).await.unwrap();
    assert_eq!(cache.cached_length(KEY), 1024);
}

#[tokio::test]
async fn test_backend_that_never_opens_disables_caching() {
    let cache = Arc::new(StreamCache::with_backend(Arc::new(|_: &Path, _: u64| {
        Err(anyhow::anyhow!("backend unavailable"))
    })));
    let dir = tempfile::tempdir().unwrap();
    cache.initialize(dir.path(), 1024);

    let factory = Arc::new(MemoryFactory::new(1024));
    assert!(cache.wrap(factory.clone()).is_none());
    assert_eq!(cache.current_size_bytes(), 0);

    // Disabled is sticky; a later initialize must not panic or revive it.
    cache.initialize(dir.path(), 1024);
    assert!(cache.wrap(factory).is_none());
}

/// Backend whose reads and writes always fail once open: playback reads must
/// still succeed straight from the upstream source.
struct FailingStore;

impl SpanStore for FailingStore {
    fn read(&mut self, _: &str, _: u64, _: u64) -> anyhow::Result<Option<Vec<u8>>> {
        Err(anyhow::anyhow!("disk on fire"))
    }
    fn write(&mut self, _: &str, _: u64, _: &[u8], _: Option<u64>) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("disk on fire"))
    }
    fn note_content_length(&mut self, _: &str, _: u64) -> anyhow::Result<()> {
        Ok(())
    }
    fn content_length_of(&self, _: &str) -> Option<u64> {
        None
    }
    fn cached_length(&self, _: &str) -> u64 {
        0
    }
    fn is_fully_cached(&self, _: &str) -> bool {
        false
    }
    fn is_partially_cached(&self, _: &str) -> bool {
        false
    }
    fn size_bytes(&self) -> u64 {
        0
    }
    fn span_count(&self) -> usize {
        0
    }
    fn refresh(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn clear(&mut self) {}
}

#[tokio::test]
async fn test_cache_errors_never_fail_a_read() {
    let cache = Arc::new(StreamCache::with_backend(Arc::new(|_: &Path, _: u64| {
        Ok(Box::new(FailingStore) as Box<dyn SpanStore>)
    })));
    let dir = tempfile::tempdir().unwrap();
    cache.initialize(dir.path(), 1024 * 1024);

    let factory = Arc::new(MemoryFactory::new(8192));
    let wrapped = cache.wrap(factory.clone()).unwrap();
    let source = wrapped.create(KEY);

    let bytes = source.read_range(0, 2048).await.unwrap();
    assert_eq!(bytes.len(), 2048);
    let bytes = source.read_range(0, 2048).await.unwrap();
    assert_eq!(bytes.len(), 2048);
    // Every read fell through to the network.
    assert_eq!(factory.reads(), 2);
}

#[tokio::test]
async fn test_set_max_size_reopens_with_new_bound() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ready_cache(dir.path(), 100_000);
    let factory = Arc::new(MemoryFactory::new(100_000));
    let wrapped = cache.wrap(factory).unwrap();
    let source = wrapped.create(KEY);
    for i in 0..9u64 {
        source.read_range(i * 10_000, 10_000).await.unwrap();
    }
    assert_eq!(cache.current_size_bytes(), 90_000);

    cache.set_max_size(20_000);
    assert!(cache.current_size_bytes() <= 20_000);
    // Still open and usable after the swap.
    assert!(cache.is_partially_cached(KEY));
}

#[tokio::test]
async fn test_release_is_idempotent_and_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ready_cache(dir.path(), 100_000);
    let factory = Arc::new(MemoryFactory::new(50_000));
    let wrapped = cache.wrap(factory.clone()).unwrap();
    wrapped.create(KEY).read_range(0, 10_000).await.unwrap();

    cache.release();
    cache.release();
    assert_eq!(cache.current_size_bytes(), 0);
    assert!(cache.wrap(factory).is_none());

    // Reopen picks the persisted index back up.
    cache.initialize(dir.path(), 100_000);
    assert_eq!(cache.current_size_bytes(), 10_000);
    assert!(cache.is_partially_cached(KEY));
}

#[tokio::test]
async fn test_clear_removes_everything_best_effort() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ready_cache(dir.path(), 100_000);
    let factory = Arc::new(MemoryFactory::new(50_000));
    let wrapped = cache.wrap(factory).unwrap();
    let source = wrapped.create(KEY);
    source.read_range(0, 10_000).await.unwrap();
    source.read_range(10_000, 10_000).await.unwrap();

    cache.clear();
    assert_eq!(cache.stats(), (0, 0));
    assert!(!cache.is_partially_cached(KEY));
}
