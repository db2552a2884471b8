use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{log_debug, log_info, log_warn};

const CACHE_INDEX_FILE: &str = "cache_index.json";

/// A readable source of media bytes, addressed by byte range.
///
/// The playback engine implements this over plain HTTP range requests; the
/// cache wraps it without the engine noticing.
#[async_trait]
pub trait MediaByteSource: Send + Sync {
    /// Total stream length, when the source knows it.
    async fn content_length(&self) -> Option<u64>;

    /// Read up to `len` bytes starting at `start`. A short read means the
    /// stream ended.
    async fn read_range(&self, start: u64, len: u64) -> Result<Vec<u8>, String>;
}

/// Creates a [`MediaByteSource`] for a given cache key (one key per remote
/// stream, typically the track id plus a source discriminator).
pub trait MediaSourceFactory: Send + Sync {
    fn create(&self, key: &str) -> Arc<dyn MediaByteSource>;
}

/// Storage backend for cached byte spans. The shipped implementation is
/// [`DiskSpanStore`]; anything that can store spans, report an aggregate
/// size and clear itself can stand in.
pub trait SpanStore: Send {
    /// Return cached bytes for the range if some stored span covers it
    /// entirely, bumping that span's recency.
    fn read(&mut self, key: &str, start: u64, len: u64) -> anyhow::Result<Option<Vec<u8>>>;

    /// Store one span. May evict least-recently-used spans to stay within
    /// the configured bound; spans larger than the bound are not stored.
    fn write(
        &mut self,
        key: &str,
        start: u64,
        data: &[u8],
        content_length: Option<u64>,
    ) -> anyhow::Result<()>;

    /// Record the total stream length for a key without storing bytes.
    fn note_content_length(&mut self, key: &str, len: u64) -> anyhow::Result<()>;

    fn content_length_of(&self, key: &str) -> Option<u64>;

    /// Merged (deduplicated) number of bytes present for a key.
    fn cached_length(&self, key: &str) -> u64;

    fn is_fully_cached(&self, key: &str) -> bool;

    fn is_partially_cached(&self, key: &str) -> bool;

    fn size_bytes(&self) -> u64;

    fn span_count(&self) -> usize;

    /// Drop spans whose backing file vanished and recompute size counters.
    fn refresh(&mut self) -> anyhow::Result<()>;

    /// Best-effort removal of everything; errors on individual spans are
    /// swallowed.
    fn clear(&mut self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpanRecord {
    key: String,
    start: u64,
    len: u64,
    last_access: u64,
    file: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SpanIndex {
    spans: Vec<SpanRecord>,
    #[serde(default)]
    content_lengths: HashMap<String, u64>,
    /// Monotonic recency clock; persisted so LRU order survives reopen.
    #[serde(default)]
    access_clock: u64,
}

/// Disk-backed span store: a directory of span files plus one JSON index.
pub struct DiskSpanStore {
    dir: PathBuf,
    index_file: PathBuf,
    max_bytes: u64,
    index: SpanIndex,
    total_size: u64,
}

impl DiskSpanStore {
    /// Open (or create) the store. Any parse or I/O failure is returned so
    /// the owner can run its wipe-and-retry recovery.
    pub fn open(dir: &Path, max_bytes: u64) -> anyhow::Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create cache dir {}", dir.display()))?;
        let index_file = dir.join(CACHE_INDEX_FILE);

        let index: SpanIndex = if index_file.exists() {
            let content = fs::read_to_string(&index_file)
                .with_context(|| format!("read cache index {}", index_file.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parse cache index {}", index_file.display()))?
        } else {
            SpanIndex::default()
        };

        let mut store = Self {
            dir: dir.to_path_buf(),
            index_file,
            max_bytes,
            index,
            total_size: 0,
        };
        store.refresh()?;
        // The bound may have shrunk since the index was written.
        store.evict_to_bound();
        store.save_index()?;
        Ok(store)
    }

    fn span_path(&self, record: &SpanRecord) -> PathBuf {
        self.dir.join(&record.file)
    }

    fn span_file_name(key: &str, start: u64, len: u64) -> String {
        let digest = Sha256::digest(key.as_bytes());
        let mut hex = String::with_capacity(32);
        for byte in &digest[..16] {
            hex.push_str(&format!("{:02x}", byte));
        }
        format!("{}_{}_{}.span", hex, start, len)
    }

    fn next_tick(&mut self) -> u64 {
        self.index.access_clock += 1;
        self.index.access_clock
    }

    fn save_index(&self) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(&self.index).context("serialize cache index")?;
        let tmp = self.index_file.with_extension("json.tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("write cache index {}", tmp.display()))?;
        fs::rename(&tmp, &self.index_file).context("replace cache index")?;
        Ok(())
    }

    fn evict_to_bound(&mut self) {
        while self.total_size > self.max_bytes && !self.index.spans.is_empty() {
            let oldest = self
                .index
                .spans
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_access)
                .map(|(i, _)| i);
            let Some(i) = oldest else { break };
            let record = self.index.spans.remove(i);
            let _ = fs::remove_file(self.span_path(&record));
            self.total_size = self.total_size.saturating_sub(record.len);
            log_debug!(
                "evicted span {}@{}+{} ({} bytes cached)",
                record.key,
                record.start,
                record.len,
                self.total_size
            );
        }
    }

    /// Merge a key's spans into disjoint intervals and sum their coverage.
    fn coverage(&self, key: &str) -> Vec<(u64, u64)> {
        let mut ranges: Vec<(u64, u64)> = self
            .index
            .spans
            .iter()
            .filter(|s| s.key == key)
            .map(|s| (s.start, s.start + s.len))
            .collect();
        ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::new();
        for (start, end) in ranges {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => {
                    *last_end = (*last_end).max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        merged
    }
}

impl SpanStore for DiskSpanStore {
    fn read(&mut self, key: &str, start: u64, len: u64) -> anyhow::Result<Option<Vec<u8>>> {
        let end = start + len;
        let tick = self.next_tick();
        let covering = self
            .index
            .spans
            .iter_mut()
            .find(|s| s.key == key && s.start <= start && s.start + s.len >= end);
        let Some(record) = covering else {
            return Ok(None);
        };
        record.last_access = tick;
        let offset = (start - record.start) as usize;
        let path = self.dir.join(&record.file);
        let bytes = fs::read(&path).with_context(|| format!("read span {}", path.display()))?;
        if bytes.len() < offset + len as usize {
            return Err(anyhow!("span file {} shorter than its record", path.display()));
        }
        Ok(Some(bytes[offset..offset + len as usize].to_vec()))
    }

    fn write(
        &mut self,
        key: &str,
        start: u64,
        data: &[u8],
        content_length: Option<u64>,
    ) -> anyhow::Result<()> {
        if let Some(total) = content_length {
            self.index.content_lengths.entry(key.to_string()).or_insert(total);
        }
        let len = data.len() as u64;
        if len == 0 {
            return Ok(());
        }
        if len > self.max_bytes {
            log_debug!("span {}@{} larger than cache bound, not stored", key, start);
            return Ok(());
        }

        let end = start + len;
        let tick = self.next_tick();
        if let Some(existing) = self
            .index
            .spans
            .iter_mut()
            .find(|s| s.key == key && s.start <= start && s.start + s.len >= end)
        {
            // Already covered: a touch, not a new span.
            existing.last_access = tick;
            return Ok(());
        }

        let file = Self::span_file_name(key, start, len);
        let path = self.dir.join(&file);
        fs::write(&path, data).with_context(|| format!("write span {}", path.display()))?;
        self.index.spans.push(SpanRecord {
            key: key.to_string(),
            start,
            len,
            last_access: tick,
            file,
        });
        self.total_size += len;
        self.evict_to_bound();
        self.save_index()
    }

    fn note_content_length(&mut self, key: &str, len: u64) -> anyhow::Result<()> {
        self.index.content_lengths.entry(key.to_string()).or_insert(len);
        Ok(())
    }

    fn content_length_of(&self, key: &str) -> Option<u64> {
        self.index.content_lengths.get(key).copied()
    }

    fn cached_length(&self, key: &str) -> u64 {
        self.coverage(key).iter().map(|(s, e)| e - s).sum()
    }

    fn is_fully_cached(&self, key: &str) -> bool {
        let Some(total) = self.content_length_of(key) else {
            return false;
        };
        if total == 0 {
            return true;
        }
        match self.coverage(key).first() {
            Some(&(0, end)) => end >= total,
            _ => false,
        }
    }

    fn is_partially_cached(&self, key: &str) -> bool {
        self.index.spans.iter().any(|s| s.key == key)
    }

    fn size_bytes(&self) -> u64 {
        self.total_size
    }

    fn span_count(&self) -> usize {
        self.index.spans.len()
    }

    fn refresh(&mut self) -> anyhow::Result<()> {
        let dir = self.dir.clone();
        self.index.spans.retain(|s| dir.join(&s.file).exists());
        self.total_size = self.index.spans.iter().map(|s| s.len).sum();
        Ok(())
    }

    fn clear(&mut self) {
        for record in &self.index.spans {
            let _ = fs::remove_file(self.dir.join(&record.file));
        }
        self.index.spans.clear();
        self.index.content_lengths.clear();
        self.total_size = 0;
        if let Err(e) = self.save_index() {
            log_warn!("Failed to persist cleared cache index: {}", e);
        }
    }
}

impl Drop for DiskSpanStore {
    fn drop(&mut self) {
        let _ = self.save_index();
    }
}

enum CacheState {
    Closed,
    Ready {
        dir: PathBuf,
        store: Box<dyn SpanStore>,
    },
    /// Recovery failed once; caching stays off for this service's lifetime.
    Disabled,
}

type BackendOpener =
    dyn Fn(&Path, u64) -> anyhow::Result<Box<dyn SpanStore>> + Send + Sync;

/// Bounded LRU disk cache sitting in front of remote byte-range reads.
///
/// Strictly an optimization: every failure path here degrades to direct
/// network reads, never to a playback error.
pub struct StreamCache {
    state: Mutex<CacheState>,
    opener: Arc<BackendOpener>,
}

impl StreamCache {
    /// A cache using the disk span store backend. Call
    /// [`initialize`](Self::initialize) before use.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(|dir: &Path, max: u64| {
            DiskSpanStore::open(dir, max).map(|s| Box::new(s) as Box<dyn SpanStore>)
        }))
    }

    pub fn with_backend(opener: Arc<BackendOpener>) -> Self {
        Self {
            state: Mutex::new(CacheState::Closed),
            opener,
        }
    }

    /// Open the store at `dir` bounded to `max_bytes`. Idempotent: when
    /// already open this only refreshes size counters. On an open failure
    /// the directory is wiped and recreated once; a second failure disables
    /// caching for this service.
    pub fn initialize(&self, dir: &Path, max_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            CacheState::Ready { store, .. } => {
                if let Err(e) = store.refresh() {
                    log_warn!("Failed to refresh stream cache counters: {}", e);
                }
            }
            CacheState::Disabled => {}
            CacheState::Closed => match (self.opener)(dir, max_bytes) {
                Ok(store) => {
                    log_info!("Stream cache ready at {}", dir.display());
                    *state = CacheState::Ready {
                        dir: dir.to_path_buf(),
                        store,
                    };
                }
                Err(first) => {
                    log_warn!(
                        "Stream cache failed to open ({}), wiping {}",
                        first,
                        dir.display()
                    );
                    let _ = fs::remove_dir_all(dir);
                    match (self.opener)(dir, max_bytes) {
                        Ok(store) => {
                            log_info!("Stream cache recreated at {}", dir.display());
                            *state = CacheState::Ready {
                                dir: dir.to_path_buf(),
                                store,
                            };
                        }
                        Err(second) => {
                            log_warn!(
                                "Stream cache unavailable, caching disabled: {}",
                                second
                            );
                            *state = CacheState::Disabled;
                        }
                    }
                }
            },
        }
    }

    /// Wrap an upstream source factory so reads go through the cache.
    /// Returns `None` when the cache is unavailable and the caller should
    /// use the upstream factory directly.
    pub fn wrap(
        self: &Arc<Self>,
        upstream: Arc<dyn MediaSourceFactory>,
    ) -> Option<Arc<dyn MediaSourceFactory>> {
        let state = self.state.lock().unwrap();
        match &*state {
            CacheState::Ready { .. } => Some(Arc::new(CachingSourceFactory {
                cache: Arc::clone(self),
                upstream,
            })),
            _ => None,
        }
    }

    pub fn current_size_bytes(&self) -> u64 {
        self.with_store(|s| s.size_bytes()).unwrap_or(0)
    }

    /// `(size_bytes, span_count)` of the open store, `(0, 0)` otherwise.
    pub fn stats(&self) -> (u64, usize) {
        self.with_store(|s| (s.size_bytes(), s.span_count()))
            .unwrap_or((0, 0))
    }

    pub fn is_fully_cached(&self, key: &str) -> bool {
        self.with_store(|s| s.is_fully_cached(key)).unwrap_or(false)
    }

    pub fn is_partially_cached(&self, key: &str) -> bool {
        self.with_store(|s| s.is_partially_cached(key))
            .unwrap_or(false)
    }

    pub fn cached_length(&self, key: &str) -> u64 {
        self.with_store(|s| s.cached_length(key)).unwrap_or(0)
    }

    pub fn content_length_of(&self, key: &str) -> Option<u64> {
        self.with_store(|s| s.content_length_of(key)).flatten()
    }

    /// Best-effort removal of all cached spans.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        if let CacheState::Ready { store, .. } = &mut *state {
            store.clear();
        }
    }

    /// Release and reopen the store with a new bound. The cache is briefly
    /// unavailable while the store is swapped.
    pub fn set_max_size(&self, new_max: u64) {
        let dir = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, CacheState::Closed) {
                CacheState::Ready { dir, store } => {
                    drop(store);
                    Some(dir)
                }
                CacheState::Disabled => {
                    *state = CacheState::Disabled;
                    None
                }
                CacheState::Closed => None,
            }
        };
        if let Some(dir) = dir {
            self.initialize(&dir, new_max);
        }
    }

    /// Idempotent shutdown; flushes and drops the store.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, CacheState::Ready { .. }) {
            *state = CacheState::Closed;
        }
    }

    fn with_store<R>(&self, f: impl FnOnce(&mut Box<dyn SpanStore>) -> R) -> Option<R> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            CacheState::Ready { store, .. } => Some(f(store)),
            _ => None,
        }
    }

    fn read_span(&self, key: &str, start: u64, len: u64) -> Option<Vec<u8>> {
        self.with_store(|s| match s.read(key, start, len) {
            Ok(hit) => hit,
            Err(e) => {
                log_debug!("cache read failed for {}@{}: {}", key, start, e);
                None
            }
        })
        .flatten()
    }

    fn write_span(&self, key: &str, start: u64, data: &[u8], content_length: Option<u64>) {
        self.with_store(|s| {
            if let Err(e) = s.write(key, start, data, content_length) {
                log_debug!("cache write failed for {}@{}: {}", key, start, e);
            }
        });
    }
}

impl Default for StreamCache {
    fn default() -> Self {
        Self::new()
    }
}

struct CachingSourceFactory {
    cache: Arc<StreamCache>,
    upstream: Arc<dyn MediaSourceFactory>,
}

impl MediaSourceFactory for CachingSourceFactory {
    fn create(&self, key: &str) -> Arc<dyn MediaByteSource> {
        Arc::new(CachingSource {
            cache: Arc::clone(&self.cache),
            upstream: self.upstream.create(key),
            key: key.to_string(),
            known_length: Mutex::new(None),
        })
    }
}

/// Source that serves reads from the cache when possible and falls through
/// to the upstream source otherwise. Cache errors are swallowed per read.
struct CachingSource {
    cache: Arc<StreamCache>,
    upstream: Arc<dyn MediaByteSource>,
    key: String,
    /// Memoized upstream content length for this source's lifetime.
    known_length: Mutex<Option<Option<u64>>>,
}

impl CachingSource {
    async fn total_length(&self) -> Option<u64> {
        if let Some(cached) = *self.known_length.lock().unwrap() {
            return cached;
        }
        let length = match self.cache.content_length_of(&self.key) {
            Some(len) => Some(len),
            None => self.upstream.content_length().await,
        };
        *self.known_length.lock().unwrap() = Some(length);
        length
    }
}

#[async_trait]
impl MediaByteSource for CachingSource {
    async fn content_length(&self) -> Option<u64> {
        self.total_length().await
    }

    async fn read_range(&self, start: u64, len: u64) -> Result<Vec<u8>, String> {
        if let Some(bytes) = self.cache.read_span(&self.key, start, len) {
            return Ok(bytes);
        }
        let bytes = self.upstream.read_range(start, len).await?;
        let total = self.total_length().await;
        self.cache.write_span(&self.key, start, &bytes, total);
        Ok(bytes)
    }
}
