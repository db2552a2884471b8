use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use tokio::fs as tokio_fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::catalog::{CatalogEntry, DownloadCatalog};
use crate::notify::NotificationSink;
use crate::paths::StoragePaths;
use crate::resolver::StreamResolver;
use crate::track::{DownloadProgress, DownloadState, Track, TrackOrigin};
use crate::{log_debug, log_info, log_warn};

/// Share of the progress bar spent on URL resolution; the transfer gets the
/// rest, proportional to bytes moved.
const RESOLVE_SHARE: f64 = 0.10;
/// Reported while transferring a stream whose total length is unknown.
const INDETERMINATE_FRACTION: f64 = 0.5;
/// Write buffer on the transfer path (64 KB).
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// How long a completed download stays in the live view before its
    /// entry is dropped and `dismiss` fires.
    pub completion_grace: Duration,
    /// Sink progress events are coalesced to at most one per interval...
    pub progress_emit_interval: Duration,
    /// ...unless this many new bytes arrived first.
    pub progress_emit_bytes: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            completion_grace: Duration::from_millis(2500),
            progress_emit_interval: Duration::from_millis(250),
            progress_emit_bytes: 512 * 1024,
        }
    }
}

/// Drives network→disk transfers of remote tracks into managed storage.
///
/// One background task per active download; per-track state machine
/// `NotDownloaded → Downloading → {Downloaded | Failed}`, with delete
/// returning to `NotDownloaded` and a re-`start()` permitted after
/// `Failed`. The only shared mutable state is the live-progress map and
/// the active-task registry, both updated by whole-value replacement so a
/// reader never sees a partial update.
pub struct DownloadManager {
    paths: StoragePaths,
    catalog: Arc<DownloadCatalog>,
    resolver: Arc<dyn StreamResolver>,
    sink: Arc<dyn NotificationSink>,
    config: ManagerConfig,
    client: reqwest::Client,
    live: Mutex<Arc<HashMap<String, DownloadProgress>>>,
    active: Mutex<Arc<HashMap<String, CancellationToken>>>,
}

impl DownloadManager {
    pub fn new(
        paths: StoragePaths,
        catalog: Arc<DownloadCatalog>,
        resolver: Arc<dyn StreamResolver>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, String> {
        Self::with_config(paths, catalog, resolver, sink, ManagerConfig::default())
    }

    pub fn with_config(
        paths: StoragePaths,
        catalog: Arc<DownloadCatalog>,
        resolver: Arc<dyn StreamResolver>,
        sink: Arc<dyn NotificationSink>,
        config: ManagerConfig,
    ) -> Result<Self, String> {
        // No global request timeout: transfers can be long. Automatic
        // decompression is off so byte counts match Content-Length.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .gzip(false)
            .brotli(false)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            paths,
            catalog,
            resolver,
            sink,
            config,
            client,
            live: Mutex::new(Arc::new(HashMap::new())),
            active: Mutex::new(Arc::new(HashMap::new())),
        })
    }

    /// Begin downloading a track in the background. Returns `false` without
    /// side effects when the track is already downloaded, already
    /// downloading, or is an original local file.
    pub fn start(self: &Arc<Self>, track: Track) -> bool {
        let Some(token) = self.begin(&track) else {
            return false;
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_transfer(track, token).await;
        });
        true
    }

    /// Download several tracks one after another, skipping those already
    /// downloaded. Each transfer runs to a terminal state before the next
    /// begins.
    pub async fn start_batch(self: &Arc<Self>, tracks: Vec<Track>) {
        for track in tracks {
            if self.is_downloaded(&track.id) {
                continue;
            }
            if let Some(token) = self.begin(&track) {
                Arc::clone(self).run_transfer(track, token).await;
            }
        }
    }

    /// Request cooperative cancellation of an active download. The in-flight
    /// network read is aborted and the transfer task cleans up at its next
    /// chunk boundary; not instantaneous. Returns `false` if nothing was
    /// downloading under this id.
    pub fn cancel(&self, id: &str) -> bool {
        let token = {
            let active = self.active.lock().unwrap();
            active.get(id).cloned()
        };
        let Some(token) = token else {
            return false;
        };
        token.cancel();
        if self.remove_live(id) {
            self.sink.dismiss(id);
        }
        // Best-effort; the transfer task deletes the partial file too when
        // it observes the cancellation.
        let _ = std::fs::remove_file(self.paths.partial_path(id));
        log_info!("Cancel requested for download {}", id);
        true
    }

    /// Remove a completed download's file and catalog entry. `Ok(false)`
    /// when the id is unknown.
    pub fn delete(&self, id: &str) -> Result<bool, String> {
        let removed = self.catalog.remove(id)?;
        let path = match &removed {
            Some(entry) => entry.local_file_path.clone(),
            None => self.paths.download_path(id),
        };
        let existed = path.exists();
        if existed {
            std::fs::remove_file(&path)
                .map_err(|e| format!("Failed to delete {}: {}", path.display(), e))?;
        }
        Ok(removed.is_some() || existed)
    }

    pub fn is_downloaded(&self, id: &str) -> bool {
        self.catalog
            .get(id)
            .map(|entry| entry.local_file_path.exists())
            .unwrap_or(false)
    }

    pub fn is_downloading(&self, id: &str) -> bool {
        self.active.lock().unwrap().contains_key(id)
    }

    /// True for tracks whose file pre-existed outside managed storage.
    pub fn is_original_local_file(&self, track: &Track) -> bool {
        track.origin == TrackOrigin::Local
            && track
                .local_path
                .as_ref()
                .map(|p| !self.paths.is_managed(p))
                .unwrap_or(false)
    }

    pub fn status_of(&self, track: &Track) -> DownloadState {
        if self.is_original_local_file(track) {
            return DownloadState::LocalOriginal;
        }
        if self.is_downloading(&track.id) {
            return DownloadState::Downloading;
        }
        let live = self.live.lock().unwrap().clone();
        if let Some(entry) = live.get(&track.id) {
            if entry.state == DownloadState::Failed {
                return DownloadState::Failed;
            }
        }
        if self.is_downloaded(&track.id) {
            return DownloadState::Downloaded;
        }
        DownloadState::NotDownloaded
    }

    /// Snapshot of the live view (in-flight and recently finished entries).
    pub fn active_downloads(&self) -> Vec<DownloadProgress> {
        let live = self.live.lock().unwrap().clone();
        live.values().cloned().collect()
    }

    /// Drop terminal `Failed` entries from the live view. The catalog is
    /// untouched.
    pub fn clear_failed_entries(&self) {
        let dismissed: Vec<String> = {
            let mut guard = self.live.lock().unwrap();
            let failed: Vec<String> = guard
                .values()
                .filter(|p| p.state == DownloadState::Failed)
                .map(|p| p.track.id.clone())
                .collect();
            if failed.is_empty() {
                return;
            }
            let mut next: HashMap<String, DownloadProgress> = (**guard).clone();
            for id in &failed {
                next.remove(id);
            }
            *guard = Arc::new(next);
            failed
        };
        for id in &dismissed {
            self.sink.dismiss(id);
        }
    }

    // Entry guard: registers the task 1:1 by track id and publishes the
    // initial live entry. Returns None when nothing should start.
    fn begin(&self, track: &Track) -> Option<CancellationToken> {
        if self.is_original_local_file(track) {
            log_debug!("{} is an original local file, nothing to download", track.id);
            return None;
        }
        if self.is_downloaded(&track.id) {
            return None;
        }
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap();
            if active.contains_key(&track.id) {
                return None;
            }
            let mut next: HashMap<String, CancellationToken> = (**active).clone();
            next.insert(track.id.clone(), token.clone());
            *active = Arc::new(next);
        }
        self.insert_live(DownloadProgress::starting(track.clone()));
        self.sink
            .progress(&track.id, &track.title, &track.artist, 0.0, 0, None);
        Some(token)
    }

    async fn run_transfer(self: Arc<Self>, track: Track, token: CancellationToken) {
        let id = track.id.clone();
        let part_path = self.paths.partial_path(&id);
        let final_path = self.paths.download_path(&id);

        // Resolved URLs are short-lived; fetch a fresh one every attempt.
        let url = match self.resolver.resolve_stream_url(&id).await {
            Ok(url) => url,
            Err(e) => {
                log_warn!("Failed to resolve stream URL for {}: {}", id, e);
                self.finish_failed(&track, &part_path).await;
                return;
            }
        };

        // Cancellation may have arrived while resolving.
        if token.is_cancelled() {
            self.finish_cancelled(&id, &part_path).await;
            return;
        }

        let response = tokio::select! {
            result = self
                .client
                .get(&url)
                .header("Accept-Encoding", "identity")
                .send() => result,
            _ = token.cancelled() => {
                self.finish_cancelled(&id, &part_path).await;
                return;
            }
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                log_warn!("Download request failed for {}: {}", id, e);
                self.finish_failed(&track, &part_path).await;
                return;
            }
        };
        if !response.status().is_success() {
            log_warn!("Download failed for {} with HTTP {}", id, response.status());
            self.finish_failed(&track, &part_path).await;
            return;
        }

        let total_bytes = response.content_length();
        self.update_live(&track, RESOLVE_SHARE, 0, total_bytes);
        self.sink
            .progress(&id, &track.title, &track.artist, RESOLVE_SHARE, 0, total_bytes);

        let file = match tokio_fs::File::create(&part_path).await {
            Ok(f) => f,
            Err(e) => {
                log_warn!("Failed to create {}: {}", part_path.display(), e);
                self.finish_failed(&track, &part_path).await;
                return;
            }
        };
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut last_emit = Instant::now();
        let mut last_emit_bytes: u64 = 0;

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = token.cancelled() => {
                    drop(writer);
                    self.finish_cancelled(&id, &part_path).await;
                    return;
                }
            };
            let Some(chunk) = item else { break };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    drop(writer);
                    if token.is_cancelled() {
                        // The aborted read surfaces as an error; this is a
                        // cancellation, not a failure.
                        self.finish_cancelled(&id, &part_path).await;
                    } else {
                        log_warn!("Transfer error for {}: {}", id, e);
                        self.finish_failed(&track, &part_path).await;
                    }
                    return;
                }
            };
            if token.is_cancelled() {
                drop(writer);
                self.finish_cancelled(&id, &part_path).await;
                return;
            }
            if let Err(e) = writer.write_all(&chunk).await {
                log_warn!("Failed to write {}: {}", part_path.display(), e);
                drop(writer);
                self.finish_failed(&track, &part_path).await;
                return;
            }
            written = written.saturating_add(chunk.len() as u64);

            let fraction = transfer_fraction(written, total_bytes);
            self.update_live(&track, fraction, written, total_bytes);
            if last_emit.elapsed() >= self.config.progress_emit_interval
                || written.saturating_sub(last_emit_bytes) >= self.config.progress_emit_bytes
            {
                self.sink
                    .progress(&id, &track.title, &track.artist, fraction, written, total_bytes);
                last_emit = Instant::now();
                last_emit_bytes = written;
            }
        }

        if let Err(e) = writer.flush().await {
            log_warn!("Failed to flush {}: {}", part_path.display(), e);
            drop(writer);
            self.finish_failed(&track, &part_path).await;
            return;
        }
        drop(writer);

        // Servers occasionally close a stream early; a short transfer is a
        // failure, not a completed download.
        if let Some(total) = total_bytes {
            if written < total {
                log_warn!(
                    "Stream for {} ended early: {} of {} bytes",
                    id,
                    written,
                    total
                );
                self.finish_failed(&track, &part_path).await;
                return;
            }
        }

        if let Err(e) = tokio_fs::rename(&part_path, &final_path).await {
            log_warn!(
                "Failed to finalize {} -> {}: {}",
                part_path.display(),
                final_path.display(),
                e
            );
            self.finish_failed(&track, &part_path).await;
            return;
        }

        let entry = CatalogEntry {
            id: id.clone(),
            title: track.title.clone(),
            artist: track.artist.clone(),
            album: track.album.clone(),
            duration_ms: track.duration_ms,
            local_file_path: final_path.clone(),
            artwork_url: track.artwork_url.clone(),
            downloaded_at: Utc::now().timestamp().max(0) as u64,
        };
        if let Err(e) = self.catalog.append(entry) {
            log_warn!("Failed to record download {} in catalog: {}", id, e);
            let _ = tokio_fs::remove_file(&final_path).await;
            self.finish_failed(&track, &part_path).await;
            return;
        }

        log_info!("Download completed for {} -> {}", id, final_path.display());
        self.set_live_downloaded(&id, written, total_bytes);
        self.sink
            .progress(&id, &track.title, &track.artist, 1.0, written, total_bytes);
        self.sink.completed(&id, &track.title, &track.artist);
        self.unregister_active(&id);

        // Keep the finished entry visible briefly, then drop it.
        tokio::time::sleep(self.config.completion_grace).await;
        if self.remove_live_if(&id, DownloadState::Downloaded) {
            self.sink.dismiss(&id);
        }
    }

    // Terminal Failed: partial file removed (matching cancel), live entry
    // kept in Failed state until cleared or restarted, reported once.
    async fn finish_failed(&self, track: &Track, part_path: &std::path::Path) {
        let _ = tokio_fs::remove_file(part_path).await;
        self.set_live_failed(&track.id);
        self.sink.failed(&track.id, &track.title);
        self.unregister_active(&track.id);
    }

    // Silent cleanup: no failure reported, live entry gone, no partial file.
    async fn finish_cancelled(&self, id: &str, part_path: &std::path::Path) {
        let _ = tokio_fs::remove_file(part_path).await;
        if self.remove_live(id) {
            self.sink.dismiss(id);
        }
        self.unregister_active(id);
        log_debug!("Download {} cancelled and cleaned up", id);
    }

    fn insert_live(&self, progress: DownloadProgress) {
        let mut guard = self.live.lock().unwrap();
        let mut next: HashMap<String, DownloadProgress> = (**guard).clone();
        next.insert(progress.track.id.clone(), progress);
        *guard = Arc::new(next);
    }

    // Updates an existing entry only: once cancel() has removed the entry,
    // late chunk updates must not resurrect it.
    fn update_live(&self, track: &Track, fraction: f64, bytes: u64, total: Option<u64>) {
        let mut guard = self.live.lock().unwrap();
        let Some(current) = guard.get(&track.id) else {
            return;
        };
        let mut updated = current.clone();
        // Fractions never move backwards while downloading.
        updated.fraction = updated.fraction.max(fraction);
        updated.bytes_downloaded = bytes;
        updated.total_bytes = total;
        let mut next: HashMap<String, DownloadProgress> = (**guard).clone();
        next.insert(track.id.clone(), updated);
        *guard = Arc::new(next);
    }

    fn set_live_downloaded(&self, id: &str, bytes: u64, total: Option<u64>) {
        let mut guard = self.live.lock().unwrap();
        let Some(current) = guard.get(id) else {
            return;
        };
        let mut updated = current.clone();
        updated.state = DownloadState::Downloaded;
        updated.fraction = 1.0;
        updated.bytes_downloaded = bytes;
        updated.total_bytes = total;
        let mut next: HashMap<String, DownloadProgress> = (**guard).clone();
        next.insert(id.to_string(), updated);
        *guard = Arc::new(next);
    }

    fn set_live_failed(&self, id: &str) {
        let mut guard = self.live.lock().unwrap();
        let Some(current) = guard.get(id) else {
            return;
        };
        let mut updated = current.clone();
        updated.state = DownloadState::Failed;
        let mut next: HashMap<String, DownloadProgress> = (**guard).clone();
        next.insert(id.to_string(), updated);
        *guard = Arc::new(next);
    }

    fn remove_live(&self, id: &str) -> bool {
        let mut guard = self.live.lock().unwrap();
        if !guard.contains_key(id) {
            return false;
        }
        let mut next: HashMap<String, DownloadProgress> = (**guard).clone();
        next.remove(id);
        *guard = Arc::new(next);
        true
    }

    fn remove_live_if(&self, id: &str, state: DownloadState) -> bool {
        let mut guard = self.live.lock().unwrap();
        match guard.get(id) {
            Some(entry) if entry.state == state => {}
            _ => return false,
        }
        let mut next: HashMap<String, DownloadProgress> = (**guard).clone();
        next.remove(id);
        *guard = Arc::new(next);
        true
    }

    fn unregister_active(&self, id: &str) {
        let mut active = self.active.lock().unwrap();
        if !active.contains_key(id) {
            return;
        }
        let mut next: HashMap<String, CancellationToken> = (**active).clone();
        next.remove(id);
        *active = Arc::new(next);
    }
}

fn transfer_fraction(written: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => {
            let transferred = written as f64 / total as f64;
            (RESOLVE_SHARE + (1.0 - RESOLVE_SHARE) * transferred).min(1.0)
        }
        _ => INDETERMINATE_FRACTION,
    }
}
