use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a track's bytes originally live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackOrigin {
    /// The file already existed on this device, outside managed storage.
    Local,
    /// The bytes must be fetched from the remote service.
    Remote,
}

/// An addressable media item. Identity is `id`, assigned by the remote
/// catalog and stable across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub duration_ms: u64,
    pub origin: TrackOrigin,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub artwork_url: Option<String>,
}

/// Per-track download state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotDownloaded,
    Downloading,
    Downloaded,
    Failed,
    /// The track's file pre-existed outside managed storage; it is never
    /// copied in and never appears in the catalog.
    LocalOriginal,
}

/// Transient record of an in-flight (or just-finished) download. Lives in
/// the manager's live view only; the durable record is the catalog entry.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub track: Track,
    pub fraction: f64,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub state: DownloadState,
}

impl DownloadProgress {
    pub(crate) fn starting(track: Track) -> Self {
        Self {
            track,
            fraction: 0.0,
            bytes_downloaded: 0,
            total_bytes: None,
            state: DownloadState::Downloading,
        }
    }
}
