use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::log_warn;
use crate::paths::StoragePaths;

/// Durable record of one completed download, backed by a file inside
/// managed storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub duration_ms: u64,
    pub local_file_path: PathBuf,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub downloaded_at: u64,
}

/// The persisted catalog of completed downloads.
///
/// The whole list is rewritten atomically on every mutation; all
/// load-modify-save sequences run under one mutex so concurrent writers
/// never interleave.
pub struct DownloadCatalog {
    catalog_file: PathBuf,
    managed_root: PathBuf,
    entries: Mutex<Vec<CatalogEntry>>,
}

impl DownloadCatalog {
    /// Load the catalog from disk. A missing or unparsable file yields an
    /// empty catalog; entries whose backing file no longer exists are
    /// dropped from the in-memory view but the file is not rewritten until
    /// the next mutation.
    pub fn load(paths: &StoragePaths) -> Self {
        let entries = Self::read_entries(&paths.catalog_file);
        Self {
            catalog_file: paths.catalog_file.clone(),
            managed_root: paths.downloads_dir.clone(),
            entries: Mutex::new(entries),
        }
    }

    fn read_entries(catalog_file: &Path) -> Vec<CatalogEntry> {
        let content = match fs::read_to_string(catalog_file) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let parsed: Vec<CatalogEntry> = match serde_json::from_str(&content) {
            Ok(list) => list,
            Err(e) => {
                log_warn!(
                    "Failed to parse catalog {}, starting empty: {}",
                    catalog_file.display(),
                    e
                );
                return Vec::new();
            }
        };
        // Lazy prune: keep only entries whose file is still present.
        parsed
            .into_iter()
            .filter(|entry| entry.local_file_path.exists())
            .collect()
    }

    /// Append (or replace by id) an entry and persist the whole list.
    /// Entries whose file lies outside managed storage are not persisted.
    pub fn append(&self, entry: CatalogEntry) -> Result<(), String> {
        if !entry.local_file_path.starts_with(&self.managed_root) {
            return Ok(());
        }
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.id != entry.id);
        entries.push(entry);
        self.save_locked(&entries)
    }

    /// Remove an entry by id. Returns the removed entry, `None` if unknown.
    pub fn remove(&self, id: &str) -> Result<Option<CatalogEntry>, String> {
        let mut entries = self.entries.lock().unwrap();
        let position = entries.iter().position(|e| e.id == id);
        let removed = position.map(|i| entries.remove(i));
        if removed.is_some() {
            self.save_locked(&entries)?;
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<CatalogEntry> {
        let entries = self.entries.lock().unwrap();
        entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.iter().any(|e| e.id == id)
    }

    /// Snapshot of the current in-memory view.
    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.entries.lock().unwrap().clone()
    }

    fn save_locked(&self, entries: &[CatalogEntry]) -> Result<(), String> {
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| format!("Failed to serialize catalog: {}", e))?;
        let tmp = self.catalog_file.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| format!("Failed to write catalog: {}", e))?;
        fs::rename(&tmp, &self.catalog_file)
            .map_err(|e| format!("Failed to replace catalog file: {}", e))
    }
}
