use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Managed storage layout for the acquisition core.
///
/// Everything the crate writes lives under these paths; a track whose file
/// sits anywhere else is treated as an original local file and left alone.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoragePaths {
    /// Completed downloads (catalog-backed files).
    pub downloads_dir: PathBuf,
    /// Transient byte-span cache for remote streaming.
    pub stream_cache_dir: PathBuf,
    /// Serialized catalog of completed downloads.
    pub catalog_file: PathBuf,
    /// Backend log file.
    pub log_file: PathBuf,
}

impl StoragePaths {
    /// Build the layout under an explicit base directory and create the
    /// directories that must exist up front.
    pub fn new(base: &Path) -> Result<Self, String> {
        let paths = StoragePaths {
            downloads_dir: base.join("downloads"),
            stream_cache_dir: base.join("stream_cache"),
            catalog_file: base.join("downloads").join("catalog.json"),
            log_file: base.join("logs").join("media.log"),
        };
        paths.ensure_directories_exist()?;
        Ok(paths)
    }

    /// Default location for user installs: the platform's local data
    /// directory, falling back to the current directory.
    pub fn locate_default() -> Result<Self, String> {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aria");
        Self::new(&base)
    }

    pub fn ensure_directories_exist(&self) -> Result<(), String> {
        let log_dir = self.log_file.parent().map(Path::to_path_buf);
        let dirs_to_create = [
            Some(self.downloads_dir.clone()),
            Some(self.stream_cache_dir.clone()),
            log_dir,
        ];
        for dir in dirs_to_create.into_iter().flatten() {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .map_err(|e| format!("Failed to create directory {}: {}", dir.display(), e))?;
            }
        }
        Ok(())
    }

    /// Final on-disk path for a completed download.
    pub fn download_path(&self, track_id: &str) -> PathBuf {
        self.downloads_dir.join(sanitize_filename(track_id))
    }

    /// In-progress transfer path; renamed to `download_path` on success.
    pub fn partial_path(&self, track_id: &str) -> PathBuf {
        self.downloads_dir
            .join(format!("{}.part", sanitize_filename(track_id)))
    }

    /// True when `path` lies inside the managed downloads directory.
    pub fn is_managed(&self, path: &Path) -> bool {
        path.starts_with(&self.downloads_dir)
    }
}

/// Map an identifier to a filesystem-safe name: alphanumerics, `_` and `-`
/// pass through, everything else becomes `_`.
pub fn sanitize_filename(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_filename("abc_DEF-123"), "abc_DEF-123");
        assert_eq!(sanitize_filename("a/b:c d"), "a_b_c_d");
    }
}
