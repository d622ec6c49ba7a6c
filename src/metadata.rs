//! Per-repository file manifest persistence.
//!
//! Manifests are cached next to the working download area so repeated
//! requests for the same repository skip the hub metadata round-trip.
//! The on-disk format is a pretty-printed JSON array, one object per file.

use crate::integrity::IntegrityExpectation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the manifest cache file inside a repository's download area.
pub const METADATA_FILE_NAME: &str = ".mlx-metadata.json";

/// One file in a repository manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifestEntry {
    /// POSIX relative path within the repository.
    pub file_name: String,
    /// Size in bytes, when the hub reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// SHA-256 hex digest, when the hub reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl FileManifestEntry {
    /// Project this entry into its integrity expectation.
    #[must_use]
    pub fn expectation(&self) -> IntegrityExpectation {
        IntegrityExpectation {
            expected_size: self.size,
            expected_sha256: self.sha256.clone(),
        }
    }
}

/// Stores and loads per-repository manifests under a private download base
/// directory, outside the hub cache itself.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    download_base: PathBuf,
}

impl MetadataStore {
    /// Create a store rooted at `download_base`.
    #[must_use]
    pub fn new(download_base: impl Into<PathBuf>) -> Self {
        Self {
            download_base: download_base.into(),
        }
    }

    /// The download base directory this store is rooted at.
    #[must_use]
    pub fn download_base(&self) -> &Path {
        &self.download_base
    }

    /// Working directory for a repository's downloads and manifest.
    #[must_use]
    pub fn repo_dir(&self, hub_id: &str) -> PathBuf {
        self.download_base.join(hub_id)
    }

    /// Path of the cached manifest for a repository.
    #[must_use]
    pub fn metadata_path(&self, hub_id: &str) -> PathBuf {
        self.repo_dir(hub_id).join(METADATA_FILE_NAME)
    }

    /// Persist a manifest. Write-through and idempotent: the file is
    /// replaced wholesale on every call.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn cache_metadata(
        &self,
        entries: &[FileManifestEntry],
        hub_id: &str,
    ) -> crate::error::Result<()> {
        let path = self.metadata_path(hub_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| std::io::Error::other(format!("manifest encode failed: {e}")))?;
        std::fs::write(&path, json)?;
        debug!(
            hub_id,
            files = entries.len(),
            path = %path.display(),
            "cached manifest"
        );
        Ok(())
    }

    /// Load a cached manifest.
    ///
    /// Returns `None` for a missing, unreadable, or undecodable file;
    /// a bad cache entry is treated as absent, never as an error.
    #[must_use]
    pub fn load_cached_metadata(&self, hub_id: &str) -> Option<Vec<FileManifestEntry>> {
        let path = self.metadata_path(hub_id);
        let body = match std::fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(hub_id, path = %path.display(), error = %e, "unreadable manifest cache");
                }
                return None;
            }
        };
        match serde_json::from_str(&body) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(hub_id, path = %path.display(), error = %e, "undecodable manifest cache");
                None
            }
        }
    }

    /// Project the cached manifest into a `file_name → expectation` map
    /// for O(1) lookup during validation. Empty when no manifest is cached.
    #[must_use]
    pub fn cached_integrity_expectations(
        &self,
        hub_id: &str,
    ) -> HashMap<String, IntegrityExpectation> {
        self.load_cached_metadata(hub_id)
            .unwrap_or_default()
            .iter()
            .map(|entry| (entry.file_name.clone(), entry.expectation()))
            .collect()
    }

    /// Remove the cached manifest for a repository, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove_metadata(&self, hub_id: &str) -> crate::error::Result<()> {
        let path = self.metadata_path(hub_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
