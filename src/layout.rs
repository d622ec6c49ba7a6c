//! HuggingFace cache directory layout.
//!
//! Owns the on-disk shape third-party loaders consume:
//! `<cache_root>/models--<owner>--<repo>/snapshots/<rev>` with a
//! `refs/main` text file naming the current snapshot, plus a legacy
//! `<cache_root>/<owner>/<repo>` mirror for older loaders.

use crate::canonicalize::canonicalize_model_dir;
use crate::error::Result;
use crate::hub_id;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

/// Name of the default snapshot revision written by this crate.
pub const DEFAULT_REVISION: &str = "main";

/// Path computations and materialization for the hub cache layout.
#[derive(Debug, Clone)]
pub struct HubLayout {
    cache_root: PathBuf,
}

impl HubLayout {
    /// Create a layout rooted at an explicit cache directory.
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    /// Layout rooted at `$HOME/.cache/huggingface/hub`, falling back to
    /// the platform temp directory when no home directory exists.
    #[must_use]
    pub fn from_env() -> Self {
        let base = dirs::home_dir()
            .map(|home| home.join(".cache"))
            .unwrap_or_else(std::env::temp_dir);
        Self::new(base.join("huggingface").join("hub"))
    }

    /// The cache root all model directories live under.
    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// `<cache_root>/models--<owner>--<repo>`.
    #[must_use]
    pub fn model_root(&self, hub_id: &str) -> PathBuf {
        self.cache_root.join(hub_id::encode_cache_segment(hub_id))
    }

    /// `<model_root>/snapshots`.
    #[must_use]
    pub fn snapshots_dir(&self, hub_id: &str) -> PathBuf {
        self.model_root(hub_id).join("snapshots")
    }

    /// `<model_root>/refs`.
    #[must_use]
    pub fn refs_dir(&self, hub_id: &str) -> PathBuf {
        self.model_root(hub_id).join("refs")
    }

    /// `<cache_root>/<owner>/<repo>`, the secondary copy for older
    /// loaders.
    #[must_use]
    pub fn legacy_dir(&self, hub_id: &str) -> PathBuf {
        self.cache_root.join(hub_id)
    }

    /// The snapshot directory for a repository.
    ///
    /// With `resolve_existing` false this is a pure path computation:
    /// `snapshots/main`. With `resolve_existing` true the on-disk state is
    /// consulted: a valid `refs/main` pointer wins, then an existing
    /// `snapshots/main`, then the most recently created snapshot (updating
    /// `refs/main` to match), and finally the not-yet-existing
    /// `snapshots/main`.
    #[must_use]
    pub fn snapshot_directory(&self, hub_id: &str, resolve_existing: bool) -> PathBuf {
        let snapshots = self.snapshots_dir(hub_id);
        let default = snapshots.join(DEFAULT_REVISION);
        if !resolve_existing {
            return default;
        }

        if let Some(rev) = self.read_main_ref(hub_id) {
            let candidate = snapshots.join(&rev);
            if candidate.is_dir() {
                return candidate;
            }
        }

        if default.is_dir() {
            return default;
        }

        if let Some(newest) = newest_subdirectory(&snapshots) {
            if let Err(e) = self.write_main_ref(hub_id, &newest_name(&newest)) {
                warn!(hub_id, error = %e, "could not update refs/main");
            }
            return newest;
        }

        default
    }

    /// Reconcile `refs/main` with the snapshots actually on disk, after
    /// external edits. Returns the snapshot directory now referenced.
    ///
    /// # Errors
    ///
    /// Returns an error if `refs/main` needs rewriting and the write fails.
    pub fn normalize_snapshot_references(&self, hub_id: &str) -> Result<PathBuf> {
        let snapshots = self.snapshots_dir(hub_id);

        if let Some(rev) = self.read_main_ref(hub_id) {
            let candidate = snapshots.join(&rev);
            if candidate.is_dir() {
                return Ok(candidate);
            }
        }

        // Stale or missing pointer: adopt main, else the newest snapshot.
        let default = snapshots.join(DEFAULT_REVISION);
        let target = if default.is_dir() {
            default
        } else if let Some(newest) = newest_subdirectory(&snapshots) {
            newest
        } else {
            return Ok(default);
        };
        self.write_main_ref(hub_id, &newest_name(&target))?;
        Ok(target)
    }

    /// Materialize the cache layout from a staged model directory.
    ///
    /// Order of effects: canonicalize the source, wipe any existing model
    /// root, copy everything into `snapshots/main`, point `refs/main` at
    /// it, then mirror into the legacy directory. A failed legacy mirror
    /// is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns an error on any failure before the legacy-mirror step.
    pub fn copy_to_hf_directory(&self, source_dir: &Path, hub_id: &str) -> Result<PathBuf> {
        canonicalize_model_dir(source_dir)?;

        let model_root = self.model_root(hub_id);
        if model_root.exists() {
            std::fs::remove_dir_all(&model_root)?;
        }

        let snapshot = self.snapshots_dir(hub_id).join(DEFAULT_REVISION);
        std::fs::create_dir_all(&snapshot)?;
        copy_dir_recursive(source_dir, &snapshot)?;
        self.write_main_ref(hub_id, DEFAULT_REVISION)?;
        info!(
            hub_id,
            snapshot = %snapshot.display(),
            "materialized hub cache layout"
        );

        let legacy = self.legacy_dir(hub_id);
        if let Err(e) = mirror_dir(&snapshot, &legacy) {
            warn!(hub_id, legacy = %legacy.display(), error = %e, "legacy mirror failed");
        }

        Ok(snapshot)
    }

    /// Map a cache-relative path back to its `owner/repo`.
    ///
    /// Paths starting with a `models--owner--repo` segment decode to
    /// `owner/repo`; anything else is returned unchanged.
    #[must_use]
    pub fn extract_model_id(path: &str) -> String {
        let first = path.split('/').next().unwrap_or(path);
        match hub_id::decode_cache_segment(first) {
            Some((owner, repo)) => format!("{owner}/{repo}"),
            None => path.to_owned(),
        }
    }

    fn read_main_ref(&self, hub_id: &str) -> Option<String> {
        let path = self.refs_dir(hub_id).join(DEFAULT_REVISION);
        let body = std::fs::read_to_string(path).ok()?;
        let rev = body.trim();
        if rev.is_empty() {
            None
        } else {
            Some(rev.to_owned())
        }
    }

    fn write_main_ref(&self, hub_id: &str, revision: &str) -> Result<()> {
        let refs = self.refs_dir(hub_id);
        std::fs::create_dir_all(&refs)?;
        std::fs::write(refs.join(DEFAULT_REVISION), revision)?;
        Ok(())
    }
}

fn newest_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_REVISION.to_owned())
}

/// Most recently created subdirectory of `dir`, by filesystem metadata.
fn newest_subdirectory(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let created = entry
            .metadata()
            .ok()
            .and_then(|m| m.created().or_else(|_| m.modified()).ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let newer = newest
            .as_ref()
            .is_none_or(|(best, _)| created >= *best);
        if newer {
            newest = Some((created, path));
        }
    }
    newest.map(|(_, path)| path)
}

/// Copy a directory tree, creating destination directories as needed.
pub(crate) fn copy_dir_recursive(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Replace `dest` with a copy of `source`.
fn mirror_dir(source: &Path, dest: &Path) -> std::io::Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    copy_dir_recursive(source, dest)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path, content: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn staged_model(dir: &TempDir) -> PathBuf {
        let source = dir.path().join("staged");
        touch(&source.join("config.json"), b"{}");
        touch(&source.join("model.safetensors"), b"weights");
        touch(&source.join("weights/part-00001.safetensors"), b"shard");
        source
    }

    #[test]
    fn path_computations() {
        let layout = HubLayout::new("/cache/hub");
        assert_eq!(
            layout.model_root("owner/repo"),
            PathBuf::from("/cache/hub/models--owner--repo")
        );
        assert_eq!(
            layout.snapshots_dir("owner/repo"),
            PathBuf::from("/cache/hub/models--owner--repo/snapshots")
        );
        assert_eq!(
            layout.refs_dir("owner/repo"),
            PathBuf::from("/cache/hub/models--owner--repo/refs")
        );
        assert_eq!(layout.legacy_dir("owner/repo"), PathBuf::from("/cache/hub/owner/repo"));
    }

    #[test]
    fn materialization_builds_the_full_layout() {
        let dir = TempDir::new().unwrap();
        let layout = HubLayout::new(dir.path().join("hub"));
        let source = staged_model(&dir);

        let snapshot = layout.copy_to_hf_directory(&source, "owner/repo").unwrap();

        assert_eq!(snapshot, layout.snapshots_dir("owner/repo").join("main"));
        assert!(snapshot.join("config.json").is_file());
        assert!(snapshot.join("model.safetensors").is_file());
        assert!(snapshot.join("weights/part-00001.safetensors").is_file());

        let main_ref =
            std::fs::read_to_string(layout.refs_dir("owner/repo").join("main")).unwrap();
        assert_eq!(main_ref, "main");
        assert!(layout
            .snapshots_dir("owner/repo")
            .join(main_ref)
            .is_dir());

        // Legacy mirror carries the same file set.
        let legacy = layout.legacy_dir("owner/repo");
        assert!(legacy.join("config.json").is_file());
        assert!(legacy.join("model.safetensors").is_file());
        assert!(legacy.join("weights/part-00001.safetensors").is_file());
    }

    #[test]
    fn materialization_replaces_prior_contents() {
        let dir = TempDir::new().unwrap();
        let layout = HubLayout::new(dir.path().join("hub"));
        let source = staged_model(&dir);

        layout.copy_to_hf_directory(&source, "owner/repo").unwrap();
        // Drop a stray file into the snapshot, then re-materialize.
        let stray = layout
            .snapshots_dir("owner/repo")
            .join("main")
            .join("stale.bin");
        std::fs::write(&stray, b"stale").unwrap();

        layout.copy_to_hf_directory(&source, "owner/repo").unwrap();
        assert!(!stray.exists());
    }

    #[test]
    fn materialization_canonicalizes_the_source() {
        let dir = TempDir::new().unwrap();
        let layout = HubLayout::new(dir.path().join("hub"));
        let source = dir.path().join("staged");
        touch(&source.join("weights/weights/model.safetensors"), b"w");
        touch(&source.join("model_config.json"), b"{}");

        let snapshot = layout.copy_to_hf_directory(&source, "owner/repo").unwrap();

        assert!(snapshot.join("weights/model.safetensors").is_file());
        assert!(!snapshot.join("weights/weights").exists());
        assert!(snapshot.join("config.json").is_file());
    }

    #[test]
    fn snapshot_directory_without_resolution_is_pure() {
        let layout = HubLayout::new("/cache/hub");
        assert_eq!(
            layout.snapshot_directory("owner/repo", false),
            PathBuf::from("/cache/hub/models--owner--repo/snapshots/main")
        );
    }

    #[test]
    fn snapshot_resolution_prefers_refs_main() {
        let dir = TempDir::new().unwrap();
        let layout = HubLayout::new(dir.path());
        let abc = layout.snapshots_dir("owner/repo").join("abc123");
        std::fs::create_dir_all(&abc).unwrap();
        std::fs::create_dir_all(layout.snapshots_dir("owner/repo").join("main")).unwrap();
        std::fs::create_dir_all(layout.refs_dir("owner/repo")).unwrap();
        std::fs::write(layout.refs_dir("owner/repo").join("main"), "abc123").unwrap();

        assert_eq!(layout.snapshot_directory("owner/repo", true), abc);
    }

    #[test]
    fn snapshot_resolution_falls_back_to_main() {
        let dir = TempDir::new().unwrap();
        let layout = HubLayout::new(dir.path());
        let main = layout.snapshots_dir("owner/repo").join("main");
        std::fs::create_dir_all(&main).unwrap();
        // refs/main points at a snapshot that no longer exists.
        std::fs::create_dir_all(layout.refs_dir("owner/repo")).unwrap();
        std::fs::write(layout.refs_dir("owner/repo").join("main"), "gone").unwrap();

        assert_eq!(layout.snapshot_directory("owner/repo", true), main);
    }

    #[test]
    fn snapshot_resolution_adopts_newest_and_repairs_ref() {
        let dir = TempDir::new().unwrap();
        let layout = HubLayout::new(dir.path());
        let rev = layout.snapshots_dir("owner/repo").join("abc123");
        std::fs::create_dir_all(&rev).unwrap();

        let resolved = layout.snapshot_directory("owner/repo", true);
        assert_eq!(resolved, rev);
        let main_ref =
            std::fs::read_to_string(layout.refs_dir("owner/repo").join("main")).unwrap();
        assert_eq!(main_ref, "abc123");
    }

    #[test]
    fn snapshot_resolution_with_nothing_on_disk() {
        let dir = TempDir::new().unwrap();
        let layout = HubLayout::new(dir.path());
        assert_eq!(
            layout.snapshot_directory("owner/repo", true),
            layout.snapshots_dir("owner/repo").join("main")
        );
    }

    #[test]
    fn normalize_references_repairs_stale_pointer() {
        let dir = TempDir::new().unwrap();
        let layout = HubLayout::new(dir.path());
        let rev = layout.snapshots_dir("owner/repo").join("abc123");
        std::fs::create_dir_all(&rev).unwrap();
        std::fs::create_dir_all(layout.refs_dir("owner/repo")).unwrap();
        std::fs::write(layout.refs_dir("owner/repo").join("main"), "deleted-rev").unwrap();

        let resolved = layout.normalize_snapshot_references("owner/repo").unwrap();
        assert_eq!(resolved, rev);
        let main_ref =
            std::fs::read_to_string(layout.refs_dir("owner/repo").join("main")).unwrap();
        assert_eq!(main_ref, "abc123");
    }

    #[test]
    fn extract_model_id_decodes_cache_paths() {
        assert_eq!(
            HubLayout::extract_model_id("models--owner--repo/snapshots/main/config.json"),
            "owner/repo"
        );
        assert_eq!(HubLayout::extract_model_id("owner/repo"), "owner/repo");
        assert_eq!(HubLayout::extract_model_id("plain"), "plain");
    }
}
