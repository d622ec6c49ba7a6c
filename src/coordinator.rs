//! Download orchestration.
//!
//! One coordinator per process ties the components together: admission
//! through the failure manager, manifest resolution through the metadata
//! store, sequential per-file downloads with overall progress, per-file
//! validation, atomic move into the model directory, canonicalization,
//! and materialization of the hub cache layout.

use crate::backoff::NetworkFailureManager;
use crate::canonicalize::canonicalize_model_dir;
use crate::error::{FetchError, Result};
use crate::events::{ProgressBus, download_event};
use crate::hub::HubClient;
use crate::hub_id;
use crate::integrity::validate_file;
use crate::layout::HubLayout;
use crate::metadata::{FileManifestEntry, MetadataStore};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Overall-progress callback, fraction in `[0, 1]`.
pub type OverallProgressFn<'a> = dyn Fn(f64) + Send + Sync + 'a;

/// Extensions that mark a file as model weights.
const WEIGHT_EXTENSIONS: &[&str] = &[".safetensors", ".bin", ".gguf", ".npz", ".mlx"];

/// File names that mark a directory as carrying a tokenizer.
const TOKENIZER_FILES: &[&str] = &["tokenizer.json", "tokenizer.model", "tokenizer_config.json"];

/// Manifest suffixes accepted outright by the download filter.
const ACCEPTED_SUFFIXES: &[&str] = &[
    ".json",
    ".safetensors",
    ".bin",
    ".gguf",
    ".mlx",
    ".npz",
    ".model",
    ".vocab",
    ".txt",
    ".py",
];

/// A locally installed model found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredModel {
    /// Normalized `owner/repo`.
    pub hub_id: String,
    /// Directory the model was found under.
    pub path: PathBuf,
}

/// Orchestrates metadata resolution, download, verification, and cache
/// materialization for model repositories.
pub struct DownloadCoordinator {
    client: HubClient,
    metadata: MetadataStore,
    layout: HubLayout,
    failures: NetworkFailureManager,
    events: ProgressBus,
    // Repositories with a download in flight. A second call for the same
    // repository fails fast with `Busy` rather than joining the in-flight
    // run; this keeps the coordinator the single writer per repository.
    active: Mutex<HashSet<String>>,
}

impl DownloadCoordinator {
    /// Assemble a coordinator from its collaborators.
    #[must_use]
    pub fn new(
        client: HubClient,
        metadata: MetadataStore,
        layout: HubLayout,
        failures: NetworkFailureManager,
        events: ProgressBus,
    ) -> Self {
        Self {
            client,
            metadata,
            layout,
            failures,
            events,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// The progress bus downloads and repairs publish to.
    #[must_use]
    pub fn events(&self) -> &ProgressBus {
        &self.events
    }

    /// The shared failure manager.
    #[must_use]
    pub fn failures(&self) -> &NetworkFailureManager {
        &self.failures
    }

    /// The metadata store.
    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// The cache layout.
    #[must_use]
    pub fn layout(&self) -> &HubLayout {
        &self.layout
    }

    /// Download a model repository into `model_dir`, staging through
    /// `temp_dir`, and materialize the hub cache layout.
    ///
    /// Files are downloaded strictly sequentially in manifest order.
    /// `progress` receives the overall fraction; the byte-weighted form is
    /// used when every manifest entry carries a size, the file-count form
    /// otherwise. Per-file validation failures are logged and left for the
    /// verification service; they do not abort the run.
    ///
    /// Returns `model_dir` on success.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidInput`]: bad identifier, or nothing left
    ///   after filtering
    /// - [`FetchError::NetworkUnavailable`]: repository in backoff
    /// - [`FetchError::Busy`]: another download for this repository is in
    ///   flight
    /// - [`FetchError::NotFound`] / [`FetchError::PermissionDenied`] /
    ///   [`FetchError::Transient`]: hub failures
    /// - [`FetchError::Cancelled`]: token fired; `model_dir` is untouched
    ///   if the move step had not started
    /// - [`FetchError::Io`]: local filesystem failures; the temp area is
    ///   preserved for diagnostics
    pub async fn download_model(
        &self,
        raw_hub_id: &str,
        model_dir: &Path,
        temp_dir: &Path,
        progress: Option<&OverallProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let hub_id = hub_id::normalize(raw_hub_id)?;

        // Admission: the failure manager is the only retry gatekeeper.
        if !self.failures.is_network_ready(&hub_id, "download") {
            let retry_in_seconds = self.failures.pending_backoff(&hub_id).unwrap_or(0);
            return Err(FetchError::NetworkUnavailable { retry_in_seconds });
        }
        let _claim = self.claim(&hub_id)?;

        // Metadata: cached manifest wins, otherwise fetch and cache.
        let manifest = match self.metadata.load_cached_metadata(&hub_id) {
            Some(cached) => {
                debug!(hub_id, files = cached.len(), "using cached manifest");
                cached
            }
            None => self.fetch_and_cache_manifest(&hub_id).await?,
        };

        let files = filter_manifest(&manifest);
        if files.is_empty() {
            return Err(FetchError::InvalidInput(format!(
                "no downloadable files in {hub_id} after filtering"
            )));
        }

        let known_bytes: u64 = files.iter().filter_map(|f| f.size).sum();
        let expected_total = files
            .iter()
            .all(|f| f.size.is_some())
            .then_some(known_bytes);

        let total_files = files.len();
        info!(
            hub_id,
            total_files,
            known_bytes = %format_bytes(known_bytes),
            "starting download"
        );
        let mut start_payload = vec![
            ("total_files", json!(total_files)),
            ("known_bytes", json!(known_bytes)),
        ];
        if let Some(expected) = expected_total {
            start_payload.push(("expected_total_bytes", json!(expected)));
        }
        self.events
            .publish_download(&hub_id, download_event::START, start_payload);

        let expectations = self.metadata.cached_integrity_expectations(&hub_id);
        let mut completed_bytes: u64 = 0;

        for (index, entry) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let dest = temp_dir.join(&entry.file_name);
            let bytes_before = completed_bytes;
            let adapter = move |fraction: f64, bytes: u64, _total: u64| {
                let overall = match expected_total {
                    Some(total) if total > 0 => {
                        ((bytes_before + bytes) as f64 / total as f64).min(1.0)
                    }
                    _ => (index as f64 + fraction) / total_files as f64,
                };
                if let Some(cb) = progress {
                    cb(overall);
                }
            };
            match self
                .client
                .download_file(&hub_id, &entry.file_name, &dest, Some(&adapter), cancel)
                .await
            {
                Ok(_) => {}
                Err(e @ FetchError::Cancelled) => return Err(e),
                Err(e) => {
                    self.failures.record_failure(&hub_id, "download", &e);
                    return Err(e);
                }
            }

            let expectation = expectations.get(&entry.file_name).cloned().unwrap_or_default();
            let validation = validate_file(&dest, &expectation);
            if validation.passed {
                completed_bytes += if validation.file_size > 0 {
                    validation.file_size
                } else {
                    entry.size.unwrap_or(0)
                };
            } else {
                // Logged only: the verification service is the
                // authoritative gate for corrupt installs.
                warn!(
                    hub_id,
                    file = %entry.file_name,
                    reason = validation.failure_reason.as_deref().unwrap_or("unknown"),
                    "validation failed; continuing"
                );
                completed_bytes += entry.size.unwrap_or(validation.file_size);
            }

            self.events.publish_download(
                &hub_id,
                download_event::FILE_COMPLETE,
                [
                    ("file_name", json!(entry.file_name)),
                    ("completed_files", json!(index + 1)),
                    ("total_files", json!(total_files)),
                ],
            );
        }

        // Every expected file must have landed in the staging area.
        for entry in &files {
            let staged = temp_dir.join(&entry.file_name);
            if !staged.is_file() {
                return Err(FetchError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} missing from staging area after download", entry.file_name),
                )));
            }
        }

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        // Move: rebuild the model directory from empty so partial installs
        // never mix with fresh contents.
        if model_dir.exists() {
            std::fs::remove_dir_all(model_dir)?;
        }
        std::fs::create_dir_all(model_dir)?;
        for entry in &files {
            let from = temp_dir.join(&entry.file_name);
            let to = model_dir.join(&entry.file_name);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&from, &to)?;
        }

        canonicalize_model_dir(model_dir)?;
        self.layout.copy_to_hf_directory(model_dir, &hub_id)?;
        self.failures.record_success(&hub_id);

        if let Some(cb) = progress {
            cb(1.0);
        }
        self.events.publish_download(
            &hub_id,
            download_event::COMPLETE,
            [
                ("completed_files", json!(total_files)),
                ("total_files", json!(total_files)),
                ("overall_total_bytes", json!(completed_bytes)),
            ],
        );
        info!(
            hub_id,
            total_files,
            total = %format_bytes(completed_bytes),
            "download complete"
        );

        Ok(model_dir.to_path_buf())
    }

    /// Resume a previously interrupted download.
    ///
    /// Currently delegates to a full [`download_model`] run; the client
    /// keeps range support so existing bytes could be revalidated and
    /// continued in a later revision.
    ///
    /// # Errors
    ///
    /// See [`download_model`].
    ///
    /// [`download_model`]: DownloadCoordinator::download_model
    pub async fn resume_download(
        &self,
        raw_hub_id: &str,
        model_dir: &Path,
        temp_dir: &Path,
        progress: Option<&OverallProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.download_model(raw_hub_id, model_dir, temp_dir, progress, cancel)
            .await
    }

    /// Refetch a repository's manifest from the hub, replacing the cached
    /// copy. This is the only path that mutates cached manifest rows.
    ///
    /// # Errors
    ///
    /// [`FetchError::NetworkUnavailable`] while in backoff, otherwise the
    /// hub errors of [`HubClient::list_files_detailed`].
    pub async fn refresh_metadata(&self, raw_hub_id: &str) -> Result<Vec<FileManifestEntry>> {
        let hub_id = hub_id::normalize(raw_hub_id)?;
        if !self.failures.is_network_ready(&hub_id, "metadata refresh") {
            let retry_in_seconds = self.failures.pending_backoff(&hub_id).unwrap_or(0);
            return Err(FetchError::NetworkUnavailable { retry_in_seconds });
        }
        self.fetch_and_cache_manifest(&hub_id).await
    }

    /// Remove a model from the cache layout, its legacy mirror, and its
    /// working area, including the cached manifest.
    ///
    /// # Errors
    ///
    /// Returns the first filesystem error encountered.
    pub fn purge_model(&self, raw_hub_id: &str) -> Result<()> {
        let hub_id = hub_id::normalize(raw_hub_id)?;
        for dir in [
            self.layout.model_root(&hub_id),
            self.layout.legacy_dir(&hub_id),
            self.metadata.repo_dir(&hub_id),
        ] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        info!(hub_id, "model purged");
        Ok(())
    }

    /// Discover locally installed models under the cache root.
    ///
    /// A model is any directory subtree holding at least one weight file
    /// and at least one tokenizer file. Results are deduplicated by
    /// repository and sorted lexically.
    #[must_use]
    pub fn list_downloaded_models(&self) -> Vec<DiscoveredModel> {
        discover_models(self.layout.cache_root())
    }

    async fn fetch_and_cache_manifest(&self, hub_id: &str) -> Result<Vec<FileManifestEntry>> {
        match self.client.list_files_detailed(hub_id).await {
            Ok(manifest) => {
                self.metadata.cache_metadata(&manifest, hub_id)?;
                Ok(manifest)
            }
            Err(e @ FetchError::NotFound(_)) => {
                // A missing repository is a fact, not a connectivity
                // problem: clear any backoff state.
                self.failures.record_success(hub_id);
                Err(e)
            }
            Err(e) => {
                self.failures.record_failure(hub_id, "metadata", &e);
                Err(e)
            }
        }
    }

    fn claim(&self, hub_id: &str) -> Result<ActiveClaim<'_>> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !active.insert(hub_id.to_owned()) {
            return Err(FetchError::Busy(hub_id.to_owned()));
        }
        Ok(ActiveClaim {
            active: &self.active,
            hub_id: hub_id.to_owned(),
        })
    }
}

/// Releases a repository's in-flight claim on drop.
struct ActiveClaim<'a> {
    active: &'a Mutex<HashSet<String>>,
    hub_id: String,
}

impl Drop for ActiveClaim<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.hub_id);
    }
}

/// Apply the download filter to a manifest, preserving order.
#[must_use]
pub fn filter_manifest(entries: &[FileManifestEntry]) -> Vec<FileManifestEntry> {
    entries
        .iter()
        .filter(|e| is_relevant_file(&e.file_name))
        .cloned()
        .collect()
}

/// Decide whether a manifest path is worth downloading.
///
/// Rules are applied to the lowercased relative path, rejections first:
/// hidden entries, temp files, git internals, documentation, previews,
/// samples, and licenses go; known model suffixes and anything named like
/// a config, tokenizer, or model stay.
#[must_use]
pub fn is_relevant_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    let name = lower.rsplit('/').next().unwrap_or(&lower);

    if lower.split('/').any(|component| component.starts_with('.')) {
        return false;
    }
    if lower.ends_with(".tmp") || lower.ends_with(".temp") {
        return false;
    }
    if lower.contains(".git") {
        return false;
    }
    if name.starts_with("readme") {
        return false;
    }
    if lower.ends_with(".md") && !lower.contains("model") {
        return false;
    }
    if lower.contains("sample") || lower.contains("example") {
        return false;
    }
    if lower.ends_with(".png") || lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        return false;
    }
    if name == "license" || name == "license.txt" {
        return false;
    }

    if ACCEPTED_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
        return true;
    }
    lower.contains("config") || lower.contains("tokenizer") || lower.contains("model")
}

/// Walk `models_root` and report every installed model.
#[must_use]
pub fn discover_models(models_root: &Path) -> Vec<DiscoveredModel> {
    let mut found: std::collections::BTreeMap<String, (PathBuf, bool, bool)> =
        std::collections::BTreeMap::new();

    for entry in WalkDir::new(models_root)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(models_root) else {
            continue;
        };
        let components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let Some(first) = components.first() else {
            continue;
        };

        let (hub_id, root) = if hub_id::decode_cache_segment(first).is_some() {
            (
                HubLayout::extract_model_id(first),
                models_root.join(first),
            )
        } else if components.len() >= 3 {
            // Plain `<owner>/<repo>/…` layout: the file must sit below
            // the repo directory.
            (
                format!("{}/{}", components[0], components[1]),
                models_root.join(&components[0]).join(&components[1]),
            )
        } else {
            continue;
        };

        let file_name = components
            .last()
            .map(String::as_str)
            .unwrap_or_default()
            .to_lowercase();
        let slot = found.entry(hub_id).or_insert((root, false, false));
        if WEIGHT_EXTENSIONS.iter().any(|ext| file_name.ends_with(ext)) {
            slot.1 = true;
        }
        if TOKENIZER_FILES.contains(&file_name.as_str()) {
            slot.2 = true;
        }
    }

    found
        .into_iter()
        .filter(|(_, (_, weights, tokenizer))| *weights && *tokenizer)
        .map(|(hub_id, (path, _, _))| DiscoveredModel { hub_id, path })
        .collect()
}

/// Human-readable byte count for logs.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
