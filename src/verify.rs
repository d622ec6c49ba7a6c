//! Post-install health checks and targeted repair.
//!
//! The download coordinator tolerates per-file validation failures; this
//! service is the authoritative gate afterwards. Missing files can be
//! repaired from the pristine staging copy the coordinator keeps; corrupt
//! files need a fresh download.

use crate::error::Result;
use crate::events::{ProgressBus, verification_event};
use crate::integrity::validate_file;
use crate::metadata::MetadataStore;
use serde_json::json;
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Config file names accepted by the completeness check.
const CONFIG_FILES: &[&str] = &["config.json", "model_config.json", "generation_config.json"];

/// Tokenizer file names accepted by the completeness check.
const TOKENIZER_FILES: &[&str] = &["tokenizer.json", "tokenizer.model", "tokenizer_config.json"];

/// Weight file extensions accepted by the completeness check.
const WEIGHT_EXTENSIONS: &[&str] = &[".safetensors", ".bin", ".gguf", ".npz", ".mlx"];

/// Outcome of a check-and-repair pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Every file present and valid; nothing to do.
    Healthy,
    /// Missing files were restored from the source copy.
    Repaired,
    /// Corrupt files found; only a fresh download can fix them.
    NeedsRedownload,
}

/// Health checking and repair over installed model directories.
#[derive(Debug, Clone)]
pub struct VerificationService {
    metadata: MetadataStore,
    events: ProgressBus,
}

impl VerificationService {
    /// Build a service over the shared metadata store and event bus.
    #[must_use]
    pub fn new(metadata: MetadataStore, events: ProgressBus) -> Self {
        Self { metadata, events }
    }

    /// Whether a directory holds a loadable model: a config, a tokenizer,
    /// and at least one weight file somewhere in its subtree.
    #[must_use]
    pub fn is_directory_complete(dir: &Path) -> bool {
        let mut has_config = false;
        let mut has_tokenizer = false;
        let mut has_weights = false;

        for entry in WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_lowercase();
            has_config |= CONFIG_FILES.contains(&name.as_str());
            has_tokenizer |= TOKENIZER_FILES.contains(&name.as_str());
            has_weights |= WEIGHT_EXTENSIONS.iter().any(|ext| name.ends_with(ext));
            if has_config && has_tokenizer && has_weights {
                return true;
            }
        }
        false
    }

    /// Informational completeness check: like [`is_directory_complete`]
    /// but logs what is missing.
    ///
    /// [`is_directory_complete`]: VerificationService::is_directory_complete
    #[must_use]
    pub fn verify_model(&self, hub_id: &str, dir: &Path) -> bool {
        let complete = Self::is_directory_complete(dir);
        if complete {
            info!(hub_id, dir = %dir.display(), "model directory is complete");
        } else {
            warn!(
                hub_id,
                dir = %dir.display(),
                "model directory is incomplete (config, tokenizer, or weights missing)"
            );
        }
        complete
    }

    /// Compare `target_dir` against the pristine `source_dir` and repair
    /// what can be repaired locally.
    ///
    /// Every file under `source_dir` must exist in `target_dir`; files
    /// with a cached integrity expectation are additionally validated.
    /// Missing files are copied back from the source. Corrupt files are
    /// not touched; they need a fresh download.
    ///
    /// # Errors
    ///
    /// Returns an error when walking the source or copying a repair file
    /// fails.
    pub fn check_and_repair(
        &self,
        hub_id: &str,
        source_dir: &Path,
        target_dir: &Path,
    ) -> Result<RepairOutcome> {
        let expectations = self.metadata.cached_integrity_expectations(hub_id);
        let mut missing: Vec<String> = Vec::new();
        let mut corrupt: Vec<String> = Vec::new();

        for entry in WalkDir::new(source_dir).follow_links(false) {
            let entry = entry.map_err(|e| {
                std::io::Error::other(format!("cannot walk {}: {e}", source_dir.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source_dir)
                .map_err(|e| std::io::Error::other(format!("path outside source tree: {e}")))?;
            let relative_name = relative.to_string_lossy().into_owned();
            let target = target_dir.join(relative);

            if !target.is_file() {
                missing.push(relative_name);
                continue;
            }
            if let Some(expectation) = expectations.get(&relative_name) {
                let result = validate_file(&target, expectation);
                if !result.passed {
                    warn!(
                        hub_id,
                        file = %relative_name,
                        reason = result.failure_reason.as_deref().unwrap_or("unknown"),
                        "corrupt file detected"
                    );
                    corrupt.push(relative_name);
                }
            }
        }

        if missing.is_empty() && corrupt.is_empty() {
            info!(hub_id, "verification passed");
            return Ok(RepairOutcome::Healthy);
        }

        self.events.publish_verification(
            hub_id,
            verification_event::REPAIR_START,
            [
                ("missing_files", json!(missing.len())),
                ("corrupt_files", json!(corrupt.len())),
            ],
        );

        // Corrupt content cannot be rebuilt from a local copy.
        if !corrupt.is_empty() {
            warn!(
                hub_id,
                corrupt = corrupt.len(),
                missing = missing.len(),
                "corrupt files present; redownload required"
            );
            self.events.publish_verification(
                hub_id,
                verification_event::REPAIR_COMPLETE,
                [("repaired_files", json!(0))],
            );
            return Ok(RepairOutcome::NeedsRedownload);
        }

        for relative_name in &missing {
            let from = source_dir.join(relative_name);
            let to = target_dir.join(relative_name);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&from, &to)?;
            info!(hub_id, file = %relative_name, "restored missing file from source copy");
        }

        self.events.publish_verification(
            hub_id,
            verification_event::REPAIR_COMPLETE,
            [("repaired_files", json!(missing.len()))],
        );
        Ok(RepairOutcome::Repaired)
    }
}
