//! Downloaded-file integrity verification.
//!
//! Two orthogonal checks per file: a size check with a tolerance band
//! (some hub backends report packed sizes for small metadata files) and a
//! streaming SHA-256 check for weight-class files. Corrupt or truncated
//! files are detected here rather than surfacing as a cryptic loader error.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;
use tracing::{info, warn};

/// Size tolerance floor: 512 KiB.
const SIZE_TOLERANCE_FLOOR: u64 = 512 * 1024;

/// Files at or above this size are always hash-checked when a digest is
/// available, regardless of extension.
const HASH_SIZE_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Hash buffer: 1 MiB, keeps multi-GB tensors out of memory.
const HASH_BUF_BYTES: usize = 1024 * 1024;

/// Expected size and digest for one file, derived from the manifest.
///
/// Both fields are advisory. An expectation with neither field present
/// yields a "download-only" validation that always passes for an existing
/// file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityExpectation {
    /// Expected size in bytes, when the manifest declared one.
    pub expected_size: Option<u64>,
    /// Expected SHA-256 hex digest, when the manifest declared one.
    pub expected_sha256: Option<String>,
}

impl IntegrityExpectation {
    /// True when neither a size nor a digest is available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expected_size.is_none() && self.expected_sha256.is_none()
    }
}

/// Outcome of validating one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Whether every applicable check passed.
    pub passed: bool,
    /// Actual on-disk size in bytes (0 when the file is missing).
    pub file_size: u64,
    /// Human-readable description of the first failed check.
    pub failure_reason: Option<String>,
}

impl ValidationResult {
    fn pass(file_size: u64) -> Self {
        Self {
            passed: true,
            file_size,
            failure_reason: None,
        }
    }

    fn fail(file_size: u64, reason: String) -> Self {
        Self {
            passed: false,
            file_size,
            failure_reason: Some(reason),
        }
    }
}

/// Allowed deviation between an expected and actual file size.
///
/// `max(1% of expected, 512 KiB)`. The floor avoids false positives on
/// tiny JSON files whose hub-reported size is the packed size, while the
/// percent band still catches truncation on multi-GB tensors.
#[must_use]
pub fn size_tolerance(expected_size: u64) -> u64 {
    (expected_size / 100).max(SIZE_TOLERANCE_FLOOR)
}

/// Whether a file participates in hash checking.
///
/// Weight-class extensions always qualify, as does the canonical
/// `pytorch_model.bin` and anything at or over 50 MiB. Small text files
/// skip hashing by default.
#[must_use]
pub fn qualifies_for_hash_check(file_name: &str, file_size: u64) -> bool {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".safetensors") || lower.ends_with(".gguf") || lower.ends_with(".mlx") {
        return true;
    }
    let base = lower.rsplit('/').next().unwrap_or(&lower);
    if base == "pytorch_model.bin" {
        return true;
    }
    file_size >= HASH_SIZE_THRESHOLD
}

/// Validate one downloaded file against its expectation.
///
/// A non-existent file fails with reason "file does not exist". Missing
/// expectations are not failures. The size check applies when
/// `expected_size > 0`; the hash check applies when a digest is present
/// and the file qualifies (see [`qualifies_for_hash_check`]).
#[must_use]
pub fn validate_file(path: &Path, expectation: &IntegrityExpectation) -> ValidationResult {
    let Ok(meta) = std::fs::metadata(path) else {
        return ValidationResult::fail(0, "file does not exist".to_owned());
    };
    if !meta.is_file() {
        return ValidationResult::fail(0, "file does not exist".to_owned());
    }
    let actual_size = meta.len();

    if let Some(expected) = expectation.expected_size
        && expected > 0
    {
        let tolerance = size_tolerance(expected);
        let delta = actual_size.abs_diff(expected);
        if delta > tolerance {
            warn!(
                path = %path.display(),
                expected,
                actual = actual_size,
                tolerance,
                "size mismatch beyond tolerance"
            );
            return ValidationResult::fail(
                actual_size,
                format!(
                    "Size mismatch: expected {expected} bytes, found {actual_size} (tolerance {tolerance})"
                ),
            );
        }
    }

    if let Some(ref expected_hex) = expectation.expected_sha256 {
        let name = path.to_string_lossy();
        if qualifies_for_hash_check(&name, actual_size) {
            match sha256_hex(path) {
                Ok(actual_hex) => {
                    if !actual_hex.eq_ignore_ascii_case(expected_hex) {
                        warn!(
                            path = %path.display(),
                            expected = %expected_hex,
                            actual = %actual_hex,
                            "hash mismatch"
                        );
                        return ValidationResult::fail(
                            actual_size,
                            format!("Hash mismatch: expected {expected_hex}, computed {actual_hex}"),
                        );
                    }
                    info!(path = %path.display(), "hash verified");
                }
                Err(e) => {
                    return ValidationResult::fail(
                        actual_size,
                        format!("Hash computation failed: {e}"),
                    );
                }
            }
        }
    }

    ValidationResult::pass(actual_size)
}

/// Compute the SHA-256 hex digest of a file, streaming in 1 MiB chunks.
pub fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(format!("{digest:x}"))
}
