//! Repository identifier (`owner/repo`) normalization.
//!
//! Identifiers arrive from many places: user input, cache directory names
//! (`models--owner--repo/...`), and paths deep inside a snapshot tree.
//! Everything is reduced to the canonical `owner/repo` form before it is
//! used for equality, lookups, or path construction.

use crate::error::{FetchError, Result};

/// Prefix used by the hub cache layout for model directories.
pub const MODELS_PREFIX: &str = "models--";

/// Normalize a raw repository identifier to `owner/repo`.
///
/// Steps, in order:
/// 1. trim surrounding whitespace
/// 2. decode a leading `models--owner--repo` cache segment
/// 3. truncate at a `snapshots/` or `blobs/` component
/// 4. keep only the first two path components
///
/// # Errors
///
/// Returns [`FetchError::InvalidInput`] when nothing usable remains.
pub fn normalize(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FetchError::InvalidInput(
            "empty repository identifier".to_owned(),
        ));
    }

    let mut components: Vec<&str> = Vec::new();
    for part in trimmed.split('/') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part == "snapshots" || part == "blobs" {
            break;
        }
        components.push(part);
    }

    // A cache-layout first segment expands into owner + repo.
    if let Some(first) = components.first()
        && let Some((owner, repo)) = decode_cache_segment(first)
    {
        return Ok(format!("{owner}/{repo}"));
    }

    match components.len() {
        0 => Err(FetchError::InvalidInput(format!(
            "unusable repository identifier: {raw:?}"
        ))),
        1 => Ok(components[0].to_owned()),
        _ => Ok(format!("{}/{}", components[0], components[1])),
    }
}

/// Decode a `models--owner--repo` directory name into `(owner, repo)`.
///
/// Returns `None` when the segment is not in cache-layout form.
#[must_use]
pub fn decode_cache_segment(segment: &str) -> Option<(&str, &str)> {
    let rest = segment.strip_prefix(MODELS_PREFIX)?;
    let (owner, repo) = rest.split_once("--")?;
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

/// Encode `owner/repo` as the cache-layout directory name
/// `models--owner--repo`.
#[must_use]
pub fn encode_cache_segment(hub_id: &str) -> String {
    format!("{MODELS_PREFIX}{}", hub_id.replace('/', "--"))
}
