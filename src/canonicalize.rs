//! Post-download filesystem fixups.
//!
//! Two idempotent passes normalize a staged model directory for downstream
//! loaders: archives sometimes unpack as `D/D/<files>` instead of
//! `D/<files>`, and some repositories ship their config under an alternate
//! name. Both passes walk the tree breadth-first and are safe to run
//! repeatedly.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use tracing::{debug, info};

/// Alternate config names, in lookup order. The first one found is copied
/// to `config.json`; the original stays in place.
const CONFIG_ALIASES: &[&str] = &["model_config.json", "generation_config.json", "mlx_config.json"];

/// Run both canonicalization passes on a directory tree.
///
/// # Errors
///
/// Returns an error if a rename or copy fails mid-pass.
pub fn canonicalize_model_dir(dir: &Path) -> io::Result<()> {
    flatten_single_file_nesting(dir)?;
    alias_config_names(dir)?;
    Ok(())
}

/// Collapse `D/D/<contents>` into `D/<contents>` wherever a directory's
/// sole child is a directory with the same name.
///
/// The replacement goes through a temporary sibling name so a crash at any
/// point leaves either the old or the new layout, never a clobbered tree.
pub fn flatten_single_file_nesting(root: &Path) -> io::Result<()> {
    let mut queue = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        if let Some(child) = sole_same_named_subdir(&dir)? {
            let parent = dir
                .parent()
                .ok_or_else(|| io::Error::other("nested directory has no parent"))?;
            let name = dir
                .file_name()
                .ok_or_else(|| io::Error::other("nested directory has no name"))?
                .to_owned();
            let staging = parent.join(format!(".{}.flatten", name.to_string_lossy()));

            // Three-step move: child out to a temp sibling, empty shell
            // removed, temp renamed into the shell's place.
            std::fs::rename(&child, &staging)?;
            std::fs::remove_dir(&dir)?;
            std::fs::rename(&staging, &dir)?;
            info!(dir = %dir.display(), "flattened single-child nesting");
            // The directory may be nested more than one level deep.
            queue.push_back(dir);
            continue;
        }

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                queue.push_back(entry.path());
            }
        }
    }
    Ok(())
}

/// If `config.json` is absent but an alternate config name exists, copy
/// the first alternate found to `config.json`. Applied per directory,
/// breadth-first.
pub fn alias_config_names(root: &Path) -> io::Result<()> {
    let mut queue = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        let canonical = dir.join("config.json");
        if !canonical.exists() {
            for alias in CONFIG_ALIASES {
                let candidate = dir.join(alias);
                if candidate.is_file() {
                    std::fs::copy(&candidate, &canonical)?;
                    debug!(
                        dir = %dir.display(),
                        alias,
                        "created config.json from alternate name"
                    );
                    break;
                }
            }
        }

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                queue.push_back(entry.path());
            }
        }
    }
    Ok(())
}

/// Returns the sole child of `dir` when that child is a directory named
/// exactly like `dir` itself.
fn sole_same_named_subdir(dir: &Path) -> io::Result<Option<std::path::PathBuf>> {
    let Some(dir_name) = dir.file_name() else {
        return Ok(None);
    };
    let mut entries = std::fs::read_dir(dir)?;
    let Some(first) = entries.next() else {
        return Ok(None);
    };
    let first = first?;
    if entries.next().is_some() {
        return Ok(None);
    }
    if first.file_type()?.is_dir() && first.file_name() == dir_name {
        Ok(Some(first.path()))
    } else {
        Ok(None)
    }
}
