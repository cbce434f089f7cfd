//! Recursive copy and removal for unit sources and directory-backed stores.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Copy `from` (file or directory) to `to`. Fails if `to` already exists.
pub fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        anyhow::bail!("copy target already exists: {}", to.display());
    }
    let meta = fs::metadata(from).with_context(|| format!("stat {}", from.display()))?;
    if meta.is_file() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::copy(from, to)
            .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        return Ok(());
    }

    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry.with_context(|| format!("walk {}", from.display()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create directory {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copy {} -> {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

/// Remove a file or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))
        }
        Ok(_) => fs::remove_file(path).with_context(|| format!("remove {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}
