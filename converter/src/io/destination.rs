//! Shared destination store used by the merge coordinator.
//!
//! [`DirectoryStore`] keeps each collection as a directory under the store
//! root; appended unit artifacts live in `<collection>/<unit tag>`. A file
//! named [`CLASSES_FILE`] at the top of an artifact holds its classification
//! scheme (one class per line), which combining unions into the canonical
//! collection's scheme.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::io::fs_tree::{copy_tree, remove_path};

pub const CLASSES_FILE: &str = "CLASSES";

pub trait Destination {
    /// Append a unit artifact into `collection`, tagged by unit. Re-appending
    /// the same unit replaces its earlier copy.
    fn append(&self, artifact: &Path, collection: &str, unit_tag: &str) -> Result<()>;

    /// Copy a unit artifact into a temporary collection, replacing a stale one.
    fn copy_to_temporary(&self, artifact: &Path, temporary: &str) -> Result<()>;

    /// Merge a temporary collection into the canonical one.
    fn merge_into(&self, temporary: &str, canonical: &str, unit_tag: &str) -> Result<()>;

    /// Delete a collection. Deleting a missing collection is not an error.
    fn delete_collection(&self, name: &str) -> Result<()>;

    fn has_collection(&self, name: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open the store at `root`, creating it from `template` (or empty) when
    /// it does not exist. An existing store is never replaced.
    pub fn open_or_create(root: &Path, template: Option<&Path>) -> Result<Self> {
        if root.is_dir() {
            info!(destination = %root.display(), "merging into existing destination");
        } else if let Some(template) = template {
            info!(
                destination = %root.display(),
                template = %template.display(),
                "creating destination from template"
            );
            copy_tree(template, root)
                .with_context(|| format!("bootstrap destination {}", root.display()))?;
        } else {
            info!(destination = %root.display(), "creating empty destination");
            fs::create_dir_all(root)
                .with_context(|| format!("create destination {}", root.display()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        name.split('/').fold(self.root.clone(), |path, part| path.join(part))
    }

    fn replace_with_copy(&self, artifact: &Path, target: &Path) -> Result<()> {
        if !artifact.exists() {
            bail!("artifact {} does not exist", artifact.display());
        }
        remove_path(target)?;
        copy_tree(artifact, target)
    }
}

impl Destination for DirectoryStore {
    fn append(&self, artifact: &Path, collection: &str, unit_tag: &str) -> Result<()> {
        let target = self.collection_path(collection).join(unit_tag);
        debug!(artifact = %artifact.display(), target = %target.display(), "append");
        self.replace_with_copy(artifact, &target)
            .with_context(|| format!("append {} into {collection}", artifact.display()))
    }

    fn copy_to_temporary(&self, artifact: &Path, temporary: &str) -> Result<()> {
        let target = self.collection_path(temporary);
        debug!(artifact = %artifact.display(), target = %target.display(), "copy to temporary");
        self.replace_with_copy(artifact, &target)
            .with_context(|| format!("copy {} into {temporary}", artifact.display()))
    }

    fn merge_into(&self, temporary: &str, canonical: &str, unit_tag: &str) -> Result<()> {
        let source = self.collection_path(temporary);
        if !source.exists() {
            bail!("temporary collection {temporary} does not exist");
        }
        let canonical_dir = self.collection_path(canonical);
        fs::create_dir_all(&canonical_dir)
            .with_context(|| format!("create collection {canonical}"))?;

        let classes = source.join(CLASSES_FILE);
        if classes.is_file() {
            merge_classes(&classes, &canonical_dir.join(CLASSES_FILE))?;
        }

        let target = canonical_dir.join(unit_tag);
        remove_path(&target)?;
        copy_tree(&source, &target)
            .with_context(|| format!("merge {temporary} into {canonical}"))?;
        let copied_classes = target.join(CLASSES_FILE);
        if copied_classes.is_file() {
            remove_path(&copied_classes)?;
        }
        Ok(())
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        remove_path(&self.collection_path(name))
            .with_context(|| format!("delete collection {name}"))
    }

    fn has_collection(&self, name: &str) -> bool {
        self.collection_path(name).exists()
    }
}

/// Union the classes listed in `from` into `into`, keeping them sorted.
fn merge_classes(from: &Path, into: &Path) -> Result<()> {
    let mut classes = BTreeSet::new();
    for path in [from, into] {
        if path.is_file() {
            let text =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            classes.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }
    }
    let mut buf = classes.into_iter().collect::<Vec<_>>().join("\n");
    buf.push('\n');
    fs::write(into, buf).with_context(|| format!("write {}", into.display()))
}
