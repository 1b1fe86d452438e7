//! Local payload tree scanning with exclusion filters.

use camino::{Utf8Path, Utf8PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::error::ProvisionError;

/// How exclusion entries are matched against the local tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExclusionRule {
    /// Match files and directories by relative path or base name; an excluded
    /// directory hides its whole subtree.
    PathOrName,
    /// Match files by base name only; directories are always traversed.
    FileName,
}

/// One regular file of the payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalFile {
    /// Path relative to the payload root, `/` separated.
    pub relative: String,
    /// Absolute local path.
    pub absolute: Utf8PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// Snapshot of the payload after exclusions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LocalTree {
    /// Regular files, sorted by relative path.
    pub files: Vec<LocalFile>,
    /// Directories (relative, `/` separated), parents before children.
    pub directories: Vec<String>,
}

impl LocalTree {
    /// Walks `root`, skipping entries matched by `excluded` under `rule`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::LocalPayload`] when `root` is not a directory
    /// or an entry cannot be read.
    pub fn scan(
        root: &Utf8Path,
        excluded: &[String],
        rule: ExclusionRule,
    ) -> Result<Self, ProvisionError> {
        if !root.is_dir() {
            return Err(payload_error(root.as_str(), "not a directory"));
        }

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_excluded(root, entry, excluded, rule));

        let mut tree = Self::default();
        for item in walker {
            let entry = item.map_err(|err| {
                let path = err
                    .path()
                    .map_or_else(|| root.to_string(), |path| path.display().to_string());
                payload_error(&path, &err.to_string())
            })?;
            let absolute = Utf8PathBuf::from_path_buf(entry.path().to_path_buf())
                .map_err(|path| payload_error(&path.display().to_string(), "path is not UTF-8"))?;
            let relative = relative_path(root, &absolute);

            if entry.file_type().is_dir() {
                tree.directories.push(relative);
            } else if entry.file_type().is_file() {
                let size = entry
                    .metadata()
                    .map_err(|err| payload_error(absolute.as_str(), &err.to_string()))?
                    .len();
                tree.files.push(LocalFile {
                    relative,
                    absolute,
                    size,
                });
            }
        }
        Ok(tree)
    }
}

/// Parent directory of a `/` separated relative path; empty for top-level
/// entries.
#[must_use]
pub fn parent_of(relative: &str) -> &str {
    relative.rsplit_once('/').map_or("", |(parent, _)| parent)
}

/// Every ancestor directory of `relative`, outermost first.
#[must_use]
pub fn ancestors_of(relative: &str) -> Vec<String> {
    let parent = parent_of(relative);
    if parent.is_empty() {
        return Vec::new();
    }
    let mut ancestors = Vec::new();
    let mut current = String::new();
    for component in parent.split('/') {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(component);
        ancestors.push(current.clone());
    }
    ancestors
}

fn is_excluded(root: &Utf8Path, entry: &DirEntry, excluded: &[String], rule: ExclusionRule) -> bool {
    let name = entry.file_name().to_string_lossy();
    match rule {
        ExclusionRule::FileName => {
            !entry.file_type().is_dir() && excluded.iter().any(|pattern| *pattern == name)
        }
        ExclusionRule::PathOrName => {
            let relative = Utf8Path::from_path(entry.path())
                .map(|path| relative_path(root, path))
                .unwrap_or_default();
            excluded
                .iter()
                .any(|pattern| *pattern == name || *pattern == relative)
        }
    }
}

fn relative_path(root: &Utf8Path, path: &Utf8Path) -> String {
    path.strip_prefix(root)
        .map(|relative| {
            relative
                .components()
                .map(|component| component.as_str())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_else(|_| path.to_string())
}

fn payload_error(path: &str, message: &str) -> ProvisionError {
    ProvisionError::LocalPayload {
        path: path.to_owned(),
        message: message.to_owned(),
    }
}
