use crate::error::{DevError, Result};
use crate::ignore::IgnoreSet;
use crate::pattern::GlobPattern;
use crate::types::FileRef;
use std::collections::BTreeMap;
use std::io;
use ::ignore::WalkBuilder;
use std::path::{Component, Path};
use tracing::{debug, warn};

/// Snapshot of project files keyed by root-relative, `/`-separated path.
pub type FileSnapshot = BTreeMap<String, FileRef>;

/// Collects the files under `root` matching `pattern`, honoring `ignores`.
///
/// Symlinks are followed; loops and directories are left out. An empty
/// result is not an error.
pub fn collect_project_files(
    pattern: &str,
    root: &Path,
    ignores: &IgnoreSet,
) -> Result<FileSnapshot> {
    let meta = std::fs::metadata(root).map_err(|e| DevError::fs(root, e))?;
    if !meta.is_dir() {
        return Err(DevError::fs(
            root,
            io::Error::new(io::ErrorKind::InvalidInput, "project root is not a directory"),
        ));
    }
    std::fs::read_dir(root).map_err(|e| DevError::fs(root, e))?;

    let glob = GlobPattern::new(pattern).map_err(|e| {
        DevError::fs(
            root,
            io::Error::new(io::ErrorKind::InvalidInput, format!("bad glob {pattern:?}: {e}")),
        )
    })?;

    let filter_root = root.to_path_buf();
    let filter_ignores = ignores.clone();
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .follow_links(true)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            match relative_path(&filter_root, entry.path()) {
                Some(rel) => !filter_ignores.is_ignored(&rel, is_dir),
                None => false,
            }
        })
        .build();

    let mut files = FileSnapshot::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if is_loop(&err) => {
                debug!("skipping symlink loop: {err}");
                continue;
            }
            Err(err) => {
                warn!("skipping unreadable project entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if !glob.is_match(&rel) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => {
                files.insert(rel, FileRef::from_metadata(entry.path().to_path_buf(), &meta));
            }
            Err(err) => warn!("skipping {}: {err}", entry.path().display()),
        }
    }

    Ok(files)
}

fn is_loop(err: &::ignore::Error) -> bool {
    match err {
        ::ignore::Error::Loop { .. } => true,
        ::ignore::Error::WithPath { err, .. }
        | ::ignore::Error::WithDepth { err, .. }
        | ::ignore::Error::WithLineNumber { err, .. } => is_loop(err),
        ::ignore::Error::Partial(errs) => errs.iter().all(is_loop),
        _ => false,
    }
}

/// Root-relative path using `/` separators.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
