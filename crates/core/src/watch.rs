use crate::error::{DevError, Result};
use crate::files::{collect_project_files, relative_path, FileSnapshot};
use crate::ignore::IgnoreSet;
use notify::{RecursiveMode, Watcher};
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Added(String),
    Modified(String),
    Removed(String),
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            FileChange::Added(p) | FileChange::Modified(p) | FileChange::Removed(p) => p,
        }
    }
}

/// Changes between two snapshots, ordered by path.
pub fn diff_snapshots(old: &FileSnapshot, new: &FileSnapshot) -> Vec<FileChange> {
    let mut changes = Vec::new();
    for (path, file) in new {
        match old.get(path) {
            None => changes.push(FileChange::Added(path.clone())),
            Some(previous) if !previous.same_revision(file) => {
                changes.push(FileChange::Modified(path.clone()))
            }
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            changes.push(FileChange::Removed(path.clone()));
        }
    }
    changes.sort_by(|a, b| a.path().cmp(b.path()));
    changes
}

/// Watches `root` and sends a batch of changes after every quiet period of
/// `debounce`. The task ends when `changes` is closed.
pub fn watch_project(
    root: PathBuf,
    ignores: IgnoreSet,
    debounce: Duration,
    initial: FileSnapshot,
    changes: mpsc::Sender<Vec<FileChange>>,
) -> Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::channel(256);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.blocking_send(res);
    })
    .map_err(|e| DevError::fs(&root, std::io::Error::other(e)))?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| DevError::fs(&root, std::io::Error::other(e)))?;
    info!("watching {}", root.display());

    let handle = tokio::spawn(async move {
        let _watcher = watcher;
        let mut known = initial;
        let mut timer: Option<Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            tokio::select! {
                Some(res) = rx.recv() => match res {
                    Ok(event) => {
                        if !(event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()) {
                            continue;
                        }
                        let relevant = event.paths.iter().any(|p| {
                            relative_path(&root, p)
                                .is_some_and(|rel| !ignores.is_ignored(&rel, p.is_dir()))
                        });
                        if relevant {
                            timer = Some(Box::pin(tokio::time::sleep(debounce)));
                        }
                    }
                    Err(err) => error!("watch error: {err}"),
                },
                _ = async {
                    match timer.as_mut() {
                        Some(t) => t.await,
                        None => std::future::pending().await,
                    }
                } => {
                    timer = None;
                    let (scan_root, scan_ignores) = (root.clone(), ignores.clone());
                    let scanned = tokio::task::spawn_blocking(move || {
                        collect_project_files("**", &scan_root, &scan_ignores)
                    })
                    .await;
                    let current = match scanned {
                        Ok(Ok(current)) => current,
                        Ok(Err(err)) => {
                            error!("rescanning project failed: {err}");
                            continue;
                        }
                        Err(err) => {
                            error!("rescan task failed: {err}");
                            continue;
                        }
                    };
                    let batch = diff_snapshots(&known, &current);
                    known = current;
                    if batch.is_empty() {
                        continue;
                    }
                    debug!("{} file change(s)", batch.len());
                    if changes.send(batch).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
        debug!("watcher for {} stopped", root.display());
    });

    Ok(handle)
}
