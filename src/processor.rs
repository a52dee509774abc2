//! Processor - bridges watched files to the versioned store
//!
//! Managed paths are expanded to leaf files, registered with a
//! [`ChangeObserver`] and captured once up front. Afterwards every change
//! becomes a `save` and every deletion a `delete` on the [`VersionedStore`],
//! keyed by the file's repository-relative name.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use path_clean::PathClean;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::store::VersionedStore;
use crate::watch::{ChangeObserver, WatchHandler};

/// Outcome of a [`Processor::manage`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManageSummary {
    /// Leaf files now registered with the observer
    pub watched: Vec<PathBuf>,
    /// Files whose registration failed, with the reason
    pub failed: Vec<(PathBuf, String)>,
    /// Paths refused outright (not absolute)
    pub rejected: Vec<PathBuf>,
}

impl ManageSummary {
    pub fn merge(&mut self, other: ManageSummary) {
        self.watched.extend(other.watched);
        self.failed.extend(other.failed);
        self.rejected.extend(other.rejected);
    }
}

/// Map an absolute path to its name inside the store: `/data/notes.txt` -> `data/notes.txt`
pub fn repository_name(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::Prefix(_) | Component::RootDir))
        .collect()
}

/// Expand `path` into the files that would be managed.
///
/// Directories are walked recursively; anything else is returned as is,
/// including paths that do not exist yet. Symlinks inside a directory are
/// managed when they point at a regular file and never descended into.
pub fn expand_managed_path(path: &Path) -> Vec<PathBuf> {
    if !path.is_dir() {
        return vec![path.to_path_buf()];
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(entry) if entry.path_is_symlink() => {
                if entry.path().is_file() {
                    files.push(entry.into_path());
                } else {
                    debug!(path = %entry.path().display(), "Skipping symlink that is not a file");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), "Skipping unreadable entry: {}", e),
        }
    }
    files
}

/// Handler that records file changes in the store
struct StoreHandler {
    store: Arc<dyn VersionedStore>,
}

impl StoreHandler {
    /// Read the file as it is right now and save it
    async fn capture(&self, path: &Path) -> Result<()> {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("Unable to read {}", path.display()))?;

        self.store
            .save(&repository_name(path), &content)
            .await
            .with_context(|| format!("Unable to save {}", path.display()))
    }
}

#[async_trait]
impl WatchHandler for StoreHandler {
    async fn on_change(&self, path: &Path) {
        info!(path = %path.display(), "File change detected");

        if let Err(e) = self.capture(path).await {
            if is_not_found(&e) {
                // The next write or the recreation will be picked up again
                warn!(path = %path.display(), "File vanished before it could be read");
            } else {
                error!(path = %path.display(), "{:#}", e);
            }
        }
    }

    async fn on_delete(&self, path: &Path) {
        info!(path = %path.display(), "File deletion detected");

        if let Err(e) = self.store.delete(&repository_name(path)).await {
            error!(path = %path.display(), "Unable to record deletion: {:#}", e);
        }
    }
}

fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == ErrorKind::NotFound)
}

/// Orchestrates observer registrations and store writes
pub struct Processor {
    observer: Arc<dyn ChangeObserver>,
    store: Arc<dyn VersionedStore>,
    handler: Arc<StoreHandler>,
}

impl Processor {
    pub fn new(observer: Arc<dyn ChangeObserver>, store: Arc<dyn VersionedStore>) -> Self {
        let handler = Arc::new(StoreHandler {
            store: store.clone(),
        });

        Self {
            observer,
            store,
            handler,
        }
    }

    /// Start mirroring `path`, a file or a directory (expanded recursively)
    pub async fn manage(&self, path: &Path) -> ManageSummary {
        let mut summary = ManageSummary::default();

        if !path.is_absolute() {
            warn!(path = %path.display(), "Only absolute paths are supported");
            summary.rejected.push(path.to_path_buf());
            return summary;
        }

        let path = path.clean();

        let files = if path.is_dir() {
            info!(path = %path.display(), "Scan directory...");
            let root = path.clone();
            tokio::task::spawn_blocking(move || expand_managed_path(&root))
                .await
                .unwrap_or_else(|e| {
                    error!(path = %path.display(), "Directory scan failed: {}", e);
                    Vec::new()
                })
        } else {
            vec![path]
        };

        for file in files {
            summary.merge(self.manage_file(file).await);
        }
        summary
    }

    async fn manage_file(&self, path: PathBuf) -> ManageSummary {
        let mut summary = ManageSummary::default();

        info!(path = %path.display(), "Overwatch file");
        if let Err(e) = self.observer.watch(&path, self.handler.clone()).await {
            error!(path = %path.display(), "Unable to watch file: {:#}", e);
            summary.failed.push((path, format!("{:#}", e)));
            return summary;
        }

        // Initial capture of the current state
        match self.handler.capture(&path).await {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                info!(path = %path.display(), "File does not exist yet, waiting for it");
            }
            Err(e) => error!(path = %path.display(), "Unable to save file: {:#}", e),
        }

        summary.watched.push(path);
        summary
    }

    /// Stop mirroring `path`; recorded history is kept
    pub async fn unmanage(&self, path: &Path) -> Result<()> {
        let path = path.clean();
        let mut errors = Vec::new();

        let files = tokio::task::spawn_blocking(move || expand_managed_path(&path))
            .await
            .context("Directory scan failed")?;

        for file in files {
            if let Err(e) = self.observer.unwatch(&file).await {
                errors.push(e);
            }
        }

        combine_errors(errors)
    }

    /// Final publish, then close the observer. Both always run.
    pub async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();

        info!("Synchronize storage...");
        match self.store.publish().await {
            Ok(()) => info!("Synchronization finished successfully"),
            Err(e) => errors.push(e.context("Final publish failed")),
        }

        if let Err(e) = self.observer.close().await {
            errors.push(e.context("Closing the file watcher failed"));
        }

        combine_errors(errors)
    }
}

/// Fold several errors into one, keeping every message
pub fn combine_errors(errors: Vec<anyhow::Error>) -> Result<()> {
    let mut errors = errors.into_iter();
    let Some(first) = errors.next() else {
        return Ok(());
    };

    let rest: Vec<String> = errors.map(|e| format!("{:#}", e)).collect();
    if rest.is_empty() {
        return Err(first);
    }

    Err(anyhow!("{:#}; {}", first, rest.join("; ")))
}
