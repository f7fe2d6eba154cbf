//! Extension source change detection
//!
//! Watches the extensions folder and emits a [`ChangeEvent`] for every
//! change below an extension's `extension/` directory. Dependencies,
//! hidden directories and pipeline definitions are ignored.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};

use crate::error::ExecutionError;

/// A relevant extension file changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub paths: Vec<PathBuf>,
}

/// Whether `path` is extension source code below `root`.
///
/// Matches `<root>/**/extension/**` except anything inside `node_modules`,
/// hidden directories or a `pipelines` directory.
pub fn is_extension_source(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };

    let parts: Vec<&str> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();

    // The file itself is the last part; only directories are filtered.
    let Some((_, directories)) = parts.split_last() else {
        return false;
    };
    if directories
        .iter()
        .any(|dir| *dir == "node_modules" || *dir == "pipelines" || dir.starts_with('.'))
    {
        return false;
    }

    // `extension` must sit below an install directory, not at the root.
    directories.iter().skip(1).any(|dir| *dir == "extension")
}

/// File system watcher over the extensions folder
pub struct ExtensionWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl ExtensionWatcher {
    /// Start watching `root`. Changes arrive on the returned stream until the
    /// watcher is stopped or dropped.
    pub fn start(
        root: impl Into<PathBuf>,
    ) -> Result<(Self, UnboundedReceiverStream<ChangeEvent>), ExecutionError> {
        let root = root.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Events report canonical paths.
        let filter_root = root.canonicalize().unwrap_or_else(|_| root.clone());
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Some(change) = Self::relevant_change(&filter_root, event) {
                        let _ = event_tx.send(change);
                    }
                }
                Err(e) => error!("Notify error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| ExecutionError::Spawn(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| {
                ExecutionError::Spawn(format!("Failed to watch path {:?}: {}", root, e))
            })?;
        info!("Watching extensions in {:?}", root);

        Ok((
            Self {
                root,
                watcher: Some(watcher),
            },
            UnboundedReceiverStream::new(event_rx),
        ))
    }

    fn relevant_change(root: &Path, event: Event) -> Option<ChangeEvent> {
        if matches!(event.kind, EventKind::Access(_)) {
            return None;
        }

        let paths: Vec<PathBuf> = event
            .paths
            .into_iter()
            .filter(|path| is_extension_source(root, path))
            .collect();
        if paths.is_empty() {
            return None;
        }

        debug!("Extension source changed: {:?}", paths);
        Some(ChangeEvent { paths })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("Stopped watching extensions in {:?}", self.root);
        }
    }
}
