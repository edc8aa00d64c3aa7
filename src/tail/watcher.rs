// SPDX-License-Identifier: Apache-2.0

//! Kernel file-change notification wrapper.
//!
//! Watches each configured path directly (inotify on Linux) and pumps
//! events through a channel the coordinator drains with a bounded wait.
//! Event kinds are deliberately coarse: anything that is not a pure access
//! means "look at the file again"; the reader determines the actual state.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

pub struct PathWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
}

impl PathWatcher {
    pub fn new() -> notify::Result<Self> {
        let (tx, rx) = channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        Ok(Self { watcher, rx })
    }

    pub fn watch(&mut self, path: &Path) -> notify::Result<()> {
        self.watcher.watch(path, RecursiveMode::NonRecursive)
    }

    /// Best effort: the watch may already be gone when the inode was
    /// unlinked underneath us.
    pub fn unwatch(&mut self, path: &Path) {
        if let Err(e) = self.watcher.unwatch(path) {
            debug!(path = %path.display(), error = %e, "unwatch");
        }
    }

    /// Wait up to `timeout` for change events, then drain whatever else is
    /// queued. Returns the touched paths; empty means the wait timed out.
    pub fn wait(&self, timeout: Duration) -> Vec<PathBuf> {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Vec::new()
            }
        };

        let mut paths = Vec::new();
        let mut absorb = |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Access(_)) {
                    paths.extend(event.paths);
                }
            }
            Err(e) => warn!(error = %e, "watch event error"),
        };

        absorb(first);
        while let Ok(res) = self.rx.try_recv() {
            absorb(res);
        }

        paths.sort();
        paths.dedup();
        paths
    }
}
