//! Handles for watched paths.

use tokio::sync::mpsc;

use crate::future::BridgeFuture;
use crate::path::FilePath;

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
    Other,
}

impl ChangeKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "create" | "created" => ChangeKind::Created,
            "modify" | "modified" | "write" | "chmod" => ChangeKind::Modified,
            "remove" | "removed" => ChangeKind::Removed,
            "rename" | "renamed" => ChangeKind::Renamed,
            _ => ChangeKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: FilePath,
    pub kind: ChangeKind,
}

/// A live watch on one path.  Dropping it stops the watch on the helper.
pub struct FilePathWatcher {
    id: u64,
    path: FilePath,
    registration: BridgeFuture<()>,
    events: mpsc::UnboundedReceiver<WatchEvent>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl FilePathWatcher {
    pub(crate) fn new(
        id: u64,
        path: FilePath,
        registration: BridgeFuture<()>,
        events: mpsc::UnboundedReceiver<WatchEvent>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id,
            path,
            registration,
            events,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &FilePath {
        &self.path
    }

    /// The helper's acknowledgement of the watch.
    pub fn registration(&self) -> &BridgeFuture<()> {
        &self.registration
    }

    /// The next event, if one is queued.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.events.try_recv().ok()
    }

    /// Block until the next event.  `None` once the transport is gone.
    ///
    /// Must not be called from an async context.
    pub fn next_blocking(&mut self) -> Option<WatchEvent> {
        self.events.blocking_recv()
    }

    /// Await the next event.  `None` once the transport is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for FilePathWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePathWatcher")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for FilePathWatcher {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}
