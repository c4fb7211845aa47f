//! Progress records and the broadcaster that serializes their updates.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

/// Progress record of one running unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadInfo {
    /// Unique record id.
    pub id: Uuid,
    /// Display name. Not unique across parts of one logical file.
    pub name: String,
    /// Fraction complete, in `[0, 1]`.
    pub progress: f64,
}

/// Trait for receiving progress updates from transfers.
///
/// All methods have default no-op implementations for convenience.
pub trait DownloadProgress: Send + Sync {
    /// Called when a transfer starts.
    fn on_start(&self, _name: &str) {}

    /// Called with the fraction complete after each batch window.
    fn on_progress(&self, _name: &str, _progress: f64) {}

    /// Called when a transfer fails.
    fn on_error(&self, _name: &str, _error: &str) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl DownloadProgress for NoProgress {}

/// Ordered collection of progress records with a single mutation point.
///
/// Every mutation goes through the inner watch sender, so observers always
/// see a whole list that existed at some point, never a torn record.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    tx: Arc<watch::Sender<Vec<DownloadInfo>>>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    /// Creates an empty broadcaster.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx: Arc::new(tx) }
    }

    /// Appends a new record at progress 0 and returns its id.
    pub fn add(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.tx.send_modify(|downloads| {
            downloads.push(DownloadInfo {
                id,
                name: name.to_string(),
                progress: 0.0,
            });
        });
        id
    }

    /// Updates the first record named `name`.
    ///
    /// When several in-flight records share a name only the first one moves.
    /// Progress never goes backwards, so late updates are dropped.
    pub fn update(&self, name: &str, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        self.tx.send_if_modified(|downloads| {
            match downloads.iter_mut().find(|d| d.name == name) {
                Some(info) if progress > info.progress => {
                    info.progress = progress;
                    true
                }
                _ => false,
            }
        });
    }

    /// Removes every record.
    pub fn remove_all(&self) {
        self.tx.send_modify(Vec::clear);
    }

    /// Returns a copy of the current records.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DownloadInfo> {
        self.tx.borrow().clone()
    }

    /// Returns a read-only view that is notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<DownloadInfo>> {
        self.tx.subscribe()
    }
}

impl DownloadProgress for ProgressBroadcaster {
    fn on_start(&self, name: &str) {
        self.add(name);
    }

    fn on_progress(&self, name: &str, progress: f64) {
        self.update(name, progress);
    }

    fn on_error(&self, name: &str, error: &str) {
        log::warn!("Transfer {name} failed: {error}");
    }
}
