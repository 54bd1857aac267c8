//! Batch install progress tracking
//!
//! Tracks a batch of extension identifiers being installed or updated,
//! records per-item status and log lines, and renders the aggregate view
//! through a [`ProgressSurface`]. Percent-style progress messages overwrite
//! the most recent progress line instead of appending, so a download does
//! not grow the log unboundedly.
//!
//! `run_batch` drives the batch through a semaphore-bounded worker pool: a
//! failure in one item is recorded on its own entry and never cancels
//! siblings.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Default concurrency for interactive batches
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Concurrency when running silently in the background
pub const SILENT_CONCURRENCY: usize = 1;

/// Status of one batch item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Progress record for one extension id
#[derive(Debug, Clone)]
pub struct ProgressEntry {
    pub id: String,
    pub status: ItemStatus,
    pub messages: Vec<String>,
    last_is_progress: bool,
}

impl ProgressEntry {
    fn new(id: String) -> Self {
        Self {
            id,
            status: ItemStatus::Pending,
            messages: Vec::new(),
            last_is_progress: false,
        }
    }
}

/// Display surface for batch progress
///
/// `cursor_entry` lets the surface report which entry is under the viewer's
/// current position so the queue can expose that entry's log.
pub trait ProgressSurface: Send + Sync {
    /// Redraw with the current entries
    fn render(&self, entries: &[ProgressEntry]);

    /// Index of the entry under the viewer's cursor, if any
    fn cursor_entry(&self) -> Option<usize> {
        None
    }
}

/// Outcome of a batch run
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Ids that completed successfully
    pub succeeded: Vec<String>,

    /// Ids that failed, with their error messages
    pub failed: Vec<(String, String)>,
}

impl BatchResult {
    /// Whether every item completed
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Batch install progress tracker
#[derive(Clone)]
pub struct InstallQueue {
    entries: Arc<Mutex<Vec<ProgressEntry>>>,
    surface: Option<Arc<dyn ProgressSurface>>,
    silent: bool,
}

impl Default for InstallQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallQueue {
    /// Create a queue without a display surface
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            surface: None,
            silent: false,
        }
    }

    /// Attach a display surface
    pub fn with_surface(mut self, surface: Arc<dyn ProgressSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    /// Mark the queue as silent (background) mode
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Concurrency cap for this queue
    pub fn concurrency(&self) -> usize {
        if self.silent {
            SILENT_CONCURRENCY
        } else {
            DEFAULT_CONCURRENCY
        }
    }

    /// Reset the tracked batch to the given ids, all pending
    pub fn set_extensions(&self, ids: &[String]) {
        {
            let mut entries = self.lock();
            entries.clear();
            entries.extend(ids.iter().cloned().map(ProgressEntry::new));
        }
        self.rerender();
    }

    /// Mark an id as running
    pub fn start_progress(&self, id: &str) {
        self.with_entry(id, |entry| {
            entry.status = ItemStatus::Running;
        });
    }

    /// Append a log line; progress lines overwrite the previous progress line
    pub fn add_message(&self, id: &str, text: &str, is_progress: bool) {
        self.with_entry(id, |entry| {
            if is_progress && entry.last_is_progress {
                if let Some(last) = entry.messages.last_mut() {
                    *last = text.to_string();
                }
            } else {
                entry.messages.push(text.to_string());
            }
            entry.last_is_progress = is_progress;
        });
    }

    /// Mark an id as finished
    pub fn finish_progress(&self, id: &str, success: bool) {
        self.with_entry(id, |entry| {
            entry.status = if success {
                ItemStatus::Success
            } else {
                ItemStatus::Failed
            };
        });
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<ProgressEntry> {
        self.lock().clone()
    }

    /// Log lines of the entry under the surface's cursor
    pub fn log_under_cursor(&self) -> Option<Vec<String>> {
        let index = self.surface.as_ref()?.cursor_entry()?;
        self.lock().get(index).map(|e| e.messages.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProgressEntry>> {
        self.entries.lock().expect("queue lock poisoned")
    }

    fn with_entry(&self, id: &str, f: impl FnOnce(&mut ProgressEntry)) {
        {
            let mut entries = self.lock();
            match entries.iter_mut().find(|e| e.id == id) {
                Some(entry) => f(entry),
                None => warn!("No progress entry for {id}"),
            }
        }
        self.rerender();
    }

    fn rerender(&self) {
        if let Some(surface) = &self.surface {
            surface.render(&self.lock().clone());
        }
    }

    /// Run `worker` over `ids` with at most `concurrency` in flight
    ///
    /// Each id gets its own progress entry; failures are isolated per item.
    pub async fn run_batch<F, Fut>(
        &self,
        ids: Vec<String>,
        concurrency: usize,
        worker: F,
    ) -> BatchResult
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.set_extensions(&ids);

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for id in ids {
            let semaphore = Arc::clone(&semaphore);
            let queue = self.clone();
            let fut = worker(id.clone());
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore closed");
                queue.start_progress(&id);
                let result = fut.await;
                match result {
                    Ok(()) => {
                        queue.finish_progress(&id, true);
                        (id, None)
                    }
                    Err(e) => {
                        let message = format!("{e:#}");
                        queue.add_message(&id, &message, false);
                        queue.finish_progress(&id, false);
                        warn!("Batch item {id} failed: {message}");
                        (id, Some(message))
                    }
                }
            });
        }

        let mut result = BatchResult::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, None)) => result.succeeded.push(id),
                Ok((id, Some(message))) => result.failed.push((id, message)),
                Err(e) => warn!("Batch task panicked: {e}"),
            }
        }
        debug!(
            "Batch finished: {} ok, {} failed",
            result.succeeded.len(),
            result.failed.len()
        );
        result
    }
}
