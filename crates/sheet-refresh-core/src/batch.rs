//! Sequential batch execution.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::clock::{CancelToken, Clock, SystemClock};
use crate::operation::{FileRefreshOperation, FileRefreshResult, RefreshStatus};
use crate::panic_message;
use crate::request::{display_name, BatchItem, RefreshSettings};
use crate::session::SessionFactory;

/// Progress callbacks. Invoked on the thread running the batch; forwarding to
/// a UI thread is up to the implementor.
pub trait RefreshObserver: Send + Sync {
    fn on_file_started(&self, _path: &Path, _index: usize, _total: usize) {}

    fn on_file_completed(&self, _path: &Path, _result: &FileRefreshResult) {}

    fn on_batch_finished(&self, _batch: &BatchResult) {}
}

impl RefreshObserver for () {}

/// Aggregate outcome of one batch, results in input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub results: Vec<FileRefreshResult>,
    pub succeeded_count: usize,
    /// Files that ended in `Error` or `TimedOut`.
    pub failed_count: usize,
    pub skipped_count: usize,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl BatchResult {
    pub fn new(
        results: Vec<FileRefreshResult>,
        started_at: DateTime<Local>,
        finished_at: DateTime<Local>,
    ) -> Self {
        let count = |wanted: fn(RefreshStatus) -> bool| {
            results.iter().filter(|r| wanted(r.status)).count()
        };
        Self {
            succeeded_count: count(|s| s == RefreshStatus::Success),
            failed_count: count(RefreshStatus::is_failure),
            skipped_count: count(|s| s == RefreshStatus::Skipped),
            results,
            started_at,
            finished_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count > 0
    }
}

/// Runs files one at a time, each against a fresh session.
pub struct BatchRunner {
    factory: Arc<dyn SessionFactory>,
    settings: RefreshSettings,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn RefreshObserver>,
}

impl BatchRunner {
    pub fn new(factory: impl SessionFactory + 'static, settings: RefreshSettings) -> Self {
        Self {
            factory: Arc::new(factory),
            settings,
            clock: Arc::new(SystemClock),
            observer: Arc::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RefreshObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    /// Process `items` in order.
    ///
    /// Never fails: every item gets exactly one result. After `cancel` fires,
    /// the in-flight file is closed and the rest are reported as skipped.
    pub fn run(&self, items: &[BatchItem], cancel: &CancelToken) -> BatchResult {
        let started_at = Local::now();
        let total = items.len();
        if total == 0 {
            tracing::info!("Batch is empty, nothing to refresh");
            let batch = BatchResult::new(Vec::new(), started_at, Local::now());
            self.observer.on_batch_finished(&batch);
            return batch;
        }

        tracing::info!(files = total, "Starting refresh batch");
        let mut results = Vec::with_capacity(total);
        for (index, item) in items.iter().enumerate() {
            self.observer.on_file_started(&item.path, index, total);
            let result = self.run_item(item, index, total, cancel);
            self.observer.on_file_completed(&item.path, &result);
            results.push(result);
        }

        let batch = BatchResult::new(results, started_at, Local::now());
        tracing::info!(
            succeeded = batch.succeeded_count,
            failed = batch.failed_count,
            skipped = batch.skipped_count,
            "Refresh batch finished"
        );
        self.observer.on_batch_finished(&batch);
        batch
    }

    fn run_item(
        &self,
        item: &BatchItem,
        index: usize,
        total: usize,
        cancel: &CancelToken,
    ) -> FileRefreshResult {
        let name = display_name(&item.path);
        if cancel.is_cancelled() {
            return FileRefreshResult::skipped(&item.path, "batch cancelled");
        }
        if let Some(reason) = &item.exclusion {
            tracing::info!(file = %name, %reason, "Skipping file");
            return FileRefreshResult::skipped(&item.path, reason.clone());
        }

        tracing::info!(file = %name, position = index + 1, total, "Refreshing file");
        let request = self.settings.request_for(&item.path, item.timeout_seconds);
        let clock = self.clock.as_ref();

        // A panicking session must not take the rest of the batch down with it.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let session = self.factory.create();
            FileRefreshOperation::new(request, clock, cancel).run(session)
        }));
        outcome.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(file = %name, panic = %message, "Refresh panicked");
            FileRefreshResult::failed(&item.path, format!("Refresh panicked: {message}"))
        })
    }
}
