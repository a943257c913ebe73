//! The control surface exposed to front ends: schedule control plus manual
//! batch runs, safe to call from any thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;

use crate::batch::{BatchResult, BatchRunner};
use crate::clock::{lock, CancelToken, Clock};
use crate::error::ScheduleError;
use crate::request::BatchItem;
use crate::schedule::{Schedule, TimeOfDay};
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Produces the files for a scheduled batch, read fresh at each trigger.
pub type FileSource = Arc<dyn Fn() -> Vec<BatchItem> + Send + Sync>;

struct Batches {
    runner: BatchRunner,
    // Held for a whole batch so manual and scheduled runs never overlap.
    gate: Mutex<()>,
    current: Mutex<Option<CancelToken>>,
    shutting_down: AtomicBool,
}

impl Batches {
    fn run(&self, items: &[BatchItem]) -> BatchResult {
        let _gate = lock(&self.gate);
        let cancel = CancelToken::new();
        {
            let mut current = lock(&self.current);
            if self.shutting_down.load(Ordering::SeqCst) {
                cancel.cancel();
            }
            *current = Some(cancel.clone());
        }
        let result = self.runner.run(items, &cancel);
        *lock(&self.current) = None;
        result
    }

    fn cancel(&self) -> bool {
        match lock(&self.current).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Refuse new batches and cancel the current one.
    fn close(&self) {
        let current = lock(&self.current);
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(token) = current.as_ref() {
            token.cancel();
        }
    }
}

pub struct RefreshService {
    batches: Arc<Batches>,
    scheduler: Scheduler,
}

impl RefreshService {
    pub fn new<F>(runner: BatchRunner, schedule: Schedule, files: F) -> Self
    where
        F: Fn() -> Vec<BatchItem> + Send + Sync + 'static,
    {
        Self::with_scheduler_options(runner, schedule, files, SchedulerConfig::default(), None)
    }

    /// Like [`new`](Self::new) with explicit scheduler tuning and clock.
    pub fn with_scheduler_options<F>(
        runner: BatchRunner,
        schedule: Schedule,
        files: F,
        config: SchedulerConfig,
        clock: Option<Arc<dyn Clock>>,
    ) -> Self
    where
        F: Fn() -> Vec<BatchItem> + Send + Sync + 'static,
    {
        let batches = Arc::new(Batches {
            runner,
            gate: Mutex::new(()),
            current: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        });

        let source: FileSource = Arc::new(files);
        let scheduled = Arc::clone(&batches);
        let mut scheduler = Scheduler::new(schedule, move || {
            if scheduled.shutting_down.load(Ordering::SeqCst) {
                return Ok(());
            }
            let items = source();
            let batch = scheduled.run(&items);
            if batch.has_failures() {
                return Err(format!(
                    "{} of {} files failed",
                    batch.failed_count,
                    batch.results.len()
                )
                .into());
            }
            Ok(())
        })
        .with_config(config);
        if let Some(clock) = clock {
            scheduler = scheduler.with_clock(clock);
        }

        Self { batches, scheduler }
    }

    pub fn start_scheduler(&self) {
        self.scheduler.start();
    }

    /// Set a single daily time and start.
    pub fn start_scheduler_at(&self, time: &str) -> Result<(), ScheduleError> {
        let time: TimeOfDay = time.parse()?;
        self.scheduler.set_time(time);
        self.scheduler.start();
        Ok(())
    }

    pub fn stop_scheduler(&self) {
        self.scheduler.stop();
    }

    pub fn set_schedule_time(&self, time: &str) -> Result<(), ScheduleError> {
        self.scheduler.set_time(time.parse()?);
        Ok(())
    }

    pub fn set_schedule_times<S: AsRef<str>>(
        &self,
        times: impl IntoIterator<Item = S>,
    ) -> Result<(), ScheduleError> {
        self.scheduler.set_times(times)
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn next_run_time(&self) -> Option<NaiveDateTime> {
        self.scheduler.next_run_time()
    }

    pub fn schedule(&self) -> Schedule {
        self.scheduler.schedule()
    }

    /// Run a batch now on the calling thread. Waits for any batch already in
    /// progress to finish first.
    pub fn run_batch(&self, items: &[BatchItem]) -> BatchResult {
        self.batches.run(items)
    }

    /// Cancel the batch in progress, if any. Returns whether one was running.
    pub fn cancel_batch(&self) -> bool {
        let cancelled = self.batches.cancel();
        if cancelled {
            tracing::info!("Cancelling refresh batch in progress");
        }
        cancelled
    }

    /// Cancel any batch, stop the scheduler and wait until the in-flight
    /// session has been closed.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down refresh service");
        self.batches.close();
        self.scheduler.stop();
        drop(lock(&self.batches.gate));
    }
}
