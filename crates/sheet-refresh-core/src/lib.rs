//! # sheet-refresh-core
//!
//! Orchestration engine for unattended spreadsheet refreshes.
//!
//! A batch of workbooks is pushed, one file at a time, through a host
//! spreadsheet engine: open, refresh every data connection, wait until the
//! background loads settle, save, close. The engine itself sits behind the
//! [`HostSession`] trait; this crate only decides when to do what.
//!
//! - [`FileRefreshOperation`] - per-file state machine, always closes its session
//! - [`CompletionDetector`] - adaptive "row count stopped changing" wait
//! - [`BatchRunner`] - sequential batch with per-file failure isolation
//! - [`Scheduler`] - interruptible daily trigger loop
//! - [`RefreshService`] - the thread-safe control surface tying them together
//!
//! ## Example
//!
//! ```rust,no_run
//! use sheet_refresh_core::{BatchRunner, CancelToken, HostSession, RefreshSettings};
//!
//! fn refresh(make_session: fn() -> Box<dyn HostSession>) {
//!     let runner = BatchRunner::new(make_session, RefreshSettings::default());
//!     let batch = runner.run(&["/reports/sales.xlsx".into()], &CancelToken::new());
//!     for result in &batch.results {
//!         println!("{}: {:?} ({:+} rows)", result.path.display(), result.status, result.added_rows);
//!     }
//! }
//! ```

pub mod batch;
pub mod clock;
pub mod detector;
pub mod error;
pub mod operation;
pub mod request;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod session;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use batch::{BatchResult, BatchRunner, RefreshObserver};
pub use clock::{CancelToken, Clock, ManualClock, SystemClock};
pub use detector::{Completion, CompletionDetector, DetectorReport, RowSample, StabilityTracker};
pub use error::{ErrorKind, ScheduleError, SessionError, SettingsError};
pub use operation::{FileRefreshOperation, FileRefreshResult, OperationState, RefreshStatus};
pub use request::{BatchItem, RefreshRequest, RefreshSettings};
pub use schedule::{Schedule, TimeOfDay};
pub use scheduler::{ScheduleState, Scheduler, SchedulerConfig, TriggerError};
pub use service::{FileSource, RefreshService};
pub use session::{wait_for_idle, HostSession, SessionFactory, SessionGuard};

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
