//! Per-file refresh lifecycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::clock::{CancelToken, Clock};
use crate::detector::{Completion, CompletionDetector};
use crate::error::{ErrorKind, SessionError};
use crate::request::RefreshRequest;
use crate::session::{HostSession, SessionGuard};

/// Lifecycle states, in the only order they may be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    Opening,
    Refreshing,
    AwaitingCompletion,
    Saving,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Success,
    Error,
    Skipped,
    TimedOut,
}

impl RefreshStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, RefreshStatus::Error | RefreshStatus::TimedOut)
    }
}

/// Final outcome for one file. Built once when the operation closes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRefreshResult {
    pub path: PathBuf,
    pub status: RefreshStatus,
    pub message: String,
    #[serde(rename = "duration_seconds", serialize_with = "as_seconds")]
    pub duration: Duration,
    pub rows_before: u64,
    pub rows_after: u64,
    /// `rows_after - rows_before`; negative when rows disappeared.
    pub added_rows: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,
}

fn as_seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl FileRefreshResult {
    /// A file the caller chose not to refresh.
    pub fn skipped(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: RefreshStatus::Skipped,
            message: reason.into(),
            duration: Duration::ZERO,
            rows_before: 0,
            rows_after: 0,
            added_rows: 0,
            error_kind: None,
            completion: None,
        }
    }

    /// A file whose operation could not produce a result of its own.
    pub fn failed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            status: RefreshStatus::Error,
            ..Self::skipped(path, message)
        }
    }
}

/// How far the operation got, filled in as it goes so that failure paths can
/// still report row counts.
#[derive(Debug, Default)]
struct Progress {
    rows_before: Option<u64>,
    rows_after: Option<u64>,
    last_sample: Option<u64>,
    completion: Option<Completion>,
}

enum Finish {
    Completed,
    TimedOut { waited: Duration, save_error: Option<SessionError> },
}

/// Drives one file through open, refresh, wait, save and close.
///
/// The session is closed on every path out of [`run`](Self::run), including
/// panics inside the session, through a [`SessionGuard`].
pub struct FileRefreshOperation<'a> {
    request: RefreshRequest,
    clock: &'a dyn Clock,
    cancel: &'a CancelToken,
    history: Vec<OperationState>,
}

impl<'a> FileRefreshOperation<'a> {
    pub fn new(request: RefreshRequest, clock: &'a dyn Clock, cancel: &'a CancelToken) -> Self {
        Self {
            request,
            clock,
            cancel,
            history: vec![OperationState::Idle],
        }
    }

    pub fn state(&self) -> OperationState {
        self.history
            .last()
            .copied()
            .unwrap_or(OperationState::Idle)
    }

    /// Every state entered so far, oldest first.
    pub fn history(&self) -> &[OperationState] {
        &self.history
    }

    pub fn path(&self) -> &Path {
        &self.request.path
    }

    pub fn run(&mut self, session: Box<dyn HostSession>) -> FileRefreshResult {
        let name = self.request.display_name();
        let started = self.clock.now();
        let mut progress = Progress::default();
        let mut guard = SessionGuard::new(session);

        let outcome = self.drive(guard.session(), &mut progress);

        guard.release();
        self.enter(OperationState::Closed);
        let duration = self.clock.now().saturating_duration_since(started);

        let result = self.finish(outcome, progress, duration);
        match result.status {
            RefreshStatus::Success => tracing::info!(
                file = %name,
                rows_before = result.rows_before,
                rows_after = result.rows_after,
                added_rows = result.added_rows,
                duration_secs = duration.as_secs(),
                "Refresh succeeded"
            ),
            _ => tracing::warn!(
                file = %name,
                status = ?result.status,
                message = %result.message,
                "Refresh did not complete"
            ),
        }
        result
    }

    fn enter(&mut self, next: OperationState) {
        debug_assert!(next > self.state(), "{:?} -> {:?}", self.state(), next);
        tracing::trace!(file = %self.request.path.display(), state = ?next, "State change");
        self.history.push(next);
    }

    fn check_cancelled(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn drive(
        &mut self,
        session: &mut dyn HostSession,
        progress: &mut Progress,
    ) -> Result<Finish, SessionError> {
        self.check_cancelled()?;
        self.enter(OperationState::Opening);
        session.open(&self.request.path)?;

        progress.rows_before = measure(session, "before refresh");

        self.check_cancelled()?;
        self.enter(OperationState::Refreshing);
        session.trigger_refresh()?;

        self.enter(OperationState::AwaitingCompletion);
        let report = CompletionDetector::new(&self.request, self.clock, self.cancel)
            .wait(session, progress.rows_before);
        progress.completion = Some(report.completion);
        progress.last_sample = report.last_rows();

        progress.rows_after = match report.completion {
            Completion::Cancelled => return Err(SessionError::Cancelled),
            Completion::Stable => report.last_rows(),
            Completion::Idle | Completion::TimedOut => {
                measure(session, "after refresh").or(report.last_rows())
            }
        };

        self.check_cancelled()?;
        self.enter(OperationState::Saving);
        let saved = session.save();

        if report.completion == Completion::TimedOut {
            return Ok(Finish::TimedOut {
                waited: report.elapsed,
                save_error: saved.err(),
            });
        }
        saved?;
        Ok(Finish::Completed)
    }

    fn finish(
        &self,
        outcome: Result<Finish, SessionError>,
        progress: Progress,
        duration: Duration,
    ) -> FileRefreshResult {
        let rows_before = progress.rows_before.unwrap_or(0);
        let rows_after = progress
            .rows_after
            .or(progress.last_sample)
            .or(progress.rows_before)
            .unwrap_or(0);
        let added_rows = rows_after as i64 - rows_before as i64;

        let (status, message, error_kind) = match outcome {
            Ok(Finish::Completed) => (
                RefreshStatus::Success,
                format!("Refreshed: {rows_before} -> {rows_after} rows ({added_rows:+})"),
                None,
            ),
            Ok(Finish::TimedOut { waited, save_error }) => {
                let message = match save_error {
                    None => format!(
                        "Timed out after {}s waiting for refresh; partial data saved",
                        waited.as_secs()
                    ),
                    Some(e) => format!(
                        "Timed out after {}s waiting for refresh; {e}",
                        waited.as_secs()
                    ),
                };
                (RefreshStatus::TimedOut, message, Some(ErrorKind::Timeout))
            }
            Err(e) => (RefreshStatus::Error, e.to_string(), Some(e.kind())),
        };

        FileRefreshResult {
            path: self.request.path.clone(),
            status,
            message,
            duration,
            rows_before,
            rows_after,
            added_rows,
            error_kind,
            completion: progress.completion,
        }
    }
}

fn measure(session: &mut dyn HostSession, when: &str) -> Option<u64> {
    match session.measure_row_count() {
        Ok(rows) => Some(rows),
        Err(e) => {
            tracing::warn!(error = %e, "Could not count rows {when}");
            None
        }
    }
}
