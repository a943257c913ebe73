//! Adaptive detection of background refresh completion.
//!
//! The engine gives no reliable signal that asynchronous data loads are done,
//! so completion is inferred from the workbook itself: once the total used-row
//! count stops changing for a number of consecutive samples, the refresh is
//! considered finished. A hard timeout bounds the wait.

use std::time::Duration;

use serde::Serialize;

use crate::clock::{CancelToken, Clock};
use crate::error::SessionError;
use crate::request::RefreshRequest;
use crate::session::{wait_for_idle, HostSession};

/// How the wait for a refresh ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Row count held steady for the full stability window.
    Stable,
    /// Row counting was unavailable; the engine reported idle instead.
    Idle,
    TimedOut,
    Cancelled,
}

/// One row-count measurement, timestamped relative to the start of the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSample {
    pub at: Duration,
    pub rows: u64,
}

/// Counts consecutive unchanged samples.
///
/// The first sample is compared against the baseline (the row count measured
/// before the refresh started) when there is one, so a workbook whose row
/// count never changes still needs a full stability window.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    previous: Option<u64>,
    stable_count: u32,
    threshold: u32,
}

impl StabilityTracker {
    pub fn new(threshold: u32, baseline: Option<u64>) -> Self {
        Self {
            previous: baseline,
            stable_count: 0,
            threshold,
        }
    }

    /// Record a sample; returns `true` once the threshold is reached.
    pub fn observe(&mut self, rows: u64) -> bool {
        if self.previous == Some(rows) {
            self.stable_count += 1;
        } else {
            self.stable_count = 0;
        }
        self.previous = Some(rows);
        self.is_stable()
    }

    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    pub fn is_stable(&self) -> bool {
        self.stable_count >= self.threshold
    }
}

/// Outcome of [`CompletionDetector::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorReport {
    pub completion: Completion,
    pub samples: Vec<RowSample>,
    pub elapsed: Duration,
}

impl DetectorReport {
    /// Row count of the most recent successful sample.
    pub fn last_rows(&self) -> Option<u64> {
        self.samples.last().map(|s| s.rows)
    }
}

pub struct CompletionDetector<'a> {
    clock: &'a dyn Clock,
    cancel: &'a CancelToken,
    interval: Duration,
    idle_poll: Duration,
    threshold: u32,
    timeout: Duration,
}

impl<'a> CompletionDetector<'a> {
    pub fn new(request: &RefreshRequest, clock: &'a dyn Clock, cancel: &'a CancelToken) -> Self {
        Self {
            clock,
            cancel,
            interval: request.row_check_interval,
            idle_poll: request.idle_poll_interval,
            threshold: request.stable_count_threshold,
            timeout: request.timeout,
        }
    }

    /// Sample until stable, timed out or cancelled.
    ///
    /// If the row count cannot be measured the detector gives up on sampling
    /// and waits for the engine to report idle for the remaining time.
    pub fn wait(&self, session: &mut dyn HostSession, baseline: Option<u64>) -> DetectorReport {
        let started = self.clock.now();
        let mut tracker = StabilityTracker::new(self.threshold, baseline);
        let mut samples = Vec::new();

        let completion = loop {
            if self.cancel.is_cancelled() {
                break Completion::Cancelled;
            }

            let at = self.clock.now().saturating_duration_since(started);
            match session.measure_row_count() {
                Ok(rows) => {
                    samples.push(RowSample { at, rows });
                    let stable = tracker.observe(rows);
                    tracing::debug!(
                        rows,
                        stable_count = tracker.stable_count(),
                        elapsed_secs = at.as_secs(),
                        "Row count sample"
                    );
                    if stable {
                        break Completion::Stable;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Row count unavailable, falling back to engine idle state"
                    );
                    break self.fall_back_to_idle(session, self.timeout.saturating_sub(at));
                }
            }

            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed >= self.timeout {
                break Completion::TimedOut;
            }
            if self
                .clock
                .sleep(self.interval.min(self.timeout - elapsed), self.cancel)
            {
                break Completion::Cancelled;
            }
        };

        DetectorReport {
            completion,
            samples,
            elapsed: self.clock.now().saturating_duration_since(started),
        }
    }

    fn fall_back_to_idle(&self, session: &mut dyn HostSession, remaining: Duration) -> Completion {
        match wait_for_idle(session, self.clock, self.cancel, self.idle_poll, remaining) {
            Ok(()) => Completion::Idle,
            Err(SessionError::Cancelled) => Completion::Cancelled,
            Err(_) => Completion::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{start_time, Call, ScriptedSession};
    use proptest::prelude::*;

    fn request() -> RefreshRequest {
        RefreshRequest::new("book.xlsx")
            .with_row_check_interval(Duration::from_secs(5))
            .with_stable_count_threshold(3)
            .with_timeout(Duration::from_secs(3600))
    }

    #[test]
    fn test_unchanged_rows_need_full_window() {
        let clock = ManualClock::auto_advancing(start_time());
        let cancel = CancelToken::new();
        let mut session = ScriptedSession::new().with_rows([10, 10, 10, 10]);

        let report = CompletionDetector::new(&request(), &clock, &cancel).wait(&mut session, Some(10));

        assert_eq!(report.completion, Completion::Stable);
        assert_eq!(report.samples.len(), 3);
        assert_eq!(report.samples[2].at, Duration::from_secs(10));
        assert_eq!(report.elapsed, Duration::from_secs(10));
    }

    #[test]
    fn test_growth_then_plateau_completes_on_fourth_equal_sample() {
        let clock = ManualClock::auto_advancing(start_time());
        let cancel = CancelToken::new();
        let mut session = ScriptedSession::new().with_rows([100, 150, 180, 180, 180, 180, 180]);

        let report = CompletionDetector::new(&request(), &clock, &cancel).wait(&mut session, Some(100));

        assert_eq!(report.completion, Completion::Stable);
        let rows: Vec<u64> = report.samples.iter().map(|s| s.rows).collect();
        assert_eq!(rows, vec![100, 150, 180, 180, 180, 180]);
    }

    #[test]
    fn test_without_baseline_first_sample_counts_zero() {
        let clock = ManualClock::auto_advancing(start_time());
        let cancel = CancelToken::new();
        let mut session = ScriptedSession::new().with_rows([10]);

        let report = CompletionDetector::new(&request(), &clock, &cancel).wait(&mut session, None);

        assert_eq!(report.completion, Completion::Stable);
        assert_eq!(report.samples.len(), 4);
        assert_eq!(report.elapsed, Duration::from_secs(15));
    }

    #[test]
    fn test_times_out_while_rows_keep_growing() {
        let clock = ManualClock::auto_advancing(start_time());
        let cancel = CancelToken::new();
        let mut session = ScriptedSession::new().with_rows(0..1000);
        let request = request().with_timeout(Duration::from_secs(12));

        let report = CompletionDetector::new(&request, &clock, &cancel).wait(&mut session, Some(0));

        assert_eq!(report.completion, Completion::TimedOut);
        // samples at 0, 5, 10 and at the 12s deadline
        assert_eq!(report.samples.len(), 4);
        assert_eq!(report.elapsed, Duration::from_secs(12));
        assert_eq!(report.last_rows(), Some(3));
    }

    #[test]
    fn test_measure_failure_falls_back_to_idle() {
        let clock = ManualClock::auto_advancing(start_time());
        let cancel = CancelToken::new();
        let mut session = ScriptedSession::new()
            .with_idle_after(2)
            .failing(Call::Measure, || SessionError::engine_call("UsedRowCount", "busy"));
        let log = session.log();

        let report = CompletionDetector::new(&request(), &clock, &cancel).wait(&mut session, Some(5));

        assert_eq!(report.completion, Completion::Idle);
        assert!(report.samples.is_empty());
        assert_eq!(log.count(Call::Measure), 1);
        assert_eq!(log.count(Call::IsIdle), 3);
    }

    #[test]
    fn test_idle_fallback_respects_remaining_timeout() {
        let clock = ManualClock::auto_advancing(start_time());
        let cancel = CancelToken::new();
        let mut session = ScriptedSession::new()
            .with_idle_after(u32::MAX)
            .failing(Call::Measure, || SessionError::engine_call("UsedRowCount", "busy"));
        let request = request().with_timeout(Duration::from_secs(9));

        let report = CompletionDetector::new(&request, &clock, &cancel).wait(&mut session, None);

        assert_eq!(report.completion, Completion::TimedOut);
        assert_eq!(clock.elapsed(), Duration::from_secs(9));
    }

    #[test]
    fn test_cancel_between_samples() {
        let clock = ManualClock::auto_advancing(start_time());
        let cancel = CancelToken::new();
        let mut session = ScriptedSession::new()
            .with_rows(0..100)
            .cancelling_after(2, cancel.clone());

        let report = CompletionDetector::new(&request(), &clock, &cancel).wait(&mut session, None);

        assert_eq!(report.completion, Completion::Cancelled);
        assert_eq!(report.samples.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_stable_only_after_threshold_equal_runs(
            rows in proptest::collection::vec(0u64..4, 1..40),
            threshold in 1u32..5,
        ) {
            let mut tracker = StabilityTracker::new(threshold, None);
            let mut run = 0u32;
            let mut previous = None;
            for r in rows {
                run = if previous == Some(r) { run + 1 } else { 0 };
                previous = Some(r);
                prop_assert_eq!(tracker.observe(r), run >= threshold);
            }
        }
    }
}
