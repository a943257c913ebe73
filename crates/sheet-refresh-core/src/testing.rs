//! Scripted [`HostSession`] for unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;

use crate::clock::{lock, CancelToken};
use crate::error::SessionError;
use crate::session::HostSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Open,
    TriggerRefresh,
    Measure,
    IsIdle,
    Save,
    Close,
}

/// Shared record of the calls a session received.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn push(&self, call: Call) {
        lock(&self.0).push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.0).clone()
    }

    pub fn count(&self, call: Call) -> usize {
        lock(&self.0).iter().filter(|c| **c == call).count()
    }
}

type ErrorFn = Box<dyn Fn() -> SessionError + Send>;

pub struct ScriptedSession {
    log: CallLog,
    rows: VecDeque<u64>,
    last_rows: u64,
    idle_after: u32,
    idle_probes: u32,
    failures: Vec<(Call, ErrorFn)>,
    cancel_after_measures: Option<(usize, CancelToken)>,
    measures: usize,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self {
            log: CallLog::default(),
            rows: VecDeque::new(),
            last_rows: 0,
            idle_after: 0,
            idle_probes: 0,
            failures: Vec::new(),
            cancel_after_measures: None,
            measures: 0,
        }
    }

    /// Successive row counts; the last one repeats once exhausted.
    pub fn with_rows(mut self, rows: impl IntoIterator<Item = u64>) -> Self {
        self.rows = rows.into_iter().collect();
        self
    }

    /// `is_idle` answers false this many times before answering true.
    pub fn with_idle_after(mut self, probes: u32) -> Self {
        self.idle_after = probes;
        self
    }

    pub fn failing(
        mut self,
        call: Call,
        error: impl Fn() -> SessionError + Send + 'static,
    ) -> Self {
        self.failures.push((call, Box::new(error)));
        self
    }

    pub fn cancelling_after(mut self, measures: usize, token: CancelToken) -> Self {
        self.cancel_after_measures = Some((measures, token));
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    fn record(&self, call: Call) -> Result<(), SessionError> {
        self.log.push(call);
        match self.failures.iter().find(|(c, _)| *c == call) {
            Some((_, error)) => Err(error()),
            None => Ok(()),
        }
    }
}

impl Default for ScriptedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSession for ScriptedSession {
    fn open(&mut self, _path: &Path) -> Result<(), SessionError> {
        self.record(Call::Open)
    }

    fn trigger_refresh(&mut self) -> Result<(), SessionError> {
        self.record(Call::TriggerRefresh)
    }

    fn measure_row_count(&mut self) -> Result<u64, SessionError> {
        self.record(Call::Measure)?;
        self.measures += 1;
        if let Some((after, token)) = &self.cancel_after_measures {
            if self.measures >= *after {
                token.cancel();
            }
        }
        if let Some(rows) = self.rows.pop_front() {
            self.last_rows = rows;
        }
        Ok(self.last_rows)
    }

    fn is_idle(&mut self) -> Result<bool, SessionError> {
        self.record(Call::IsIdle)?;
        self.idle_probes = self.idle_probes.saturating_add(1);
        Ok(self.idle_probes > self.idle_after)
    }

    fn save(&mut self) -> Result<(), SessionError> {
        self.record(Call::Save)
    }

    fn close(&mut self) {
        self.log.push(Call::Close);
    }
}

pub fn start_time() -> NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(4, 0, 0)
        .unwrap()
}
