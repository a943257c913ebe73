//! Background daily trigger loop.
//!
//! The loop wakes every `tick`, compares the wall clock against the next fire
//! time and invokes the trigger when it is due. All control operations go
//! through one lock around [`ScheduleState`], so `set_time` takes effect on
//! the loop's next wake without a restart.

use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::NaiveDateTime;

use crate::clock::{lock, CancelToken, Clock, SystemClock};
use crate::error::ScheduleError;
use crate::panic_message;
use crate::schedule::{Schedule, TimeOfDay};

pub type TriggerError = Box<dyn Error + Send + Sync>;

type Trigger = Arc<dyn Fn() -> Result<(), TriggerError> + Send + Sync>;

pub const DEFAULT_TICK: Duration = Duration::from_millis(500);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CATCH_UP_GRACE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Length of each interruptible sleep.
    pub tick: Duration,
    /// How long `stop` waits for the loop thread before detaching it.
    pub join_timeout: Duration,
    /// A fire time noticed this late still fires; later than this it is
    /// skipped as missed.
    pub catch_up_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            catch_up_grace: DEFAULT_CATCH_UP_GRACE,
        }
    }
}

/// Snapshot of the scheduler's shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub schedule: Schedule,
    pub running: bool,
    pub next_fire_at: Option<NaiveDateTime>,
}

struct Worker {
    handle: JoinHandle<()>,
    stop: CancelToken,
    done: mpsc::Receiver<()>,
}

pub struct Scheduler {
    state: Arc<Mutex<ScheduleState>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    trigger: Trigger,
    // Held for the duration of every trigger call. A loop detached by a
    // timed-out stop can still be mid-trigger when a new loop starts.
    firing: Arc<Mutex<()>>,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    pub fn new<F>(schedule: Schedule, trigger: F) -> Self
    where
        F: Fn() -> Result<(), TriggerError> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(ScheduleState {
                schedule,
                running: false,
                next_fire_at: None,
            })),
            clock: Arc::new(SystemClock),
            config: SchedulerConfig::default(),
            trigger: Arc::new(trigger),
            firing: Arc::new(Mutex::new(())),
            worker: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the loop. Does nothing if it is already running.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            tracing::debug!("Scheduler already running");
            return;
        }

        {
            let mut state = lock(&self.state);
            let next = state.schedule.next_after(self.clock.local_now());
            state.running = true;
            state.next_fire_at = Some(next);
            tracing::info!(schedule = %state.schedule, next_run = %next, "Scheduler started");
        }

        let stop = CancelToken::new();
        let (done_tx, done) = mpsc::channel();
        let run = RunLoop {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            config: self.config,
            trigger: Arc::clone(&self.trigger),
            firing: Arc::clone(&self.firing),
            stop: stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("refresh-scheduler".into())
            .spawn(move || {
                run.run();
                let _ = done_tx.send(());
            });

        match handle {
            Ok(handle) => *worker = Some(Worker { handle, stop, done }),
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn scheduler thread");
                let mut state = lock(&self.state);
                state.running = false;
                state.next_fire_at = None;
            }
        }
    }

    /// Signal the loop to exit and wait up to the join timeout for it.
    ///
    /// Returns once the loop has exited or the timeout passed; in the latter
    /// case the thread is left to finish its current trigger on its own.
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        {
            let mut state = lock(&self.state);
            state.running = false;
            state.next_fire_at = None;
        }
        worker.stop.cancel();

        match worker.done.recv_timeout(self.config.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    tracing::error!("Scheduler thread panicked");
                }
                tracing::info!("Scheduler stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_secs = self.config.join_timeout.as_secs(),
                    "Scheduler thread did not exit in time, detaching"
                );
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Replace the schedule with a single daily time.
    pub fn set_time(&self, time: TimeOfDay) {
        self.set_schedule(Schedule::daily(time));
    }

    /// Replace the schedule with `HH:MM` strings. On error the current
    /// schedule is kept.
    pub fn set_times<S: AsRef<str>>(
        &self,
        times: impl IntoIterator<Item = S>,
    ) -> Result<(), ScheduleError> {
        let schedule = Schedule::parse(times)?;
        self.set_schedule(schedule);
        Ok(())
    }

    pub fn set_schedule(&self, schedule: Schedule) {
        let mut state = lock(&self.state);
        if state.running {
            let next = schedule.next_after(self.clock.local_now());
            tracing::info!(schedule = %schedule, next_run = %next, "Schedule changed");
            state.next_fire_at = Some(next);
        }
        state.schedule = schedule;
    }

    pub fn schedule(&self) -> Schedule {
        lock(&self.state).schedule.clone()
    }

    /// Next fire time while running.
    pub fn next_run_time(&self) -> Option<NaiveDateTime> {
        let state = lock(&self.state);
        state.next_fire_at.filter(|_| state.running)
    }

    pub fn state(&self) -> ScheduleState {
        lock(&self.state).clone()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RunLoop {
    state: Arc<Mutex<ScheduleState>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    trigger: Trigger,
    firing: Arc<Mutex<()>>,
    stop: CancelToken,
}

impl RunLoop {
    fn run(&self) {
        while !self.stop.is_cancelled() {
            if let Some(due) = self.take_due() {
                let late = self.clock.local_now() - due;
                let grace = chrono::Duration::from_std(self.config.catch_up_grace)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                if late <= grace {
                    self.fire(due);
                } else {
                    tracing::warn!(
                        due = %due,
                        late_minutes = late.num_minutes(),
                        "Missed scheduled refresh, waiting for the next one"
                    );
                }
                continue;
            }
            if self.clock.sleep(self.config.tick, &self.stop) {
                break;
            }
        }
        tracing::debug!("Scheduler loop exited");
    }

    /// If the next fire time has passed, advance it and return the old one.
    fn take_due(&self) -> Option<NaiveDateTime> {
        let now = self.clock.local_now();
        let mut state = lock(&self.state);
        match state.next_fire_at {
            Some(at) if state.running && now >= at => {
                let next = state.schedule.next_after(now);
                state.next_fire_at = Some(next);
                Some(at)
            }
            _ => None,
        }
    }

    fn fire(&self, due: NaiveDateTime) {
        let _firing = lock(&self.firing);
        if self.stop.is_cancelled() {
            return;
        }
        tracing::info!(due = %due, "Scheduled refresh triggered");
        let trigger = &self.trigger;
        match panic::catch_unwind(AssertUnwindSafe(|| trigger())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Scheduled refresh failed"),
            Err(payload) => tracing::error!(
                panic = %panic_message(payload.as_ref()),
                "Scheduled refresh panicked"
            ),
        }
    }
}
