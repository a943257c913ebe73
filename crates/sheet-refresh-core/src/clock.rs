//! Time source and interruptible sleeping.
//!
//! Every wait in the engine goes through a [`Clock`] together with a
//! [`CancelToken`], so a stop or cancel request wakes the sleeper immediately
//! instead of after the full interval. Tests swap in [`ManualClock`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic time, used for durations and deadlines.
    fn now(&self) -> Instant;

    /// Local wall-clock time, used for time-of-day scheduling.
    fn local_now(&self) -> NaiveDateTime;

    /// Sleep for `duration` unless `cancel` fires first.
    ///
    /// Returns `true` if the sleep ended because of cancellation.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        cancel.wait_timeout(duration)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A cloneable cancellation flag that can wake sleepers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    gate: Mutex<()>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _gate = lock(&self.inner.gate);
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block for up to `timeout`. Returns `true` if cancelled.
    ///
    /// A timeout too large to represent as an `Instant` waits for
    /// cancellation only.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut gate = lock(&self.inner.gate);
        loop {
            if self.is_cancelled() {
                return true;
            }
            gate = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.inner
                        .wake
                        .wait_timeout(gate, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .wake
                    .wait(gate)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

/// A clock that only moves when told to.
///
/// In auto-advancing mode every `sleep` moves time forward by the requested
/// amount and returns at once, which suits single-threaded code such as the
/// completion detector. In stepped mode `sleep` blocks until another thread
/// calls [`ManualClock::advance`] past the deadline, which suits the scheduler.
#[derive(Debug)]
pub struct ManualClock {
    base_instant: Instant,
    base_wall: NaiveDateTime,
    virtual_time: Mutex<VirtualTime>,
    changed: Condvar,
    auto_advance: bool,
}

#[derive(Debug, Default)]
struct VirtualTime {
    elapsed: Duration,
    sleepers: usize,
}

impl ManualClock {
    pub fn auto_advancing(start: NaiveDateTime) -> Self {
        Self::with_mode(start, true)
    }

    pub fn stepped(start: NaiveDateTime) -> Self {
        Self::with_mode(start, false)
    }

    fn with_mode(start: NaiveDateTime, auto_advance: bool) -> Self {
        Self {
            base_instant: Instant::now(),
            base_wall: start,
            virtual_time: Mutex::new(VirtualTime::default()),
            changed: Condvar::new(),
            auto_advance,
        }
    }

    /// Time passed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        lock(&self.virtual_time).elapsed
    }

    pub fn advance(&self, by: Duration) {
        let mut time = lock(&self.virtual_time);
        time.elapsed = time.elapsed.saturating_add(by);
        self.changed.notify_all();
    }

    /// Block until some thread is parked in a stepped `sleep`, so that the
    /// next `advance` is guaranteed to wake it. Returns `false` on timeout.
    pub fn wait_for_sleeper(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut time = lock(&self.virtual_time);
        while time.sleepers == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            time = self
                .changed
                .wait_timeout(time, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn local_now(&self) -> NaiveDateTime {
        self.base_wall + chrono::Duration::milliseconds(self.elapsed().as_millis() as i64)
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        if self.auto_advance {
            self.advance(duration);
            return cancel.is_cancelled();
        }

        let mut time = lock(&self.virtual_time);
        let deadline = time.elapsed.saturating_add(duration);
        time.sleepers += 1;
        self.changed.notify_all();
        while time.elapsed < deadline && !cancel.is_cancelled() {
            // Cancellation does not signal this condvar, so poll it.
            time = self
                .changed
                .wait_timeout(time, Duration::from_millis(5))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        time.sleepers -= 1;
        cancel.is_cancelled()
    }
}
