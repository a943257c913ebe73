//! The host automation seam.
//!
//! A [`HostSession`] owns one external spreadsheet engine process and at most
//! one open workbook. The engine itself lives behind this trait; the refresh
//! logic only sees these operations.

use std::path::Path;
use std::time::Duration;

use crate::clock::{CancelToken, Clock};
use crate::error::SessionError;

/// One live connection to a spreadsheet engine, used for a single file.
pub trait HostSession: Send {
    /// Launch the engine (headless) and open `path` for editing.
    ///
    /// Fails with `FileNotFound`, `FileLocked` or `EngineStart`.
    fn open(&mut self, path: &Path) -> Result<(), SessionError>;

    /// Start refreshing every data connection. Returns as soon as the engine
    /// accepted the request; the refresh itself runs in the background.
    fn trigger_refresh(&mut self) -> Result<(), SessionError>;

    /// Total used rows across all sheets, 0 when no workbook is open.
    /// Unreadable sheets are skipped.
    fn measure_row_count(&mut self) -> Result<u64, SessionError>;

    /// Whether the engine currently reports itself idle.
    fn is_idle(&mut self) -> Result<bool, SessionError>;

    /// Save the workbook in place.
    fn save(&mut self) -> Result<(), SessionError>;

    /// Close the workbook and terminate the engine. Must tolerate being called
    /// after any failure and must not panic.
    fn close(&mut self);
}

impl<S: HostSession + ?Sized> HostSession for Box<S> {
    fn open(&mut self, path: &Path) -> Result<(), SessionError> {
        (**self).open(path)
    }

    fn trigger_refresh(&mut self) -> Result<(), SessionError> {
        (**self).trigger_refresh()
    }

    fn measure_row_count(&mut self) -> Result<u64, SessionError> {
        (**self).measure_row_count()
    }

    fn is_idle(&mut self) -> Result<bool, SessionError> {
        (**self).is_idle()
    }

    fn save(&mut self) -> Result<(), SessionError> {
        (**self).save()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Creates a fresh session for each file of a batch.
pub trait SessionFactory: Send + Sync {
    fn create(&self) -> Box<dyn HostSession>;
}

impl<F> SessionFactory for F
where
    F: Fn() -> Box<dyn HostSession> + Send + Sync,
{
    fn create(&self) -> Box<dyn HostSession> {
        self()
    }
}

/// Exclusive owner of a session that closes it exactly once.
///
/// `close()` runs on [`SessionGuard::release`] or, failing that, on drop,
/// which also covers early returns and unwinding.
pub struct SessionGuard {
    session: Box<dyn HostSession>,
    released: bool,
}

impl SessionGuard {
    pub fn new(session: Box<dyn HostSession>) -> Self {
        Self {
            session,
            released: false,
        }
    }

    pub fn session(&mut self) -> &mut dyn HostSession {
        self.session.as_mut()
    }

    /// Close now instead of at drop.
    pub fn release(mut self) {
        self.close_once();
    }

    fn close_once(&mut self) {
        if !self.released {
            self.released = true;
            self.session.close();
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.close_once();
    }
}

/// Poll [`HostSession::is_idle`] every `poll` until idle, `timeout`, or cancel.
///
/// A busy engine sometimes refuses to answer the probe; such errors are logged
/// and treated as "not idle yet".
pub fn wait_for_idle(
    session: &mut dyn HostSession,
    clock: &dyn Clock,
    cancel: &CancelToken,
    poll: Duration,
    timeout: Duration,
) -> Result<(), SessionError> {
    let started = clock.now();
    loop {
        match session.is_idle() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => tracing::debug!(error = %e, "Engine state probe failed, retrying"),
        }

        let waited = clock.now().saturating_duration_since(started);
        if waited >= timeout {
            return Err(SessionError::Timeout {
                what: "engine to become idle",
                waited,
            });
        }
        if clock.sleep(poll.min(timeout - waited), cancel) {
            return Err(SessionError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{start_time, Call, ScriptedSession};

    #[test]
    fn test_guard_closes_on_drop() {
        let session = ScriptedSession::new();
        let log = session.log();
        {
            let mut guard = SessionGuard::new(Box::new(session));
            guard.session().open(Path::new("a.xlsx")).unwrap();
        }
        assert_eq!(log.count(Call::Close), 1);
    }

    #[test]
    fn test_guard_release_closes_once() {
        let session = ScriptedSession::new();
        let log = session.log();
        let guard = SessionGuard::new(Box::new(session));
        guard.release();
        assert_eq!(log.count(Call::Close), 1);
    }

    #[test]
    fn test_guard_closes_while_unwinding() {
        let session = ScriptedSession::new();
        let log = session.log();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = SessionGuard::new(Box::new(session));
            panic!("engine exploded");
        }));
        assert!(outcome.is_err());
        assert_eq!(log.count(Call::Close), 1);
    }

    #[test]
    fn test_wait_for_idle_polls_until_idle() {
        let clock = ManualClock::auto_advancing(start_time());
        let mut session = ScriptedSession::new().with_idle_after(3);
        wait_for_idle(
            &mut session,
            &clock,
            &CancelToken::new(),
            Duration::from_secs(2),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(6));
    }

    #[test]
    fn test_wait_for_idle_times_out() {
        let clock = ManualClock::auto_advancing(start_time());
        let mut session = ScriptedSession::new().with_idle_after(u32::MAX);
        let err = wait_for_idle(
            &mut session,
            &clock,
            &CancelToken::new(),
            Duration::from_secs(2),
            Duration::from_secs(7),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert_eq!(clock.elapsed(), Duration::from_secs(7));
    }

    #[test]
    fn test_wait_for_idle_observes_cancel() {
        let clock = ManualClock::auto_advancing(start_time());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut session = ScriptedSession::new().with_idle_after(u32::MAX);
        let err = wait_for_idle(
            &mut session,
            &clock,
            &cancel,
            Duration::from_secs(2),
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
    }
}
