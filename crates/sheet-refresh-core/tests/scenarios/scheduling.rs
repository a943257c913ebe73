//! Scheduled batches through the service facade.

use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{runner, start_time, FakeEngine, FileScript};
use sheet_refresh_core::{
    BatchItem, BatchResult, FileRefreshResult, ManualClock, RefreshObserver, RefreshService,
    RefreshSettings, RefreshStatus, Schedule, SchedulerConfig,
};

const WAIT: Duration = Duration::from_secs(5);

/// Forwards observer events to the test thread.
struct Events(Mutex<Sender<String>>);

impl RefreshObserver for Events {
    fn on_file_started(&self, path: &Path, _index: usize, _total: usize) {
        let _ = self.0.lock().unwrap().send(format!("started {}", path.display()));
    }

    fn on_file_completed(&self, path: &Path, result: &FileRefreshResult) {
        let _ = self
            .0
            .lock()
            .unwrap()
            .send(format!("completed {} {:?}", path.display(), result.status));
    }

    fn on_batch_finished(&self, batch: &BatchResult) {
        let _ = self
            .0
            .lock()
            .unwrap()
            .send(format!("finished {}/{}", batch.succeeded_count, batch.results.len()));
    }
}

#[test]
fn test_scheduled_trigger_runs_configured_files() {
    let engine = Arc::new(
        FakeEngine::new()
            .script("daily.xlsx", FileScript::rows([10, 12]))
            .script("locked.xlsx", FileScript::locked()),
    );
    let (tx, rx) = mpsc::channel();
    let runner = runner(&engine, RefreshSettings::default())
        .with_observer(Arc::new(Events(Mutex::new(tx))));
    let clock = Arc::new(ManualClock::stepped(start_time()));

    let service = RefreshService::with_scheduler_options(
        runner,
        Schedule::parse(["04:30"]).unwrap(),
        || vec![BatchItem::new("daily.xlsx"), BatchItem::new("locked.xlsx")],
        SchedulerConfig {
            tick: Duration::from_secs(1),
            ..Default::default()
        },
        Some(clock.clone()),
    );
    service.start_scheduler();
    assert_eq!(
        service.next_run_time(),
        Some(start_time().date().and_hms_opt(4, 30, 0).unwrap())
    );

    assert!(clock.wait_for_sleeper(WAIT));
    clock.advance(Duration::from_secs(30 * 60));

    let events: Vec<String> = (0..5).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(
        events,
        vec![
            "started daily.xlsx",
            "completed daily.xlsx Success",
            "started locked.xlsx",
            "completed locked.xlsx Error",
            "finished 1/2",
        ]
    );
    assert_eq!(
        service.next_run_time(),
        Some(start_time().date().and_hms_opt(4, 30, 0).unwrap() + chrono::Duration::days(1))
    );

    service.shutdown();
    assert!(!service.is_running());
    assert_eq!(engine.created(), engine.closed());
}

#[test]
fn test_manual_run_while_scheduler_idle() {
    let engine = Arc::new(FakeEngine::new().script("a.xlsx", FileScript::rows([1, 1])));
    let service = RefreshService::with_scheduler_options(
        runner(&engine, RefreshSettings::default()),
        Schedule::parse(["23:00"]).unwrap(),
        Vec::new,
        SchedulerConfig::default(),
        Some(Arc::new(ManualClock::stepped(start_time()))),
    );
    service.start_scheduler();

    let batch = service.run_batch(&["a.xlsx".into()]);

    assert_eq!(batch.results[0].status, RefreshStatus::Success);
    assert!(service.is_running());
    service.stop_scheduler();
    assert_eq!(service.next_run_time(), None);
}
