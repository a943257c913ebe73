//! Scripted fake engine shared by the scenario tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};
use sheet_refresh_core::{
    BatchRunner, HostSession, ManualClock, RefreshSettings, SessionError, SessionFactory,
};

/// How one file behaves when opened by the fake engine.
#[derive(Debug, Clone, Default)]
pub struct FileScript {
    /// Row counts returned by successive measurements; the last one repeats.
    pub rows: Vec<u64>,
    pub locked: bool,
    pub missing: bool,
    pub save_fails: bool,
}

impl FileScript {
    pub fn rows(rows: impl IntoIterator<Item = u64>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Rows keep growing, so only the timeout ends the wait.
    pub fn growing() -> Self {
        Self::rows(0..10_000)
    }

    pub fn locked() -> Self {
        Self {
            locked: true,
            ..Default::default()
        }
    }

    pub fn missing() -> Self {
        Self {
            missing: true,
            ..Default::default()
        }
    }

    pub fn save_fails(mut self) -> Self {
        self.save_fails = true;
        self
    }
}

#[derive(Debug, Default)]
struct EngineLog {
    created: usize,
    opened: Vec<PathBuf>,
    closed: usize,
}

/// Hands out fake sessions; behavior is looked up by file name at open.
#[derive(Debug, Default)]
pub struct FakeEngine {
    scripts: HashMap<String, FileScript>,
    log: Mutex<EngineLog>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, name: &str, script: FileScript) -> Self {
        self.scripts.insert(name.to_string(), script);
        self
    }

    pub fn created(&self) -> usize {
        self.log.lock().unwrap().created
    }

    pub fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        self.log.lock().unwrap().opened.clone()
    }
}

/// Lets the test keep an `Arc` to the engine while the runner owns a factory.
pub struct SharedEngine(pub Arc<FakeEngine>);

impl SessionFactory for SharedEngine {
    fn create(&self) -> Box<dyn HostSession> {
        self.0.log.lock().unwrap().created += 1;
        Box::new(FakeSession {
            engine: Arc::clone(&self.0),
            script: None,
            measured: 0,
        })
    }
}

struct FakeSession {
    engine: Arc<FakeEngine>,
    script: Option<FileScript>,
    measured: usize,
}

impl HostSession for FakeSession {
    fn open(&mut self, path: &Path) -> Result<(), SessionError> {
        self.engine.log.lock().unwrap().opened.push(path.to_path_buf());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let script = self.engine.scripts.get(&name).cloned().unwrap_or_default();
        if script.missing {
            return Err(SessionError::FileNotFound(path.to_path_buf()));
        }
        if script.locked {
            return Err(SessionError::FileLocked {
                path: path.to_path_buf(),
                reason: "in use by another process".into(),
            });
        }
        self.script = Some(script);
        Ok(())
    }

    fn trigger_refresh(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn measure_row_count(&mut self) -> Result<u64, SessionError> {
        let Some(script) = &self.script else {
            return Ok(0);
        };
        let rows = script
            .rows
            .get(self.measured)
            .or(script.rows.last())
            .copied()
            .unwrap_or(0);
        self.measured += 1;
        Ok(rows)
    }

    fn is_idle(&mut self) -> Result<bool, SessionError> {
        Ok(true)
    }

    fn save(&mut self) -> Result<(), SessionError> {
        match &self.script {
            Some(script) if script.save_fails => Err(SessionError::Save("disk full".into())),
            _ => Ok(()),
        }
    }

    fn close(&mut self) {
        self.engine.log.lock().unwrap().closed += 1;
    }
}

pub fn start_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 3)
        .unwrap()
        .and_hms_opt(4, 0, 0)
        .unwrap()
}

/// Runner over `engine` with a virtual clock.
pub fn runner(engine: &Arc<FakeEngine>, settings: RefreshSettings) -> BatchRunner {
    BatchRunner::new(SharedEngine(Arc::clone(engine)), settings)
        .with_clock(Arc::new(ManualClock::auto_advancing(start_time())))
}
