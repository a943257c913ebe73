//! Subprocess management and JSON IPC for the COM bridge process.

use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use excel_com_protocol::{
    CalculationState, Command as BridgeCommand, ErrorKind, Request, Response, ResponseData,
    ResponseResult,
};

use crate::workbook::Workbook;

/// Errors from the Excel COM bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to spawn bridge process: {0}")]
    SpawnFailed(#[from] io::Error),

    #[error("Bridge process not running")]
    NotRunning,

    #[error("Failed to send command to bridge: {0}")]
    SendFailed(String),

    #[error("Failed to read response from bridge: {0}")]
    ReadFailed(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Bridge returned error: {message}")]
    BridgeError {
        message: String,
        kind: Option<ErrorKind>,
    },

    #[error("No response to {command} within {}s", .waited.as_secs())]
    Timeout {
        command: &'static str,
        waited: Duration,
    },

    #[error("Unexpected response data for {0}")]
    UnexpectedResponse(&'static str),

    #[error("WINE not found. Install WINE and ensure 'wine' is in PATH.")]
    WineNotFound,

    #[error("Bridge executable not found at: {0}")]
    BridgeExeNotFound(String),
}

impl BridgeError {
    /// The bridge's own classification, if it sent one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            BridgeError::BridgeError { kind, .. } => *kind,
            _ => None,
        }
    }
}

/// Configuration for the Excel COM bridge.
#[derive(Debug, Clone)]
pub struct ExcelBridgeConfig {
    /// Path to the `excel-com-bridge.exe` Windows executable.
    /// If None, will search in common locations relative to the current binary.
    pub bridge_exe_path: Option<PathBuf>,

    /// WINE executable. `None` means "wine" on non-Windows hosts and running
    /// the bridge directly on Windows.
    pub wine_path: Option<PathBuf>,

    /// Optional WINEPREFIX to use (for isolating the WINE environment).
    pub wine_prefix: Option<PathBuf>,

    /// How long to wait for each bridge response.
    pub timeout: Duration,
}

impl Default for ExcelBridgeConfig {
    fn default() -> Self {
        Self {
            bridge_exe_path: None,
            wine_path: None,
            wine_prefix: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl ExcelBridgeConfig {
    /// The launcher to put in front of the bridge exe, if any.
    fn launcher(&self) -> Option<PathBuf> {
        match &self.wine_path {
            Some(wine) => Some(wine.clone()),
            None if cfg!(windows) => None,
            None => Some(PathBuf::from("wine")),
        }
    }
}

type Line = io::Result<String>;

/// The main handle for communicating with the Excel COM bridge.
///
/// This manages the bridge subprocess lifecycle. Responses are read on a
/// dedicated thread so that every command can be bounded by a timeout; a
/// bridge that stops answering is killed when the handle is dropped.
pub struct ExcelBridge {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    responses: Mutex<Receiver<Line>>,
    next_id: AtomicU64,
    timeout: Duration,
    wine: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExcelBridge {
    /// Start the bridge process and initialize Excel.
    pub fn start(config: ExcelBridgeConfig) -> Result<Self, BridgeError> {
        let exe_path = config
            .bridge_exe_path
            .clone()
            .unwrap_or_else(find_bridge_exe);

        if !exe_path.exists() {
            return Err(BridgeError::BridgeExeNotFound(
                exe_path.display().to_string(),
            ));
        }

        let launcher = config.launcher();
        let mut cmd = match &launcher {
            Some(wine) => {
                let mut cmd = std::process::Command::new(wine);
                if let Some(prefix) = &config.wine_prefix {
                    cmd.env("WINEPREFIX", prefix);
                }
                cmd.arg(&exe_path);
                cmd
            }
            None => std::process::Command::new(&exe_path),
        };
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit()); // Bridge diagnostics go to our stderr

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound && launcher.is_some() {
                BridgeError::WineNotFound
            } else {
                BridgeError::SpawnFailed(e)
            }
        })?;
        tracing::debug!(pid = child.id(), exe = %exe_path.display(), "Bridge process spawned");

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(BridgeError::NotRunning);
        };

        let (tx, rx) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("excel-bridge-reader".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = reader {
            let _ = child.kill();
            return Err(BridgeError::SpawnFailed(e));
        }

        let bridge = Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            responses: Mutex::new(rx),
            next_id: AtomicU64::new(1),
            timeout: config.timeout,
            wine: launcher.is_some(),
        };

        // Initialize COM and Excel; on failure the drop kills the process
        bridge.send_command(BridgeCommand::Init)?;

        Ok(bridge)
    }

    /// Send a command to the bridge and wait for the response.
    fn send_command(&self, command: BridgeCommand) -> Result<Option<ResponseData>, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = command.name();

        let request = Request { id, command };
        let json = serde_json::to_string(&request)?;
        tracing::trace!(id, command = name, "Bridge request");

        // Send the request
        {
            let mut stdin = lock(&self.stdin);
            writeln!(stdin, "{json}").map_err(|e| BridgeError::SendFailed(e.to_string()))?;
            stdin
                .flush()
                .map_err(|e| BridgeError::SendFailed(e.to_string()))?;
        }

        let response = await_response(&lock(&self.responses), id, name, self.timeout)?;

        match response.result {
            ResponseResult::Ok { data } => Ok(data),
            ResponseResult::Error { message, kind } => {
                Err(BridgeError::BridgeError { message, kind })
            }
        }
    }

    /// Path as the bridge process sees it.
    fn bridge_path(&self, path: &Path) -> String {
        if self.wine {
            linux_to_wine_path(path)
        } else {
            absolute(path).display().to_string()
        }
    }

    /// Open an existing workbook from a local path.
    pub fn open_workbook(&self, path: &Path) -> Result<Workbook<'_>, BridgeError> {
        let data = self.send_command(BridgeCommand::OpenWorkbook {
            path: self.bridge_path(path),
        })?;
        match data {
            Some(ResponseData::WorkbookHandle { workbook }) => Ok(Workbook::new(self, workbook)),
            _ => Err(BridgeError::UnexpectedResponse("OpenWorkbook")),
        }
    }

    /// Whether Excel is ready and its calculation state.
    pub fn engine_state(&self) -> Result<(bool, CalculationState), BridgeError> {
        match self.send_command(BridgeCommand::EngineState)? {
            Some(ResponseData::EngineState { ready, calculation }) => Ok((ready, calculation)),
            _ => Err(BridgeError::UnexpectedResponse("EngineState")),
        }
    }

    /// Force the Excel window hidden again.
    pub fn ensure_hidden(&self) -> Result<(), BridgeError> {
        self.send_command(BridgeCommand::EnsureHidden)?;
        Ok(())
    }

    /// Shut down the bridge: close all workbooks, quit Excel, and terminate
    /// the process. The process is killed if it does not go quietly.
    pub fn shutdown(self) -> Result<(), BridgeError> {
        let result = self.send_command(BridgeCommand::Shutdown);

        let mut child = lock(&self.child);
        let deadline = Instant::now() + self.timeout.min(Duration::from_secs(10));
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                _ => {
                    tracing::warn!(pid = child.id(), "Bridge did not exit, killing it");
                    let _ = child.kill();
                    let _ = child.wait();
                    break;
                }
            }
        }

        result.map(|_| ())
    }

    // -- Internal methods used by Workbook --

    pub(crate) fn refresh_all(&self, workbook: u64) -> Result<(), BridgeError> {
        self.send_command(BridgeCommand::RefreshAll { workbook })?;
        Ok(())
    }

    pub(crate) fn used_row_count(&self, workbook: u64) -> Result<(u64, Vec<String>), BridgeError> {
        match self.send_command(BridgeCommand::UsedRowCount { workbook })? {
            Some(ResponseData::RowCount {
                rows,
                skipped_sheets,
            }) => Ok((rows, skipped_sheets)),
            _ => Err(BridgeError::UnexpectedResponse("UsedRowCount")),
        }
    }

    pub(crate) fn save_workbook(&self, workbook: u64) -> Result<(), BridgeError> {
        self.send_command(BridgeCommand::SaveWorkbook {
            workbook,
            path: None,
        })?;
        Ok(())
    }

    pub(crate) fn close_workbook(&self, workbook: u64) -> Result<(), BridgeError> {
        self.send_command(BridgeCommand::CloseWorkbook { workbook })?;
        Ok(())
    }
}

impl Drop for ExcelBridge {
    fn drop(&mut self) {
        let child = self
            .child
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Ok(None) = child.try_wait() {
            tracing::warn!(pid = child.id(), "Bridge dropped while running, killing it");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Wait for the response to request `id`.
///
/// Responses to earlier requests that timed out are discarded. A response
/// with id 0 is the bridge rejecting a line it could not parse and belongs to
/// the request in flight.
fn await_response(
    lines: &Receiver<Line>,
    id: u64,
    command: &'static str,
    timeout: Duration,
) -> Result<Response, BridgeError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let line = match lines.recv_timeout(remaining) {
            Ok(line) => line.map_err(|e| BridgeError::ReadFailed(e.to_string()))?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(BridgeError::Timeout {
                    command,
                    waited: timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => return Err(BridgeError::NotRunning),
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response: Response = serde_json::from_str(line)?;
        if response.id == id || response.id == 0 {
            return Ok(response);
        }
        tracing::debug!(
            expected = id,
            got = response.id,
            "Discarding stale bridge response"
        );
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    }
}

/// Convert a Linux filesystem path to a WINE (Windows) path.
///
/// WINE maps `/` to `Z:\`, so `/home/user/file.xlsx` becomes `Z:\home\user\file.xlsx`.
pub fn linux_to_wine_path(linux_path: &Path) -> String {
    format!("Z:{}", absolute(linux_path).display()).replace('/', "\\")
}

/// Attempt to locate the bridge exe relative to the current executable or in common paths.
fn find_bridge_exe() -> PathBuf {
    // Check next to the current executable
    if let Ok(mut exe) = std::env::current_exe() {
        exe.pop();
        let candidate = exe.join("excel-com-bridge.exe");
        if candidate.exists() {
            return candidate;
        }
    }

    // Cross-compiled development builds
    for profile in ["release", "debug"] {
        let candidate = PathBuf::from(format!(
            "target/x86_64-pc-windows-gnu/{profile}/excel-com-bridge.exe"
        ));
        if candidate.exists() {
            return candidate;
        }
    }

    // Default: assume it's in the current directory
    PathBuf::from("excel-com-bridge.exe")
}
