//! [`HostSession`] backed by the Excel COM bridge.

use std::path::{Path, PathBuf};

use excel_com_protocol::ErrorKind;
use sheet_refresh_core::{HostSession, SessionError};

use crate::bridge::{BridgeError, ExcelBridge, ExcelBridgeConfig};
use crate::workbook::Workbook;

/// One Excel instance refreshing one workbook.
///
/// The bridge process is started by [`open`](HostSession::open) and shut down
/// by [`close`](HostSession::close); a fresh session is used for every file.
pub struct ExcelSession {
    config: ExcelBridgeConfig,
    bridge: Option<ExcelBridge>,
    workbook: Option<u64>,
    path: Option<PathBuf>,
}

impl ExcelSession {
    pub fn new(config: ExcelBridgeConfig) -> Self {
        Self {
            config,
            bridge: None,
            workbook: None,
            path: None,
        }
    }

    fn workbook(&self, call: &'static str) -> Result<Workbook<'_>, SessionError> {
        match (&self.bridge, self.workbook) {
            (Some(bridge), Some(handle)) => Ok(Workbook::new(bridge, handle)),
            _ => Err(SessionError::engine_call(call, "no workbook open")),
        }
    }

    fn bridge(&self, call: &'static str) -> Result<&ExcelBridge, SessionError> {
        self.bridge
            .as_ref()
            .ok_or_else(|| SessionError::engine_call(call, "engine not started"))
    }

    /// Opening and refreshing can make the window visible again on some
    /// installs; hide it before going on.
    fn keep_hidden(&self) {
        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.ensure_hidden() {
                tracing::debug!(error = %e, "Could not re-hide Excel");
            }
        }
    }
}

impl HostSession for ExcelSession {
    fn open(&mut self, path: &Path) -> Result<(), SessionError> {
        check_openable(path)?;

        let bridge = ExcelBridge::start(self.config.clone())
            .map_err(|e| SessionError::EngineStart(e.to_string()))?;
        let opened = bridge.open_workbook(path).map(|workbook| workbook.handle());
        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(shutdown) = bridge.shutdown() {
                    tracing::debug!(error = %shutdown, "Bridge shutdown after failed open");
                }
                return Err(open_error(path, e));
            }
        };
        tracing::debug!(file = %path.display(), workbook = handle, "Workbook opened");

        self.bridge = Some(bridge);
        self.workbook = Some(handle);
        self.path = Some(path.to_path_buf());
        self.keep_hidden();
        Ok(())
    }

    fn trigger_refresh(&mut self) -> Result<(), SessionError> {
        self.workbook("RefreshAll")?
            .refresh_all()
            .map_err(|e| call_error("RefreshAll", e))?;
        self.keep_hidden();
        Ok(())
    }

    fn measure_row_count(&mut self) -> Result<u64, SessionError> {
        if self.workbook.is_none() {
            return Ok(0);
        }
        let count = self
            .workbook("UsedRowCount")?
            .used_rows()
            .map_err(|e| call_error("UsedRowCount", e))?;
        if !count.skipped_sheets.is_empty() {
            tracing::warn!(sheets = ?count.skipped_sheets, "Skipped unreadable sheets while counting rows");
        }
        Ok(count.rows)
    }

    fn is_idle(&mut self) -> Result<bool, SessionError> {
        let (ready, calculation) = self
            .bridge("EngineState")?
            .engine_state()
            .map_err(|e| call_error("EngineState", e))?;
        Ok(ready && calculation.is_done())
    }

    fn save(&mut self) -> Result<(), SessionError> {
        self.workbook("SaveWorkbook")?
            .save()
            .map_err(|e| SessionError::Save(e.to_string()))
    }

    fn close(&mut self) {
        if let Ok(workbook) = self.workbook("CloseWorkbook") {
            if let Err(e) = workbook.close() {
                tracing::warn!(error = %e, "Failed to close workbook");
            }
        }
        self.workbook = None;

        if let Some(bridge) = self.bridge.take() {
            if let Err(e) = bridge.shutdown() {
                tracing::warn!(error = %e, "Excel bridge did not shut down cleanly");
            }
        }
        if let Some(path) = self.path.take() {
            tracing::debug!(file = %path.display(), "Excel session closed");
        }
    }
}

/// Fail fast on files the engine could never open for writing.
fn check_openable(path: &Path) -> Result<(), SessionError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SessionError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => {
            return Err(SessionError::FileLocked {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };
    if metadata.permissions().readonly() {
        return Err(SessionError::FileLocked {
            path: path.to_path_buf(),
            reason: "file is read-only".into(),
        });
    }
    Ok(())
}

fn open_error(path: &Path, err: BridgeError) -> SessionError {
    match err.kind() {
        Some(ErrorKind::FileNotFound) => SessionError::FileNotFound(path.to_path_buf()),
        Some(ErrorKind::FileLocked) => SessionError::FileLocked {
            path: path.to_path_buf(),
            reason: match err {
                BridgeError::BridgeError { message, .. } => message,
                other => other.to_string(),
            },
        },
        _ => call_error("OpenWorkbook", err),
    }
}

fn call_error(call: &'static str, err: BridgeError) -> SessionError {
    match err {
        BridgeError::Timeout { waited, .. } => SessionError::Timeout {
            what: "Excel to respond",
            waited,
        },
        other => SessionError::engine_call(call, other.to_string()),
    }
}
