//! Shared protocol types for communication between the refresh client and the
//! Windows COM bridge process (run natively or under WINE).
//!
//! The protocol is JSON-over-stdio: one JSON object per line in each direction.

use serde::{Deserialize, Serialize};

/// A command sent from the client to the bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Monotonically increasing request ID for correlating responses.
    pub id: u64,
    /// The command to execute.
    #[serde(flatten)]
    pub command: Command,
}

/// Commands the client can send to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum Command {
    /// Initialize COM and create a hidden Excel.Application instance.
    Init,

    /// Open an existing workbook for editing (Windows path).
    ///
    /// External links are not updated and the read-only recommendation is ignored.
    OpenWorkbook { path: String },

    /// Start `RefreshAll` on the workbook. Background queries keep running
    /// after the response is sent.
    RefreshAll { workbook: u64 },

    /// Sum of `UsedRange.Rows.Count` across all worksheets.
    UsedRowCount { workbook: u64 },

    /// Report whether the application is ready and whether it is calculating.
    EngineState,

    /// Force the application window hidden again.
    EnsureHidden,

    /// Save the workbook in place, or to `path` when given.
    SaveWorkbook {
        workbook: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// Close a workbook without saving.
    CloseWorkbook { workbook: u64 },

    /// Shut down the bridge: close all workbooks, quit Excel, uninitialize COM.
    Shutdown,
}

impl Command {
    /// Short command name used in log and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Init => "Init",
            Command::OpenWorkbook { .. } => "OpenWorkbook",
            Command::RefreshAll { .. } => "RefreshAll",
            Command::UsedRowCount { .. } => "UsedRowCount",
            Command::EngineState => "EngineState",
            Command::EnsureHidden => "EnsureHidden",
            Command::SaveWorkbook { .. } => "SaveWorkbook",
            Command::CloseWorkbook { .. } => "CloseWorkbook",
            Command::Shutdown => "Shutdown",
        }
    }
}

/// A response sent from the bridge back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The request ID this response corresponds to.
    pub id: u64,
    /// The result of the command.
    #[serde(flatten)]
    pub result: ResponseResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ResponseResult {
    #[serde(rename = "ok")]
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        /// Classification of the failure, when the bridge could tell.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },
}

impl ResponseResult {
    pub fn error(message: impl Into<String>) -> Self {
        ResponseResult::Error {
            message: message.into(),
            kind: None,
        }
    }

    pub fn error_with_kind(message: impl Into<String>, kind: ErrorKind) -> Self {
        ResponseResult::Error {
            message: message.into(),
            kind: Some(kind),
        }
    }
}

/// Failure classes the bridge reports explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FileNotFound,
    FileLocked,
    NotInitialized,
    UnknownWorkbook,
}

/// Data returned in successful responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    /// Handle to a newly opened workbook.
    WorkbookHandle { workbook: u64 },
    /// Total used rows, plus the names of sheets that could not be read.
    RowCount {
        rows: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        skipped_sheets: Vec<String>,
    },
    /// Application busy/idle state.
    EngineState {
        ready: bool,
        calculation: CalculationState,
    },
}

/// Mirror of Excel's `XlCalculationState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationState {
    Done,
    Calculating,
    Pending,
}

impl CalculationState {
    /// Map the raw `Application.CalculationState` value.
    ///
    /// xlDone = 0, xlCalculating = 1, xlPending = 2. Unknown values are treated
    /// as pending so the caller keeps polling.
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => CalculationState::Done,
            1 => CalculationState::Calculating,
            _ => CalculationState::Pending,
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, CalculationState::Done)
    }
}
