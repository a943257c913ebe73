//! Error types for sheet-refresh-core

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Failure of one step of a file refresh.
///
/// These never escape a batch: the operation turns them into a
/// [`FileRefreshResult`](crate::FileRefreshResult).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("File is locked or open in another program: {} ({reason})", .path.display())]
    FileLocked { path: PathBuf, reason: String },

    #[error("Failed to start spreadsheet engine: {0}")]
    EngineStart(String),

    #[error("Engine rejected {call}: {message}")]
    EngineCall { call: &'static str, message: String },

    #[error("Failed to save workbook: {0}")]
    Save(String),

    #[error("Timed out after {}s waiting for {what}", .waited.as_secs())]
    Timeout { what: &'static str, waited: Duration },

    #[error("Cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn engine_call(call: &'static str, message: impl Into<String>) -> Self {
        SessionError::EngineCall {
            call,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::FileNotFound(_) => ErrorKind::FileNotFound,
            SessionError::FileLocked { .. } => ErrorKind::FileLocked,
            SessionError::EngineStart(_) => ErrorKind::EngineStart,
            SessionError::EngineCall { .. } => ErrorKind::EngineCall,
            SessionError::Save(_) => ErrorKind::Save,
            SessionError::Timeout { .. } => ErrorKind::Timeout,
            SessionError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Serializable classification of a [`SessionError`], kept on results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FileNotFound,
    FileLocked,
    EngineStart,
    EngineCall,
    Save,
    Timeout,
    Cancelled,
}

/// Invalid schedule input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid time '{0}': expected HH:MM (24-hour)")]
    InvalidTime(String),

    #[error("No valid schedule times given")]
    Empty,
}

/// Invalid refresh settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
