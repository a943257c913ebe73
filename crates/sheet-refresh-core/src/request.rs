//! Refresh settings and per-file requests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Default wait ceiling for one file's background refresh.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;
/// Default engine busy/idle polling interval.
pub const DEFAULT_IDLE_POLL_SECS: u64 = 2;
/// Default spacing between row-count samples.
pub const DEFAULT_ROW_CHECK_SECS: u64 = 5;
/// Default number of consecutive unchanged samples that ends the wait.
pub const DEFAULT_STABLE_COUNT: u32 = 3;

/// Refresh tuning shared by every file in a batch unless overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub timeout_seconds: u64,
    pub idle_poll_interval_seconds: u64,
    pub row_check_interval_seconds: u64,
    pub stable_count_threshold: u32,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            idle_poll_interval_seconds: DEFAULT_IDLE_POLL_SECS,
            row_check_interval_seconds: DEFAULT_ROW_CHECK_SECS,
            stable_count_threshold: DEFAULT_STABLE_COUNT,
        }
    }
}

impl RefreshSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.timeout_seconds == 0 {
            return Err(SettingsError::Zero("timeout_seconds"));
        }
        if self.idle_poll_interval_seconds == 0 {
            return Err(SettingsError::Zero("idle_poll_interval_seconds"));
        }
        if self.row_check_interval_seconds == 0 {
            return Err(SettingsError::Zero("row_check_interval_seconds"));
        }
        if self.stable_count_threshold == 0 {
            return Err(SettingsError::Zero("stable_count_threshold"));
        }
        Ok(())
    }

    /// Build the immutable request for one file.
    pub fn request_for(
        &self,
        path: impl Into<PathBuf>,
        timeout_override: Option<u64>,
    ) -> RefreshRequest {
        RefreshRequest {
            path: path.into(),
            timeout: Duration::from_secs(timeout_override.unwrap_or(self.timeout_seconds)),
            idle_poll_interval: Duration::from_secs(self.idle_poll_interval_seconds),
            row_check_interval: Duration::from_secs(self.row_check_interval_seconds),
            stable_count_threshold: self.stable_count_threshold,
        }
    }
}

/// Everything one [`FileRefreshOperation`](crate::FileRefreshOperation) needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub path: PathBuf,
    pub timeout: Duration,
    pub idle_poll_interval: Duration,
    pub row_check_interval: Duration,
    pub stable_count_threshold: u32,
}

impl RefreshRequest {
    /// A request with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RefreshSettings::default().request_for(path, None)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_row_check_interval(mut self, interval: Duration) -> Self {
        self.row_check_interval = interval;
        self
    }

    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn with_stable_count_threshold(mut self, threshold: u32) -> Self {
        self.stable_count_threshold = threshold;
        self
    }

    /// File name for log and result messages.
    pub fn display_name(&self) -> String {
        display_name(&self.path)
    }
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// One entry of a batch, in the order the caller wants it processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub path: PathBuf,
    /// Overrides [`RefreshSettings::timeout_seconds`] for this file.
    pub timeout_seconds: Option<u64>,
    /// Set when the caller decided not to refresh this file; it is reported
    /// as skipped without opening a session.
    pub exclusion: Option<String>,
}

impl BatchItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout_seconds: None,
            exclusion: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn excluded(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            timeout_seconds: None,
            exclusion: Some(reason.into()),
        }
    }
}

impl From<PathBuf> for BatchItem {
    fn from(path: PathBuf) -> Self {
        BatchItem::new(path)
    }
}

impl From<&Path> for BatchItem {
    fn from(path: &Path) -> Self {
        BatchItem::new(path)
    }
}

impl From<&str> for BatchItem {
    fn from(path: &str) -> Self {
        BatchItem::new(path)
    }
}
