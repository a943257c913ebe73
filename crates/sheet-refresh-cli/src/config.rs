//! JSON configuration file and batch planning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sheet_refresh_core::{
    BatchItem, RefreshSettings, RefreshStatus, Schedule, ScheduleError, SchedulerConfig,
    SettingsError,
};
use sheet_refresh_excel::ExcelBridgeConfig;
use thiserror::Error;

/// Extensions the Excel host can open and save in place.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls"];

pub const DEFAULT_SCHEDULE_TIME: &str = "06:00";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Invalid refresh settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// One configured workbook: either a bare path or a detailed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileEntry {
    Path(PathBuf),
    Detailed {
        path: PathBuf,
        #[serde(default = "enabled_by_default")]
        enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
        /// Outcome of the most recent scheduled refresh.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_status: Option<RefreshStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_run: Option<NaiveDateTime>,
    },
}

fn enabled_by_default() -> bool {
    true
}

impl FileEntry {
    pub fn path(&self) -> &Path {
        match self {
            FileEntry::Path(path) | FileEntry::Detailed { path, .. } => path,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            FileEntry::Path(_) => true,
            FileEntry::Detailed { enabled, .. } => *enabled,
        }
    }

    pub fn last_status(&self) -> Option<(RefreshStatus, Option<NaiveDateTime>)> {
        match self {
            FileEntry::Path(_) => None,
            FileEntry::Detailed {
                last_status,
                last_run,
                ..
            } => last_status.map(|status| (status, *last_run)),
        }
    }

    fn record(&mut self, status: RefreshStatus, at: NaiveDateTime) {
        match self {
            FileEntry::Path(path) => {
                *self = FileEntry::Detailed {
                    path: std::mem::take(path),
                    enabled: true,
                    timeout_seconds: None,
                    last_status: Some(status),
                    last_run: Some(at),
                }
            }
            FileEntry::Detailed {
                last_status,
                last_run,
                ..
            } => {
                *last_status = Some(status);
                *last_run = Some(at);
            }
        }
    }

    pub fn timeout_seconds(&self) -> Option<u64> {
        match self {
            FileEntry::Path(_) => None,
            FileEntry::Detailed {
                timeout_seconds, ..
            } => *timeout_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_ms: u64,
    pub join_timeout_seconds: u64,
    pub catch_up_grace_minutes: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            tick_ms: defaults.tick.as_millis() as u64,
            join_timeout_seconds: defaults.join_timeout.as_secs(),
            catch_up_grace_minutes: defaults.catch_up_grace.as_secs() / 60,
        }
    }
}

impl SchedulerSection {
    pub fn to_scheduler_config(self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(self.tick_ms),
            join_timeout: Duration::from_secs(self.join_timeout_seconds),
            catch_up_grace: Duration::from_secs(self.catch_up_grace_minutes * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exe_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wine_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wine_prefix: Option<PathBuf>,
    pub response_timeout_seconds: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            exe_path: None,
            wine_path: None,
            wine_prefix: None,
            response_timeout_seconds: ExcelBridgeConfig::default().timeout.as_secs(),
        }
    }
}

impl BridgeSection {
    pub fn to_bridge_config(&self) -> ExcelBridgeConfig {
        ExcelBridgeConfig {
            bridge_exe_path: self.exe_path.clone(),
            wine_path: self.wine_path.clone(),
            wine_prefix: self.wine_prefix.clone(),
            timeout: Duration::from_secs(self.response_timeout_seconds),
        }
    }
}

/// The whole configuration file. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub files: Vec<FileEntry>,
    pub schedule_times: Vec<String>,
    pub auto_refresh_enabled: bool,
    pub refresh: RefreshSettings,
    pub scheduler: SchedulerSection,
    pub bridge: BridgeSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            schedule_times: vec![DEFAULT_SCHEDULE_TIME.to_string()],
            auto_refresh_enabled: false,
            refresh: RefreshSettings::default(),
            scheduler: SchedulerSection::default(),
            bridge: BridgeSection::default(),
        }
    }
}

impl Config {
    /// Read and validate a config file. Relative workbook paths are taken
    /// relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read(path)?;
        config.validate()?;
        config.resolve_relative_to(base_dir(path));
        tracing::debug!(config = %path.display(), files = config.files.len(), "Loaded config");
        Ok(config)
    }

    /// Parse without validating or resolving paths, for rewriting in place.
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Store `status` and `at` on the entry for `file` in the config file at
    /// `path`. Returns `false` when no entry matches.
    pub fn record_last_run(
        path: &Path,
        file: &Path,
        status: RefreshStatus,
        at: NaiveDateTime,
    ) -> Result<bool, ConfigError> {
        let mut config = Self::read(path)?;
        let base = base_dir(path);
        let Some(entry) = config
            .files
            .iter_mut()
            .find(|entry| base.join(entry.path()) == file)
        else {
            return Ok(false);
        };
        entry.record(status, at);
        config.save(path)?;
        Ok(true)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| write_error(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        std::fs::write(path, json + "\n").map_err(write_error)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.refresh.validate()?;
        self.schedule()?;
        if self.scheduler.tick_ms == 0 {
            return Err(ConfigError::Zero("scheduler.tick_ms"));
        }
        if self.bridge.response_timeout_seconds == 0 {
            return Err(ConfigError::Zero("bridge.response_timeout_seconds"));
        }
        if self.files.iter().any(|entry| entry.timeout_seconds() == Some(0)) {
            return Err(ConfigError::Zero("files[].timeout_seconds"));
        }
        Ok(())
    }

    pub fn schedule(&self) -> Result<Schedule, ScheduleError> {
        Schedule::parse(&self.schedule_times)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        for entry in &mut self.files {
            let path = match entry {
                FileEntry::Path(path) | FileEntry::Detailed { path, .. } => path,
            };
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Every configured file, in order, with the ones that must not be
    /// opened already marked as exclusions.
    pub fn plan_batch(&self) -> Vec<BatchItem> {
        self.files
            .iter()
            .map(|entry| {
                if !entry.enabled() {
                    return BatchItem::excluded(entry.path(), "disabled in config");
                }
                let item = plan_file(entry.path());
                match entry.timeout_seconds() {
                    Some(seconds) if item.exclusion.is_none() => item.with_timeout(seconds),
                    _ => item,
                }
            })
            .collect()
    }
}

fn base_dir(config_path: &Path) -> &Path {
    config_path.parent().unwrap_or_else(|| Path::new(""))
}

/// A batch item for one path, excluded when its extension is unsupported or
/// the file is read-only. Missing files are left to the refresh to report.
pub fn plan_file(path: &Path) -> BatchItem {
    if !has_supported_extension(path) {
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_else(|| "(none)".to_string());
        return BatchItem::excluded(path, format!("Unsupported file extension: {ext}"));
    }
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.permissions().readonly() => {
            BatchItem::excluded(path, "File is read-only")
        }
        _ => BatchItem::new(path),
    }
}

pub fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| e.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}
