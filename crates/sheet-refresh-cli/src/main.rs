//! sheet-refresh CLI - scheduled workbook refresh

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sheet_refresh_core::{
    BatchItem, BatchResult, BatchRunner, CancelToken, FileRefreshResult, HostSession,
    RefreshObserver, RefreshService, RefreshStatus, Schedule,
};
use sheet_refresh_excel::ExcelSession;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::{plan_file, Config};

/// Looked up in the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "sheet-refresh.json";

#[derive(Parser)]
#[command(name = "sheet-refresh")]
#[command(
    author,
    version,
    about = "Refresh Excel workbook data connections on a daily schedule"
)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh workbooks now, one after another
    Run {
        /// Workbooks to refresh (default: the enabled files in the config)
        files: Vec<PathBuf>,

        /// Config file (default: ./sheet-refresh.json if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Per-file refresh timeout in seconds, overriding the config
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,

        /// Print the batch result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the daily scheduler in the foreground until Ctrl-C
    Schedule {
        /// Config file (default: ./sheet-refresh.json if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Time of day to refresh at, HH:MM (repeatable; default: from config)
        #[arg(long = "at", value_name = "HH:MM")]
        times: Vec<String>,

        /// Write each batch result as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show when the next scheduled refresh would run
    NextRun {
        /// Config file (default: ./sheet-refresh.json if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Time of day, HH:MM (repeatable; default: from config)
        #[arg(long = "at", value_name = "HH:MM")]
        times: Vec<String>,
    },

    /// Write a config file with default settings
    InitConfig {
        /// Where to write it
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.verbose);

    match cli.command {
        Commands::Run {
            files,
            config,
            timeout,
            json,
        } => run_now(&files, config.as_deref(), timeout, json),

        Commands::Schedule {
            config,
            times,
            report,
        } => {
            schedule(config.as_deref(), &times, report)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::NextRun { config, times } => {
            let config = load_config(config.as_deref())?;
            let schedule = resolve_schedule(&config, &times)?;
            let next = schedule.next_after(chrono::Local::now().naive_local());
            println!("Schedule: {schedule}");
            println!("Next run: {}", next.format("%Y-%m-%d %H:%M"));
            Ok(ExitCode::SUCCESS)
        }

        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default()
                .save(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            println!("Wrote default config to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(format: LogFormat, verbose: bool) {
    let default_filter = if verbose {
        "sheet_refresh_cli=debug,sheet_refresh_core=debug,sheet_refresh_excel=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// The config file in effect: the one given, else `default` if it exists.
fn config_file(explicit: Option<&Path>, default: &Path) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None if default.exists() => Some(default.to_path_buf()),
        None => None,
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match config_file(path, Path::new(DEFAULT_CONFIG_FILE)) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Could not load configuration from {}", path.display())),
        None => {
            tracing::debug!("No config file, using defaults");
            Ok(Config::default())
        }
    }
}

fn resolve_schedule(config: &Config, times: &[String]) -> Result<Schedule> {
    if times.is_empty() {
        config.schedule().context("Invalid schedule_times in config")
    } else {
        Schedule::parse(times).context("Invalid --at time")
    }
}

fn build_runner(config: &Config) -> BatchRunner {
    let bridge = config.bridge.to_bridge_config();
    BatchRunner::new(
        move || -> Box<dyn HostSession> { Box::new(ExcelSession::new(bridge.clone())) },
        config.refresh,
    )
}

fn run_now(
    files: &[PathBuf],
    config_path: Option<&Path>,
    timeout: Option<u64>,
    json: bool,
) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let items = plan_run(&config, files, timeout);
    if items.is_empty() {
        tracing::warn!("No files to refresh; pass files or list them in the config");
    }

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let batch = build_runner(&config).run(&items, &cancel);
    if json {
        let out = serde_json::to_string_pretty(&batch).context("Failed to serialize result")?;
        println!("{out}");
    } else {
        print!("{}", format_summary(&batch));
    }

    Ok(if batch.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Items for a manual run: the given files, or the config's files when none
/// are given.
fn plan_run(config: &Config, files: &[PathBuf], timeout: Option<u64>) -> Vec<BatchItem> {
    let mut items: Vec<BatchItem> = if files.is_empty() {
        config.plan_batch()
    } else {
        files.iter().map(|path| plan_file(path)).collect()
    };
    if let Some(seconds) = timeout {
        for item in items.iter_mut().filter(|item| item.exclusion.is_none()) {
            item.timeout_seconds = Some(seconds);
        }
    }
    items
}

fn schedule(config_path: Option<&Path>, times: &[String], report: Option<PathBuf>) -> Result<()> {
    let config_path = config_file(config_path, Path::new(DEFAULT_CONFIG_FILE));
    let config = load_config(config_path.as_deref())?;
    if times.is_empty() && !config.auto_refresh_enabled {
        bail!("Automatic refresh is disabled in the config; set auto_refresh_enabled or pass --at");
    }
    let schedule = resolve_schedule(&config, times)?;

    let runner = build_runner(&config).with_observer(Arc::new(ScheduleRecorder {
        report,
        config: config_path.clone(),
    }));

    // The file list is re-read from the config at every trigger.
    let reload_from = config_path;
    let fallback = config.clone();
    let files = move || match &reload_from {
        Some(path) => match Config::load(path) {
            Ok(fresh) => fresh.plan_batch(),
            Err(e) => {
                tracing::warn!(error = %e, "Config reload failed, using the file list from startup");
                fallback.plan_batch()
            }
        },
        None => fallback.plan_batch(),
    };

    let service = RefreshService::with_scheduler_options(
        runner,
        schedule,
        files,
        config.scheduler.to_scheduler_config(),
        None,
    );
    service.start_scheduler();
    if let Some(next) = service.next_run_time() {
        println!("Next run: {} (Ctrl-C to stop)", next.format("%Y-%m-%d %H:%M"));
    }

    let waited = wait_for_ctrl_c();
    service.shutdown();
    waited
}

/// Block until Ctrl-C.
fn wait_for_ctrl_c() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("Failed to listen for Ctrl-C")
}

/// Cancel `cancel` on Ctrl-C so a manual run stops after closing the
/// workbook in progress.
fn cancel_on_ctrl_c(cancel: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || match wait_for_ctrl_c() {
            Ok(()) => {
                tracing::warn!("Interrupted, cancelling the remaining files");
                cancel.cancel();
            }
            Err(e) => tracing::debug!(error = %e, "Ctrl-C handler unavailable"),
        });
    if let Err(e) = spawned {
        tracing::debug!(error = %e, "Could not spawn Ctrl-C thread");
    }
}

/// Keeps a record of scheduled runs: each file's last outcome in the config,
/// and optionally each finished batch as a JSON report.
struct ScheduleRecorder {
    report: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl RefreshObserver for ScheduleRecorder {
    fn on_file_completed(&self, path: &Path, result: &FileRefreshResult) {
        let Some(config) = &self.config else {
            return;
        };
        if result.status == RefreshStatus::Skipped {
            return;
        }
        let now = chrono::Local::now().naive_local();
        match Config::record_last_run(config, path, result.status, now) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(file = %path.display(), "File not in config, status not recorded"),
            Err(e) => tracing::warn!(error = %e, "Failed to record refresh status"),
        }
    }

    fn on_batch_finished(&self, batch: &BatchResult) {
        let Some(report) = &self.report else {
            return;
        };
        let written = serde_json::to_string_pretty(batch)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(report, json).map_err(anyhow::Error::from));
        match written {
            Ok(()) => tracing::debug!(report = %report.display(), "Wrote batch report"),
            Err(e) => tracing::warn!(report = %report.display(), error = %e, "Failed to write batch report"),
        }
    }
}

fn status_label(status: RefreshStatus) -> &'static str {
    match status {
        RefreshStatus::Success => "OK",
        RefreshStatus::Error => "ERROR",
        RefreshStatus::Skipped => "SKIPPED",
        RefreshStatus::TimedOut => "TIMEOUT",
    }
}

fn format_summary(batch: &BatchResult) -> String {
    let mut out = String::new();
    for result in &batch.results {
        let name = result
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| result.path.display().to_string());
        out.push_str(&format!(
            "{:<8} {}  {}\n",
            status_label(result.status),
            name,
            result.message
        ));
    }
    let elapsed = (batch.finished_at - batch.started_at)
        .to_std()
        .unwrap_or_default();
    out.push_str(&format!(
        "{} file(s): {} succeeded, {} failed, {} skipped in {:.1}s\n",
        batch.results.len(),
        batch.succeeded_count,
        batch.failed_count,
        batch.skipped_count,
        elapsed.as_secs_f64()
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileEntry;
    use chrono::{Local, TimeZone};
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_schedule_times_and_globals() {
        let cli = Cli::try_parse_from([
            "sheet-refresh",
            "schedule",
            "--at",
            "05:00",
            "--at",
            "12:30",
            "--log-format",
            "json",
            "-v",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.verbose);
        match cli.command {
            Commands::Schedule { times, config, .. } => {
                assert_eq!(times, vec!["05:00", "12:30"]);
                assert_eq!(config, None);
            }
            _ => panic!("expected schedule"),
        }
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        assert!(Cli::try_parse_from(["sheet-refresh", "run", "--timeout", "0", "a.xlsx"]).is_err());
    }

    #[test]
    fn test_resolve_schedule_prefers_at_flags() {
        let config = Config::default();
        assert_eq!(resolve_schedule(&config, &[]).unwrap().to_string(), "06:00");
        assert_eq!(
            resolve_schedule(&config, &["23:15".to_string()])
                .unwrap()
                .to_string(),
            "23:15"
        );
        assert!(resolve_schedule(&config, &["7:00".to_string()]).is_err());
    }

    #[test]
    fn test_plan_run_applies_timeout_to_refreshable_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            files: vec![
                FileEntry::Path(dir.path().join("a.xlsx")),
                FileEntry::Detailed {
                    path: dir.path().join("b.xlsx"),
                    enabled: false,
                    timeout_seconds: None,
                    last_status: None,
                    last_run: None,
                },
            ],
            ..Config::default()
        };

        let from_config = plan_run(&config, &[], Some(30));
        assert_eq!(from_config.len(), 2);
        assert_eq!(from_config[0].timeout_seconds, Some(30));
        assert_eq!(from_config[1].timeout_seconds, None);
        assert!(from_config[1].exclusion.is_some());

        let explicit = plan_run(&config, &[dir.path().join("c.csv")], None);
        assert_eq!(explicit.len(), 1);
        assert!(explicit[0].exclusion.is_some());
    }

    #[test]
    fn test_format_summary() {
        let started = Local.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        let finished = started + chrono::Duration::seconds(42);
        let mut ok = FileRefreshResult::skipped("/reports/sales.xlsx", "Refreshed: 10 -> 15 rows (+5)");
        ok.status = RefreshStatus::Success;
        ok.duration = Duration::from_secs(40);
        let batch = BatchResult::new(
            vec![
                ok,
                FileRefreshResult::skipped("/reports/old.xls", "disabled in config"),
            ],
            started,
            finished,
        );

        assert_eq!(
            format_summary(&batch),
            "OK       sales.xlsx  Refreshed: 10 -> 15 rows (+5)\n\
             SKIPPED  old.xls  disabled in config\n\
             2 file(s): 1 succeeded, 0 failed, 1 skipped in 42.0s\n"
        );
    }

    #[test]
    fn test_config_file_falls_back_to_existing_default() {
        let dir = tempfile::tempdir().unwrap();
        let default = dir.path().join(DEFAULT_CONFIG_FILE);
        let explicit = dir.path().join("other.json");

        assert_eq!(config_file(None, &default), None);
        assert_eq!(config_file(Some(explicit.as_path()), &default), Some(explicit.clone()));

        std::fs::write(&default, "{}").unwrap();
        assert_eq!(config_file(None, &default), Some(default.clone()));
        assert_eq!(config_file(Some(explicit.as_path()), &default), Some(explicit));
    }

    #[test]
    fn test_schedule_recorder_stores_outcomes_in_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join(DEFAULT_CONFIG_FILE);
        let report = dir.path().join("last-batch.json");
        std::fs::write(&config_path, r#"{"files": ["a.xlsx", "b.xlsx"]}"#).unwrap();
        let recorder = ScheduleRecorder {
            report: Some(report.clone()),
            config: Some(config_path.clone()),
        };
        let a = dir.path().join("a.xlsx");
        let b = dir.path().join("b.xlsx");

        let mut done = FileRefreshResult::failed(&a, "Refreshed");
        done.status = RefreshStatus::Success;
        recorder.on_file_completed(&a, &done);
        recorder.on_file_completed(&b, &FileRefreshResult::skipped(&b, "batch cancelled"));
        let started = Local.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        recorder.on_batch_finished(&BatchResult::new(vec![done], started, started));

        let config = Config::load(&config_path).unwrap();
        assert_eq!(
            config.files[0].last_status().map(|(status, _)| status),
            Some(RefreshStatus::Success)
        );
        assert_eq!(config.files[1].last_status(), None);
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(written["succeeded_count"], 1);
    }
}
