//! Excel host for sheet-refresh, driven through a COM bridge process.
//!
//! This crate spawns a Windows `.exe` (under WINE on Linux, directly on
//! Windows) that automates Excel through COM, communicating over
//! JSON-over-stdio, and exposes it as a [`HostSession`] for the refresh engine.
//!
//! # Architecture
//!
//! ```text
//! sheet-refresh-core (BatchRunner)
//!     └── ExcelSession (this crate, one per file)
//!           └── ExcelBridge
//!                 └── spawns: [wine] excel-com-bridge.exe
//!                       └── COM: Excel.Application
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use sheet_refresh_core::{BatchRunner, CancelToken, HostSession, RefreshSettings};
//! use sheet_refresh_excel::{ExcelBridgeConfig, ExcelSession};
//!
//! let config = ExcelBridgeConfig::default();
//! let runner = BatchRunner::new(
//!     move || -> Box<dyn HostSession> { Box::new(ExcelSession::new(config.clone())) },
//!     RefreshSettings::default(),
//! );
//! let batch = runner.run(&["/srv/reports/sales.xlsx".into()], &CancelToken::new());
//! println!("{} refreshed, {} failed", batch.succeeded_count, batch.failed_count);
//! ```
//!
//! [`HostSession`]: sheet_refresh_core::HostSession

mod bridge;
mod session;
mod workbook;

pub use bridge::{linux_to_wine_path, BridgeError, ExcelBridge, ExcelBridgeConfig};
pub use session::ExcelSession;
pub use workbook::{RowCount, Workbook};
