//! Workbook handle: the per-workbook commands of the bridge.

use crate::bridge::{BridgeError, ExcelBridge};

/// Used-row total for a workbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCount {
    pub rows: u64,
    /// Sheets whose used range could not be read (protected, chart sheets).
    pub skipped_sheets: Vec<String>,
}

/// A handle to an open workbook in the Excel COM bridge.
///
/// Operations on this workbook are forwarded to the bridge process.
pub struct Workbook<'a> {
    bridge: &'a ExcelBridge,
    handle: u64,
}

impl<'a> Workbook<'a> {
    pub(crate) fn new(bridge: &'a ExcelBridge, handle: u64) -> Self {
        Self { bridge, handle }
    }

    /// Get the internal handle ID.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Start refreshing every connection and query table. Returns once Excel
    /// has accepted the call; background queries keep running.
    pub fn refresh_all(&self) -> Result<(), BridgeError> {
        self.bridge.refresh_all(self.handle)
    }

    pub fn used_rows(&self) -> Result<RowCount, BridgeError> {
        let (rows, skipped_sheets) = self.bridge.used_row_count(self.handle)?;
        Ok(RowCount {
            rows,
            skipped_sheets,
        })
    }

    /// Save in place, keeping the original file format.
    pub fn save(&self) -> Result<(), BridgeError> {
        self.bridge.save_workbook(self.handle)
    }

    /// Close the workbook without saving.
    pub fn close(self) -> Result<(), BridgeError> {
        self.bridge.close_workbook(self.handle)
    }
}
