//! Excel refresh automation on top of the IDispatch wrapper.

#![cfg(windows)]

use std::collections::HashMap;

use excel_com_protocol::{CalculationState, ErrorKind};

use crate::dispatch::{
    variant_bool, variant_get_bool, variant_get_i64, variant_get_string, variant_i32,
    variant_missing, variant_str, DispatchObject,
};

/// A failed Excel call, optionally classified for the client.
pub struct ExcelError {
    pub message: String,
    pub kind: Option<ErrorKind>,
}

impl From<String> for ExcelError {
    fn from(message: String) -> Self {
        Self {
            message,
            kind: None,
        }
    }
}

impl ExcelError {
    fn unknown_workbook(handle: u64) -> Self {
        Self {
            message: format!("Unknown workbook handle: {handle}"),
            kind: Some(ErrorKind::UnknownWorkbook),
        }
    }
}

/// Used-row total for a workbook.
pub struct RowCount {
    pub rows: u64,
    pub skipped_sheets: Vec<String>,
}

/// A hidden Excel.Application and the workbooks it has open.
pub struct ExcelApp {
    app: DispatchObject,
    workbooks: HashMap<u64, DispatchObject>,
    next_handle: u64,
}

impl ExcelApp {
    pub fn new() -> Result<Self, String> {
        let app = DispatchObject::create_from_progid("Excel.Application")?;

        app.put("Visible", variant_bool(false))?;
        app.put("DisplayAlerts", variant_bool(false))?;
        app.put("ScreenUpdating", variant_bool(false))?;
        app.put("EnableEvents", variant_bool(false))?;

        Ok(Self {
            app,
            workbooks: HashMap::new(),
            next_handle: 1,
        })
    }

    /// Open for editing. Returns the handle ID.
    pub fn open_workbook(&mut self, path: &str) -> Result<u64, ExcelError> {
        // Workbooks.Open(Filename, UpdateLinks, ReadOnly, Format, Password,
        //                WriteResPassword, IgnoreReadOnlyRecommended)
        let args = [
            variant_str(path),
            variant_i32(0),
            variant_bool(false),
            variant_missing(),
            variant_missing(),
            variant_missing(),
            variant_bool(true),
        ];
        let wb = self
            .app
            .child("Workbooks")?
            .call_child("Open", &args)
            .map_err(classify_open_error)?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.workbooks.insert(handle, wb);
        Ok(handle)
    }

    fn workbook(&self, handle: u64) -> Result<&DispatchObject, ExcelError> {
        self.workbooks
            .get(&handle)
            .ok_or_else(|| ExcelError::unknown_workbook(handle))
    }

    pub fn refresh_all(&self, handle: u64) -> Result<(), ExcelError> {
        self.workbook(handle)?.call("RefreshAll", &[])?;
        Ok(())
    }

    /// Sum of used rows over every worksheet; sheets that fail are listed
    /// instead of failing the whole count.
    pub fn used_row_count(&self, handle: u64) -> Result<RowCount, ExcelError> {
        let sheets = self.workbook(handle)?.child("Worksheets")?;
        let count = variant_get_i64(&sheets.get("Count")?).unwrap_or(0);

        let mut rows = 0u64;
        let mut skipped_sheets = Vec::new();
        for index in 1..=count {
            match sheet_used_rows(&sheets, index as i32) {
                Ok(n) => rows += n,
                Err(e) => {
                    log!("skipping sheet {index}: {e}");
                    let name = sheets
                        .item("Item", variant_i32(index as i32))
                        .and_then(|s| s.get("Name"))
                        .ok()
                        .and_then(|v| variant_get_string(&v))
                        .unwrap_or_else(|| format!("#{index}"));
                    skipped_sheets.push(name);
                }
            }
        }
        Ok(RowCount {
            rows,
            skipped_sheets,
        })
    }

    /// `(Application.Ready, Application.CalculationState)`.
    pub fn engine_state(&self) -> Result<(bool, CalculationState), ExcelError> {
        let ready = variant_get_bool(&self.app.get("Ready")?).unwrap_or(false);
        let calc = variant_get_i64(&self.app.get("CalculationState")?)
            .map(|raw| CalculationState::from_raw(raw as i32))
            .unwrap_or(CalculationState::Pending);
        Ok((ready, calc))
    }

    pub fn ensure_hidden(&self) -> Result<(), ExcelError> {
        self.app.put("Visible", variant_bool(false))?;
        Ok(())
    }

    pub fn save_workbook(&self, handle: u64, path: Option<&str>) -> Result<(), ExcelError> {
        let wb = self.workbook(handle)?;
        match path {
            Some(path) => wb.call("SaveAs", &[variant_str(path)])?,
            None => wb.call("Save", &[])?,
        };
        Ok(())
    }

    pub fn close_workbook(&mut self, handle: u64) -> Result<(), ExcelError> {
        let wb = self
            .workbooks
            .remove(&handle)
            .ok_or_else(|| ExcelError::unknown_workbook(handle))?;
        wb.call("Close", &[variant_bool(false)])?;
        Ok(())
    }

    /// Close everything still open and quit Excel.
    pub fn shutdown(mut self) -> Result<(), String> {
        let handles: Vec<u64> = self.workbooks.keys().copied().collect();
        for h in handles {
            let _ = self.close_workbook(h);
        }
        self.app.call("Quit", &[])?;
        Ok(())
    }
}

fn sheet_used_rows(sheets: &DispatchObject, index: i32) -> Result<u64, String> {
    let sheet = sheets.item("Item", variant_i32(index))?;
    let rows = sheet.child("UsedRange")?.child("Rows")?;
    let count = variant_get_i64(&rows.get("Count")?).unwrap_or(0);
    Ok(count.max(0) as u64)
}

/// Excel reports sharing violations only through the exception text.
fn classify_open_error(message: String) -> ExcelError {
    let lower = message.to_lowercase();
    let kind = if lower.contains("permission denied")
        || lower.contains("locked")
        || lower.contains("in use")
        || lower.contains("read-only")
    {
        Some(ErrorKind::FileLocked)
    } else if lower.contains("could not be found") || lower.contains("couldn't find") {
        Some(ErrorKind::FileNotFound)
    } else {
        None
    };
    ExcelError { message, kind }
}
