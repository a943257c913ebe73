//! Excel COM bridge: a Windows process that opens, refreshes and saves
//! workbooks through Excel's COM automation, controlled by JSON commands over
//! stdin/stdout.
//!
//! Runs natively on Windows or cross-compiled from Linux and run under WINE.
//!
//! Protocol: one JSON object per line (newline-delimited JSON).
//! - Reads `Request` objects from stdin
//! - Writes `Response` objects to stdout
//! - Diagnostic/log messages go to stderr (never stdout)

#[cfg(windows)]
macro_rules! log {
    ($($arg:tt)*) => {
        eprintln!("[bridge] {}", format_args!($($arg)*))
    };
}

#[cfg(windows)]
mod dispatch;
#[cfg(windows)]
mod excel;

#[cfg(not(windows))]
fn main() {
    eprintln!("excel-com-bridge must be compiled for Windows (--target x86_64-pc-windows-gnu)");
    eprintln!("and run natively or under WINE.");
    std::process::exit(1);
}

#[cfg(windows)]
fn main() {
    use std::io;

    log!("starting");
    let mut excel: Option<excel::ExcelApp> = None;
    serve(io::stdin().lock(), &mut io::stdout().lock(), &mut excel);

    // stdin closed without a Shutdown: Excel must not outlive the bridge
    if let Some(app) = excel.take() {
        log!("input closed, quitting Excel");
        if let Err(e) = app.shutdown() {
            log!("Excel quit failed: {e}");
        }
        uninit_com();
    }
    log!("exiting");
}

/// Answer requests until stdin closes or a Shutdown succeeds.
#[cfg(windows)]
fn serve(
    input: impl std::io::BufRead,
    out: &mut impl std::io::Write,
    excel: &mut Option<excel::ExcelApp>,
) {
    use excel_com_protocol::{Command, Request, Response, ResponseResult};

    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log!("stdin: {e}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(line.trim()) {
            Ok(request) => request,
            Err(e) => {
                log!("unparseable request ({e}): {line}");
                // id 0: nothing to correlate with
                reply(
                    out,
                    &Response {
                        id: 0,
                        result: ResponseResult::error(format!("JSON parse error: {e}")),
                    },
                );
                continue;
            }
        };

        let response = handle_command(excel, &request);
        reply(out, &response);

        let shut_down = matches!(request.command, Command::Shutdown)
            && matches!(response.result, ResponseResult::Ok { .. });
        if shut_down {
            log!("shutdown complete");
            return;
        }
    }
}

#[cfg(windows)]
fn reply(out: &mut impl std::io::Write, response: &excel_com_protocol::Response) {
    let written = serde_json::to_string(response)
        .map_err(std::io::Error::from)
        .and_then(|json| {
            writeln!(out, "{json}")?;
            out.flush()
        });
    if let Err(e) = written {
        log!("could not write response {}: {e}", response.id);
    }
}

#[cfg(windows)]
fn handle_command(
    excel: &mut Option<excel::ExcelApp>,
    request: &excel_com_protocol::Request,
) -> excel_com_protocol::Response {
    use excel_com_protocol::*;

    let id = request.id;

    let result = match &request.command {
        Command::Init => init_com_and_excel(excel),
        Command::OpenWorkbook { path } => with_excel(excel, |app| {
            let handle = app.open_workbook(path)?;
            Ok(Some(ResponseData::WorkbookHandle { workbook: handle }))
        }),
        Command::RefreshAll { workbook } => with_excel(excel, |app| {
            app.refresh_all(*workbook)?;
            Ok(None)
        }),
        Command::UsedRowCount { workbook } => with_excel(excel, |app| {
            let count = app.used_row_count(*workbook)?;
            Ok(Some(ResponseData::RowCount {
                rows: count.rows,
                skipped_sheets: count.skipped_sheets,
            }))
        }),
        Command::EngineState => with_excel(excel, |app| {
            let (ready, calculation) = app.engine_state()?;
            Ok(Some(ResponseData::EngineState { ready, calculation }))
        }),
        Command::EnsureHidden => with_excel(excel, |app| {
            app.ensure_hidden()?;
            Ok(None)
        }),
        Command::SaveWorkbook { workbook, path } => with_excel(excel, |app| {
            app.save_workbook(*workbook, path.as_deref())?;
            Ok(None)
        }),
        Command::CloseWorkbook { workbook } => with_excel(excel, |app| {
            app.close_workbook(*workbook)?;
            Ok(None)
        }),
        Command::Shutdown => match excel.take() {
            Some(app) => match app.shutdown() {
                Ok(()) => {
                    uninit_com();
                    ResponseResult::Ok { data: None }
                }
                Err(e) => ResponseResult::error(format!("Shutdown failed: {e}")),
            },
            None => ResponseResult::Ok { data: None },
        },
    };

    Response { id, result }
}

#[cfg(windows)]
fn init_com_and_excel(excel: &mut Option<excel::ExcelApp>) -> excel_com_protocol::ResponseResult {
    use excel_com_protocol::ResponseResult;
    use windows::Win32::System::Com::{CoInitializeEx, COINIT_APARTMENTTHREADED};

    if excel.is_some() {
        return ResponseResult::Ok { data: None };
    }

    // Excel requires a single-threaded apartment
    unsafe {
        if let Err(e) = CoInitializeEx(None, COINIT_APARTMENTTHREADED).ok() {
            return ResponseResult::error(format!("CoInitializeEx failed: {e}"));
        }
    }

    log!("COM initialized (STA)");

    match excel::ExcelApp::new() {
        Ok(app) => {
            log!("Excel.Application created, hidden");
            *excel = Some(app);
            ResponseResult::Ok { data: None }
        }
        Err(e) => {
            uninit_com();
            ResponseResult::error(format!("Failed to create Excel.Application: {e}"))
        }
    }
}

#[cfg(windows)]
fn uninit_com() {
    unsafe {
        windows::Win32::System::Com::CoUninitialize();
    }
    log!("COM uninitialized");
}

#[cfg(windows)]
fn with_excel(
    excel: &mut Option<excel::ExcelApp>,
    f: impl FnOnce(
        &mut excel::ExcelApp,
    ) -> Result<Option<excel_com_protocol::ResponseData>, excel::ExcelError>,
) -> excel_com_protocol::ResponseResult {
    use excel_com_protocol::{ErrorKind, ResponseResult};

    match excel.as_mut() {
        Some(app) => match f(app) {
            Ok(data) => ResponseResult::Ok { data },
            Err(e) => ResponseResult::Error {
                message: e.message,
                kind: e.kind,
            },
        },
        None => ResponseResult::error_with_kind(
            "Excel not initialized. Send 'Init' command first.",
            ErrorKind::NotInitialized,
        ),
    }
}
