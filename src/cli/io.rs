//! JSON output for the CLI
//!
//! - Pages: one JSON object per line on stdout
//! - Logs: stderr only, so stdout stays machine-readable

use std::io::{self, Write};

use serde::Serialize;

use super::errors::CliResult;

/// Write one value as a single JSON line to stdout
pub fn write_line<T: Serialize>(value: &T) -> CliResult<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(())
}

/// Write an error object to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_line(&serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    }))
}
