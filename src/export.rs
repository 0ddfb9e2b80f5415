//! Flat CSV export of measurement history.
//!
//! Format:
//! timestamp,download_mbps,upload_mbps,ping_ms,server

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::measure::HistoryEntry;

pub const CSV_HEADER: &str = "timestamp,download_mbps,upload_mbps,ping_ms,server";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Write `entries` to `path` in the order given.
///
/// The file is created or truncated. A failure part-way leaves whatever was
/// written in place.
pub fn export_csv(path: &Path, entries: &[HistoryEntry]) -> Result<(), ExportError> {
    let io_err = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    write_csv(&mut writer, entries).map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    tracing::info!(path = %path.display(), rows = entries.len(), "exported history");
    Ok(())
}

/// Write header plus one row per entry to any writer.
pub fn write_csv<W: Write>(writer: &mut W, entries: &[HistoryEntry]) -> std::io::Result<()> {
    writeln!(writer, "{}", CSV_HEADER)?;
    for e in entries {
        writeln!(
            writer,
            "{},{:.4},{:.4},{},{}",
            quote_field(e.timestamp()),
            e.download_mbps(),
            e.upload_mbps(),
            e.ping_ms(),
            quote_field(e.server()),
        )?;
    }
    Ok(())
}

pub fn to_csv_string(entries: &[HistoryEntry]) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_csv(&mut buf, entries);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Minimal quoting: only fields containing a delimiter, quote or newline.
fn quote_field(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\"")).into()
    } else {
        field.into()
    }
}
