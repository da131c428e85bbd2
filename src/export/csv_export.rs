//! CSV export functionality
//!
//! Provides CSV serialization for sessions and tool calls.

use std::path::Path;

use csv::Writer;
use serde::Serialize;

use super::{ExportResult, ExportableSession, ExportableToolUse};

fn write_records<T: Serialize>(records: &[T], path: &Path) -> ExportResult<()> {
    let mut writer = Writer::from_path(path)?;

    for record in records {
        writer.serialize(record)?;
    }

    writer.flush()?;
    Ok(())
}

/// Write sessions to CSV format
pub fn write_sessions_csv(sessions: &[ExportableSession], path: &Path) -> ExportResult<()> {
    write_records(sessions, path)
}

/// Write tool calls to CSV format
pub fn write_tool_uses_csv(tool_uses: &[ExportableToolUse], path: &Path) -> ExportResult<()> {
    write_records(tool_uses, path)
}
