//! JSON export functionality
//!
//! Provides JSON serialization for sessions and computed statistics.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use super::{ExportResult, ExportableSession};

const EXPORT_VERSION: &str = "1.0.0";

/// Complete export structure for JSON
#[derive(Debug, Clone, Serialize)]
pub struct SessionsExportJson<'a> {
    pub export_date: String,
    pub export_version: &'static str,
    pub total_sessions: usize,
    pub summary: ExportSummary,
    pub sessions: &'a [ExportableSession],
}

/// Summary statistics for the export
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub total_turns: u64,
    pub total_tokens: u64,
    pub enriched_sessions: usize,
    pub avg_turns_per_session: f64,
    pub date_range: Option<(String, String)>,
}

impl ExportSummary {
    fn from_sessions(sessions: &[ExportableSession]) -> Self {
        let total_turns: u64 = sessions.iter().map(|s| s.turns as u64).sum();
        let earliest = sessions.iter().map(|s| s.start_time.as_str()).min();
        let latest = sessions
            .iter()
            .map(|s| s.end_time.as_deref().unwrap_or(&s.start_time))
            .max();

        Self {
            total_turns,
            total_tokens: sessions.iter().map(|s| s.input_tokens + s.output_tokens).sum(),
            enriched_sessions: sessions.iter().filter(|s| s.enriched).count(),
            avg_turns_per_session: crate::metrics::ratio(total_turns as f64, sessions.len() as f64),
            date_range: earliest.zip(latest).map(|(a, b)| (a.to_string(), b.to_string())),
        }
    }
}

/// Write sessions to JSON format
pub fn write_sessions_json(sessions: &[ExportableSession], path: &Path) -> ExportResult<()> {
    let export = SessionsExportJson {
        export_date: chrono::Utc::now().to_rfc3339(),
        export_version: EXPORT_VERSION,
        total_sessions: sessions.len(),
        summary: ExportSummary::from_sessions(sessions),
        sessions,
    };
    write_json(&export, path)
}

/// Pretty JSON with a trailing newline
fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> ExportResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}
