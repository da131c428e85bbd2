//! Export module for CSV and JSON export functionality
//!
//! Writes stored sessions, their statistics and tool calls to files.

pub mod csv_export;
pub mod json_export;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{queries, Database, DbError};
use crate::metrics::stats::{compute_statistics, Stats};
use crate::models::{SessionFilter, ToolUse};

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid export format: {0}. Use 'csv' or 'json'")]
    InvalidFormat(String),
}

pub type ExportResult<T> = Result<T, ExportError>;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl std::str::FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(ExportError::InvalidFormat(s.to_string())),
        }
    }
}

impl ExportFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

/// Flat session record for CSV/JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportableSession {
    pub session_id: String,
    pub transcript_path: Option<String>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_ms: u64,
    pub turns: u32,
    pub messages: u32,
    pub tool_uses: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_hit_rate: f64,
    pub enriched: bool,
    pub model_time_ms: u64,
    pub tool_time_ms: u64,
    pub errors: u32,
    pub retries: u32,
}

impl ExportableSession {
    pub fn from_stats(stats: &Stats, transcript_path: Option<String>) -> Self {
        Self {
            session_id: stats.session_id.clone(),
            transcript_path,
            start_time: stats.start_time.to_rfc3339(),
            end_time: stats.end_time.map(|t| t.to_rfc3339()),
            duration_ms: stats.total_duration_ms,
            turns: stats.turn_count,
            messages: stats.message_count,
            tool_uses: stats.tool_use_count,
            input_tokens: stats.tokens.input_tokens,
            output_tokens: stats.tokens.output_tokens,
            cache_read_tokens: stats.tokens.cache_read_tokens,
            cache_creation_tokens: stats.tokens.cache_creation_tokens,
            cache_hit_rate: stats.cache_hit_rate,
            enriched: stats.enriched,
            model_time_ms: stats.time.model_time_ms,
            tool_time_ms: stats.time.tool_time_ms,
            errors: stats.error_count,
            retries: stats.retry_count,
        }
    }
}

/// Flat tool call record for CSV/JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportableToolUse {
    pub session_id: String,
    pub turn_number: u32,
    pub tool_use_id: String,
    pub name: String,
    pub input: String,
    pub output_preview: Option<String>,
    /// `success`, `error` or `pending`
    pub status: String,
    pub error: Option<String>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_ms: Option<i64>,
}

const OUTPUT_PREVIEW_CHARS: usize = 100;

impl From<&ToolUse> for ExportableToolUse {
    fn from(tool_use: &ToolUse) -> Self {
        let status = match tool_use.success {
            Some(true) => "success",
            Some(false) => "error",
            None => "pending",
        };
        Self {
            session_id: tool_use.session_id.clone(),
            turn_number: tool_use.turn_number,
            tool_use_id: tool_use.tool_use_id.clone(),
            name: tool_use.name.clone(),
            input: tool_use.input.to_string(),
            output_preview: tool_use.output.as_ref().map(|out| {
                if out.chars().count() > OUTPUT_PREVIEW_CHARS {
                    let cut: String = out.chars().take(OUTPUT_PREVIEW_CHARS).collect();
                    format!("{}...", cut)
                } else {
                    out.clone()
                }
            }),
            status: status.to_string(),
            error: tool_use.error.clone(),
            start_time: tool_use.start_time.to_rfc3339(),
            end_time: tool_use.end_time.map(|t| t.to_rfc3339()),
            duration_ms: tool_use.duration_ms(),
        }
    }
}

/// Generate a timestamped filename for exports
pub fn generate_export_filename(prefix: &str, extension: &str) -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.{}", prefix, timestamp, extension)
}

/// Stored sessions matching `filter`, as export records
pub fn exportable_sessions(db: &Database, filter: &SessionFilter) -> ExportResult<Vec<ExportableSession>> {
    let summaries = db.with_connection(|conn| queries::list_sessions(conn, filter))?;
    let mut sessions = Vec::with_capacity(summaries.len());

    for summary in summaries {
        match compute_statistics(db, &summary.session_id) {
            Ok(Some(stats)) => {
                sessions.push(ExportableSession::from_stats(&stats, summary.transcript_path));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Skipping session {} in export: {}", summary.session_id, e);
            }
        }
    }

    Ok(sessions)
}

/// Export sessions matching `filter` into `dir`, returning the file written
pub fn export_sessions(
    db: &Database,
    filter: &SessionFilter,
    format: ExportFormat,
    dir: &Path,
) -> ExportResult<PathBuf> {
    let sessions = exportable_sessions(db, filter)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(generate_export_filename("sessions", format.extension()));

    match format {
        ExportFormat::Csv => write_sessions_csv(&sessions, &path)?,
        ExportFormat::Json => write_sessions_json(&sessions, &path)?,
    }

    tracing::info!("Exported {} sessions to {:?}", sessions.len(), path);
    Ok(path)
}

/// Export a session's tool calls, optionally only one tool, as CSV into `dir`
pub fn export_tool_uses(
    db: &Database,
    session_id: &str,
    tool_name: Option<&str>,
    dir: &Path,
) -> ExportResult<PathBuf> {
    let tool_uses = db.with_connection(|conn| queries::get_tool_uses(conn, session_id, tool_name))?;
    let records: Vec<ExportableToolUse> = tool_uses.iter().map(ExportableToolUse::from).collect();

    std::fs::create_dir_all(dir)?;
    let path = dir.join(generate_export_filename("tool_uses", "csv"));
    write_tool_uses_csv(&records, &path)?;

    tracing::info!("Exported {} tool uses of {} to {:?}", records.len(), session_id, path);
    Ok(path)
}

// Re-export writers
pub use csv_export::*;
pub use json_export::*;
