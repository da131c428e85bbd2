//! JSONL parsing module
//!
//! This module handles Claude Code transcript files:
//! - Incremental line reading with byte/line cursors
//! - Line decoding into typed entries
//! - Reconstruction of turns, messages and tool calls from entries

pub mod jsonl;
pub mod session;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

/// Parser errors
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
}

/// Result type for parser operations
pub type ParserResult<T> = Result<T, ParserError>;

/// Parse an ISO-8601 timestamp, with or without offset and fractional seconds.
/// Timestamps without an offset are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}
