//! Session data types
//!
//! Types representing Claude Code sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::turn::{OrphanResult, Turn};

/// Session header row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub transcript_path: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Unset until the first turn has been reconstructed
    pub end_time: Option<DateTime<Utc>>,
}

impl Session {
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0))
    }
}

/// Summary view of a session for list display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub transcript_path: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub turn_count: u32,
    pub tool_use_count: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A session with its full turn, message and tool-use graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: Session,
    pub turns: Vec<Turn>,
    pub orphan_results: Vec<OrphanResult>,
}

impl SessionDetail {
    pub fn message_count(&self) -> usize {
        self.turns
            .iter()
            .map(|t| 1 + t.assistant_messages.len())
            .sum()
    }

    pub fn tool_use_count(&self) -> usize {
        self.turns.iter().map(|t| t.tool_uses.len()).sum()
    }
}

/// Filter options for session queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    /// Only sessions with activity at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of sessions, newest first
    pub limit: Option<u32>,
}

impl SessionFilter {
    /// Sessions active within the last `days` days
    pub fn last_days(days: i64) -> Self {
        Self {
            since: Some(Utc::now() - chrono::Duration::days(days)),
            limit: None,
        }
    }
}
