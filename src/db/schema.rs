//! Database schema definitions
//!
//! Contains SQL for creating all tables and indexes

use rusqlite::Connection;
use super::DbError;

/// SQL schema for all tables
const SCHEMA: &str = r#"
-- Core session tracking
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    transcript_path TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_time DESC);

-- Turn (cycle) tracking
CREATE TABLE IF NOT EXISTS turns (
    turn_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    turn_number INTEGER NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration_ms INTEGER,
    UNIQUE(session_id, turn_number)
);

CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, turn_number);

-- User and assistant messages; assistant ids are merge keys
CREATE TABLE IF NOT EXISTS messages (
    session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    message_id TEXT NOT NULL,
    turn_number INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    model TEXT,
    input_tokens INTEGER DEFAULT 0,
    output_tokens INTEGER DEFAULT 0,
    cache_read_tokens INTEGER DEFAULT 0,
    cache_creation_tokens INTEGER DEFAULT 0,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (session_id, message_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_turn ON messages(session_id, turn_number, seq);

-- Tool usage tracking; success is NULL while the result is pending
CREATE TABLE IF NOT EXISTS tool_uses (
    session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    tool_use_id TEXT NOT NULL,
    turn_number INTEGER NOT NULL,
    message_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    tool_name TEXT NOT NULL,
    input_json TEXT,
    output TEXT,
    success INTEGER,
    error TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration_ms INTEGER,
    PRIMARY KEY (session_id, tool_use_id)
);

CREATE INDEX IF NOT EXISTS idx_tool_uses_turn ON tool_uses(session_id, turn_number, seq);
CREATE INDEX IF NOT EXISTS idx_tool_uses_name ON tool_uses(tool_name);

-- Tool results without a known invocation; may precede the session row
CREATE TABLE IF NOT EXISTS orphan_results (
    session_id TEXT NOT NULL,
    tool_use_id TEXT NOT NULL,
    turn_number INTEGER,
    output TEXT NOT NULL,
    is_error INTEGER DEFAULT 0,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (session_id, tool_use_id)
);

-- Metrics samples; immutable, deduplicated on their natural key
CREATE TABLE IF NOT EXISTS metrics_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT,
    seq INTEGER NOT NULL,
    metric_name TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT,
    timestamp TEXT,
    labels TEXT NOT NULL DEFAULT '{}',
    instrument TEXT NOT NULL DEFAULT 'unknown',
    observation_count INTEGER,
    recorded_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_metrics_natural ON metrics_samples(
    IFNULL(session_id, ''), seq, metric_name, IFNULL(timestamp, ''), value, labels
);
CREATE INDEX IF NOT EXISTS idx_metrics_session ON metrics_samples(session_id);

-- File position tracking (for incremental parsing)
CREATE TABLE IF NOT EXISTS file_positions (
    file_path TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    byte_position INTEGER DEFAULT 0,
    line_offset INTEGER DEFAULT 0,
    state_json TEXT,
    last_read_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_file_positions_session ON file_positions(session_id);

-- Local resource snapshots, in capture order
CREATE TABLE IF NOT EXISTS resource_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    stage_id TEXT,
    stage_name TEXT,
    cpu_percent REAL DEFAULT 0,
    memory_used_bytes INTEGER DEFAULT 0,
    memory_available_bytes INTEGER DEFAULT 0,
    memory_total_bytes INTEGER DEFAULT 0,
    memory_percent REAL DEFAULT 0,
    process_memory_rss INTEGER DEFAULT 0,
    process_memory_vms INTEGER DEFAULT 0,
    network_bytes_sent INTEGER DEFAULT 0,
    network_bytes_recv INTEGER DEFAULT 0,
    network_packets_sent INTEGER DEFAULT 0,
    network_packets_recv INTEGER DEFAULT 0,
    disk_read_bytes INTEGER DEFAULT 0,
    disk_write_bytes INTEGER DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_resource_snapshots_session ON resource_snapshots(session_id, timestamp);

-- Resource use per stage
CREATE TABLE IF NOT EXISTS stage_resource_usage (
    session_id TEXT NOT NULL,
    stage_id TEXT NOT NULL,
    stage_name TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    avg_cpu_percent REAL DEFAULT 0,
    max_cpu_percent REAL DEFAULT 0,
    avg_memory_percent REAL DEFAULT 0,
    max_memory_bytes INTEGER DEFAULT 0,
    memory_delta_bytes INTEGER DEFAULT 0,
    network_bytes_sent_delta INTEGER DEFAULT 0,
    network_bytes_recv_delta INTEGER DEFAULT 0,
    disk_read_bytes_delta INTEGER DEFAULT 0,
    disk_write_bytes_delta INTEGER DEFAULT 0,
    snapshot_count INTEGER DEFAULT 0,
    PRIMARY KEY (session_id, stage_id)
);
"#;

/// Create all database tables
pub fn create_tables(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(count, 9);
    }

    #[test]
    fn test_create_tables_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
    }
}
