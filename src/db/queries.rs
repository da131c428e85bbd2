//! Database query implementations
//!
//! Upserts are keyed by natural identifiers so repeating them with the same
//! input never adds rows. Reads rebuild the session graph.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::DbError;
use crate::models::{
    InstrumentKind, Message, MetricsSample, OrphanResult, ResourceReading, ResourceSnapshot, Role,
    Session, SessionDetail, SessionFilter, SessionSummary, StageUsage, TokenUsage, ToolUse, Turn,
};
use crate::parser::session::ReconstructionState;

/// Read cursor of a transcript file
#[derive(Debug, Clone, PartialEq)]
pub struct FilePosition {
    pub file_path: String,
    pub session_id: String,
    pub byte_position: u64,
    pub line_offset: u64,
    pub state: ReconstructionState,
}

/// Decode a JSON text column
fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn role_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Role> {
    let text: String = row.get(idx)?;
    text.parse::<Role>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

// ============================================================================
// Upserts
// ============================================================================

/// Insert or update a session header
pub fn upsert_session(conn: &Connection, session: &Session) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO sessions (session_id, transcript_path, start_time, end_time)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(session_id) DO UPDATE SET
            transcript_path = COALESCE(excluded.transcript_path, sessions.transcript_path),
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            updated_at = CURRENT_TIMESTAMP
        "#,
        params![
            session.session_id,
            session.transcript_path,
            session.start_time,
            session.end_time,
        ],
    )?;
    Ok(())
}

/// Insert or update a turn with its messages and tool uses
pub fn upsert_turn(conn: &Connection, turn: &Turn) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO turns (turn_id, session_id, turn_number, start_time, end_time, duration_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(turn_id) DO UPDATE SET
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            duration_ms = excluded.duration_ms
        "#,
        params![
            turn.turn_id(),
            turn.session_id,
            turn.turn_number,
            turn.start_time,
            turn.end_time,
            turn.duration_ms(),
        ],
    )?;

    upsert_message(conn, &turn.user_message, 0)?;
    for (i, message) in turn.assistant_messages.iter().enumerate() {
        upsert_message(conn, message, i as i64 + 1)?;
    }
    for (i, tool_use) in turn.tool_uses.iter().enumerate() {
        upsert_tool_use(conn, tool_use, i as i64)?;
    }

    Ok(())
}

/// Insert or update a message; `seq` orders messages within their turn
pub fn upsert_message(conn: &Connection, message: &Message, seq: i64) -> Result<(), DbError> {
    let content = serde_json::to_string(&message.content)?;

    conn.execute(
        r#"
        INSERT INTO messages (
            session_id, message_id, turn_number, seq, role, content, model,
            input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens, timestamp
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(session_id, message_id) DO UPDATE SET
            turn_number = excluded.turn_number,
            seq = excluded.seq,
            content = excluded.content,
            model = excluded.model,
            input_tokens = excluded.input_tokens,
            output_tokens = excluded.output_tokens,
            cache_read_tokens = excluded.cache_read_tokens,
            cache_creation_tokens = excluded.cache_creation_tokens,
            timestamp = excluded.timestamp
        "#,
        params![
            message.session_id,
            message.message_id,
            message.turn_number,
            seq,
            message.role.as_str(),
            content,
            message.model,
            message.usage.input_tokens as i64,
            message.usage.output_tokens as i64,
            message.usage.cache_read_tokens as i64,
            message.usage.cache_creation_tokens as i64,
            message.timestamp,
        ],
    )?;
    Ok(())
}

/// Insert or update a tool use
pub fn upsert_tool_use(conn: &Connection, tool_use: &ToolUse, seq: i64) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO tool_uses (
            session_id, tool_use_id, turn_number, message_id, seq, tool_name, input_json,
            output, success, error, start_time, end_time, duration_ms
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(session_id, tool_use_id) DO UPDATE SET
            turn_number = excluded.turn_number,
            message_id = excluded.message_id,
            seq = excluded.seq,
            tool_name = excluded.tool_name,
            input_json = excluded.input_json,
            output = excluded.output,
            success = excluded.success,
            error = excluded.error,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            duration_ms = excluded.duration_ms
        "#,
        params![
            tool_use.session_id,
            tool_use.tool_use_id,
            tool_use.turn_number,
            tool_use.message_id,
            seq,
            tool_use.name,
            tool_use.input,
            tool_use.output,
            tool_use.success,
            tool_use.error,
            tool_use.start_time,
            tool_use.end_time,
            tool_use.duration_ms(),
        ],
    )?;
    Ok(())
}

/// Insert or update an orphan tool result
pub fn upsert_orphan(conn: &Connection, orphan: &OrphanResult) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO orphan_results (session_id, tool_use_id, turn_number, output, is_error, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(session_id, tool_use_id) DO UPDATE SET
            turn_number = excluded.turn_number,
            output = excluded.output,
            is_error = excluded.is_error,
            timestamp = excluded.timestamp
        "#,
        params![
            orphan.session_id,
            orphan.tool_use_id,
            orphan.turn_number,
            orphan.output,
            orphan.is_error,
            orphan.timestamp,
        ],
    )?;
    Ok(())
}

/// Record metrics samples, skipping ones already stored. Returns how many were new.
pub fn insert_metrics_samples(conn: &Connection, samples: &[MetricsSample]) -> Result<usize, DbError> {
    let mut stmt = conn.prepare(
        r#"
        INSERT OR IGNORE INTO metrics_samples (
            session_id, seq, metric_name, value, unit, timestamp, labels, instrument, observation_count
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )?;

    let mut inserted = 0;
    for sample in samples {
        inserted += stmt.execute(params![
            sample.session_id,
            sample.seq as i64,
            sample.name,
            sample.value,
            sample.unit,
            sample.timestamp,
            sample.labels_json(),
            sample.instrument.as_str(),
            sample.count.map(|c| c as i64),
        ])?;
    }

    Ok(inserted)
}

// ============================================================================
// Reads
// ============================================================================

/// List sessions by recency, newest first
pub fn list_sessions(conn: &Connection, filter: &SessionFilter) -> Result<Vec<SessionSummary>, DbError> {
    let limit = filter.limit.map(i64::from).unwrap_or(-1);

    let mut stmt = conn.prepare(
        r#"
        SELECT
            s.session_id,
            s.transcript_path,
            s.start_time,
            s.end_time,
            (SELECT COUNT(*) FROM turns t WHERE t.session_id = s.session_id) AS turn_count,
            (SELECT COUNT(*) FROM tool_uses u WHERE u.session_id = s.session_id) AS tool_use_count,
            (SELECT COALESCE(SUM(m.input_tokens), 0) FROM messages m WHERE m.session_id = s.session_id),
            (SELECT COALESCE(SUM(m.output_tokens), 0) FROM messages m WHERE m.session_id = s.session_id)
        FROM sessions s
        WHERE ?1 IS NULL OR COALESCE(s.end_time, s.start_time) >= ?1
        ORDER BY COALESCE(s.end_time, s.start_time) DESC
        LIMIT ?2
        "#,
    )?;

    let sessions = stmt
        .query_map(params![filter.since, limit], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                transcript_path: row.get(1)?,
                start_time: row.get(2)?,
                end_time: row.get(3)?,
                turn_count: row.get(4)?,
                tool_use_count: row.get(5)?,
                input_tokens: row.get::<_, i64>(6)? as u64,
                output_tokens: row.get::<_, i64>(7)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(sessions)
}

/// Get a session header by ID
pub fn get_session(conn: &Connection, session_id: &str) -> Result<Option<Session>, DbError> {
    let session = conn
        .query_row(
            "SELECT session_id, transcript_path, start_time, end_time FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(Session {
                    session_id: row.get(0)?,
                    transcript_path: row.get(1)?,
                    start_time: row.get(2)?,
                    end_time: row.get(3)?,
                })
            },
        )
        .optional()?;

    Ok(session)
}

/// Get a session with its turns, messages, tool uses and orphan results
pub fn get_session_detail(conn: &Connection, session_id: &str) -> Result<Option<SessionDetail>, DbError> {
    let Some(session) = get_session(conn, session_id)? else {
        return Ok(None);
    };

    let mut messages: HashMap<u32, Vec<Message>> = HashMap::new();
    for message in get_messages(conn, session_id)? {
        messages.entry(message.turn_number).or_default().push(message);
    }

    let mut tool_uses: HashMap<u32, Vec<ToolUse>> = HashMap::new();
    for tool_use in get_tool_uses(conn, session_id, None)? {
        tool_uses.entry(tool_use.turn_number).or_default().push(tool_use);
    }

    let mut stmt = conn.prepare(
        "SELECT turn_number, start_time, end_time FROM turns WHERE session_id = ?1 ORDER BY turn_number",
    )?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, DateTime<Utc>>(1)?,
                row.get::<_, Option<DateTime<Utc>>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut turns = Vec::with_capacity(rows.len());
    for (turn_number, start_time, end_time) in rows {
        let mut turn_messages = messages.remove(&turn_number).unwrap_or_default().into_iter();
        let Some(user_message) = turn_messages.next().filter(|m| m.role == Role::User) else {
            tracing::warn!("Turn {} of {} has no user message", turn_number, session_id);
            continue;
        };

        turns.push(Turn {
            session_id: session_id.to_string(),
            turn_number,
            user_message,
            assistant_messages: turn_messages.collect(),
            tool_uses: tool_uses.remove(&turn_number).unwrap_or_default(),
            start_time,
            end_time,
        });
    }

    Ok(Some(SessionDetail {
        session,
        turns,
        orphan_results: get_orphan_results(conn, session_id)?,
    }))
}

/// Messages of a session in turn order
pub fn get_messages(conn: &Connection, session_id: &str) -> Result<Vec<Message>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT session_id, message_id, turn_number, role, content, model,
               input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens, timestamp
        FROM messages
        WHERE session_id = ?1
        ORDER BY turn_number, seq
        "#,
    )?;

    let messages = stmt
        .query_map(params![session_id], |row| {
            Ok(Message {
                session_id: row.get(0)?,
                message_id: row.get(1)?,
                turn_number: row.get(2)?,
                role: role_column(row, 3)?,
                content: json_column(row, 4)?,
                model: row.get(5)?,
                usage: TokenUsage {
                    input_tokens: row.get::<_, i64>(6)? as u64,
                    output_tokens: row.get::<_, i64>(7)? as u64,
                    cache_read_tokens: row.get::<_, i64>(8)? as u64,
                    cache_creation_tokens: row.get::<_, i64>(9)? as u64,
                },
                timestamp: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(messages)
}

/// Tool uses of a session, optionally only those of one tool
pub fn get_tool_uses(
    conn: &Connection,
    session_id: &str,
    tool_name: Option<&str>,
) -> Result<Vec<ToolUse>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT session_id, tool_use_id, turn_number, message_id, tool_name, input_json,
               output, success, error, start_time, end_time
        FROM tool_uses
        WHERE session_id = ?1 AND (?2 IS NULL OR tool_name = ?2)
        ORDER BY turn_number, seq
        "#,
    )?;

    let tool_uses = stmt
        .query_map(params![session_id, tool_name], |row| {
            Ok(ToolUse {
                session_id: row.get(0)?,
                tool_use_id: row.get(1)?,
                turn_number: row.get(2)?,
                message_id: row.get(3)?,
                name: row.get(4)?,
                input: row.get::<_, Option<Value>>(5)?.unwrap_or(Value::Null),
                output: row.get(6)?,
                success: row.get(7)?,
                error: row.get(8)?,
                start_time: row.get(9)?,
                end_time: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(tool_uses)
}

/// Orphan tool results of a session
pub fn get_orphan_results(conn: &Connection, session_id: &str) -> Result<Vec<OrphanResult>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT session_id, tool_use_id, turn_number, output, is_error, timestamp
        FROM orphan_results
        WHERE session_id = ?1
        ORDER BY timestamp
        "#,
    )?;

    let orphans = stmt
        .query_map(params![session_id], |row| {
            Ok(OrphanResult {
                session_id: row.get(0)?,
                tool_use_id: row.get(1)?,
                turn_number: row.get(2)?,
                output: row.get(3)?,
                is_error: row.get(4)?,
                timestamp: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(orphans)
}

/// Metrics samples of one session, or of every session when `None`
pub fn get_metrics_samples(
    conn: &Connection,
    session_id: Option<&str>,
) -> Result<Vec<MetricsSample>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT session_id, seq, metric_name, value, unit, timestamp, labels, instrument, observation_count
        FROM metrics_samples
        WHERE ?1 IS NULL OR session_id = ?1
        ORDER BY id
        "#,
    )?;

    let samples = stmt
        .query_map(params![session_id], |row| {
            let labels: BTreeMap<String, String> = json_column(row, 6)?;
            let instrument: String = row.get(7)?;
            Ok(MetricsSample {
                session_id: row.get(0)?,
                seq: row.get::<_, i64>(1)? as u64,
                name: row.get(2)?,
                value: row.get(3)?,
                unit: row.get(4)?,
                timestamp: row.get(5)?,
                labels,
                instrument: InstrumentKind::parse(&instrument),
                count: row.get::<_, Option<i64>>(8)?.map(|c| c as u64),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(samples)
}

// ============================================================================
// Resource usage
// ============================================================================

/// Append a resource snapshot
pub fn insert_resource_snapshot(conn: &Connection, snapshot: &ResourceSnapshot) -> Result<(), DbError> {
    let r = &snapshot.reading;
    conn.execute(
        r#"
        INSERT INTO resource_snapshots (
            session_id, timestamp, stage_id, stage_name, cpu_percent,
            memory_used_bytes, memory_available_bytes, memory_total_bytes, memory_percent,
            process_memory_rss, process_memory_vms,
            network_bytes_sent, network_bytes_recv, network_packets_sent, network_packets_recv,
            disk_read_bytes, disk_write_bytes
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
        params![
            snapshot.session_id,
            snapshot.timestamp,
            snapshot.stage_id,
            snapshot.stage_name,
            r.cpu_percent,
            r.memory_used_bytes as i64,
            r.memory_available_bytes as i64,
            r.memory_total_bytes as i64,
            r.memory_percent,
            r.process_memory_rss as i64,
            r.process_memory_vms as i64,
            r.network_bytes_sent as i64,
            r.network_bytes_recv as i64,
            r.network_packets_sent as i64,
            r.network_packets_recv as i64,
            r.disk_read_bytes as i64,
            r.disk_write_bytes as i64,
        ],
    )?;
    Ok(())
}

/// Insert or replace the aggregate of one stage
pub fn upsert_stage_usage(conn: &Connection, usage: &StageUsage) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO stage_resource_usage (
            session_id, stage_id, stage_name, start_time, end_time,
            avg_cpu_percent, max_cpu_percent, avg_memory_percent, max_memory_bytes,
            memory_delta_bytes, network_bytes_sent_delta, network_bytes_recv_delta,
            disk_read_bytes_delta, disk_write_bytes_delta, snapshot_count
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT(session_id, stage_id) DO UPDATE SET
            stage_name = excluded.stage_name,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            avg_cpu_percent = excluded.avg_cpu_percent,
            max_cpu_percent = excluded.max_cpu_percent,
            avg_memory_percent = excluded.avg_memory_percent,
            max_memory_bytes = excluded.max_memory_bytes,
            memory_delta_bytes = excluded.memory_delta_bytes,
            network_bytes_sent_delta = excluded.network_bytes_sent_delta,
            network_bytes_recv_delta = excluded.network_bytes_recv_delta,
            disk_read_bytes_delta = excluded.disk_read_bytes_delta,
            disk_write_bytes_delta = excluded.disk_write_bytes_delta,
            snapshot_count = excluded.snapshot_count
        "#,
        params![
            usage.session_id,
            usage.stage_id,
            usage.stage_name,
            usage.start_time,
            usage.end_time,
            usage.avg_cpu_percent,
            usage.max_cpu_percent,
            usage.avg_memory_percent,
            usage.max_memory_bytes as i64,
            usage.memory_delta_bytes,
            usage.network_bytes_sent_delta,
            usage.network_bytes_recv_delta,
            usage.disk_read_bytes_delta,
            usage.disk_write_bytes_delta,
            usage.snapshot_count,
        ],
    )?;
    Ok(())
}

/// Snapshots of a session in capture order
pub fn get_resource_snapshots(conn: &Connection, session_id: &str) -> Result<Vec<ResourceSnapshot>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT session_id, timestamp, stage_id, stage_name, cpu_percent,
               memory_used_bytes, memory_available_bytes, memory_total_bytes, memory_percent,
               process_memory_rss, process_memory_vms,
               network_bytes_sent, network_bytes_recv, network_packets_sent, network_packets_recv,
               disk_read_bytes, disk_write_bytes
        FROM resource_snapshots
        WHERE session_id = ?1
        ORDER BY id
        "#,
    )?;

    let snapshots = stmt
        .query_map(params![session_id], |row| {
            let bytes = |idx: usize| row.get::<_, i64>(idx).map(|v| v.max(0) as u64);
            Ok(ResourceSnapshot {
                session_id: row.get(0)?,
                timestamp: row.get(1)?,
                stage_id: row.get(2)?,
                stage_name: row.get(3)?,
                reading: ResourceReading {
                    cpu_percent: row.get(4)?,
                    memory_used_bytes: bytes(5)?,
                    memory_available_bytes: bytes(6)?,
                    memory_total_bytes: bytes(7)?,
                    memory_percent: row.get(8)?,
                    process_memory_rss: bytes(9)?,
                    process_memory_vms: bytes(10)?,
                    network_bytes_sent: bytes(11)?,
                    network_bytes_recv: bytes(12)?,
                    network_packets_sent: bytes(13)?,
                    network_packets_recv: bytes(14)?,
                    disk_read_bytes: bytes(15)?,
                    disk_write_bytes: bytes(16)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(snapshots)
}

/// Stage aggregates of a session by start time
pub fn get_stage_usage(conn: &Connection, session_id: &str) -> Result<Vec<StageUsage>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT session_id, stage_id, stage_name, start_time, end_time,
               avg_cpu_percent, max_cpu_percent, avg_memory_percent, max_memory_bytes,
               memory_delta_bytes, network_bytes_sent_delta, network_bytes_recv_delta,
               disk_read_bytes_delta, disk_write_bytes_delta, snapshot_count
        FROM stage_resource_usage
        WHERE session_id = ?1
        ORDER BY start_time, stage_id
        "#,
    )?;

    let stages = stmt
        .query_map(params![session_id], |row| {
            Ok(StageUsage {
                session_id: row.get(0)?,
                stage_id: row.get(1)?,
                stage_name: row.get(2)?,
                start_time: row.get(3)?,
                end_time: row.get(4)?,
                avg_cpu_percent: row.get(5)?,
                max_cpu_percent: row.get(6)?,
                avg_memory_percent: row.get(7)?,
                max_memory_bytes: row.get::<_, i64>(8)?.max(0) as u64,
                memory_delta_bytes: row.get(9)?,
                network_bytes_sent_delta: row.get(10)?,
                network_bytes_recv_delta: row.get(11)?,
                disk_read_bytes_delta: row.get(12)?,
                disk_write_bytes_delta: row.get(13)?,
                snapshot_count: row.get(14)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(stages)
}

// ============================================================================
// Deletion
// ============================================================================

/// Delete a session and everything attached to it in one transaction.
/// Returns `false` when the session did not exist.
pub fn delete_session(conn: &Connection, session_id: &str) -> Result<bool, DbError> {
    let tx = conn.unchecked_transaction()?;

    tx.execute("DELETE FROM tool_uses WHERE session_id = ?1", params![session_id])?;
    tx.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])?;
    tx.execute("DELETE FROM turns WHERE session_id = ?1", params![session_id])?;
    tx.execute("DELETE FROM orphan_results WHERE session_id = ?1", params![session_id])?;
    tx.execute("DELETE FROM metrics_samples WHERE session_id = ?1", params![session_id])?;
    tx.execute("DELETE FROM file_positions WHERE session_id = ?1", params![session_id])?;
    tx.execute("DELETE FROM resource_snapshots WHERE session_id = ?1", params![session_id])?;
    tx.execute("DELETE FROM stage_resource_usage WHERE session_id = ?1", params![session_id])?;
    let deleted = tx.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])?;

    tx.commit()?;

    if deleted > 0 {
        tracing::info!("Deleted session {}", session_id);
    }
    Ok(deleted > 0)
}

/// Drop the rows rebuilt from a session's transcript, keeping the session
/// header and its metrics. Used before a rewritten transcript is reprocessed.
pub fn clear_transcript_records(conn: &Connection, session_id: &str) -> Result<(), DbError> {
    conn.execute("DELETE FROM tool_uses WHERE session_id = ?1", params![session_id])?;
    conn.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])?;
    conn.execute("DELETE FROM turns WHERE session_id = ?1", params![session_id])?;
    conn.execute("DELETE FROM orphan_results WHERE session_id = ?1", params![session_id])?;
    Ok(())
}

// ============================================================================
// Read cursors
// ============================================================================

/// Get file position for incremental parsing
pub fn get_file_position(conn: &Connection, file_path: &str) -> Result<Option<FilePosition>, DbError> {
    let position = conn
        .query_row(
            r#"
            SELECT file_path, session_id, byte_position, line_offset, state_json
            FROM file_positions
            WHERE file_path = ?1
            "#,
            params![file_path],
            |row| {
                let session_id: String = row.get(1)?;
                let state = match row.get::<_, Option<String>>(4)? {
                    Some(_) => json_column(row, 4)?,
                    None => ReconstructionState::new(session_id.clone()),
                };
                Ok(FilePosition {
                    file_path: row.get(0)?,
                    session_id,
                    byte_position: row.get::<_, i64>(2)? as u64,
                    line_offset: row.get::<_, i64>(3)? as u64,
                    state,
                })
            },
        )
        .optional()?;

    Ok(position)
}

/// Update file position
pub fn update_file_position(conn: &Connection, position: &FilePosition) -> Result<(), DbError> {
    let state_json = serde_json::to_string(&position.state)?;

    conn.execute(
        r#"
        INSERT INTO file_positions (file_path, session_id, byte_position, line_offset, state_json, last_read_at)
        VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
        ON CONFLICT(file_path) DO UPDATE SET
            session_id = excluded.session_id,
            byte_position = excluded.byte_position,
            line_offset = excluded.line_offset,
            state_json = excluded.state_json,
            last_read_at = CURRENT_TIMESTAMP
        "#,
        params![
            position.file_path,
            position.session_id,
            position.byte_position as i64,
            position.line_offset as i64,
            state_json,
        ],
    )?;
    Ok(())
}

/// Forget a file's read cursor
pub fn clear_file_position(conn: &Connection, file_path: &str) -> Result<(), DbError> {
    conn.execute("DELETE FROM file_positions WHERE file_path = ?1", params![file_path])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::ContentBlock;
    use chrono::TimeZone;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    fn sample_turn(session_id: &str) -> Turn {
        let user_message = Message {
            message_id: "u1".to_string(),
            session_id: session_id.to_string(),
            turn_number: 1,
            role: Role::User,
            content: vec![ContentBlock::Text { text: "list".to_string() }],
            model: None,
            usage: TokenUsage::default(),
            timestamp: ts(0),
        };
        let assistant = Message {
            message_id: "m1".to_string(),
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "c1".to_string(),
                name: "Bash".to_string(),
                input: serde_json::json!({"command": "ls"}),
            }],
            model: Some("claude-sonnet-4".to_string()),
            usage: TokenUsage::new(10, 5),
            timestamp: ts(1),
            ..user_message.clone()
        };
        let tool_use = ToolUse {
            tool_use_id: "c1".to_string(),
            session_id: session_id.to_string(),
            turn_number: 1,
            message_id: "m1".to_string(),
            name: "Bash".to_string(),
            input: serde_json::json!({"command": "ls"}),
            output: Some("a.txt\nb.txt".to_string()),
            success: Some(true),
            error: None,
            start_time: ts(1),
            end_time: Some(ts(3)),
        };

        Turn {
            session_id: session_id.to_string(),
            turn_number: 1,
            user_message,
            assistant_messages: vec![assistant],
            tool_uses: vec![tool_use],
            start_time: ts(0),
            end_time: Some(ts(3)),
        }
    }

    fn store_session(conn: &Connection, session_id: &str) {
        upsert_session(
            conn,
            &Session {
                session_id: session_id.to_string(),
                transcript_path: Some("/tmp/t.jsonl".to_string()),
                start_time: ts(0),
                end_time: Some(ts(3)),
            },
        )
        .unwrap();
        upsert_turn(conn, &sample_turn(session_id)).unwrap();
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_upserts_are_idempotent() {
        let db = Database::in_memory().unwrap();
        db.with_connection(|conn| {
            store_session(conn, "s1");
            store_session(conn, "s1");

            assert_eq!(count(conn, "sessions"), 1);
            assert_eq!(count(conn, "turns"), 1);
            assert_eq!(count(conn, "messages"), 2);
            assert_eq!(count(conn, "tool_uses"), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_session_detail_round_trip() {
        let db = Database::in_memory().unwrap();
        let detail = db
            .with_connection(|conn| {
                store_session(conn, "s1");
                get_session_detail(conn, "s1")
            })
            .unwrap()
            .unwrap();

        assert_eq!(detail.turns.len(), 1);
        assert_eq!(detail.turns[0], sample_turn("s1"));
        assert_eq!(detail.session.transcript_path.as_deref(), Some("/tmp/t.jsonl"));
    }

    #[test]
    fn test_tool_uses_filtered_by_name() {
        let db = Database::in_memory().unwrap();
        db.with_connection(|conn| {
            store_session(conn, "s1");
            assert_eq!(get_tool_uses(conn, "s1", None)?.len(), 1);
            assert_eq!(get_tool_uses(conn, "s1", Some("Bash"))?.len(), 1);
            assert!(get_tool_uses(conn, "s1", Some("Read"))?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_list_sessions_recency_window() {
        let db = Database::in_memory().unwrap();
        let sessions = db
            .with_connection(|conn| {
                store_session(conn, "s1");
                let all = list_sessions(conn, &SessionFilter::default())?;
                assert_eq!(all.len(), 1);
                assert_eq!(all[0].turn_count, 1);
                assert_eq!(all[0].input_tokens, 10);

                list_sessions(
                    conn,
                    &SessionFilter {
                        since: Some(ts(30)),
                        limit: None,
                    },
                )
            })
            .unwrap();
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_metrics_samples_deduplicated() {
        let db = Database::in_memory().unwrap();
        let mut sample = MetricsSample::new("claude_code.tokens.input", 500.0);
        sample.session_id = Some("s1".to_string());
        let unattributed = MetricsSample::new("claude_code.tokens.input", 7.0);

        db.with_connection(|conn| {
            let batch = vec![sample.clone(), unattributed.clone()];
            assert_eq!(insert_metrics_samples(conn, &batch)?, 2);
            assert_eq!(insert_metrics_samples(conn, &batch)?, 0);

            assert_eq!(get_metrics_samples(conn, Some("s1"))?, vec![sample.clone()]);
            assert_eq!(get_metrics_samples(conn, None)?.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_session_removes_everything() {
        let db = Database::in_memory().unwrap();
        db.with_connection(|conn| {
            store_session(conn, "s1");
            store_session(conn, "s2");
            let mut sample = MetricsSample::new("x", 1.0);
            sample.session_id = Some("s1".to_string());
            insert_metrics_samples(conn, &[sample])?;

            assert!(delete_session(conn, "s1")?);
            assert!(!delete_session(conn, "s1")?);

            assert!(get_session_detail(conn, "s1")?.is_none());
            assert!(get_tool_uses(conn, "s1", None)?.is_empty());
            assert!(get_messages(conn, "s1")?.is_empty());
            assert!(get_metrics_samples(conn, Some("s1"))?.is_empty());
            assert!(get_session_detail(conn, "s2")?.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_clear_transcript_records_keeps_header_and_metrics() {
        let db = Database::in_memory().unwrap();
        db.with_connection(|conn| {
            store_session(conn, "s1");
            store_session(conn, "s2");
            let mut sample = MetricsSample::new("x", 1.0);
            sample.session_id = Some("s1".to_string());
            insert_metrics_samples(conn, &[sample])?;

            clear_transcript_records(conn, "s1")?;

            let detail = get_session_detail(conn, "s1")?.unwrap();
            assert!(detail.turns.is_empty());
            assert!(get_messages(conn, "s1")?.is_empty());
            assert_eq!(get_metrics_samples(conn, Some("s1"))?.len(), 1);
            assert_eq!(get_session_detail(conn, "s2")?.unwrap().turns.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_resource_rows_round_trip() {
        let db = Database::in_memory().unwrap();
        let snapshot = ResourceSnapshot {
            session_id: "s1".to_string(),
            timestamp: ts(1),
            stage_id: Some("turn-1".to_string()),
            stage_name: Some("turn".to_string()),
            reading: ResourceReading {
                cpu_percent: 12.5,
                memory_used_bytes: 2048,
                network_bytes_recv: 99,
                ..ResourceReading::default()
            },
        };
        let mut usage = StageUsage::from_snapshots("s1", "turn-1", "turn", ts(1), None, &[snapshot.clone()]);

        db.with_connection(|conn| {
            insert_resource_snapshot(conn, &snapshot)?;
            upsert_stage_usage(conn, &usage)?;
            usage.end_time = Some(ts(5));
            upsert_stage_usage(conn, &usage)?;

            assert_eq!(get_resource_snapshots(conn, "s1")?, vec![snapshot.clone()]);
            assert_eq!(get_stage_usage(conn, "s1")?, vec![usage.clone()]);
            assert!(get_resource_snapshots(conn, "s2")?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_file_position_round_trip() {
        let db = Database::in_memory().unwrap();
        let mut state = ReconstructionState::new("s1");
        state.lines_consumed = 4;
        let position = FilePosition {
            file_path: "/tmp/t.jsonl".to_string(),
            session_id: "s1".to_string(),
            byte_position: 512,
            line_offset: 4,
            state,
        };

        db.with_connection(|conn| {
            update_file_position(conn, &position)?;
            assert_eq!(get_file_position(conn, "/tmp/t.jsonl")?, Some(position.clone()));
            clear_file_position(conn, "/tmp/t.jsonl")?;
            assert!(get_file_position(conn, "/tmp/t.jsonl")?.is_none());
            Ok(())
        })
        .unwrap();
    }
}
