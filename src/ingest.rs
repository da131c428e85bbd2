//! Transcript and metrics ingestion
//!
//! Moves new transcript lines into the store, resuming from a per-file
//! cursor kept next to the data, and imports a session's collected metrics.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::db::queries::{self, FilePosition};
use crate::db::Database;
use crate::otel::mapping::MappingStore;
use crate::otel::MetricsCollector;
use crate::parser::jsonl::IncrementalReader;
use crate::parser::session::{reconstruct, ReconstructionState};
use crate::TraceResult;

/// What one ingest call did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub session_id: String,
    pub lines_read: usize,
    pub turns: usize,
    pub messages: usize,
    pub tool_uses: usize,
    pub orphans: usize,
    pub warnings: usize,
    /// Byte offset the next call resumes from
    pub byte_position: u64,
    /// Highest turn number touched by this call
    pub last_turn: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IngestOutcome {
    /// The transcript does not exist
    Missing,
    /// The transcript shrank; its rows and cursor were dropped so the next
    /// call rebuilds from the start
    Truncated,
    /// Nothing new since the last call
    Unchanged,
    Ingested(IngestReport),
}

/// Incremental transcript ingestion into a [`Database`]
pub struct Ingestor<'a> {
    db: &'a Database,
}

impl<'a> Ingestor<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Process lines appended to `path` since the previous call.
    pub fn ingest(&self, path: &Path, session_id: &str) -> TraceResult<IngestOutcome> {
        let file_len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("Transcript {:?} not found", path);
                return Ok(IngestOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        let key = path.to_string_lossy().to_string();
        let cursor = self
            .db
            .with_connection(|conn| queries::get_file_position(conn, &key))?
            .filter(|cursor| {
                let same = cursor.session_id == session_id;
                if !same {
                    tracing::info!(
                        "Transcript {} now belongs to session {}, starting over",
                        key,
                        session_id
                    );
                }
                same
            })
            .unwrap_or_else(|| FilePosition {
                file_path: key.clone(),
                session_id: session_id.to_string(),
                byte_position: 0,
                line_offset: 0,
                state: ReconstructionState::new(session_id),
            });

        if file_len < cursor.byte_position {
            tracing::warn!(
                "Transcript {} shrank from {} to {} bytes, discarding what was built from it",
                key,
                cursor.byte_position,
                file_len
            );
            self.db.with_transaction(|conn| {
                queries::clear_transcript_records(conn, session_id)?;
                queries::clear_file_position(conn, &key)
            })?;
            return Ok(IngestOutcome::Truncated);
        }
        if file_len == cursor.byte_position {
            return Ok(IngestOutcome::Unchanged);
        }

        let mut reader =
            IncrementalReader::from_position(path, cursor.byte_position, cursor.line_offset);
        let lines = reader.read_new_lines()?;
        if lines.is_empty() {
            // Only a partial line so far
            return Ok(IngestOutcome::Unchanged);
        }

        let reconstruction = reconstruct(cursor.state, &lines, 0);
        for warning in &reconstruction.warnings {
            tracing::debug!("{}:{}: {}", key, warning.line, warning.message);
        }

        let report = IngestReport {
            session_id: session_id.to_string(),
            lines_read: lines.len(),
            turns: reconstruction.turns.len(),
            messages: reconstruction
                .turns
                .iter()
                .map(|t| 1 + t.assistant_messages.len())
                .sum(),
            tool_uses: reconstruction.turns.iter().map(|t| t.tool_uses.len()).sum(),
            orphans: reconstruction.orphans.len(),
            warnings: reconstruction.warnings.len(),
            byte_position: reader.position(),
            last_turn: reconstruction.turns.iter().map(|t| t.turn_number).max(),
        };

        let position = FilePosition {
            file_path: key.clone(),
            session_id: session_id.to_string(),
            byte_position: reader.position(),
            line_offset: reader.lines_read(),
            state: reconstruction.state,
        };

        self.db.with_transaction(|conn| {
            if let Some(mut session) = reconstruction.session {
                session.transcript_path = Some(key.clone());
                queries::upsert_session(conn, &session)?;
            }
            for turn in &reconstruction.turns {
                queries::upsert_turn(conn, turn)?;
            }
            for orphan in &reconstruction.orphans {
                queries::upsert_orphan(conn, orphan)?;
            }
            queries::update_file_position(conn, &position)
        })?;

        tracing::info!(
            "Ingested {} lines from {} ({} turns, {} tool uses)",
            report.lines_read,
            key,
            report.turns,
            report.tool_uses
        );
        Ok(IngestOutcome::Ingested(report))
    }

    /// Ingest, starting over once if the transcript was truncated
    pub fn ingest_or_restart(&self, path: &Path, session_id: &str) -> TraceResult<IngestOutcome> {
        match self.ingest(path, session_id)? {
            IngestOutcome::Truncated => self.ingest(path, session_id),
            outcome => Ok(outcome),
        }
    }
}

/// Result of importing a session's metrics file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetricsImport {
    /// No metrics file at the resolved location
    SourceMissing(PathBuf),
    Imported {
        path: PathBuf,
        collected: usize,
        /// Samples not already stored
        inserted: usize,
    },
}

/// Collect the session's metrics file, as resolved by `mappings`, into the store
pub fn import_metrics(
    db: &Database,
    mappings: &MappingStore,
    collector: &MetricsCollector,
    session_id: &str,
) -> TraceResult<MetricsImport> {
    let path = mappings.resolve(session_id)?;

    let Some(collection) = collector.collect_from_file(&path, Some(session_id))? else {
        return Ok(MetricsImport::SourceMissing(path));
    };

    let inserted = db.with_transaction(|conn| queries::insert_metrics_samples(conn, &collection.samples))?;
    tracing::info!(
        "Imported {} of {} metrics samples from {:?}",
        inserted,
        collection.samples.len(),
        path
    );

    Ok(MetricsImport::Imported {
        path,
        collected: collection.samples.len(),
        inserted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn user(uuid: &str, ts: &str, text: &str) -> String {
        serde_json::json!({
            "type": "user", "uuid": uuid, "timestamp": ts,
            "message": {"role": "user", "content": text}
        })
        .to_string()
    }

    fn append(path: &Path, lines: &[String]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    #[test]
    fn test_missing_transcript() {
        let db = Database::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let outcome = Ingestor::new(&db)
            .ingest(&dir.path().join("nope.jsonl"), "s1")
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Missing);
    }

    #[test]
    fn test_resume_and_unchanged() {
        let db = Database::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        let ingestor = Ingestor::new(&db);

        append(&path, &[user("u1", "2024-01-01T00:00:00Z", "first")]);
        let IngestOutcome::Ingested(first) = ingestor.ingest(&path, "s1").unwrap() else {
            panic!("expected ingest");
        };
        assert_eq!(first.lines_read, 1);
        assert_eq!(ingestor.ingest(&path, "s1").unwrap(), IngestOutcome::Unchanged);

        append(&path, &[user("u2", "2024-01-01T00:01:00Z", "second")]);
        let IngestOutcome::Ingested(second) = ingestor.ingest(&path, "s1").unwrap() else {
            panic!("expected ingest");
        };
        assert_eq!(second.lines_read, 1);
        assert_eq!(second.last_turn, Some(2));

        let detail = db
            .with_connection(|conn| queries::get_session_detail(conn, "s1"))
            .unwrap()
            .unwrap();
        assert_eq!(detail.turns.len(), 2);
        assert_eq!(detail.session.transcript_path, Some(path.to_string_lossy().to_string()));
    }

    #[test]
    fn test_truncation_resets_cursor() {
        let db = Database::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        let ingestor = Ingestor::new(&db);

        append(
            &path,
            &[
                user("u1", "2024-01-01T00:00:00Z", "first"),
                user("u2", "2024-01-01T00:01:00Z", "second"),
            ],
        );
        ingestor.ingest(&path, "s1").unwrap();

        std::fs::write(&path, format!("{}\n", user("u1", "2024-01-01T00:00:00Z", "first"))).unwrap();
        assert_eq!(ingestor.ingest(&path, "s1").unwrap(), IngestOutcome::Truncated);
        assert!(matches!(
            ingestor.ingest(&path, "s1").unwrap(),
            IngestOutcome::Ingested(_)
        ));
    }

    #[test]
    fn test_rewritten_transcript_replaces_stored_turns() {
        let db = Database::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        let ingestor = Ingestor::new(&db);

        append(
            &path,
            &[
                user("u1", "2024-01-01T00:00:00Z", "first old"),
                user("u2", "2024-01-01T00:01:00Z", "second old"),
            ],
        );
        ingestor.ingest(&path, "s1").unwrap();

        std::fs::write(&path, format!("{}\n", user("u9", "2024-01-02T00:00:00Z", "rewritten"))).unwrap();
        let outcome = ingestor.ingest_or_restart(&path, "s1").unwrap();
        assert!(matches!(outcome, IngestOutcome::Ingested(IngestReport { turns: 1, .. })));

        let detail = db
            .with_connection(|conn| queries::get_session_detail(conn, "s1"))
            .unwrap()
            .unwrap();
        assert_eq!(detail.turns.len(), 1);
        assert_eq!(detail.turns[0].user_message.text(), "rewritten");
        assert_eq!(detail.session.start_time, detail.turns[0].start_time);
    }

    #[test]
    fn test_import_metrics() {
        let db = Database::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mappings = MappingStore::new(dir.path().join("mapping.json"), dir.path().join("otel"));
        let collector = MetricsCollector::default();

        let missing = import_metrics(&db, &mappings, &collector, "s1").unwrap();
        assert!(matches!(missing, MetricsImport::SourceMissing(_)));

        let metrics_path = dir.path().join("s1.txt");
        std::fs::write(
            &metrics_path,
            "{\"name\":\"claude_code.token.usage\",\"value\":500,\"attributes\":{\"type\":\"input\"}}\n\
             {\"name\":\"claude_code.token.usage\",\"value\":120,\"attributes\":{\"type\":\"output\"}}\n",
        )
        .unwrap();
        mappings.register("s1", &metrics_path, None).unwrap();

        let imported = import_metrics(&db, &mappings, &collector, "s1").unwrap();
        assert_eq!(
            imported,
            MetricsImport::Imported {
                path: metrics_path.clone(),
                collected: 2,
                inserted: 2,
            }
        );

        // A second import stores nothing new
        let again = import_metrics(&db, &mappings, &collector, "s1").unwrap();
        assert!(matches!(again, MetricsImport::Imported { inserted: 0, .. }));

        let samples = db
            .with_connection(|conn| queries::get_metrics_samples(conn, Some("s1")))
            .unwrap();
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn test_import_waits_for_complete_metrics_line() {
        let db = Database::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mappings = MappingStore::new(dir.path().join("mapping.json"), dir.path().join("otel"));
        let collector = MetricsCollector::default();

        let metrics_path = dir.path().join("s1.txt");
        mappings.register("s1", &metrics_path, None).unwrap();

        std::fs::write(&metrics_path, "claude_code_token_usage{type=\"input\"} 50").unwrap();
        let first = import_metrics(&db, &mappings, &collector, "s1").unwrap();
        assert!(matches!(first, MetricsImport::Imported { collected: 0, inserted: 0, .. }));

        let mut file = std::fs::OpenOptions::new().append(true).open(&metrics_path).unwrap();
        writeln!(file, "0").unwrap();
        let second = import_metrics(&db, &mappings, &collector, "s1").unwrap();
        assert!(matches!(second, MetricsImport::Imported { collected: 1, inserted: 1, .. }));

        let values: Vec<f64> = db
            .with_connection(|conn| queries::get_metrics_samples(conn, Some("s1")))
            .unwrap()
            .iter()
            .map(|sample| sample.value)
            .collect();
        assert_eq!(values, vec![500.0]);
    }
}
