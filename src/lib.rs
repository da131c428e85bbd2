//! Claude Code transcript tracing
//!
//! This library rebuilds Claude Code sessions from their JSONL transcripts
//! and enriches them with OpenTelemetry metrics. It handles:
//! - Transcript parsing and turn/message/tool-use reconstruction
//! - Metrics collection and session/metrics-file mapping
//! - SQLite persistence with incremental resume
//! - Statistics, comparisons and export
//! - Polling a live transcript
//! - Local resource monitoring aligned with session stages

pub mod config;
pub mod db;
pub mod export;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod otel;
pub mod parser;
pub mod watcher;

use std::io::Read;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::Database;
use ingest::{import_metrics, IngestOutcome, Ingestor, MetricsImport};
use metrics::stats::{compute_statistics, Stats};
use models::{ResourceSummary, SessionMetricsSummary, StageUsage};
use otel::mapping::MappingStore;
use otel::MetricsCollector;

/// Crate-level error
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("Parser error: {0}")]
    Parser(#[from] parser::ParserError),

    #[error("Metrics collection error: {0}")]
    Otel(#[from] otel::OtelError),

    #[error("Statistics error: {0}")]
    Metrics(#[from] metrics::MetricsError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] watcher::WatcherError),

    #[error("Export error: {0}")]
    Export(#[from] export::ExportError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type TraceResult<T> = Result<T, TraceError>;

/// Initialize logging to stderr; `RUST_LOG` overrides the `info` default
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Payload Claude Code hands to a hook on stdin
#[derive(Debug, Clone, Deserialize)]
pub struct HookInput {
    pub session_id: String,
    pub transcript_path: String,
    #[serde(default)]
    pub stop_hook_active: bool,
}

/// What a hook invocation did
#[derive(Debug, Clone, Serialize)]
pub struct HookReport {
    pub session_id: String,
    pub ingest: Option<IngestOutcome>,
    pub metrics: Option<MetricsImport>,
    pub stats: Option<Stats>,
}

/// Transcript side of [`SessionLogs`]
#[derive(Debug, Clone, Serialize)]
pub struct TraceOverview {
    pub transcript_path: Option<String>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    pub turn_count: u32,
    pub tool_use_count: u32,
}

/// Everything recorded for one session, by source
#[derive(Debug, Clone, Serialize)]
pub struct SessionLogs {
    pub session_id: String,
    pub trace: Option<TraceOverview>,
    /// Where the session's metrics are read from
    pub metrics_file: PathBuf,
    pub metrics_file_exists: bool,
    pub metrics: Option<SessionMetricsSummary>,
    pub resources: Option<ResourceSummary>,
    pub stages: Vec<StageUsage>,
}

/// Everything a command needs, opened from one [`Config`]
pub struct Context {
    pub config: Config,
    pub db: Database,
    pub mappings: MappingStore,
    pub collector: MetricsCollector,
}

impl Context {
    pub fn open(config: Config) -> TraceResult<Self> {
        let db = Database::open(&config.database_path())?;
        let mappings = MappingStore::new(config.mapping_file(), config.otel_dir());
        Ok(Self {
            config,
            db,
            mappings,
            collector: MetricsCollector::default(),
        })
    }

    /// Ingest a transcript, import its metrics and compute its statistics
    pub fn process_session(&self, transcript: &std::path::Path, session_id: &str) -> TraceResult<HookReport> {
        let outcome = Ingestor::new(&self.db).ingest_or_restart(transcript, session_id)?;
        if outcome == IngestOutcome::Missing {
            tracing::info!("Transcript {:?} not found, nothing to do", transcript);
        }

        let metrics = match import_metrics(&self.db, &self.mappings, &self.collector, session_id) {
            Ok(import) => Some(import),
            Err(e) => {
                // Metrics are enrichment only
                tracing::warn!("Metrics import for {} failed: {}", session_id, e);
                None
            }
        };

        let stats = compute_statistics(&self.db, session_id)?;
        if let Some(stats) = &stats {
            tracing::info!(
                "Session {}: {} turns, {} tool uses, {} tokens{}",
                session_id,
                stats.turn_count,
                stats.tool_use_count,
                stats.total_tokens,
                if stats.enriched { " (from metrics)" } else { "" }
            );
        }

        Ok(HookReport {
            session_id: session_id.to_string(),
            ingest: Some(outcome),
            metrics,
            stats,
        })
    }
}

impl Context {
    /// Locate the transcript, metrics and resource data of a session
    pub fn find_logs(&self, session_id: &str) -> TraceResult<SessionLogs> {
        let stats = compute_statistics(&self.db, session_id)?;
        let transcript_path = self.db.with_connection(|conn| {
            Ok(db::queries::get_session(conn, session_id)?.and_then(|s| s.transcript_path))
        })?;
        let metrics_file = self.mappings.resolve(session_id)?;
        let stages = self
            .db
            .with_connection(|conn| db::queries::get_stage_usage(conn, session_id))?;
        let samples = self
            .db
            .with_connection(|conn| db::queries::get_metrics_samples(conn, Some(session_id)))?;

        Ok(SessionLogs {
            session_id: session_id.to_string(),
            metrics_file_exists: metrics_file.exists(),
            metrics_file,
            metrics: (!samples.is_empty())
                .then(|| SessionMetricsSummary::from_samples(Some(session_id.to_string()), &samples)),
            trace: stats.map(|s| TraceOverview {
                transcript_path,
                start_time: s.start_time,
                duration_ms: s.total_duration_ms,
                turn_count: s.turn_count,
                tool_use_count: s.tool_use_count,
            }),
            resources: monitor::session_resource_summary(&self.db, session_id)?,
            stages,
        })
    }
}

/// Run the hook entry point on a JSON payload read from `reader`
pub fn run_hook<R: Read>(mut reader: R, config: Config) -> TraceResult<HookReport> {
    let mut raw = String::new();
    reader.read_to_string(&mut raw)?;
    let input: HookInput = serde_json::from_str(&raw)?;

    if input.session_id.trim().is_empty() {
        return Err(TraceError::InvalidInput("empty session_id".to_string()));
    }
    if input.stop_hook_active {
        tracing::debug!("Stop hook already active for {}, skipping", input.session_id);
        return Ok(HookReport {
            session_id: input.session_id,
            ingest: None,
            metrics: None,
            stats: None,
        });
    }

    let transcript = config::expand_tilde(&input.transcript_path);
    let ctx = Context::open(config)?;
    ctx.process_session(&transcript, &input.session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_config(dir: &Path) -> Config {
        Config {
            data_dir: Some(dir.to_path_buf()),
            ..Config::default()
        }
    }

    #[test]
    fn test_hook_processes_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("abc.jsonl");
        std::fs::write(
            &transcript,
            concat!(
                r#"{"type":"user","uuid":"u1","timestamp":"2024-01-01T00:00:00Z","message":{"role":"user","content":"hi"}}"#,
                "\n",
                r#"{"type":"assistant","timestamp":"2024-01-01T00:00:01Z","message":{"id":"m1","role":"assistant","content":[{"type":"text","text":"hello"}],"usage":{"input_tokens":3,"output_tokens":2}}}"#,
                "\n"
            ),
        )
        .unwrap();

        let payload = serde_json::json!({
            "session_id": "abc",
            "transcript_path": transcript.to_string_lossy(),
        })
        .to_string();

        let report = run_hook(payload.as_bytes(), test_config(dir.path())).unwrap();
        assert!(matches!(report.ingest, Some(IngestOutcome::Ingested(_))));
        assert!(matches!(report.metrics, Some(MetricsImport::SourceMissing(_))));

        let stats = report.stats.unwrap();
        assert_eq!(stats.turn_count, 1);
        assert_eq!(stats.total_tokens, 5);
        assert!(!stats.enriched);
    }

    #[test]
    fn test_hook_missing_transcript_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let payload = r#"{"session_id":"abc","transcript_path":"/no/such/file.jsonl"}"#;

        let report = run_hook(payload.as_bytes(), test_config(dir.path())).unwrap();
        assert_eq!(report.ingest, Some(IngestOutcome::Missing));
        assert!(report.stats.is_none());
    }

    #[test]
    fn test_hook_stop_active_skips() {
        let dir = tempfile::tempdir().unwrap();
        let payload = r#"{"session_id":"abc","transcript_path":"x","stop_hook_active":true}"#;

        let report = run_hook(payload.as_bytes(), test_config(dir.path())).unwrap();
        assert!(report.ingest.is_none());
        assert!(!dir.path().join("traces.db").exists());
    }

    #[test]
    fn test_find_logs_reports_each_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::open(test_config(dir.path())).unwrap();

        let empty = ctx.find_logs("abc").unwrap();
        assert!(empty.trace.is_none());
        assert!(empty.metrics.is_none());
        assert!(empty.resources.is_none());
        assert!(!empty.metrics_file_exists);

        let transcript = dir.path().join("abc.jsonl");
        std::fs::write(
            &transcript,
            concat!(
                r#"{"type":"user","uuid":"u1","timestamp":"2024-01-01T00:00:00Z","message":{"role":"user","content":"hi"}}"#,
                "\n"
            ),
        )
        .unwrap();
        ctx.process_session(&transcript, "abc").unwrap();

        let metrics_file = ctx.mappings.get_or_create("abc", None).unwrap();
        std::fs::create_dir_all(metrics_file.parent().unwrap()).unwrap();
        std::fs::write(&metrics_file, "claude_code_api_calls 4\n").unwrap();
        import_metrics(&ctx.db, &ctx.mappings, &ctx.collector, "abc").unwrap();

        let mut monitor = monitor::ResourceMonitor::new(&ctx.db, "abc", FixedSampler);
        monitor.start_stage("turn-1", "turn").unwrap();
        monitor.end_all_stages().unwrap();

        let logs = ctx.find_logs("abc").unwrap();
        let trace = logs.trace.unwrap();
        assert_eq!(trace.turn_count, 1);
        assert_eq!(trace.transcript_path, Some(transcript.to_string_lossy().to_string()));
        assert!(logs.metrics_file_exists);
        assert_eq!(logs.metrics.unwrap().api_calls, 4);
        assert_eq!(logs.resources.unwrap().snapshot_count, 2);
        assert_eq!(logs.stages.len(), 1);
    }

    struct FixedSampler;

    impl monitor::ResourceSampler for FixedSampler {
        fn sample(&mut self) -> models::ResourceReading {
            models::ResourceReading {
                cpu_percent: 5.0,
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_hook_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            run_hook("not json".as_bytes(), test_config(dir.path())),
            Err(TraceError::Json(_))
        ));
        assert!(matches!(
            run_hook(r#"{"session_id":" ","transcript_path":"x"}"#.as_bytes(), test_config(dir.path())),
            Err(TraceError::InvalidInput(_))
        ));
    }
}
