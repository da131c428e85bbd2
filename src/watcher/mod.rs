//! Transcript watcher module
//!
//! Polls a growing transcript on a fixed interval and ingests whatever was
//! appended since the previous poll. A missing or truncated file just means
//! no new data for that cycle.

pub mod discovery;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::ingest::{IngestOutcome, IngestReport, Ingestor};

/// Watcher errors
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Cannot derive a session id from {0}")]
    NoSessionId(PathBuf),
}

/// Counters of a finished watch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchSummary {
    pub polls: u64,
    pub updates: u64,
    pub failures: u64,
}

/// Polls one transcript file
pub struct TranscriptWatcher {
    path: PathBuf,
    session_id: String,
    interval: Duration,
}

impl TranscriptWatcher {
    pub fn new(path: PathBuf, session_id: String, interval: Duration) -> Self {
        Self {
            path,
            session_id,
            interval,
        }
    }

    /// Watch `path` under the session id taken from its file name
    pub fn for_path(path: PathBuf, interval: Duration) -> Result<Self, WatcherError> {
        let session_id = discovery::session_id_from_path(&path)
            .ok_or_else(|| WatcherError::NoSessionId(path.clone()))?;
        Ok(Self::new(path, session_id, interval))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Poll until `cancel` fires, calling `on_update` after each poll that
    /// stored new records. Failed polls are logged and retried next cycle.
    pub async fn run<F>(&self, db: &Database, cancel: CancellationToken, mut on_update: F) -> WatchSummary
    where
        F: FnMut(&IngestReport),
    {
        let ingestor = Ingestor::new(db);
        let mut summary = WatchSummary::default();

        tracing::info!(
            "Watching {:?} as session {} every {:?}",
            self.path,
            self.session_id,
            self.interval
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            summary.polls += 1;
            match ingestor.ingest(&self.path, &self.session_id) {
                Ok(IngestOutcome::Ingested(report)) => {
                    summary.updates += 1;
                    on_update(&report);
                }
                Ok(IngestOutcome::Missing) => {
                    tracing::trace!("{:?} not there yet", self.path);
                }
                Ok(IngestOutcome::Truncated) => {
                    tracing::info!("{:?} was truncated, rereading next poll", self.path);
                }
                Ok(IngestOutcome::Unchanged) => {}
                Err(e) => {
                    summary.failures += 1;
                    tracing::warn!("Poll of {:?} failed: {}", self.path, e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!(
            "Stopped watching {:?} after {} polls ({} updates)",
            self.path,
            summary.polls,
            summary.updates
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn user_line(uuid: &str, text: &str) -> String {
        serde_json::json!({
            "type": "user", "uuid": uuid, "timestamp": "2024-01-01T00:00:00Z",
            "message": {"role": "user", "content": text}
        })
        .to_string()
    }

    #[test]
    fn test_for_path_needs_jsonl() {
        let watcher =
            TranscriptWatcher::for_path(PathBuf::from("/p/abc.jsonl"), Duration::from_secs(1)).unwrap();
        assert_eq!(watcher.session_id(), "abc");
        assert!(TranscriptWatcher::for_path(PathBuf::from("/p/abc.txt"), Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let db = Database::in_memory().unwrap();
        let watcher = TranscriptWatcher::new(
            PathBuf::from("/does/not/exist.jsonl"),
            "s1".to_string(),
            Duration::from_millis(10),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = watcher.run(&db, cancel, |_| {}).await;
        assert_eq!(summary.polls, 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error() {
        let db = Database::in_memory().unwrap();
        let watcher = TranscriptWatcher::new(
            PathBuf::from("/does/not/exist.jsonl"),
            "s1".to_string(),
            Duration::from_millis(5),
        );
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let summary = watcher.run(&db, cancel, |_| {}).await;
        assert!(summary.polls >= 1);
        assert_eq!(summary.updates, 0);
        assert_eq!(summary.failures, 0);
    }

    #[tokio::test]
    async fn test_picks_up_appended_lines() {
        let db = Database::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(&path, format!("{}\n", user_line("u1", "hi"))).unwrap();

        let watcher = TranscriptWatcher::new(path.clone(), "s1".to_string(), Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let mut lines_seen = 0;

        let summary = watcher
            .run(&db, cancel, |report| {
                lines_seen += report.lines_read;
                if lines_seen == 1 {
                    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
                    writeln!(file, "{}", user_line("u2", "again")).unwrap();
                } else {
                    stopper.cancel();
                }
            })
            .await;

        assert_eq!(lines_seen, 2);
        assert_eq!(summary.updates, 2);
    }
}
