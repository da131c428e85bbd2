//! Session to metrics-file mapping
//!
//! A small JSON document records which metrics file belongs to which
//! session. Every operation reads the whole document fresh and mutations
//! rewrite it whole; concurrent writers resolve as last writer wins.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::OtelResult;
use crate::models::SessionOtelMapping;

const DOCUMENT_VERSION: &str = "1.0";

/// On-disk layout of the mapping file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MappingDocument {
    version: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    mappings: Vec<SessionOtelMapping>,
}

impl Default for MappingDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION.to_string(),
            updated_at: Utc::now(),
            mappings: Vec::new(),
        }
    }
}

/// Resolves and records session/metrics-file associations
#[derive(Debug, Clone)]
pub struct MappingStore {
    path: PathBuf,
    otel_dir: PathBuf,
}

impl MappingStore {
    /// `path` is the mapping document, `otel_dir` where default metrics files live
    pub fn new(path: PathBuf, otel_dir: PathBuf) -> Self {
        Self { path, otel_dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path a session's metrics go to when nothing is registered. Stable
    /// for a session within one UTC day.
    pub fn default_path(&self, session_id: &str, now: DateTime<Utc>) -> PathBuf {
        let safe_id = session_id.replace(['/', '\\'], "_");
        self.otel_dir
            .join(format!("{}_{}_otel.txt", safe_id, now.format("%Y%m%d")))
    }

    /// Registered path for a session, or its default path. Never writes.
    pub fn resolve(&self, session_id: &str) -> OtelResult<PathBuf> {
        self.resolve_at(session_id, Utc::now())
    }

    pub fn resolve_at(&self, session_id: &str, now: DateTime<Utc>) -> OtelResult<PathBuf> {
        Ok(self
            .lookup(session_id)?
            .map(|m| m.otel_log_file)
            .unwrap_or_else(|| self.default_path(session_id, now)))
    }

    /// Registered mapping for a session
    pub fn lookup(&self, session_id: &str) -> OtelResult<Option<SessionOtelMapping>> {
        Ok(self
            .load()?
            .mappings
            .into_iter()
            .find(|m| m.session_id == session_id))
    }

    /// Insert or replace the mapping for a session
    pub fn register(
        &self,
        session_id: &str,
        otel_log_file: &Path,
        description: Option<&str>,
    ) -> OtelResult<SessionOtelMapping> {
        let mapping = SessionOtelMapping {
            session_id: session_id.to_string(),
            otel_log_file: otel_log_file.to_path_buf(),
            timestamp: Utc::now(),
            description: description.map(String::from),
        };

        let mut doc = self.load()?;
        doc.mappings.retain(|m| m.session_id != session_id);
        doc.mappings.push(mapping.clone());
        self.save(&mut doc)?;

        tracing::info!("Mapped session {} to {:?}", session_id, otel_log_file);
        Ok(mapping)
    }

    /// Registered path, or register and return the default one
    pub fn get_or_create(&self, session_id: &str, description: Option<&str>) -> OtelResult<PathBuf> {
        if let Some(existing) = self.lookup(session_id)? {
            return Ok(existing.otel_log_file);
        }

        fs::create_dir_all(&self.otel_dir)?;
        let path = self.default_path(session_id, Utc::now());
        self.register(session_id, &path, description)?;
        Ok(path)
    }

    /// All mappings, newest first
    pub fn list(&self) -> OtelResult<Vec<SessionOtelMapping>> {
        let mut mappings = self.load()?.mappings;
        mappings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(mappings)
    }

    /// Drop a session's mapping; `false` when there was none
    pub fn remove(&self, session_id: &str) -> OtelResult<bool> {
        let mut doc = self.load()?;
        let before = doc.mappings.len();
        doc.mappings.retain(|m| m.session_id != session_id);

        if doc.mappings.len() == before {
            return Ok(false);
        }
        self.save(&mut doc)?;
        Ok(true)
    }

    /// Mapping whose metrics file is `path`
    pub fn find_by_path(&self, path: &Path) -> OtelResult<Option<SessionOtelMapping>> {
        Ok(self
            .load()?
            .mappings
            .into_iter()
            .find(|m| m.otel_log_file == path))
    }

    fn load(&self) -> OtelResult<MappingDocument> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(MappingDocument::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&contents) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::warn!("Mapping file {:?} is corrupt, starting fresh: {}", self.path, e);
                Ok(MappingDocument::default())
            }
        }
    }

    fn save(&self, doc: &mut MappingDocument) -> OtelResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        doc.version = DOCUMENT_VERSION.to_string();
        doc.updated_at = Utc::now();

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
