//! OpenTelemetry metrics collection
//!
//! Turns exporter text into [`MetricsSample`]s and keeps track of which
//! metrics file belongs to which session.

pub mod layouts;
pub mod mapping;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use crate::models::MetricsSample;
use layouts::{default_layouts, LayoutContext, MetricsLayout};

/// Metrics collection errors
#[derive(Error, Debug)]
pub enum OtelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for metrics operations
pub type OtelResult<T> = Result<T, OtelError>;

/// Longest multi-line record we buffer before giving up on it
const MAX_RECORD_LINES: usize = 4096;

/// Label carrying the session id in Claude Code metrics
pub const SESSION_ID_LABEL: &str = "session.id";

/// Samples gathered from one source
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub samples: Vec<MetricsSample>,
    pub records_seen: usize,
    /// Records no layout recognized
    pub records_skipped: usize,
    /// Trailing bytes left for a later pass: an unterminated last line or
    /// an object literal whose braces never closed
    pub pending_bytes: usize,
}

/// Parses exporter output using an ordered list of layouts
pub struct MetricsCollector {
    layouts: Vec<Box<dyn MetricsLayout>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(default_layouts())
    }
}

impl MetricsCollector {
    pub fn new(layouts: Vec<Box<dyn MetricsLayout>>) -> Self {
        Self { layouts }
    }

    /// Collect samples from any byte stream. Samples without a
    /// `session.id` label are attributed to `session_id`.
    ///
    /// Only newline-terminated lines are read. The exporter may still be
    /// writing the tail of the source, so a partial last line, or a
    /// multi-line record left open at the end, is not collected.
    pub fn collect_from_reader<R: BufRead>(
        &self,
        mut reader: R,
        session_id: Option<&str>,
    ) -> OtelResult<Collection> {
        let mut collection = Collection::default();
        let mut ctx = LayoutContext::default();
        let mut records = RecordSplitter::default();
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            if !line.ends_with('\n') {
                collection.pending_bytes += read;
                break;
            }
            let text = line.trim_end_matches(['\n', '\r']);
            if let Some(record) = records.push(text) {
                self.collect_record(&record, session_id, &mut ctx, &mut collection);
            }
        }
        collection.pending_bytes += records.pending_bytes();

        tracing::debug!(
            "Collected {} samples from {} records ({} skipped, {} bytes pending)",
            collection.samples.len(),
            collection.records_seen,
            collection.records_skipped,
            collection.pending_bytes
        );

        Ok(collection)
    }

    /// Collect samples from in-memory text
    pub fn collect_str(&self, text: &str, session_id: Option<&str>) -> Collection {
        // Reading from a byte slice cannot fail
        self.collect_from_reader(text.as_bytes(), session_id)
            .unwrap_or_default()
    }

    /// Collect samples from a file; `None` when the file does not exist
    pub fn collect_from_file(
        &self,
        path: &Path,
        session_id: Option<&str>,
    ) -> OtelResult<Option<Collection>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Metrics file {:?} does not exist", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.collect_from_reader(BufReader::new(file), session_id)
            .map(Some)
    }

    fn collect_record(
        &self,
        record: &str,
        session_id: Option<&str>,
        ctx: &mut LayoutContext,
        collection: &mut Collection,
    ) {
        if record.trim().is_empty() {
            return;
        }
        collection.records_seen += 1;

        let parsed = self
            .layouts
            .iter()
            .find_map(|layout| layout.parse(record, ctx).map(|samples| (layout.name(), samples)));

        match parsed {
            Some((layout, samples)) => {
                tracing::trace!("Record matched {} layout ({} samples)", layout, samples.len());
                for mut sample in samples {
                    sample.seq = collection.samples.len() as u64;
                    sample.session_id = sample
                        .labels
                        .get(SESSION_ID_LABEL)
                        .cloned()
                        .or_else(|| session_id.map(String::from));
                    collection.samples.push(sample);
                }
            }
            None => {
                tracing::trace!("No layout matched record: {}", record.lines().next().unwrap_or(""));
                collection.records_skipped += 1;
            }
        }
    }
}

/// Groups lines into records. A line opening an object literal that is not
/// closed on the same line starts a multi-line record that ends when its
/// braces balance.
#[derive(Default)]
struct RecordSplitter {
    buffer: Vec<String>,
    depth: i64,
}

impl RecordSplitter {
    fn push(&mut self, line: &str) -> Option<String> {
        if self.buffer.is_empty() {
            let depth = brace_delta(line);
            if line.trim_start().starts_with('{') && depth > 0 {
                self.buffer.push(line.to_string());
                self.depth = depth;
                return None;
            }
            return Some(line.to_string());
        }

        self.buffer.push(line.to_string());
        self.depth += brace_delta(line);
        if self.depth <= 0 || self.buffer.len() >= MAX_RECORD_LINES {
            return self.finish();
        }
        None
    }

    fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        self.depth = 0;
        Some(std::mem::take(&mut self.buffer).join("\n"))
    }

    /// Size of a record still waiting for its closing brace
    fn pending_bytes(&self) -> usize {
        self.buffer.iter().map(|line| line.len() + 1).sum()
    }
}

/// Net change in brace nesting, ignoring braces inside string literals
fn brace_delta(line: &str) -> i64 {
    let mut delta = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in line.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }

    delta
}
