//! JSONL line parser
//!
//! Handles incremental reading of transcript files and decoding of single
//! lines into typed entries.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{parse_timestamp, ParserError, ParserResult};
use crate::models::{ContentBlock, TokenUsage};

/// Entry types in Claude Code JSONL files
#[derive(Debug, Clone, PartialEq)]
pub enum EntryType {
    User,
    Assistant,
    System,
    Summary,
    FileHistorySnapshot,
    Unknown(String),
}

impl From<&str> for EntryType {
    fn from(s: &str) -> Self {
        match s {
            "user" => EntryType::User,
            "assistant" => EntryType::Assistant,
            "system" => EntryType::System,
            "summary" => EntryType::Summary,
            "file-history-snapshot" => EntryType::FileHistorySnapshot,
            other => EntryType::Unknown(other.to_string()),
        }
    }
}

/// A `tool_result` block carried by a user line
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub output: String,
    pub is_error: bool,
}

/// One streamed piece of an assistant message
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantFragment {
    /// `message.id`; fragments sharing it belong to one message
    pub merge_key: Option<String>,
    pub content: Vec<ContentBlock>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// What a line contributes to reconstruction
#[derive(Debug, Clone, PartialEq)]
pub enum EntryPayload {
    /// A user message that opens a new turn
    UserMessage(Vec<ContentBlock>),
    /// A user-role line carrying tool results
    ToolResults(Vec<ToolResultBlock>),
    Assistant(AssistantFragment),
    /// Summaries, snapshots, system notices
    Ignored,
}

/// A parsed JSONL entry
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub entry_type: EntryType,
    pub uuid: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: EntryPayload,
}

/// Incremental JSONL reader
///
/// Tracks a byte position and the number of lines consumed so far. Only
/// complete lines are consumed: a trailing line without newline is taken
/// only if it already holds a complete JSON value.
pub struct IncrementalReader {
    path: PathBuf,
    position: u64,
    lines_read: u64,
}

impl IncrementalReader {
    /// Create a new incremental reader
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::from_position(path, 0, 0)
    }

    /// Create a new reader resuming from a byte position and line count
    pub fn from_position<P: AsRef<Path>>(path: P, position: u64, lines_read: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            position,
            lines_read,
        }
    }

    /// Read new raw lines from the file since last read
    pub fn read_new_lines(&mut self) -> ParserResult<Vec<String>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        reader.seek(SeekFrom::Start(self.position))?;

        let mut lines = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line)?;

            if bytes_read == 0 {
                break;
            }

            if !line.ends_with('\n') && serde_json::from_str::<Value>(line.trim()).is_err() {
                // Writer is mid-line; pick it up on the next read
                break;
            }

            self.position += bytes_read as u64;
            self.lines_read += 1;
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }

        Ok(lines)
    }

    /// Get current file position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of lines consumed so far
    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Reset position to beginning
    pub fn reset(&mut self) {
        self.position = 0;
        self.lines_read = 0;
    }
}

/// Parse a single JSONL line
pub fn parse_line(line: &str) -> ParserResult<ParsedEntry> {
    let value: Value = serde_json::from_str(line)?;
    let obj = value
        .as_object()
        .ok_or_else(|| ParserError::InvalidEntry("line is not a JSON object".to_string()))?;

    let message = obj.get("message").filter(|m| m.is_object());

    let entry_type = obj
        .get("type")
        .and_then(Value::as_str)
        .map(EntryType::from)
        .unwrap_or(EntryType::Unknown("missing".to_string()));

    let role = message
        .and_then(|m| m.get("role"))
        .or_else(|| obj.get("role"))
        .and_then(Value::as_str)
        .or(obj.get("type").and_then(Value::as_str));

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp);

    let uuid = obj.get("uuid").and_then(Value::as_str).map(String::from);

    let raw_content = message
        .and_then(|m| m.get("content"))
        .or_else(|| obj.get("content"));

    let payload = match role {
        Some("user") => {
            let (blocks, results) = parse_content(raw_content);
            if results.is_empty() {
                EntryPayload::UserMessage(blocks)
            } else {
                EntryPayload::ToolResults(results)
            }
        }
        Some("assistant") => {
            let (blocks, _) = parse_content(raw_content);
            let field = |key: &str| message.and_then(|m| m.get(key)).or_else(|| obj.get(key));

            EntryPayload::Assistant(AssistantFragment {
                merge_key: message
                    .and_then(|m| m.get("id"))
                    .and_then(Value::as_str)
                    .map(String::from),
                content: blocks,
                model: field("model").and_then(Value::as_str).map(String::from),
                usage: field("usage").and_then(TokenUsage::from_value),
            })
        }
        _ => EntryPayload::Ignored,
    };

    Ok(ParsedEntry {
        entry_type,
        uuid,
        timestamp,
        payload,
    })
}

/// Split message content into regular blocks and tool results
fn parse_content(content: Option<&Value>) -> (Vec<ContentBlock>, Vec<ToolResultBlock>) {
    let mut blocks = Vec::new();
    let mut results = Vec::new();

    match content {
        Some(Value::String(text)) => blocks.push(ContentBlock::Text { text: text.clone() }),
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(text) = item.as_str() {
                    blocks.push(ContentBlock::Text { text: text.to_string() });
                    continue;
                }
                let str_field = |key: &str| item.get(key).and_then(Value::as_str);

                match str_field("type") {
                    Some("text") => {
                        if let Some(text) = str_field("text") {
                            blocks.push(ContentBlock::Text { text: text.to_string() });
                        }
                    }
                    Some("thinking") => {
                        if let Some(thinking) = str_field("thinking") {
                            blocks.push(ContentBlock::Thinking {
                                thinking: thinking.to_string(),
                            });
                        }
                    }
                    Some("tool_use") => {
                        if let (Some(id), Some(name)) = (str_field("id"), str_field("name")) {
                            blocks.push(ContentBlock::ToolUse {
                                id: id.to_string(),
                                name: name.to_string(),
                                input: item.get("input").cloned().unwrap_or(Value::Null),
                            });
                        }
                    }
                    Some("tool_result") => {
                        if let Some(id) = str_field("tool_use_id") {
                            results.push(ToolResultBlock {
                                tool_use_id: id.to_string(),
                                output: result_text(item.get("content")),
                                is_error: item
                                    .get("is_error")
                                    .and_then(Value::as_bool)
                                    .unwrap_or(false),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    (blocks, results)
}

/// Flatten a tool result payload to text
fn result_text(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| match part {
                Value::String(s) => s.clone(),
                other => other
                    .get("text")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| other.to_string()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}
