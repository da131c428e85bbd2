//! Turn (cycle) data types
//!
//! A turn is one user message plus every assistant message and tool call
//! that followed it, up to the next user message.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A single content block of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
}

/// Token usage snapshot reported with an assistant message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            ..Self::default()
        }
    }

    /// Read a transcript `usage` object. Missing or null counters are zero.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let count = |key: &str| obj.get(key).and_then(Value::as_u64).unwrap_or(0);

        Some(Self {
            input_tokens: count("input_tokens"),
            output_tokens: count("output_tokens"),
            cache_read_tokens: count("cache_read_input_tokens"),
            cache_creation_tokens: count("cache_creation_input_tokens"),
        })
    }

    /// Input plus output tokens
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0 && self.cache_read_tokens == 0 && self.cache_creation_tokens == 0
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }

    /// Share of prompt tokens served from cache; 0 when nothing was read at all.
    pub fn cache_hit_rate(&self) -> f64 {
        let denominator = self.cache_read_tokens + self.input_tokens;
        if denominator == 0 {
            0.0
        } else {
            self.cache_read_tokens as f64 / denominator as f64
        }
    }
}

/// A user or assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Merge key for assistant messages, line uuid (or a synthetic id) for user messages
    pub message_id: String,
    pub session_id: String,
    pub turn_number: u32,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Concatenated text blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Append a content block. Consecutive text blocks are joined into one,
    /// tool invocations already present (same call id) are dropped.
    pub fn append_block(&mut self, block: ContentBlock) -> bool {
        match block {
            ContentBlock::Text { text } => {
                if let Some(ContentBlock::Text { text: last }) = self.content.last_mut() {
                    last.push_str(&text);
                } else {
                    self.content.push(ContentBlock::Text { text });
                }
                true
            }
            ContentBlock::ToolUse { ref id, .. } => {
                let duplicate = self
                    .content
                    .iter()
                    .any(|b| matches!(b, ContentBlock::ToolUse { id: existing, .. } if existing == id));
                if duplicate {
                    return false;
                }
                self.content.push(block);
                true
            }
            other => {
                self.content.push(other);
                true
            }
        }
    }
}

/// A tool invocation and, once it arrives, its result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool_use_id: String,
    pub session_id: String,
    pub turn_number: u32,
    /// Assistant message that issued the call
    pub message_id: String,
    pub name: String,
    pub input: Value,
    pub output: Option<String>,
    /// `None` while the result is still pending
    pub success: Option<bool>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ToolUse {
    pub fn is_pending(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0))
    }

    /// Record the result of this call
    pub fn complete(&mut self, output: String, is_error: bool, at: DateTime<Utc>) {
        self.end_time = Some(at.max(self.start_time));
        self.success = Some(!is_error);
        self.error = if is_error { Some(output.clone()) } else { None };
        self.output = Some(output);
    }
}

/// A tool result whose invocation was never seen in the open turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanResult {
    pub session_id: String,
    pub tool_use_id: String,
    /// Turn that was open when the result arrived, if any
    pub turn_number: Option<u32>,
    pub output: String,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// A complete turn record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: String,
    pub turn_number: u32,
    pub user_message: Message,
    pub assistant_messages: Vec<Message>,
    pub tool_uses: Vec<ToolUse>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn turn_id(&self) -> String {
        turn_id(&self.session_id, self.turn_number)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0))
    }

    /// Summed usage of the assistant messages
    pub fn usage(&self) -> TokenUsage {
        let mut usage = TokenUsage::default();
        for message in &self.assistant_messages {
            usage.add(&message.usage);
        }
        usage
    }

    /// Latest timestamp of anything recorded in the turn
    pub fn last_activity(&self) -> DateTime<Utc> {
        let assistant = self.assistant_messages.iter().map(|m| m.timestamp);
        let tools = self
            .tool_uses
            .iter()
            .flat_map(|t| std::iter::once(t.start_time).chain(t.end_time));

        assistant
            .chain(tools)
            .fold(self.start_time, |latest, ts| latest.max(ts))
    }
}

/// Stable identifier of a turn row
pub fn turn_id(session_id: &str, turn_number: u32) -> String {
    format!("{}_{}", session_id, turn_number)
}
