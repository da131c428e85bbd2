//! Session reconstruction
//!
//! Folds transcript lines into turns. A turn starts with a user message and
//! collects every assistant message and tool call until the next user
//! message. Assistant fragments sharing a merge key are folded into one
//! message; tool results are matched to pending calls by call id.
//!
//! Reconstruction is a pure function of (prior state, new lines), so a file
//! processed in two halves yields the same records as one pass over the whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::jsonl::{parse_line, AssistantFragment, EntryPayload, ParsedEntry, ToolResultBlock};
use crate::models::{ContentBlock, Message, OrphanResult, Role, Session, TokenUsage, ToolUse, Turn};

/// Carry-over between reconstruction passes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionState {
    pub session_id: String,
    /// Lines consumed by all previous passes
    pub lines_consumed: u64,
    pub turn_counter: u32,
    pub session_start: Option<DateTime<Utc>>,
    pub session_end: Option<DateTime<Utc>>,
    /// Last timestamp seen, inherited by lines without one
    pub last_timestamp: Option<DateTime<Utc>>,
    /// The turn still accepting messages and tool results
    pub current_turn: Option<Turn>,
}

impl ReconstructionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }
}

/// A line that could not be used
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionWarning {
    /// 1-based line number within the transcript
    pub line: u64,
    pub message: String,
}

/// Records produced by one pass
#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    pub state: ReconstructionState,
    /// Session header, once at least one turn exists
    pub session: Option<Session>,
    /// Turns closed during the pass followed by a snapshot of the open turn
    pub turns: Vec<Turn>,
    pub orphans: Vec<OrphanResult>,
    pub warnings: Vec<ReconstructionWarning>,
    pub lines_processed: usize,
}

impl Reconstruction {
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.orphans.is_empty()
    }
}

/// Reconstruct records from `lines`, skipping the first `offset` of them.
pub fn reconstruct<S: AsRef<str>>(
    state: ReconstructionState,
    lines: &[S],
    offset: usize,
) -> Reconstruction {
    let mut reconstructor = SessionReconstructor::new(state);

    for line in lines.iter().skip(offset) {
        reconstructor.process_line(line.as_ref());
    }

    reconstructor.finish()
}

/// Folds entries into turns, one line at a time
pub struct SessionReconstructor {
    state: ReconstructionState,
    closed_turns: Vec<Turn>,
    orphans: Vec<OrphanResult>,
    warnings: Vec<ReconstructionWarning>,
    lines_processed: usize,
}

impl SessionReconstructor {
    pub fn new(state: ReconstructionState) -> Self {
        Self {
            state,
            closed_turns: Vec::new(),
            orphans: Vec::new(),
            warnings: Vec::new(),
            lines_processed: 0,
        }
    }

    /// Decode and apply one raw line
    pub fn process_line(&mut self, line: &str) {
        self.state.lines_consumed += 1;
        self.lines_processed += 1;
        let line_number = self.state.lines_consumed;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        match parse_line(trimmed) {
            Ok(entry) => self.process_entry(entry, line_number),
            Err(e) => {
                tracing::warn!("Skipping malformed line {}: {}", line_number, e);
                self.warn(line_number, format!("malformed line: {}", e));
            }
        }
    }

    /// Apply a decoded entry
    pub fn process_entry(&mut self, entry: ParsedEntry, line_number: u64) {
        if entry.timestamp.is_some() {
            self.state.last_timestamp = entry.timestamp;
        }
        let timestamp = entry
            .timestamp
            .or(self.state.last_timestamp)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        match entry.payload {
            EntryPayload::UserMessage(content) => self.start_turn(entry.uuid, content, timestamp),
            EntryPayload::ToolResults(results) => {
                for result in results {
                    self.attach_result(result, timestamp);
                }
            }
            EntryPayload::Assistant(fragment) => {
                self.merge_fragment(entry.uuid, fragment, timestamp, line_number)
            }
            EntryPayload::Ignored => {}
        }
    }

    fn start_turn(&mut self, uuid: Option<String>, content: Vec<ContentBlock>, timestamp: DateTime<Utc>) {
        self.close_turn();

        self.state.turn_counter += 1;
        let turn_number = self.state.turn_counter;
        let session_id = self.state.session_id.clone();

        if self.state.session_start.is_none() {
            self.state.session_start = Some(timestamp);
        }

        let user_message = Message {
            message_id: uuid.unwrap_or_else(|| format!("turn-{}-user", turn_number)),
            session_id: session_id.clone(),
            turn_number,
            role: Role::User,
            content,
            model: None,
            usage: TokenUsage::default(),
            timestamp,
        };

        tracing::debug!("Opened turn {} of session {}", turn_number, session_id);

        self.state.current_turn = Some(Turn {
            session_id,
            turn_number,
            user_message,
            assistant_messages: Vec::new(),
            tool_uses: Vec::new(),
            start_time: timestamp,
            end_time: None,
        });
    }

    fn merge_fragment(
        &mut self,
        uuid: Option<String>,
        fragment: AssistantFragment,
        timestamp: DateTime<Utc>,
        line_number: u64,
    ) {
        let Some(turn) = self.state.current_turn.as_mut() else {
            self.warn(line_number, "assistant message before any user message".to_string());
            return;
        };

        let timestamp = timestamp.max(turn.start_time);
        let merge_key = fragment
            .merge_key
            .or(uuid)
            .unwrap_or_else(|| format!("turn-{}-assistant-{}", turn.turn_number, turn.assistant_messages.len()));

        let index = match turn
            .assistant_messages
            .iter()
            .position(|m| m.message_id == merge_key)
        {
            Some(index) => index,
            None => {
                turn.assistant_messages.push(Message {
                    message_id: merge_key.clone(),
                    session_id: turn.session_id.clone(),
                    turn_number: turn.turn_number,
                    role: Role::Assistant,
                    content: Vec::new(),
                    model: None,
                    usage: TokenUsage::default(),
                    timestamp,
                });
                turn.assistant_messages.len() - 1
            }
        };

        let message = &mut turn.assistant_messages[index];
        if fragment.model.is_some() {
            message.model = fragment.model;
        }
        if let Some(usage) = fragment.usage {
            message.usage = usage;
        }

        for block in fragment.content {
            let invocation = match &block {
                ContentBlock::ToolUse { id, name, input } => Some((id.clone(), name.clone(), input.clone())),
                _ => None,
            };
            if !message.append_block(block) {
                continue;
            }

            if let Some((id, name, input)) = invocation {
                if turn.tool_uses.iter().any(|t| t.tool_use_id == id) {
                    continue;
                }
                turn.tool_uses.push(ToolUse {
                    tool_use_id: id,
                    session_id: turn.session_id.clone(),
                    turn_number: turn.turn_number,
                    message_id: merge_key.clone(),
                    name,
                    input,
                    output: None,
                    success: None,
                    error: None,
                    start_time: timestamp,
                    end_time: None,
                });
            }
        }
    }

    fn attach_result(&mut self, result: ToolResultBlock, timestamp: DateTime<Utc>) {
        let open_turn = self.state.current_turn.as_mut();
        let turn_number = open_turn.as_ref().map(|t| t.turn_number);

        if let Some(turn) = open_turn {
            let timestamp = timestamp.max(turn.start_time);
            if let Some(tool_use) = turn
                .tool_uses
                .iter_mut()
                .find(|t| t.tool_use_id == result.tool_use_id)
            {
                if tool_use.is_pending() {
                    tool_use.complete(result.output, result.is_error, timestamp);
                } else {
                    tracing::debug!("Ignoring repeated result for {}", result.tool_use_id);
                }
                return;
            }
        }

        tracing::debug!("Orphan tool result {}", result.tool_use_id);
        self.orphans.push(OrphanResult {
            session_id: self.state.session_id.clone(),
            tool_use_id: result.tool_use_id,
            turn_number,
            output: result.output,
            is_error: result.is_error,
            timestamp,
        });
    }

    /// Close the open turn, if any
    fn close_turn(&mut self) {
        if let Some(turn) = self.state.current_turn.take() {
            let turn = self.snapshot(&turn);
            self.closed_turns.push(turn);
        }
    }

    /// Copy of a turn with its end time filled in
    fn snapshot(&mut self, turn: &Turn) -> Turn {
        let mut turn = turn.clone();
        if !turn.assistant_messages.is_empty() || !turn.tool_uses.is_empty() {
            turn.end_time = Some(turn.last_activity());
        }

        let end = turn.end_time.unwrap_or(turn.start_time);
        self.state.session_end = Some(self.state.session_end.map_or(end, |e| e.max(end)));
        turn
    }

    fn warn(&mut self, line: u64, message: String) {
        self.warnings.push(ReconstructionWarning { line, message });
    }

    /// Finish the pass, snapshotting the open turn
    pub fn finish(mut self) -> Reconstruction {
        let mut turns = std::mem::take(&mut self.closed_turns);
        if let Some(open) = self.state.current_turn.clone() {
            turns.push(self.snapshot(&open));
        }

        let session = self.state.session_start.map(|start_time| Session {
            session_id: self.state.session_id.clone(),
            transcript_path: None,
            start_time,
            end_time: self.state.session_end,
        });

        Reconstruction {
            state: self.state,
            session,
            turns,
            orphans: self.orphans,
            warnings: self.warnings,
            lines_processed: self.lines_processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(uuid: &str, ts: &str, text: &str) -> String {
        json!({"type": "user", "uuid": uuid, "timestamp": ts, "message": {"role": "user", "content": text}})
            .to_string()
    }

    fn assistant(id: &str, ts: &str, content: serde_json::Value, usage: Option<(u64, u64)>) -> String {
        let mut message = json!({"id": id, "role": "assistant", "model": "claude-sonnet-4", "content": content});
        if let Some((input, output)) = usage {
            message["usage"] = json!({"input_tokens": input, "output_tokens": output});
        }
        json!({"type": "assistant", "timestamp": ts, "message": message}).to_string()
    }

    fn tool_result(ts: &str, id: &str, output: &str, is_error: bool) -> String {
        json!({"type": "user", "timestamp": ts, "message": {"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": id, "content": output, "is_error": is_error}
        ]}})
        .to_string()
    }

    fn tool_call(id: &str, name: &str) -> serde_json::Value {
        json!([{"type": "tool_use", "id": id, "name": name, "input": {"command": "ls"}}])
    }

    fn sample_lines() -> Vec<String> {
        vec![
            user("u1", "2024-01-01T00:00:00Z", "list files"),
            assistant("m1", "2024-01-01T00:00:01Z", json!([{"type": "text", "text": "Hello"}]), Some((0, 0))),
            assistant("m1", "2024-01-01T00:00:02Z", json!([{"type": "text", "text": " world"}]), Some((10, 5))),
            assistant("m2", "2024-01-01T00:00:03Z", tool_call("t1", "Bash"), Some((20, 8))),
            tool_result("2024-01-01T00:00:05Z", "t1", "ok", false),
            user("u2", "2024-01-01T00:01:00Z", "thanks"),
            assistant("m3", "2024-01-01T00:01:02Z", json!([{"type": "text", "text": "done"}]), Some((30, 2))),
        ]
    }

    #[test]
    fn test_fragments_merge_by_key() {
        let lines = sample_lines();
        let result = reconstruct(ReconstructionState::new("s1"), &lines[..3], 0);

        assert_eq!(result.turns.len(), 1);
        let turn = &result.turns[0];
        assert_eq!(turn.assistant_messages.len(), 1);
        assert_eq!(turn.assistant_messages[0].text(), "Hello world");
        assert_eq!(turn.assistant_messages[0].usage, TokenUsage::new(10, 5));
    }

    #[test]
    fn test_usage_keeps_latest_non_null() {
        let lines = vec![
            user("u1", "2024-01-01T00:00:00Z", "q"),
            assistant("m1", "2024-01-01T00:00:01Z", json!([{"type": "text", "text": "a"}]), Some((10, 5))),
            assistant("m1", "2024-01-01T00:00:02Z", json!([{"type": "text", "text": "b"}]), None),
        ];
        let result = reconstruct(ReconstructionState::new("s1"), &lines, 0);
        assert_eq!(result.turns[0].assistant_messages[0].usage, TokenUsage::new(10, 5));
    }

    #[test]
    fn test_tool_result_correlation() {
        let result = reconstruct(ReconstructionState::new("s1"), &sample_lines(), 0);

        assert_eq!(result.turns.len(), 2);
        let tool = &result.turns[0].tool_uses[0];
        assert_eq!(tool.tool_use_id, "t1");
        assert_eq!(tool.name, "Bash");
        assert_eq!(tool.output.as_deref(), Some("ok"));
        assert_eq!(tool.success, Some(true));
        assert_eq!(tool.duration_ms(), Some(2000));
        assert_eq!(tool.message_id, "m2");
        assert!(result.orphans.is_empty());
    }

    #[test]
    fn test_error_result_sets_error_text() {
        let lines = vec![
            user("u1", "2024-01-01T00:00:00Z", "q"),
            assistant("m1", "2024-01-01T00:00:01Z", tool_call("t1", "Bash"), None),
            tool_result("2024-01-01T00:00:02Z", "t1", "command not found", true),
        ];
        let result = reconstruct(ReconstructionState::new("s1"), &lines, 0);
        let tool = &result.turns[0].tool_uses[0];
        assert_eq!(tool.success, Some(false));
        assert_eq!(tool.error.as_deref(), Some("command not found"));
    }

    #[test]
    fn test_orphan_result_does_not_fail() {
        let lines = vec![
            tool_result("2024-01-01T00:00:00Z", "early", "x", false),
            user("u1", "2024-01-01T00:00:01Z", "q"),
            tool_result("2024-01-01T00:00:02Z", "unknown", "y", false),
            assistant("m1", "2024-01-01T00:00:03Z", json!([{"type": "text", "text": "fine"}]), None),
        ];
        let result = reconstruct(ReconstructionState::new("s1"), &lines, 0);

        assert_eq!(result.orphans.len(), 2);
        assert_eq!(result.orphans[0].turn_number, None);
        assert_eq!(result.orphans[1].turn_number, Some(1));
        assert_eq!(result.turns.len(), 1);
        assert_eq!(result.turns[0].assistant_messages.len(), 1);
    }

    #[test]
    fn test_result_for_flushed_turn_is_orphan() {
        let lines = vec![
            user("u1", "2024-01-01T00:00:00Z", "q"),
            assistant("m1", "2024-01-01T00:00:01Z", tool_call("t1", "Bash"), None),
            user("u2", "2024-01-01T00:00:02Z", "next"),
            tool_result("2024-01-01T00:00:03Z", "t1", "late", false),
        ];
        let result = reconstruct(ReconstructionState::new("s1"), &lines, 0);
        assert!(result.turns[0].tool_uses[0].is_pending());
        assert_eq!(result.orphans.len(), 1);
        assert_eq!(result.orphans[0].tool_use_id, "t1");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let mut lines = sample_lines();
        lines.insert(1, "{broken".to_string());
        lines.insert(2, String::new());

        let result = reconstruct(ReconstructionState::new("s1"), &lines, 0);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].line, 2);
        assert_eq!(result.turns.len(), 2);
    }

    #[test]
    fn test_incremental_equivalence() {
        let lines = sample_lines();
        let whole = reconstruct(ReconstructionState::new("s1"), &lines, 0);

        for split in 0..=lines.len() {
            let first = reconstruct(ReconstructionState::new("s1"), &lines[..split], 0);
            let second = reconstruct(first.state.clone(), &lines, split);

            assert_eq!(second.state, whole.state, "state differs at split {}", split);
            assert_eq!(second.session, whole.session, "session differs at split {}", split);

            let mut merged: Vec<Turn> = first.turns.clone();
            for turn in second.turns {
                merged.retain(|t| t.turn_number != turn.turn_number);
                merged.push(turn);
            }
            merged.sort_by_key(|t| t.turn_number);
            assert_eq!(merged, whole.turns, "turns differ at split {}", split);
        }
    }

    #[test]
    fn test_offset_beyond_input_is_noop() {
        let lines = sample_lines();
        let result = reconstruct(ReconstructionState::new("s1"), &lines, lines.len() + 3);
        assert_eq!(result.lines_processed, 0);
        assert!(result.is_empty());
        assert!(result.session.is_none());
    }

    #[test]
    fn test_turn_bounds_and_clamping() {
        let lines = vec![
            user("u1", "2024-01-01T00:00:10Z", "q"),
            assistant("m1", "2024-01-01T00:00:05Z", json!([{"type": "text", "text": "early"}]), None),
            assistant("m2", "2024-01-01T00:00:20Z", json!([{"type": "text", "text": "late"}]), None),
        ];
        let result = reconstruct(ReconstructionState::new("s1"), &lines, 0);
        let turn = &result.turns[0];

        assert!(turn.assistant_messages.iter().all(|m| m.timestamp >= turn.start_time));
        assert_eq!(turn.duration_ms(), Some(10_000));
        let session = result.session.unwrap();
        assert_eq!(session.duration_ms(), Some(10_000));
    }

    #[test]
    fn test_assistant_before_user_is_warning() {
        let lines = vec![assistant("m0", "2024-01-01T00:00:00Z", json!("hi"), None)];
        let result = reconstruct(ReconstructionState::new("s1"), &lines, 0);
        assert!(result.turns.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }
}
