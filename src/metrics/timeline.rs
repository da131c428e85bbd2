//! Session timeline
//!
//! Flattens a session graph into time-ordered events for display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, SessionDetail};

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    TurnStart,
    UserMessage,
    AssistantMessage,
    ToolStart,
    ToolEnd,
    TurnEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub turn_number: u32,
    pub kind: TimelineEventKind,
    /// Short description: message preview or tool name
    pub summary: String,
}

impl TimelineEvent {
    fn new(timestamp: DateTime<Utc>, turn_number: u32, kind: TimelineEventKind, summary: String) -> Self {
        Self {
            timestamp,
            turn_number,
            kind,
            summary,
        }
    }
}

/// Build the ordered event list of a session. Turns stay in transcript
/// order; events are sorted by time only within their turn, and events
/// with equal timestamps keep their transcript order.
pub fn build_timeline(detail: &SessionDetail) -> Vec<TimelineEvent> {
    let mut timeline = Vec::new();

    for turn in &detail.turns {
        let n = turn.turn_number;
        let mut events = Vec::new();
        events.push(TimelineEvent::new(
            turn.start_time,
            n,
            TimelineEventKind::TurnStart,
            format!("Turn {}", n),
        ));
        events.push(TimelineEvent::new(
            turn.user_message.timestamp,
            n,
            TimelineEventKind::UserMessage,
            preview(&turn.user_message),
        ));

        for message in &turn.assistant_messages {
            events.push(TimelineEvent::new(
                message.timestamp,
                n,
                TimelineEventKind::AssistantMessage,
                preview(message),
            ));
        }

        for tool_use in &turn.tool_uses {
            events.push(TimelineEvent::new(
                tool_use.start_time,
                n,
                TimelineEventKind::ToolStart,
                tool_use.name.clone(),
            ));
            if let Some(end) = tool_use.end_time {
                let status = match tool_use.success {
                    Some(false) => "failed",
                    _ => "ok",
                };
                events.push(TimelineEvent::new(
                    end,
                    n,
                    TimelineEventKind::ToolEnd,
                    format!("{} ({})", tool_use.name, status),
                ));
            }
        }

        if let Some(end) = turn.end_time {
            events.push(TimelineEvent::new(
                end,
                n,
                TimelineEventKind::TurnEnd,
                format!("Turn {}", n),
            ));
        }

        events.sort_by_key(|e| e.timestamp);
        timeline.extend(events);
    }

    timeline
}

fn preview(message: &Message) -> String {
    let text = message.text();
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() > PREVIEW_CHARS {
        let cut: String = line.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}
