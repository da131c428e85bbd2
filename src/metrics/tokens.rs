//! Token breakdowns
//!
//! Splits a session's token usage by turn and by model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{SessionDetail, TokenUsage, Turn};

/// Token usage of one turn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnTokens {
    pub turn_number: u32,
    pub usage: TokenUsage,
    /// Model of the turn's last assistant message
    pub model: Option<String>,
    pub assistant_messages: u32,
}

impl TurnTokens {
    pub fn from_turn(turn: &Turn) -> Self {
        Self {
            turn_number: turn.turn_number,
            usage: turn.usage(),
            model: turn
                .assistant_messages
                .iter()
                .rev()
                .find_map(|m| m.model.clone()),
            assistant_messages: turn.assistant_messages.len() as u32,
        }
    }
}

/// Token usage of a session by turn and by model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenBreakdown {
    pub session_id: String,
    pub total: TokenUsage,
    pub by_turn: Vec<TurnTokens>,
    pub by_model: BTreeMap<String, TokenUsage>,
}

impl TokenBreakdown {
    pub fn from_detail(detail: &SessionDetail) -> Self {
        let mut breakdown = Self {
            session_id: detail.session.session_id.clone(),
            ..Self::default()
        };

        for turn in &detail.turns {
            for message in &turn.assistant_messages {
                let model = message.model.clone().unwrap_or_else(|| "unknown".to_string());
                breakdown.by_model.entry(model).or_default().add(&message.usage);
            }

            let turn_tokens = TurnTokens::from_turn(turn);
            breakdown.total.add(&turn_tokens.usage);
            breakdown.by_turn.push(turn_tokens);
        }

        breakdown
    }

    /// Mean input+output tokens per turn
    pub fn avg_per_turn(&self) -> f64 {
        super::ratio(self.total.total() as f64, self.by_turn.len() as f64)
    }

    /// Turn with the largest input+output usage
    pub fn peak_turn(&self) -> Option<&TurnTokens> {
        self.by_turn.iter().max_by_key(|t| t.usage.total())
    }
}

/// Calculate token velocity (tokens per second)
pub fn token_velocity(tokens: u64, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        0.0
    } else {
        (tokens as f64) / (duration_ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, Role, Session};
    use chrono::{TimeZone, Utc};

    fn message(turn: u32, id: &str, role: Role, model: Option<&str>, usage: TokenUsage) -> Message {
        Message {
            message_id: id.to_string(),
            session_id: "s".to_string(),
            turn_number: turn,
            role,
            content: Vec::new(),
            model: model.map(String::from),
            usage,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn turn(number: u32, assistant: Vec<Message>) -> Turn {
        let user = message(number, &format!("u{}", number), Role::User, None, TokenUsage::default());
        Turn {
            session_id: "s".to_string(),
            turn_number: number,
            start_time: user.timestamp,
            user_message: user,
            assistant_messages: assistant,
            tool_uses: Vec::new(),
            end_time: None,
        }
    }

    #[test]
    fn test_breakdown_by_turn_and_model() {
        let detail = SessionDetail {
            session: Session {
                session_id: "s".to_string(),
                transcript_path: None,
                start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                end_time: None,
            },
            turns: vec![
                turn(1, vec![
                    message(1, "a", Role::Assistant, Some("opus"), TokenUsage::new(100, 50)),
                    message(1, "b", Role::Assistant, Some("haiku"), TokenUsage::new(10, 5)),
                ]),
                turn(2, vec![message(2, "c", Role::Assistant, Some("opus"), TokenUsage::new(200, 20))]),
            ],
            orphan_results: Vec::new(),
        };

        let breakdown = TokenBreakdown::from_detail(&detail);
        assert_eq!(breakdown.total, TokenUsage::new(310, 75));
        assert_eq!(breakdown.by_model["opus"], TokenUsage::new(300, 70));
        assert_eq!(breakdown.by_model["haiku"], TokenUsage::new(10, 5));
        assert_eq!(breakdown.by_turn[0].model.as_deref(), Some("haiku"));
        assert_eq!(breakdown.peak_turn().map(|t| t.turn_number), Some(2));
        assert_eq!(breakdown.avg_per_turn(), 192.5);
    }

    #[test]
    fn test_empty_breakdown() {
        let breakdown = TokenBreakdown::default();
        assert_eq!(breakdown.avg_per_turn(), 0.0);
        assert!(breakdown.peak_turn().is_none());
    }

    #[test]
    fn test_token_velocity() {
        assert_eq!(token_velocity(1000, 1000), 1000.0);
        assert_eq!(token_velocity(1000, 2000), 500.0);
        assert_eq!(token_velocity(0, 1000), 0.0);
        assert_eq!(token_velocity(1000, 0), 0.0);
    }
}
