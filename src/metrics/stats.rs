//! Session statistics
//!
//! Derives time, token and tool statistics from a stored session graph.
//! When the transcript carries no token counts at all, the totals collected
//! from the metrics stream for that session are reported instead and the
//! result is flagged as enriched.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ratio, MetricsResult};
use crate::db::{queries, Database};
use crate::models::{MetricsSample, SessionDetail, SessionFilter, SessionMetricsSummary, TokenUsage, ToolUse, Turn};

/// Split of session time between inference and tool execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeBreakdown {
    pub model_time_ms: u64,
    pub tool_time_ms: u64,
    pub model_pct: f64,
    pub tool_pct: f64,
}

impl TimeBreakdown {
    fn new(model_time_ms: u64, tool_time_ms: u64) -> Self {
        let total = (model_time_ms + tool_time_ms) as f64;
        Self {
            model_time_ms,
            tool_time_ms,
            model_pct: ratio(model_time_ms as f64, total) * 100.0,
            tool_pct: ratio(tool_time_ms as f64, total) * 100.0,
        }
    }
}

/// Call and latency statistics of one tool name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub call_count: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub pending_count: u32,
    pub total_latency_ms: u64,
    /// Mean over completed calls
    pub avg_latency_ms: f64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
}

impl ToolStats {
    fn record(&mut self, tool_use: &ToolUse) {
        self.call_count += 1;
        match tool_use.success {
            Some(true) => self.success_count += 1,
            Some(false) => self.error_count += 1,
            None => self.pending_count += 1,
        }

        if let Some(latency) = tool_use.duration_ms() {
            let latency = latency.max(0) as u64;
            self.total_latency_ms += latency;
            self.min_latency_ms = Some(self.min_latency_ms.map_or(latency, |m| m.min(latency)));
            self.max_latency_ms = Some(self.max_latency_ms.map_or(latency, |m| m.max(latency)));
        }
        self.refresh_average();
    }

    fn merge(&mut self, other: &ToolStats) {
        self.call_count += other.call_count;
        self.success_count += other.success_count;
        self.error_count += other.error_count;
        self.pending_count += other.pending_count;
        self.total_latency_ms += other.total_latency_ms;
        self.min_latency_ms = match (self.min_latency_ms, other.min_latency_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_latency_ms = match (self.max_latency_ms, other.max_latency_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.refresh_average();
    }

    fn refresh_average(&mut self) {
        let completed = self.call_count - self.pending_count;
        self.avg_latency_ms = ratio(self.total_latency_ms as f64, completed as f64);
    }
}

/// Derived statistics of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: u64,
    pub turn_count: u32,
    pub message_count: u32,
    pub tool_use_count: u32,
    pub time: TimeBreakdown,
    pub tokens: TokenUsage,
    pub total_tokens: u64,
    pub cache_hit_rate: f64,
    /// Token counts come from the metrics stream
    pub enriched: bool,
    /// Mean delay between a user message and the first assistant reply
    pub avg_response_latency_ms: f64,
    pub tools: BTreeMap<String, ToolStats>,
    pub retry_count: u32,
    pub error_count: u32,
    pub orphan_count: u32,
    pub metrics: Option<SessionMetricsSummary>,
}

impl Stats {
    /// Compute statistics from a session graph and its correlated samples
    pub fn from_detail(detail: &SessionDetail, samples: &[MetricsSample]) -> Self {
        let session = &detail.session;

        let mut transcript_tokens = TokenUsage::default();
        let mut tools: BTreeMap<String, ToolStats> = BTreeMap::new();
        let mut model_time_ms = 0u64;
        let mut tool_time_ms = 0u64;
        let mut retry_count = 0u32;
        let mut latency_sum = 0u64;
        let mut latency_turns = 0u32;

        for turn in &detail.turns {
            transcript_tokens.add(&turn.usage());
            model_time_ms += model_time(turn);
            retry_count += count_retries(&turn.tool_uses);

            if let Some(first) = turn.assistant_messages.first() {
                latency_sum += (first.timestamp - turn.user_message.timestamp)
                    .num_milliseconds()
                    .max(0) as u64;
                latency_turns += 1;
            }

            for tool_use in &turn.tool_uses {
                if let Some(duration) = tool_use.duration_ms() {
                    tool_time_ms += duration.max(0) as u64;
                }
                tools.entry(tool_use.name.clone()).or_default().record(tool_use);
            }
        }

        let metrics = if samples.is_empty() {
            None
        } else {
            Some(SessionMetricsSummary::from_samples(
                Some(session.session_id.clone()),
                samples,
            ))
        };

        // Substitution is all-or-nothing for the whole session
        let (tokens, enriched) = match &metrics {
            Some(summary) if transcript_tokens.total() == 0 && summary.has_tokens() => {
                (summary.tokens, true)
            }
            _ => (transcript_tokens, false),
        };

        let end_time = session
            .end_time
            .or_else(|| detail.turns.last().map(Turn::last_activity));
        let total_duration_ms = end_time
            .map(|end| (end - session.start_time).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        Self {
            session_id: session.session_id.clone(),
            start_time: session.start_time,
            end_time,
            total_duration_ms,
            turn_count: detail.turns.len() as u32,
            message_count: detail.message_count() as u32,
            tool_use_count: detail.tool_use_count() as u32,
            time: TimeBreakdown::new(model_time_ms, tool_time_ms),
            total_tokens: tokens.total(),
            cache_hit_rate: tokens.cache_hit_rate(),
            tokens,
            enriched,
            avg_response_latency_ms: ratio(latency_sum as f64, latency_turns as f64),
            error_count: tools.values().map(|t| t.error_count).sum(),
            tools,
            retry_count,
            orphan_count: detail.orphan_results.len() as u32,
            metrics,
        }
    }
}

/// Inference time implied by a turn's assistant messages: for each one, the
/// gap since the previous event (user message, assistant message or tool end).
fn model_time(turn: &Turn) -> u64 {
    let mut events: Vec<(DateTime<Utc>, bool)> = Vec::new();
    events.push((turn.user_message.timestamp, false));
    events.extend(turn.assistant_messages.iter().map(|m| (m.timestamp, true)));
    events.extend(turn.tool_uses.iter().filter_map(|t| t.end_time).map(|ts| (ts, false)));
    events.sort_by_key(|(ts, _)| *ts);

    events
        .windows(2)
        .filter(|pair| pair[1].1)
        .map(|pair| (pair[1].0 - pair[0].0).num_milliseconds().max(0) as u64)
        .sum()
}

/// A call is a retry when the same tool failed earlier in the turn, or an
/// identical call (name and input) was already made.
fn count_retries(tool_uses: &[ToolUse]) -> u32 {
    let mut failed: HashSet<&str> = HashSet::new();
    let mut seen: HashSet<(&str, String)> = HashSet::new();
    let mut retries = 0;

    for tool_use in tool_uses {
        let call = (tool_use.name.as_str(), tool_use.input.to_string());
        if failed.contains(tool_use.name.as_str()) || seen.contains(&call) {
            retries += 1;
        }
        seen.insert(call);
        if tool_use.success == Some(false) {
            failed.insert(tool_use.name.as_str());
        }
    }

    retries
}

/// Statistics for one stored session, `None` if it does not exist
pub fn compute_statistics(db: &Database, session_id: &str) -> MetricsResult<Option<Stats>> {
    let loaded = db.with_connection(|conn| {
        let Some(detail) = queries::get_session_detail(conn, session_id)? else {
            return Ok(None);
        };
        let samples = queries::get_metrics_samples(conn, Some(session_id))?;
        Ok(Some((detail, samples)))
    })?;

    Ok(loaded.map(|(detail, samples)| {
        let stats = Stats::from_detail(&detail, &samples);
        tracing::debug!(
            "Computed stats for {}: {} turns, {} tokens (enriched: {})",
            session_id,
            stats.turn_count,
            stats.total_tokens,
            stats.enriched
        );
        stats
    }))
}

/// Statistics summed and averaged over several sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub session_count: u32,
    pub enriched_sessions: u32,
    pub total_duration_ms: u64,
    pub turn_count: u32,
    pub message_count: u32,
    pub tool_use_count: u32,
    pub time: TimeBreakdown,
    pub tokens: TokenUsage,
    pub total_tokens: u64,
    pub cache_hit_rate: f64,
    pub tools: BTreeMap<String, ToolStats>,
    pub retry_count: u32,
    pub error_count: u32,
    pub orphan_count: u32,
    pub avg_duration_ms: f64,
    pub avg_turns_per_session: f64,
    pub avg_tokens_per_session: f64,
    /// Failed tool uses per tool use
    pub error_rate: f64,
    pub avg_response_latency_ms: f64,
}

impl AggregateStats {
    pub fn from_stats(stats: &[Stats]) -> Self {
        let mut agg = Self::default();
        let mut model_time_ms = 0;
        let mut tool_time_ms = 0;
        let mut latency_sum = 0.0;

        for s in stats {
            agg.session_count += 1;
            if s.enriched {
                agg.enriched_sessions += 1;
            }
            agg.total_duration_ms += s.total_duration_ms;
            agg.turn_count += s.turn_count;
            agg.message_count += s.message_count;
            agg.tool_use_count += s.tool_use_count;
            model_time_ms += s.time.model_time_ms;
            tool_time_ms += s.time.tool_time_ms;
            agg.tokens.add(&s.tokens);
            agg.retry_count += s.retry_count;
            agg.error_count += s.error_count;
            agg.orphan_count += s.orphan_count;
            latency_sum += s.avg_response_latency_ms;

            for (name, tool) in &s.tools {
                agg.tools.entry(name.clone()).or_default().merge(tool);
            }
        }

        let sessions = agg.session_count as f64;
        agg.time = TimeBreakdown::new(model_time_ms, tool_time_ms);
        agg.total_tokens = agg.tokens.total();
        agg.cache_hit_rate = agg.tokens.cache_hit_rate();
        agg.avg_duration_ms = ratio(agg.total_duration_ms as f64, sessions);
        agg.avg_turns_per_session = ratio(agg.turn_count as f64, sessions);
        agg.avg_tokens_per_session = ratio(agg.total_tokens as f64, sessions);
        agg.error_rate = ratio(agg.error_count as f64, agg.tool_use_count as f64);
        agg.avg_response_latency_ms = ratio(latency_sum, sessions);
        agg
    }
}

/// Aggregate over the sessions matching `filter`. Sessions without turns, or
/// whose statistics cannot be computed, are left out.
pub fn aggregate_statistics(db: &Database, filter: &SessionFilter) -> MetricsResult<AggregateStats> {
    let sessions = db.with_connection(|conn| queries::list_sessions(conn, filter))?;
    let stats = collect_stats(db, sessions.iter().map(|s| s.session_id.as_str()));

    tracing::info!(
        "Aggregated {} of {} sessions",
        stats.len(),
        sessions.len()
    );
    Ok(AggregateStats::from_stats(&stats))
}

/// Side-by-side statistics for chosen sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionComparison {
    pub sessions: Vec<Stats>,
    /// Requested ids with no usable data
    pub missing: Vec<String>,
    pub combined: AggregateStats,
}

pub fn compare_sessions(db: &Database, session_ids: &[String]) -> MetricsResult<SessionComparison> {
    let sessions = collect_stats(db, session_ids.iter().map(String::as_str));
    let missing = session_ids
        .iter()
        .filter(|id| !sessions.iter().any(|s| &s.session_id == *id))
        .cloned()
        .collect();

    Ok(SessionComparison {
        combined: AggregateStats::from_stats(&sessions),
        sessions,
        missing,
    })
}

fn collect_stats<'a>(db: &Database, ids: impl Iterator<Item = &'a str>) -> Vec<Stats> {
    ids.filter_map(|id| match compute_statistics(db, id) {
        Ok(Some(stats)) if stats.turn_count > 0 => Some(stats),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Skipping session {}: {}", id, e);
            None
        }
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, OrphanResult, Role, Session};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn message(turn: u32, id: &str, role: Role, secs: i64, usage: TokenUsage) -> Message {
        Message {
            message_id: id.to_string(),
            session_id: "s1".to_string(),
            turn_number: turn,
            role,
            content: Vec::new(),
            model: Some("claude-sonnet".to_string()),
            usage,
            timestamp: at(secs),
        }
    }

    fn tool(id: &str, name: &str, input: serde_json::Value, start: i64, end: Option<i64>, success: Option<bool>) -> ToolUse {
        ToolUse {
            tool_use_id: id.to_string(),
            session_id: "s1".to_string(),
            turn_number: 1,
            message_id: "a1".to_string(),
            name: name.to_string(),
            input,
            output: end.map(|_| "out".to_string()),
            success,
            error: None,
            start_time: at(start),
            end_time: end.map(at),
        }
    }

    fn detail(usage: TokenUsage, tool_uses: Vec<ToolUse>) -> SessionDetail {
        let turn = Turn {
            session_id: "s1".to_string(),
            turn_number: 1,
            user_message: message(1, "u1", Role::User, 0, TokenUsage::default()),
            assistant_messages: vec![
                message(1, "a1", Role::Assistant, 2, usage),
                message(1, "a2", Role::Assistant, 10, TokenUsage::default()),
            ],
            tool_uses,
            start_time: at(0),
            end_time: Some(at(10)),
        };
        SessionDetail {
            session: Session {
                session_id: "s1".to_string(),
                transcript_path: None,
                start_time: at(0),
                end_time: Some(at(10)),
            },
            turns: vec![turn],
            orphan_results: Vec::new(),
        }
    }

    fn sample(name: &str, value: f64, token_type: &str) -> MetricsSample {
        let mut sample = MetricsSample::new(name, value);
        sample.session_id = Some("s1".to_string());
        sample.labels.insert("type".to_string(), token_type.to_string());
        sample
    }

    fn token_samples() -> Vec<MetricsSample> {
        vec![
            sample("claude_code.token.usage", 500.0, "input"),
            sample("claude_code.token.usage", 120.0, "output"),
        ]
    }

    #[test]
    fn test_zero_transcript_tokens_use_metrics() {
        let stats = Stats::from_detail(&detail(TokenUsage::new(0, 0), Vec::new()), &token_samples());
        assert_eq!(stats.tokens, TokenUsage::new(500, 120));
        assert_eq!(stats.total_tokens, 620);
        assert!(stats.enriched);
        assert!(stats.metrics.is_some());
    }

    #[test]
    fn test_transcript_tokens_never_substituted() {
        let stats = Stats::from_detail(&detail(TokenUsage::new(10, 5), Vec::new()), &token_samples());
        assert_eq!(stats.tokens, TokenUsage::new(10, 5));
        assert!(!stats.enriched);
    }

    #[test]
    fn test_no_metrics_no_enrichment() {
        let stats = Stats::from_detail(&detail(TokenUsage::default(), Vec::new()), &[]);
        assert_eq!(stats.tokens, TokenUsage::default());
        assert_eq!(stats.cache_hit_rate, 0.0);
        assert!(!stats.enriched);
        assert!(stats.metrics.is_none());
    }

    #[test]
    fn test_cache_hit_rate() {
        let usage = TokenUsage {
            input_tokens: 25,
            output_tokens: 10,
            cache_read_tokens: 75,
            cache_creation_tokens: 0,
        };
        let stats = Stats::from_detail(&detail(usage, Vec::new()), &[]);
        assert_eq!(stats.cache_hit_rate, 0.75);
    }

    #[test]
    fn test_time_breakdown() {
        // user@0, a1@2, tool 3..8, a2@10
        let tools = vec![tool("t1", "Bash", json!({"command": "ls"}), 3, Some(8), Some(true))];
        let stats = Stats::from_detail(&detail(TokenUsage::new(1, 1), tools), &[]);

        assert_eq!(stats.total_duration_ms, 10_000);
        assert_eq!(stats.time.model_time_ms, 4_000);
        assert_eq!(stats.time.tool_time_ms, 5_000);
        assert!((stats.time.model_pct - 44.444).abs() < 0.01);
        assert_eq!(stats.avg_response_latency_ms, 2_000.0);
    }

    #[test]
    fn test_tool_stats_and_retries() {
        let tools = vec![
            tool("t1", "Bash", json!({"command": "make"}), 3, Some(4), Some(false)),
            tool("t2", "Bash", json!({"command": "make -j1"}), 4, Some(7), Some(true)),
            tool("t3", "Read", json!({"path": "a"}), 7, Some(8), Some(true)),
            tool("t4", "Read", json!({"path": "a"}), 8, Some(9), Some(true)),
            tool("t5", "Grep", json!({}), 9, None, None),
        ];
        let stats = Stats::from_detail(&detail(TokenUsage::new(1, 1), tools), &[]);

        assert_eq!(stats.tool_use_count, 5);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.retry_count, 2);

        let bash = &stats.tools["Bash"];
        assert_eq!(bash.call_count, 2);
        assert_eq!(bash.error_count, 1);
        assert_eq!(bash.total_latency_ms, 4_000);
        assert_eq!(bash.avg_latency_ms, 2_000.0);
        assert_eq!(bash.min_latency_ms, Some(1_000));
        assert_eq!(bash.max_latency_ms, Some(3_000));

        let grep = &stats.tools["Grep"];
        assert_eq!(grep.pending_count, 1);
        assert_eq!(grep.avg_latency_ms, 0.0);
    }

    #[test]
    fn test_orphans_counted() {
        let mut d = detail(TokenUsage::new(1, 1), Vec::new());
        d.orphan_results.push(OrphanResult {
            session_id: "s1".to_string(),
            tool_use_id: "ghost".to_string(),
            turn_number: Some(1),
            output: "x".to_string(),
            is_error: false,
            timestamp: at(5),
        });
        assert_eq!(Stats::from_detail(&d, &[]).orphan_count, 1);
    }

    #[test]
    fn test_aggregate_handles_empty_input() {
        let agg = AggregateStats::from_stats(&[]);
        assert_eq!(agg.session_count, 0);
        assert_eq!(agg.avg_duration_ms, 0.0);
        assert_eq!(agg.error_rate, 0.0);
        assert_eq!(agg.cache_hit_rate, 0.0);
        assert_eq!(agg.time.model_pct, 0.0);
    }

    #[test]
    fn test_aggregate_sums_sessions() {
        let a = Stats::from_detail(&detail(TokenUsage::new(10, 5), Vec::new()), &[]);
        let b = Stats::from_detail(&detail(TokenUsage::new(0, 0), Vec::new()), &token_samples());
        let agg = AggregateStats::from_stats(&[a, b]);

        assert_eq!(agg.session_count, 2);
        assert_eq!(agg.enriched_sessions, 1);
        assert_eq!(agg.tokens, TokenUsage::new(510, 125));
        assert_eq!(agg.avg_tokens_per_session, 317.5);
        assert_eq!(agg.error_rate, 0.0);
    }

    #[test]
    fn test_compute_statistics_from_store() {
        let db = Database::in_memory().unwrap();
        let d = detail(TokenUsage::new(0, 0), Vec::new());
        db.with_connection(|conn| {
            queries::upsert_session(conn, &d.session)?;
            queries::upsert_turn(conn, &d.turns[0])?;
            queries::insert_metrics_samples(conn, &token_samples())?;
            Ok(())
        })
        .unwrap();

        let stats = compute_statistics(&db, "s1").unwrap().unwrap();
        assert_eq!(stats.turn_count, 1);
        assert_eq!(stats.message_count, 3);
        assert_eq!(stats.tokens, TokenUsage::new(500, 120));
        assert!(stats.enriched);

        assert!(compute_statistics(&db, "nope").unwrap().is_none());

        let comparison = compare_sessions(&db, &["s1".to_string(), "nope".to_string()]).unwrap();
        assert_eq!(comparison.sessions.len(), 1);
        assert_eq!(comparison.missing, vec!["nope".to_string()]);

        let agg = aggregate_statistics(&db, &SessionFilter::default()).unwrap();
        assert_eq!(agg.session_count, 1);
    }

    #[test]
    fn test_aggregate_skips_sessions_without_turns() {
        let db = Database::in_memory().unwrap();
        db.with_connection(|conn| {
            queries::upsert_session(
                conn,
                &Session {
                    session_id: "empty".to_string(),
                    transcript_path: None,
                    start_time: at(0),
                    end_time: None,
                },
            )
        })
        .unwrap();

        let agg = aggregate_statistics(&db, &SessionFilter::default()).unwrap();
        assert_eq!(agg.session_count, 0);
        assert_eq!(agg.avg_turns_per_session, 0.0);
    }
}
