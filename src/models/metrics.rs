//! Metrics data types
//!
//! Samples collected from OpenTelemetry exporter output and the per-session
//! summaries derived from them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::turn::TokenUsage;

/// Instrument that produced a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Counter,
    Gauge,
    Histogram,
    #[default]
    Unknown,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Counter => "counter",
            InstrumentKind::Gauge => "gauge",
            InstrumentKind::Histogram => "histogram",
            InstrumentKind::Unknown => "unknown",
        }
    }

    /// Parse the type names used by Prometheus and OTLP exporters
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "counter" | "sum" | "observable_counter" | "up_down_counter" | "updowncounter" => {
                InstrumentKind::Counter
            }
            "gauge" | "observable_gauge" => InstrumentKind::Gauge,
            "histogram" | "summary" | "exponential_histogram" => InstrumentKind::Histogram,
            _ => InstrumentKind::Unknown,
        }
    }
}

/// What a sample measures, as far as enrichment cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    InputTokens,
    OutputTokens,
    CacheReadTokens,
    CacheCreationTokens,
    ApiCalls,
    ApiLatency,
    ToolCalls,
    Errors,
    Cost,
    Other,
}

const INPUT_TOKEN_NAMES: &[&str] = &[
    "claude_code.tokens.input",
    "tokens.input",
    "input_tokens",
    "anthropic.claude.tokens.input",
    "llm.tokens.input",
];
const OUTPUT_TOKEN_NAMES: &[&str] = &[
    "claude_code.tokens.output",
    "tokens.output",
    "output_tokens",
    "anthropic.claude.tokens.output",
    "llm.tokens.output",
];
const CACHE_READ_NAMES: &[&str] = &[
    "claude_code.tokens.cache_read",
    "tokens.cache_read",
    "cache_read_input_tokens",
    "anthropic.claude.cache_read",
];
const CACHE_CREATION_NAMES: &[&str] = &[
    "claude_code.tokens.cache_creation",
    "tokens.cache_creation",
    "cache_creation_input_tokens",
    "anthropic.claude.cache_creation",
];
const API_CALL_NAMES: &[&str] = &[
    "claude_code.api.calls",
    "api.calls",
    "llm.calls",
    "anthropic.claude.requests",
];
const API_LATENCY_NAMES: &[&str] = &[
    "claude_code.api.latency",
    "api.latency",
    "llm.latency",
    "anthropic.claude.latency",
];
const TOOL_CALL_NAMES: &[&str] = &["claude_code.tools.calls", "tools.calls", "tool_calls"];
const ERROR_NAMES: &[&str] = &[
    "claude_code.errors",
    "errors",
    "api.errors",
    "anthropic.claude.errors",
];
const COST_NAMES: &[&str] = &["claude_code.cost.usage", "cost.usage"];

/// Metric emitted by Claude Code with the token type carried in a `type` label
const TOKEN_USAGE_METRIC: &str = "claude_code.token.usage";

/// Exposition unit suffixes dropped before matching names
const NAME_SUFFIXES: &[&str] = &["_total", "_tokens", "_usd", "_milliseconds"];

/// Fold dotted OpenTelemetry names and their Prometheus renderings
/// (`claude_code_token_usage_tokens_total`) onto one form.
fn normalize_name(name: &str) -> String {
    let mut name = name.to_ascii_lowercase().replace(['.', '-'], "_");
    for suffix in NAME_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped.to_string();
        }
    }
    name
}

/// One observation parsed from exporter output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Owning session, when known at collection time
    pub session_id: Option<String>,
    pub name: String,
    /// Point value; the sum for histogram points
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub instrument: InstrumentKind,
    /// Observation count for histogram points
    pub count: Option<u64>,
    /// Position of the sample in its source
    pub seq: u64,
}

impl MetricsSample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            session_id: None,
            name: name.into(),
            value,
            unit: None,
            timestamp: None,
            labels: BTreeMap::new(),
            instrument: InstrumentKind::Unknown,
            count: None,
            seq: 0,
        }
    }

    /// Classify the sample by metric name aliases
    pub fn kind(&self) -> SampleKind {
        let name = normalize_name(&self.name);

        if name == normalize_name(TOKEN_USAGE_METRIC) {
            return match self.labels.get("type").map(String::as_str) {
                Some("input") => SampleKind::InputTokens,
                Some("output") => SampleKind::OutputTokens,
                Some("cacheRead") | Some("cache_read") => SampleKind::CacheReadTokens,
                Some("cacheCreation") | Some("cache_creation") => SampleKind::CacheCreationTokens,
                _ => SampleKind::Other,
            };
        }

        let table: [(&[&str], SampleKind); 9] = [
            (INPUT_TOKEN_NAMES, SampleKind::InputTokens),
            (OUTPUT_TOKEN_NAMES, SampleKind::OutputTokens),
            (CACHE_READ_NAMES, SampleKind::CacheReadTokens),
            (CACHE_CREATION_NAMES, SampleKind::CacheCreationTokens),
            (API_CALL_NAMES, SampleKind::ApiCalls),
            (API_LATENCY_NAMES, SampleKind::ApiLatency),
            (TOOL_CALL_NAMES, SampleKind::ToolCalls),
            (ERROR_NAMES, SampleKind::Errors),
            (COST_NAMES, SampleKind::Cost),
        ];

        table
            .iter()
            .find(|(names, _)| names.iter().any(|alias| normalize_name(alias) == name))
            .map(|(_, kind)| *kind)
            .unwrap_or(SampleKind::Other)
    }

    /// Labels serialized as a stable JSON object
    pub fn labels_json(&self) -> String {
        serde_json::to_string(&self.labels).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Aggregate over all samples sharing a metric name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricAggregate {
    pub name: String,
    pub instrument: InstrumentKind,
    pub unit: Option<String>,
    pub sample_count: u64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    /// Number of observations (histogram counts, 1 per plain sample)
    pub observations: u64,
}

impl MetricAggregate {
    fn observe(&mut self, sample: &MetricsSample) {
        if self.sample_count == 0 {
            self.min = sample.value;
            self.max = sample.value;
        } else {
            self.min = self.min.min(sample.value);
            self.max = self.max.max(sample.value);
        }
        self.sample_count += 1;
        self.total += sample.value;
        self.observations += sample.count.unwrap_or(1);
        if self.unit.is_none() {
            self.unit = sample.unit.clone();
        }
        if self.instrument == InstrumentKind::Unknown {
            self.instrument = sample.instrument;
        }
    }

    pub fn average(&self) -> f64 {
        if self.observations == 0 {
            0.0
        } else {
            self.total / self.observations as f64
        }
    }
}

/// Per-session view over collected samples
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetricsSummary {
    pub session_id: Option<String>,
    pub sample_count: u64,
    pub tokens: TokenUsage,
    pub api_calls: u64,
    /// Mean API latency in milliseconds
    pub api_latency_ms: f64,
    pub tool_calls: u64,
    pub errors: u64,
    pub cost_usd: f64,
    pub metrics: BTreeMap<String, MetricAggregate>,
}

impl SessionMetricsSummary {
    pub fn from_samples(session_id: Option<String>, samples: &[MetricsSample]) -> Self {
        let mut summary = Self {
            session_id,
            ..Self::default()
        };
        let mut latency_sum = 0.0;
        let mut latency_observations = 0u64;

        for sample in samples {
            summary.sample_count += 1;
            let counter = sample.value.max(0.0).round() as u64;

            match sample.kind() {
                SampleKind::InputTokens => summary.tokens.input_tokens += counter,
                SampleKind::OutputTokens => summary.tokens.output_tokens += counter,
                SampleKind::CacheReadTokens => summary.tokens.cache_read_tokens += counter,
                SampleKind::CacheCreationTokens => summary.tokens.cache_creation_tokens += counter,
                SampleKind::ApiCalls => summary.api_calls += counter,
                SampleKind::ApiLatency => {
                    latency_sum += sample.value;
                    latency_observations += sample.count.unwrap_or(1);
                }
                SampleKind::ToolCalls => summary.tool_calls += counter,
                SampleKind::Errors => summary.errors += counter,
                SampleKind::Cost => summary.cost_usd += sample.value,
                SampleKind::Other => {}
            }

            summary
                .metrics
                .entry(sample.name.clone())
                .or_insert_with(|| MetricAggregate {
                    name: sample.name.clone(),
                    ..MetricAggregate::default()
                })
                .observe(sample);
        }

        if latency_observations > 0 {
            summary.api_latency_ms = latency_sum / latency_observations as f64;
        }

        summary
    }

    pub fn has_tokens(&self) -> bool {
        self.tokens.total() > 0
    }
}

/// Association between a session and the file its metrics are written to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOtelMapping {
    pub session_id: String,
    pub otel_log_file: PathBuf,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
}
