//! Exporter text layouts
//!
//! Each layout recognizes one textual rendering of metric data points. The
//! collector tries them in order and the first that claims a record wins.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::models::{InstrumentKind, MetricsSample};
use crate::parser::parse_timestamp;

lazy_static! {
    static ref EXPOSITION_LINE: Regex = Regex::new(
        r"^(?P<name>[a-zA-Z_][a-zA-Z0-9_\.]*)(?:\{(?P<labels>[^}]*)\})?\s+(?P<value>[0-9.eE+-]+)(?:\s+(?P<timestamp>\d+))?$"
    )
    .unwrap();
    static ref EXPOSITION_LABEL: Regex = Regex::new(r#"([a-zA-Z_][a-zA-Z0-9_\.]*)="([^"]*)""#).unwrap();
    static ref TYPE_DIRECTIVE: Regex =
        Regex::new(r"^#\s*TYPE\s+(?P<name>\S+)\s+(?P<kind>\S+)").unwrap();
}

/// State shared by layouts across the records of one source
#[derive(Debug, Default)]
pub struct LayoutContext {
    /// Instrument kinds announced by `# TYPE` directives
    pub type_hints: HashMap<String, InstrumentKind>,
}

/// A textual layout of metric records
pub trait MetricsLayout: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the record is not in this layout. `Some` with an empty
    /// list when it is, but carries no data points (comments, directives).
    fn parse(&self, record: &str, ctx: &mut LayoutContext) -> Option<Vec<MetricsSample>>;
}

/// Layouts in precedence order
pub fn default_layouts() -> Vec<Box<dyn MetricsLayout>> {
    vec![
        Box::new(JsonLineLayout),
        Box::new(ConsoleExporterLayout),
        Box::new(ExpositionLayout),
    ]
}

/// One JSON object per line, either a flat metric or an OTLP
/// `resourceMetrics` envelope.
pub struct JsonLineLayout;

impl MetricsLayout for JsonLineLayout {
    fn name(&self) -> &'static str {
        "json"
    }

    fn parse(&self, record: &str, _ctx: &mut LayoutContext) -> Option<Vec<MetricsSample>> {
        let record = record.trim();
        if !record.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(record).ok()?;
        let obj = value.as_object()?;

        if let Some(resources) = obj.get("resourceMetrics").and_then(Value::as_array) {
            return Some(parse_otlp_resources(resources));
        }

        let name = str_of(obj, &["name", "metric_name", "Name"])?;
        let unit = str_of(obj, &["unit"]);
        let instrument = str_of(obj, &["type", "metric_type"])
            .map(|t| InstrumentKind::parse(&t))
            .unwrap_or_default();

        let points: Vec<&Value> = ["data_points", "dataPoints", "points"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_array))
            .map(|points| points.iter().collect())
            .unwrap_or_else(|| vec![&value]);

        let samples = points
            .into_iter()
            .filter_map(|point| {
                let point = point.as_object()?;
                let mut sample = json_point(&name, point)?;
                sample.unit = unit.clone();
                if sample.instrument == InstrumentKind::Unknown {
                    sample.instrument = instrument;
                }
                Some(sample)
            })
            .collect::<Vec<_>>();

        if samples.is_empty() {
            None
        } else {
            Some(samples)
        }
    }
}

fn parse_otlp_resources(resources: &[Value]) -> Vec<MetricsSample> {
    let mut samples = Vec::new();

    for resource in resources {
        let scopes = resource
            .get("scopeMetrics")
            .or_else(|| resource.get("instrumentationLibraryMetrics"))
            .and_then(Value::as_array);

        for scope in scopes.into_iter().flatten() {
            let metrics = scope.get("metrics").and_then(Value::as_array);

            for metric in metrics.into_iter().flatten() {
                let Some(name) = metric.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let unit = metric.get("unit").and_then(Value::as_str).map(String::from);

                let kinds = [
                    ("sum", InstrumentKind::Counter),
                    ("gauge", InstrumentKind::Gauge),
                    ("histogram", InstrumentKind::Histogram),
                ];
                for (key, instrument) in kinds {
                    let points = metric
                        .get(key)
                        .and_then(|body| body.get("dataPoints"))
                        .and_then(Value::as_array);

                    for point in points.into_iter().flatten().filter_map(Value::as_object) {
                        if let Some(mut sample) = json_point(name, point) {
                            sample.unit = unit.clone();
                            sample.instrument = instrument;
                            samples.push(sample);
                        }
                    }
                }
            }
        }
    }

    samples
}

/// Build a sample from a JSON data point
fn json_point(name: &str, point: &Map<String, Value>) -> Option<MetricsSample> {
    let count = point.get("count").and_then(number);
    let (value, instrument) = match ["value", "asDouble", "asInt"]
        .iter()
        .find_map(|key| point.get(*key).and_then(number))
    {
        Some(value) => (value, InstrumentKind::Unknown),
        None => match point.get("sum").and_then(number) {
            Some(sum) => (sum, InstrumentKind::Histogram),
            None => (count?, InstrumentKind::Unknown),
        },
    };

    let mut sample = MetricsSample::new(name, value);
    sample.instrument = instrument;
    if instrument == InstrumentKind::Histogram {
        sample.count = count.map(|c| c as u64);
    }
    sample.timestamp = ["timestamp", "time_unix_nano", "timeUnixNano"]
        .iter()
        .find_map(|key| point.get(*key).and_then(json_timestamp));
    sample.labels = point
        .get("attributes")
        .map(attribute_labels)
        .unwrap_or_default();

    Some(sample)
}

/// OpenTelemetry JS `ConsoleMetricExporter` output: a multi-line object
/// literal with `descriptor` and `dataPoints` fields.
pub struct ConsoleExporterLayout;

impl MetricsLayout for ConsoleExporterLayout {
    fn name(&self) -> &'static str {
        "console"
    }

    fn parse(&self, record: &str, _ctx: &mut LayoutContext) -> Option<Vec<MetricsSample>> {
        let record = record.trim();
        if !record.starts_with('{') || !record.contains("descriptor") {
            return None;
        }
        let value: Value = serde_json::from_str(&object_literal_to_json(record)).ok()?;

        let descriptor = value.get("descriptor")?.as_object()?;
        let name = descriptor.get("name")?.as_str()?;
        let unit = descriptor
            .get("unit")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(String::from);
        let instrument = descriptor
            .get("type")
            .and_then(Value::as_str)
            .map(InstrumentKind::parse)
            .unwrap_or_default();

        let points = value.get("dataPoints").and_then(Value::as_array)?;
        let mut samples = Vec::new();

        for point in points {
            let (value, count) = match point.get("value") {
                Some(Value::Object(hist)) => (
                    hist.get("sum").and_then(number).unwrap_or(0.0),
                    hist.get("count").and_then(number).map(|c| c as u64),
                ),
                Some(other) => match number(other) {
                    Some(v) => (v, None),
                    None => continue,
                },
                None => continue,
            };

            let mut sample = MetricsSample::new(name, value);
            sample.unit = unit.clone();
            sample.instrument = if count.is_some() {
                InstrumentKind::Histogram
            } else {
                instrument
            };
            sample.count = count;
            sample.timestamp = point
                .get("endTime")
                .or_else(|| point.get("startTime"))
                .and_then(hrtime);
            sample.labels = point
                .get("attributes")
                .map(attribute_labels)
                .unwrap_or_default();
            samples.push(sample);
        }

        Some(samples)
    }
}

/// Prometheus text exposition: `name{k="v"} value [timestamp]`, with
/// `# TYPE` directives typing the samples that follow.
pub struct ExpositionLayout;

impl MetricsLayout for ExpositionLayout {
    fn name(&self) -> &'static str {
        "exposition"
    }

    fn parse(&self, record: &str, ctx: &mut LayoutContext) -> Option<Vec<MetricsSample>> {
        let line = record.trim();

        if line.starts_with('#') {
            if let Some(caps) = TYPE_DIRECTIVE.captures(line) {
                ctx.type_hints
                    .insert(caps["name"].to_string(), InstrumentKind::parse(&caps["kind"]));
            }
            return Some(Vec::new());
        }

        let caps = EXPOSITION_LINE.captures(line)?;
        let name = &caps["name"];
        let value: f64 = caps["value"].parse().ok()?;

        let mut sample = MetricsSample::new(name, value);
        if let Some(labels) = caps.name("labels") {
            sample.labels = EXPOSITION_LABEL
                .captures_iter(labels.as_str())
                .map(|c| (c[1].to_string(), c[2].to_string()))
                .collect();
        }
        sample.timestamp = caps
            .name("timestamp")
            .and_then(|ts| ts.as_str().parse::<f64>().ok())
            .and_then(epoch_timestamp);
        sample.instrument = base_name_hint(ctx, name);

        Some(vec![sample])
    }
}

/// Exposition suffixes that belong to a typed family
fn base_name_hint(ctx: &LayoutContext, name: &str) -> InstrumentKind {
    if let Some(kind) = ctx.type_hints.get(name) {
        return *kind;
    }
    ["_total", "_sum", "_count", "_bucket"]
        .iter()
        .filter_map(|suffix| name.strip_suffix(suffix))
        .find_map(|base| ctx.type_hints.get(base).copied())
        .unwrap_or_default()
}

fn str_of(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(String::from)
}

/// Numbers, including the string-encoded integers of OTLP JSON
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s).or_else(|| s.parse::<f64>().ok().and_then(epoch_timestamp)),
        other => number(other).and_then(epoch_timestamp),
    }
}

/// Epoch value in nanoseconds, milliseconds or seconds, judged by magnitude
pub fn epoch_timestamp(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    if raw > 1e18 {
        Some(DateTime::from_timestamp_nanos(raw as i64))
    } else if raw > 1e12 {
        DateTime::from_timestamp_millis(raw as i64)
    } else {
        let secs = raw.trunc() as i64;
        let nanos = ((raw - raw.trunc()) * 1e9) as u32;
        DateTime::from_timestamp(secs, nanos)
    }
}

/// `[seconds, nanoseconds]` pairs as printed by the JS SDK
fn hrtime(value: &Value) -> Option<DateTime<Utc>> {
    let parts = value.as_array()?;
    let secs = parts.first().and_then(number)? as i64;
    let nanos = parts.get(1).and_then(number).unwrap_or(0.0) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Attributes as a plain map or as OTLP `[{key, value: {stringValue}}]`
fn attribute_labels(value: &Value) -> BTreeMap<String, String> {
    let scalar = |v: &Value| match v {
        Value::String(s) => s.clone(),
        Value::Object(typed) => typed
            .values()
            .next()
            .map(|inner| match inner {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        other => other.to_string(),
    };

    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), scalar(v))).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let key = item.get("key")?.as_str()?;
                Some((key.to_string(), item.get("value").map(scalar).unwrap_or_default()))
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Rewrite a JS object literal (as printed by `util.inspect`) into JSON:
/// quote bare keys, convert single-quoted strings, drop trailing commas and
/// turn other bare identifiers (`undefined`, `[Array]`) into null.
fn object_literal_to_json(src: &str) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len() + src.len() / 4);
    let mut i = 0;

    let next_significant = |from: usize| chars[from..].iter().copied().find(|c| !c.is_whitespace());

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let quote = c;
                i += 1;
                out.push('"');
                while i < chars.len() && chars[i] != quote {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            match chars[i + 1] {
                                '\'' | '`' => out.push(chars[i + 1]),
                                other => {
                                    out.push('\\');
                                    out.push(other);
                                }
                            }
                            i += 1;
                        }
                        '"' => out.push_str("\\\""),
                        '\n' => out.push_str("\\n"),
                        other => out.push(other),
                    }
                    i += 1;
                }
                out.push('"');
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E' | '+' | '-')) {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if next_significant(i) == Some(':') {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else if matches!(ident.as_str(), "true" | "false" | "null") {
                    out.push_str(&ident);
                } else {
                    out.push_str("null");
                }
            }
            ',' => {
                if !matches!(next_significant(i + 1), Some('}') | Some(']')) {
                    out.push(',');
                }
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    out
}
