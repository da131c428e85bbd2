//! Data models module
//!
//! Contains the event model shared by every other module:
//! - Session, turn, message and tool-use records
//! - Metrics samples and session/metrics mappings
//! - Local resource snapshots and their aggregates

pub mod session;
pub mod turn;
pub mod metrics;
pub mod resource;

pub use metrics::{InstrumentKind, MetricsSample, SampleKind, SessionMetricsSummary, SessionOtelMapping};
pub use resource::{ResourceReading, ResourceSnapshot, ResourceSummary, StageUsage};
pub use session::{Session, SessionDetail, SessionFilter, SessionSummary};
pub use turn::{ContentBlock, Message, OrphanResult, Role, TokenUsage, ToolUse, Turn};
