//! Metrics calculation module
//!
//! This module turns stored sessions into analytics:
//! - Per-session statistics, enriched from collected metrics
//! - Cross-session aggregates and comparisons
//! - Token breakdowns and timelines

pub mod stats;
pub mod timeline;
pub mod tokens;

use thiserror::Error;

use crate::db::DbError;

/// Metrics calculation errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Result type for metrics operations
pub type MetricsResult<T> = Result<T, MetricsError>;

/// `numerator / denominator`, or 0 when the denominator is 0
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
