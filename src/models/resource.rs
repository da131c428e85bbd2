//! Local resource usage models
//!
//! Point-in-time machine readings tied to a session, and their aggregates
//! per stage and per session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Machine counters at one instant. Network and disk values are running
/// totals; differences between readings give the traffic in between.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceReading {
    /// 0 to 100
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_available_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_percent: f64,
    /// Resident memory of the observed process
    pub process_memory_rss: u64,
    pub process_memory_vms: u64,
    pub network_bytes_sent: u64,
    pub network_bytes_recv: u64,
    pub network_packets_sent: u64,
    pub network_packets_recv: u64,
    /// Bytes the observed process read from and wrote to disk
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub stage_id: Option<String>,
    pub stage_name: Option<String>,
    #[serde(flatten)]
    pub reading: ResourceReading,
}

/// `b - a` for running totals; negative when a counter was reset
fn delta(a: u64, b: u64) -> i64 {
    b as i64 - a as i64
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Resource use over one stage of a session (a turn, a tool run, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageUsage {
    pub session_id: String,
    pub stage_id: String,
    pub stage_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub avg_cpu_percent: f64,
    pub max_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub max_memory_bytes: u64,
    /// Change from the first to the last snapshot
    pub memory_delta_bytes: i64,
    pub network_bytes_sent_delta: i64,
    pub network_bytes_recv_delta: i64,
    pub disk_read_bytes_delta: i64,
    pub disk_write_bytes_delta: i64,
    pub snapshot_count: u32,
}

impl StageUsage {
    /// Aggregate the snapshots taken during a stage, in capture order
    pub fn from_snapshots(
        session_id: &str,
        stage_id: &str,
        stage_name: &str,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        snapshots: &[ResourceSnapshot],
    ) -> Self {
        let readings: Vec<&ResourceReading> = snapshots.iter().map(|s| &s.reading).collect();

        let mut usage = Self {
            session_id: session_id.to_string(),
            stage_id: stage_id.to_string(),
            stage_name: stage_name.to_string(),
            start_time,
            end_time,
            avg_cpu_percent: mean(readings.iter().map(|r| r.cpu_percent)),
            max_cpu_percent: readings.iter().map(|r| r.cpu_percent).fold(0.0, f64::max),
            avg_memory_percent: mean(readings.iter().map(|r| r.memory_percent)),
            max_memory_bytes: readings.iter().map(|r| r.memory_used_bytes).max().unwrap_or(0),
            memory_delta_bytes: 0,
            network_bytes_sent_delta: 0,
            network_bytes_recv_delta: 0,
            disk_read_bytes_delta: 0,
            disk_write_bytes_delta: 0,
            snapshot_count: readings.len() as u32,
        };

        if let (Some(first), Some(last)) = (readings.first(), readings.last()) {
            usage.memory_delta_bytes = delta(first.memory_used_bytes, last.memory_used_bytes);
            usage.network_bytes_sent_delta = delta(first.network_bytes_sent, last.network_bytes_sent);
            usage.network_bytes_recv_delta = delta(first.network_bytes_recv, last.network_bytes_recv);
            usage.disk_read_bytes_delta = delta(first.disk_read_bytes, last.disk_read_bytes);
            usage.disk_write_bytes_delta = delta(first.disk_write_bytes, last.disk_write_bytes);
        }

        usage
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentRange {
    pub avg_percent: f64,
    pub max_percent: f64,
    pub min_percent: f64,
}

impl PercentRange {
    fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        Self {
            avg_percent: mean(values.iter().copied()),
            max_percent: values.iter().copied().fold(f64::MIN, f64::max),
            min_percent: values.iter().copied().fold(f64::MAX, f64::min),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySummary {
    #[serde(flatten)]
    pub percent: PercentRange,
    pub max_bytes: u64,
    pub delta_bytes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficSummary {
    pub bytes_sent: i64,
    pub bytes_recv: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskSummary {
    pub read_bytes: i64,
    pub write_bytes: i64,
}

/// Resource use over a whole session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub session_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub snapshot_count: u32,
    pub stage_count: u32,
    pub cpu: PercentRange,
    pub memory: MemorySummary,
    pub network: TrafficSummary,
    pub disk: DiskSummary,
}

impl ResourceSummary {
    /// Summarize a session's snapshots, given in capture order
    pub fn from_snapshots(session_id: &str, snapshots: &[ResourceSnapshot], stage_count: u32) -> Self {
        let mut summary = Self {
            session_id: session_id.to_string(),
            snapshot_count: snapshots.len() as u32,
            stage_count,
            ..Self::default()
        };
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return summary;
        };

        let cpu: Vec<f64> = snapshots.iter().map(|s| s.reading.cpu_percent).collect();
        let memory: Vec<f64> = snapshots.iter().map(|s| s.reading.memory_percent).collect();
        let (a, b) = (&first.reading, &last.reading);

        summary.start_time = Some(first.timestamp);
        summary.end_time = Some(last.timestamp);
        summary.duration_ms = (last.timestamp - first.timestamp).num_milliseconds();
        summary.cpu = PercentRange::from_values(&cpu);
        summary.memory = MemorySummary {
            percent: PercentRange::from_values(&memory),
            max_bytes: snapshots
                .iter()
                .map(|s| s.reading.memory_used_bytes)
                .max()
                .unwrap_or(0),
            delta_bytes: delta(a.memory_used_bytes, b.memory_used_bytes),
        };
        summary.network = TrafficSummary {
            bytes_sent: delta(a.network_bytes_sent, b.network_bytes_sent),
            bytes_recv: delta(a.network_bytes_recv, b.network_bytes_recv),
        };
        summary.disk = DiskSummary {
            read_bytes: delta(a.disk_read_bytes, b.disk_read_bytes),
            write_bytes: delta(a.disk_write_bytes, b.disk_write_bytes),
        };
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn snapshot(secs: i64, cpu: f64, memory_used: u64, recv: u64) -> ResourceSnapshot {
        ResourceSnapshot {
            session_id: "s1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs),
            stage_id: None,
            stage_name: None,
            reading: ResourceReading {
                cpu_percent: cpu,
                memory_used_bytes: memory_used,
                memory_total_bytes: 1000,
                memory_percent: memory_used as f64 / 10.0,
                network_bytes_recv: recv,
                ..ResourceReading::default()
            },
        }
    }

    #[test]
    fn test_stage_usage_aggregates() {
        let snaps = vec![snapshot(0, 10.0, 400, 1_000), snapshot(1, 30.0, 600, 1_500), snapshot(2, 20.0, 500, 4_000)];
        let usage = StageUsage::from_snapshots(
            "s1",
            "turn-1",
            "turn",
            snaps[0].timestamp,
            Some(snaps[2].timestamp),
            &snaps,
        );

        assert_eq!(usage.avg_cpu_percent, 20.0);
        assert_eq!(usage.max_cpu_percent, 30.0);
        assert_eq!(usage.max_memory_bytes, 600);
        assert_eq!(usage.memory_delta_bytes, 100);
        assert_eq!(usage.network_bytes_recv_delta, 3_000);
        assert_eq!(usage.snapshot_count, 3);
        assert_eq!(usage.duration_ms(), Some(2_000));
    }

    #[test]
    fn test_counter_reset_gives_negative_delta() {
        let snaps = vec![snapshot(0, 0.0, 500, 9_000), snapshot(1, 0.0, 300, 100)];
        let summary = ResourceSummary::from_snapshots("s1", &snaps, 0);
        assert_eq!(summary.network.bytes_recv, -8_900);
        assert_eq!(summary.memory.delta_bytes, -200);
    }

    #[test]
    fn test_session_summary() {
        let snaps = vec![snapshot(0, 10.0, 400, 0), snapshot(4, 50.0, 800, 10)];
        let summary = ResourceSummary::from_snapshots("s1", &snaps, 1);

        assert_eq!(summary.duration_ms, 4_000);
        assert_eq!(summary.cpu.avg_percent, 30.0);
        assert_eq!(summary.cpu.min_percent, 10.0);
        assert_eq!(summary.cpu.max_percent, 50.0);
        assert_eq!(summary.memory.percent.max_percent, 80.0);
        assert_eq!(summary.memory.max_bytes, 800);
        assert_eq!(summary.stage_count, 1);
    }

    #[test]
    fn test_empty_summary() {
        let summary = ResourceSummary::from_snapshots("s1", &[], 2);
        assert_eq!(summary.snapshot_count, 0);
        assert_eq!(summary.stage_count, 2);
        assert!(summary.start_time.is_none());
        assert_eq!(summary.cpu, PercentRange::default());
    }
}
