//! Local resource monitoring
//!
//! Samples machine resources while a session runs and files each snapshot
//! under the session and its current stage. Stages are opened and closed
//! explicitly; the watch loop opens one per transcript turn.

pub mod system;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::{queries, Database, DbError};
use crate::models::{ResourceReading, ResourceSnapshot, ResourceSummary, StageUsage};

pub use system::SystemSampler;

/// Source of machine readings
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> ResourceReading;
}

/// Request to open a stage; the open stage, if any, is closed first
#[derive(Debug, Clone, PartialEq)]
pub struct StageStart {
    pub stage_id: String,
    pub stage_name: String,
}

impl StageStart {
    pub fn turn(turn_number: u32) -> Self {
        Self {
            stage_id: format!("turn-{}", turn_number),
            stage_name: "turn".to_string(),
        }
    }
}

struct OpenStage {
    stage_name: String,
    start_time: DateTime<Utc>,
    snapshots: Vec<ResourceSnapshot>,
}

/// Counters of a finished monitoring run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorSummary {
    pub snapshots: u64,
    pub stages: u64,
    pub failures: u64,
}

/// Captures snapshots for one session and stores them in a [`Database`]
pub struct ResourceMonitor<'a, S: ResourceSampler> {
    db: &'a Database,
    session_id: String,
    sampler: S,
    snapshots: Vec<ResourceSnapshot>,
    open: BTreeMap<String, OpenStage>,
    closed: Vec<StageUsage>,
    current_stage: Option<String>,
}

impl<'a, S: ResourceSampler> ResourceMonitor<'a, S> {
    pub fn new(db: &'a Database, session_id: &str, sampler: S) -> Self {
        Self {
            db,
            session_id: session_id.to_string(),
            sampler,
            snapshots: Vec::new(),
            open: BTreeMap::new(),
            closed: Vec::new(),
            current_stage: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn current_stage(&self) -> Option<&str> {
        self.current_stage.as_deref()
    }

    /// Take a reading, attribute it to the current stage and store it
    pub fn capture_snapshot(&mut self) -> Result<ResourceSnapshot, DbError> {
        let stage = self
            .current_stage
            .as_ref()
            .and_then(|id| self.open.get(id).map(|open| (id.clone(), open.stage_name.clone())));

        let snapshot = ResourceSnapshot {
            session_id: self.session_id.clone(),
            timestamp: Utc::now(),
            stage_id: stage.as_ref().map(|(id, _)| id.clone()),
            stage_name: stage.map(|(_, name)| name),
            reading: self.sampler.sample(),
        };

        self.db
            .with_connection(|conn| queries::insert_resource_snapshot(conn, &snapshot))?;

        if let Some(open) = snapshot.stage_id.as_ref().and_then(|id| self.open.get_mut(id)) {
            open.snapshots.push(snapshot.clone());
        }
        self.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    /// Open a stage and take its first snapshot, closing the current one
    pub fn start_stage(&mut self, stage_id: &str, stage_name: &str) -> Result<(), DbError> {
        if let Some(current) = self.current_stage.clone() {
            if current == stage_id {
                return Ok(());
            }
            self.end_stage(&current)?;
        }

        tracing::debug!("Stage {} ({}) started for {}", stage_id, stage_name, self.session_id);
        self.open.insert(
            stage_id.to_string(),
            OpenStage {
                stage_name: stage_name.to_string(),
                start_time: Utc::now(),
                snapshots: Vec::new(),
            },
        );
        self.current_stage = Some(stage_id.to_string());
        self.capture_snapshot()?;
        Ok(())
    }

    /// Take a final snapshot of a stage, then aggregate and store it.
    /// `None` when no such stage is open.
    pub fn end_stage(&mut self, stage_id: &str) -> Result<Option<StageUsage>, DbError> {
        if !self.open.contains_key(stage_id) {
            return Ok(None);
        }
        let previous = self.current_stage.replace(stage_id.to_string());
        self.capture_snapshot()?;
        self.current_stage = previous.filter(|id| id != stage_id);

        let Some(open) = self.open.remove(stage_id) else {
            return Ok(None);
        };
        let usage = StageUsage::from_snapshots(
            &self.session_id,
            stage_id,
            &open.stage_name,
            open.start_time,
            Some(Utc::now()),
            &open.snapshots,
        );
        self.db
            .with_connection(|conn| queries::upsert_stage_usage(conn, &usage))?;

        self.closed.push(usage.clone());
        Ok(Some(usage))
    }

    /// Close every open stage
    pub fn end_all_stages(&mut self) -> Result<Vec<StageUsage>, DbError> {
        let ids: Vec<String> = self.open.keys().cloned().collect();
        let mut ended = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(usage) = self.end_stage(&id)? {
                ended.push(usage);
            }
        }
        Ok(ended)
    }

    pub fn snapshots(&self) -> &[ResourceSnapshot] {
        &self.snapshots
    }

    /// Stages closed so far
    pub fn stages(&self) -> &[StageUsage] {
        &self.closed
    }

    /// Summary of what this monitor captured
    pub fn summary(&self) -> ResourceSummary {
        let stage_count = (self.closed.len() + self.open.len()) as u32;
        ResourceSummary::from_snapshots(&self.session_id, &self.snapshots, stage_count)
    }

    /// Capture every `interval` until `cancel` fires, switching stages as
    /// requests arrive on `stages`. Open stages are closed on the way out.
    pub async fn run(
        &mut self,
        interval: Duration,
        cancel: CancellationToken,
        mut stages: mpsc::UnboundedReceiver<StageStart>,
    ) -> MonitorSummary {
        let mut summary = MonitorSummary::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut accepting = true;

        tracing::info!("Monitoring resources for {} every {:?}", self.session_id, interval);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    match self.capture_snapshot() {
                        Ok(_) => summary.snapshots += 1,
                        Err(e) => {
                            summary.failures += 1;
                            tracing::warn!("Resource snapshot for {} failed: {}", self.session_id, e);
                        }
                    }
                }
                request = stages.recv(), if accepting => match request {
                    Some(stage) => {
                        summary.stages += 1;
                        if let Err(e) = self.start_stage(&stage.stage_id, &stage.stage_name) {
                            summary.failures += 1;
                            tracing::warn!("Could not start stage {}: {}", stage.stage_id, e);
                        }
                    }
                    None => accepting = false,
                },
                _ = cancel.cancelled() => break,
            }
        }

        if let Err(e) = self.end_all_stages() {
            summary.failures += 1;
            tracing::warn!("Could not close stages of {}: {}", self.session_id, e);
        }

        tracing::info!(
            "Stopped monitoring {} after {} snapshots",
            self.session_id,
            summary.snapshots
        );
        summary
    }
}

/// Stored resource summary of a session; `None` when nothing was captured
pub fn session_resource_summary(db: &Database, session_id: &str) -> Result<Option<ResourceSummary>, DbError> {
    db.with_connection(|conn| {
        let snapshots = queries::get_resource_snapshots(conn, session_id)?;
        if snapshots.is_empty() {
            return Ok(None);
        }
        let stage_count = queries::get_stage_usage(conn, session_id)?.len() as u32;
        Ok(Some(ResourceSummary::from_snapshots(session_id, &snapshots, stage_count)))
    })
}
