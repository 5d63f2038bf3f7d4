//! Persistence seam
//!
//! The storage layer proper (database, certificates, audit) is an external
//! collaborator; the engine only talks to the [`TestStore`] trait below
//! and treats every call as best-effort: a persistence failure is logged
//! and never aborts the physical run.
//!
//! [`MemoryStore`] is the in-process implementation used by the binaries
//! and the integration tests.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use crate::dut::ReadingKind;
use crate::report::{PointResult, RunStatus, RunSummary};
use crate::sensors::SensorSnapshot;
use crate::standards::QLabel;

/// What caused a sensor tick to be recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickTrigger {
    Periodic,
    Event,
}

/// Storage failures; surfaced to the engine but never escalated.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown run {0}")]
    UnknownRun(u64),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Hooks the engine drives during a run.
pub trait TestStore: Send + Sync {
    fn start_run(&self, run_id: u64) -> Result<(), StoreError>;
    fn update_state(&self, run_id: u64, q_point: Option<QLabel>, state_name: &str)
        -> Result<(), StoreError>;
    fn record_point(&self, run_id: u64, point: &PointResult) -> Result<(), StoreError>;
    fn record_sensor_tick(
        &self,
        run_id: u64,
        snapshot: &SensorSnapshot,
        q_point: Option<QLabel>,
        trigger: TickTrigger,
        label: &str,
    ) -> Result<(), StoreError>;
    fn record_manual_entry(
        &self,
        run_id: u64,
        q_point: Option<QLabel>,
        kind: ReadingKind,
        value: f64,
        entered_by: &str,
    ) -> Result<(), StoreError>;
    fn complete_run(&self, run_id: u64, summary: &RunSummary) -> Result<(), StoreError>;
    fn abort_run(&self, run_id: u64, reason: &str) -> Result<(), StoreError>;
    fn issue_certificate(&self, run_id: u64) -> Result<String, StoreError>;
}

/// One persisted sensor tick.
#[derive(Clone, Debug, Serialize)]
pub struct SensorTick {
    pub q_point: Option<QLabel>,
    pub trigger: TickTrigger,
    pub label: String,
    pub snapshot: SensorSnapshot,
}

/// One persisted manual DUT entry.
#[derive(Clone, Debug, Serialize)]
pub struct ManualEntry {
    pub q_point: Option<QLabel>,
    pub kind: ReadingKind,
    pub value: f64,
    pub entered_by: String,
}

/// Everything the in-memory store keeps per run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunRecord {
    pub status: Option<RunStatus>,
    pub current_q_point: Option<QLabel>,
    pub current_state: String,
    pub abort_reason: Option<String>,
    pub certificate_number: Option<String>,
    pub points: Vec<PointResult>,
    pub ticks: Vec<SensorTick>,
    pub manual_entries: Vec<ManualEntry>,
    pub summary: Option<RunSummary>,
}

/// In-process [`TestStore`].
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<u64, RunRecord>>,
    cert_counter: Mutex<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of a run's record, for inspection.
    pub fn run(&self, run_id: u64) -> Option<RunRecord> {
        self.runs.lock().unwrap().get(&run_id).cloned()
    }

    fn with_run<T>(
        &self,
        run_id: u64,
        f: impl FnOnce(&mut RunRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut runs = self.runs.lock().unwrap();
        let record = runs.get_mut(&run_id).ok_or(StoreError::UnknownRun(run_id))?;
        Ok(f(record))
    }
}

impl TestStore for MemoryStore {
    fn start_run(&self, run_id: u64) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().unwrap();
        let record = runs.entry(run_id).or_default();
        record.status = Some(RunStatus::Running);
        record.current_state = "PRE_CHECK".into();
        debug!(run_id, "run started");
        Ok(())
    }

    fn update_state(
        &self,
        run_id: u64,
        q_point: Option<QLabel>,
        state_name: &str,
    ) -> Result<(), StoreError> {
        self.with_run(run_id, |r| {
            r.current_q_point = q_point;
            r.current_state = state_name.to_string();
        })
    }

    fn record_point(&self, run_id: u64, point: &PointResult) -> Result<(), StoreError> {
        self.with_run(run_id, |r| {
            if let Some(slot) = r.points.iter_mut().find(|p| p.q_point == point.q_point) {
                *slot = point.clone();
            } else {
                r.points.push(point.clone());
            }
        })
    }

    fn record_sensor_tick(
        &self,
        run_id: u64,
        snapshot: &SensorSnapshot,
        q_point: Option<QLabel>,
        trigger: TickTrigger,
        label: &str,
    ) -> Result<(), StoreError> {
        self.with_run(run_id, |r| {
            r.ticks.push(SensorTick {
                q_point,
                trigger,
                label: label.to_string(),
                snapshot: snapshot.clone(),
            });
        })
    }

    fn record_manual_entry(
        &self,
        run_id: u64,
        q_point: Option<QLabel>,
        kind: ReadingKind,
        value: f64,
        entered_by: &str,
    ) -> Result<(), StoreError> {
        self.with_run(run_id, |r| {
            r.manual_entries.push(ManualEntry {
                q_point,
                kind,
                value,
                entered_by: entered_by.to_string(),
            });
        })
    }

    fn complete_run(&self, run_id: u64, summary: &RunSummary) -> Result<(), StoreError> {
        self.with_run(run_id, |r| {
            r.status = Some(RunStatus::Completed);
            r.current_state = "COMPLETE".into();
            r.summary = Some(summary.clone());
        })
    }

    fn abort_run(&self, run_id: u64, reason: &str) -> Result<(), StoreError> {
        self.with_run(run_id, |r| {
            r.status = Some(RunStatus::Aborted);
            r.current_state = "EMERGENCY_STOP".into();
            r.abort_reason = Some(reason.to_string());
        })
    }

    fn issue_certificate(&self, run_id: u64) -> Result<String, StoreError> {
        let number = {
            let mut counter = self.cert_counter.lock().unwrap();
            *counter += 1;
            format!(
                "CAL-{}-{:04}",
                chrono::Utc::now().format("%Y%m%d"),
                *counter
            )
        };
        self.with_run(run_id, |r| {
            r.certificate_number = Some(number.clone());
            if let Some(summary) = r.summary.as_mut() {
                summary.certificate_number = Some(number.clone());
            }
        })?;
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_and_certificate() {
        let store = MemoryStore::new();
        store.start_run(1).unwrap();
        store.update_state(1, Some(QLabel::Q1), "FLOW_STABILIZE").unwrap();

        let record = store.run(1).unwrap();
        assert_eq!(record.status, Some(RunStatus::Running));
        assert_eq!(record.current_q_point, Some(QLabel::Q1));
        assert_eq!(record.current_state, "FLOW_STABILIZE");

        let cert = store.issue_certificate(1).unwrap();
        assert!(cert.starts_with("CAL-"));
        assert!(cert.ends_with("-0001"));
        let second = store.issue_certificate(1).unwrap();
        assert!(second.ends_with("-0002"));
    }

    #[test]
    fn unknown_run_is_an_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update_state(9, None, "IDLE"),
            Err(StoreError::UnknownRun(9))
        ));
        assert!(store.abort_run(9, "x").is_err());
    }

    #[test]
    fn abort_records_reason() {
        let store = MemoryStore::new();
        store.start_run(2).unwrap();
        store.abort_run(2, "operator request").unwrap();
        let record = store.run(2).unwrap();
        assert_eq!(record.status, Some(RunStatus::Aborted));
        assert_eq!(record.current_state, "EMERGENCY_STOP");
        assert_eq!(record.abort_reason.as_deref(), Some("operator request"));
    }
}
