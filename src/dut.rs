//! Device-under-test interface
//!
//! Reads the meter being calibrated in one of two modes:
//!
//! - **FieldBus**: the DUT answers on the meter bridge (address 20,
//!   register 0, two words); `read_before`/`read_after` fetch the
//!   totalizer directly and a failed read parks the interface in ERROR.
//! - **Manual**: the DUT has no bus interface; `read_before`/`read_after`
//!   only move the state to WAITING_BEFORE / WAITING_AFTER and the test
//!   engine blocks until the operator submits the reading it can see on
//!   the meter's register.
//!
//! The DUT volume for a point is always `max(0, after − before)`.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::hardware::{BusChannel, HardwareBackend, DUT_ADDR};

/// How DUT readings are obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutMode {
    FieldBus,
    Manual,
}

/// Interface state across one Q-point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DutState {
    Idle,
    WaitingBefore,
    Measuring,
    WaitingAfter,
    Complete,
    Error,
}

/// Which of the two readings is being taken or submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    Before,
    After,
}

impl ReadingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingKind::Before => "before",
            ReadingKind::After => "after",
        }
    }
}

/// A before/after totalizer pair for one Q-point.
#[derive(Clone, Copy, Debug, Default)]
pub struct DutReading {
    pub before_l: f64,
    pub after_l: f64,
    pub volume_l: f64,
    pub timestamp_before: f64,
    pub timestamp_after: f64,
}

impl DutReading {
    pub fn is_valid(&self) -> bool {
        self.after_l >= self.before_l && self.timestamp_after > 0.0
    }
}

/// Rejected manual submissions.
#[derive(Debug, thiserror::Error)]
pub enum DutSubmitError {
    #[error("reading must be non-negative, got {0}")]
    Negative(f64),
    #[error("after reading {after} is below before reading {before}")]
    AfterBelowBefore { before: f64, after: f64 },
    #[error("no manual reading expected in field-bus mode")]
    NotManual,
}

struct DutSlots {
    state: DutState,
    before: f64,
    after: f64,
    t_before: f64,
    t_after: f64,
}

/// The DUT interface. One per bench.
pub struct DutInterface {
    backend: Arc<dyn HardwareBackend>,
    mode: Mutex<DutMode>,
    slots: Mutex<DutSlots>,
}

impl DutInterface {
    pub fn new(backend: Arc<dyn HardwareBackend>, mode: DutMode) -> Arc<Self> {
        Arc::new(Self {
            backend,
            mode: Mutex::new(mode),
            slots: Mutex::new(DutSlots {
                state: DutState::Idle,
                before: 0.0,
                after: 0.0,
                t_before: 0.0,
                t_after: 0.0,
            }),
        })
    }

    pub fn mode(&self) -> DutMode {
        *self.mode.lock().unwrap()
    }

    /// Switch modes; clears any partial readings.
    pub fn set_mode(&self, mode: DutMode) {
        *self.mode.lock().unwrap() = mode;
        self.reset();
        info!(?mode, "DUT mode set");
    }

    pub fn state(&self) -> DutState {
        self.slots.lock().unwrap().state
    }

    // -------------------------------------------------------------------------------------------
    // Field-bus reads
    // -------------------------------------------------------------------------------------------

    /// Whether the DUT answers on the field bus.
    pub async fn is_connected(&self) -> bool {
        if self.mode() != DutMode::FieldBus {
            return false;
        }
        self.read_totalizer().await.is_some()
    }

    async fn read_totalizer(&self) -> Option<f64> {
        match self
            .backend
            .mb_read(BusChannel::Meter, DUT_ADDR, 0, 2)
            .await
        {
            Ok(values) => values.first().copied(),
            Err(e) => {
                warn!(error = %e, "DUT totalizer read failed");
                None
            }
        }
    }

    /// Take the "before" reading.
    ///
    /// Field-bus mode returns the totalizer (or `None` on failure, with
    /// the state parked in ERROR). Manual mode returns `None` and moves to
    /// WAITING_BEFORE; the engine then waits on [`DutInterface::submit`].
    pub async fn read_before(&self) -> Option<f64> {
        match self.mode() {
            DutMode::FieldBus => match self.read_totalizer().await {
                Some(value) => {
                    let mut slots = self.slots.lock().unwrap();
                    slots.before = value;
                    slots.t_before = now_unix();
                    slots.state = DutState::Measuring;
                    info!(before_l = value, "DUT before reading");
                    Some(value)
                }
                None => {
                    self.slots.lock().unwrap().state = DutState::Error;
                    None
                }
            },
            DutMode::Manual => {
                self.slots.lock().unwrap().state = DutState::WaitingBefore;
                info!("DUT waiting for manual BEFORE entry");
                None
            }
        }
    }

    /// Take the "after" reading; same contract as [`read_before`].
    pub async fn read_after(&self) -> Option<f64> {
        match self.mode() {
            DutMode::FieldBus => match self.read_totalizer().await {
                Some(value) => {
                    let mut slots = self.slots.lock().unwrap();
                    slots.after = value;
                    slots.t_after = now_unix();
                    slots.state = DutState::Complete;
                    info!(
                        after_l = value,
                        volume_l = slots.after - slots.before,
                        "DUT after reading"
                    );
                    Some(value)
                }
                None => {
                    self.slots.lock().unwrap().state = DutState::Error;
                    None
                }
            },
            DutMode::Manual => {
                self.slots.lock().unwrap().state = DutState::WaitingAfter;
                info!("DUT waiting for manual AFTER entry");
                None
            }
        }
    }

    // -------------------------------------------------------------------------------------------
    // Manual entry
    // -------------------------------------------------------------------------------------------

    /// Record an operator-entered reading. Enforces `after ≥ before ≥ 0`.
    pub fn submit(&self, kind: ReadingKind, value: f64) -> Result<(), DutSubmitError> {
        if self.mode() != DutMode::Manual {
            return Err(DutSubmitError::NotManual);
        }
        if value < 0.0 {
            return Err(DutSubmitError::Negative(value));
        }
        let mut slots = self.slots.lock().unwrap();
        match kind {
            ReadingKind::Before => {
                slots.before = value;
                slots.t_before = now_unix();
                slots.state = DutState::Measuring;
                info!(before_l = value, "DUT manual before");
            }
            ReadingKind::After => {
                if value < slots.before {
                    return Err(DutSubmitError::AfterBelowBefore {
                        before: slots.before,
                        after: value,
                    });
                }
                slots.after = value;
                slots.t_after = now_unix();
                slots.state = DutState::Complete;
                info!(
                    after_l = value,
                    volume_l = slots.after - slots.before,
                    "DUT manual after"
                );
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------------------------

    pub fn reading(&self) -> DutReading {
        let slots = self.slots.lock().unwrap();
        DutReading {
            before_l: slots.before,
            after_l: slots.after,
            volume_l: (slots.after - slots.before).max(0.0),
            timestamp_before: slots.t_before,
            timestamp_after: slots.t_after,
        }
    }

    /// DUT volume for the point: `max(0, after − before)`.
    pub fn volume_l(&self) -> f64 {
        let slots = self.slots.lock().unwrap();
        (slots.after - slots.before).max(0.0)
    }

    /// Clear readings for the next Q-point.
    pub fn reset(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.state = DutState::Idle;
        slots.before = 0.0;
        slots.after = 0.0;
        slots.t_before = 0.0;
        slots.t_after = 0.0;
    }
}

fn now_unix() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulator;

    #[tokio::test]
    async fn field_bus_reads_track_the_totalizer() {
        let sim = Arc::new(Simulator::new());
        sim.set_noise(false);
        sim.connect_dut(1.5);
        let dut = DutInterface::new(sim.clone(), DutMode::FieldBus);
        assert!(dut.is_connected().await);

        let before = dut.read_before().await.unwrap();
        assert_eq!(dut.state(), DutState::Measuring);

        sim.with_state(|s| s.dut_totalizer += 2.5);
        let after = dut.read_after().await.unwrap();
        assert_eq!(dut.state(), DutState::Complete);
        assert!((after - before - 2.5).abs() < 1e-9);
        assert!((dut.volume_l() - 2.5).abs() < 1e-9);
        assert!(dut.reading().is_valid());
    }

    #[tokio::test]
    async fn disconnected_dut_fails_to_error_state() {
        let sim = Arc::new(Simulator::new());
        let dut = DutInterface::new(sim, DutMode::FieldBus);
        assert!(!dut.is_connected().await);
        assert!(dut.read_before().await.is_none());
        assert_eq!(dut.state(), DutState::Error);
    }

    #[tokio::test]
    async fn manual_mode_waits_then_accepts_submissions() {
        let sim = Arc::new(Simulator::new());
        let dut = DutInterface::new(sim, DutMode::Manual);

        assert!(dut.read_before().await.is_none());
        assert_eq!(dut.state(), DutState::WaitingBefore);
        dut.submit(ReadingKind::Before, 1234.5).unwrap();
        assert_eq!(dut.state(), DutState::Measuring);

        assert!(dut.read_after().await.is_none());
        assert_eq!(dut.state(), DutState::WaitingAfter);
        dut.submit(ReadingKind::After, 1236.0).unwrap();
        assert_eq!(dut.state(), DutState::Complete);
        assert!((dut.volume_l() - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn manual_validation_rules() {
        let sim = Arc::new(Simulator::new());
        let dut = DutInterface::new(sim, DutMode::Manual);

        assert!(matches!(
            dut.submit(ReadingKind::Before, -1.0),
            Err(DutSubmitError::Negative(_))
        ));
        dut.submit(ReadingKind::Before, 100.0).unwrap();
        assert!(matches!(
            dut.submit(ReadingKind::After, 99.0),
            Err(DutSubmitError::AfterBelowBefore { .. })
        ));
        dut.submit(ReadingKind::After, 100.0).unwrap();

        // Field-bus mode rejects manual entries outright.
        dut.set_mode(DutMode::FieldBus);
        assert!(matches!(
            dut.submit(ReadingKind::Before, 1.0),
            Err(DutSubmitError::NotManual)
        ));
    }

    #[tokio::test]
    async fn reset_clears_partial_readings() {
        let sim = Arc::new(Simulator::new());
        let dut = DutInterface::new(sim, DutMode::Manual);
        dut.submit(ReadingKind::Before, 50.0).unwrap();
        dut.reset();
        assert_eq!(dut.state(), DutState::Idle);
        assert_eq!(dut.volume_l(), 0.0);
        assert!(!dut.reading().is_valid());
    }
}
