//! Manual-control surface with safety interlocks
//!
//! The web/touch UI (out of scope here) drives valves and the pump through
//! [`ManualPanel`], which refuses any command whose prerequisites are not
//! met, before a single hardware command goes out. The engine does not
//! use this surface; its sequencing enforces the same invariants by
//! construction.
//!
//! Interlocks:
//! - SV1 opens only with a meter installed (DUT connected) **and** at
//!   least one test lane open.
//! - The pump starts only with reservoir level ≥ 70 % **and** an open
//!   flow path (SV1 or bypass).
//! - Closing the last open flow path while the pump runs stops the pump
//!   in the same transaction.
//!
//! [`DutGuard`] watches the snapshot stream and reacts to a DUT
//! disconnect while the main inlet is open: SV1 is closed immediately,
//! and the pump is stopped unless the bypass still provides a path.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::hardware::{BusError, ValveId};
use crate::pump::PumpController;
use crate::sensors::{SensorHub, SensorSnapshot};
use crate::valves::ValveController;

/// Reservoir level required to start the pump, %.
pub const PUMP_RESERVOIR_MIN_PCT: f64 = 70.0;

/// A command refused by an interlock, before any hardware was touched.
#[derive(Debug, thiserror::Error)]
pub enum InterlockViolation {
    #[error("cannot open SV1: no meter installed on the line")]
    DutNotConnected,
    #[error("cannot open SV1: no test lane open (open BV-L1/L2/L3 first)")]
    NoLaneOpen,
    #[error("cannot start pump: reservoir level {level_pct:.1}% below {PUMP_RESERVOIR_MIN_PCT}% minimum")]
    ReservoirLow { level_pct: f64 },
    #[error("cannot start pump: no flow path open (open SV1 or BV-BP first)")]
    NoFlowPath,
}

/// Manual-control failures.
#[derive(Debug, thiserror::Error)]
pub enum ManualControlError {
    #[error(transparent)]
    Interlock(#[from] InterlockViolation),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// The interlocked manual-control facade.
pub struct ManualPanel {
    hub: Arc<SensorHub>,
    valves: Arc<ValveController>,
    pump: Arc<PumpController>,
}

impl ManualPanel {
    pub fn new(
        hub: Arc<SensorHub>,
        valves: Arc<ValveController>,
        pump: Arc<PumpController>,
    ) -> Self {
        Self { hub, valves, pump }
    }

    /// Open a valve, enforcing the SV1 interlocks.
    pub async fn open_valve(&self, valve: ValveId) -> Result<(), ManualControlError> {
        if valve == ValveId::Sv1 {
            let snap = self.hub.latest();
            if !snap.dut_connected {
                return Err(InterlockViolation::DutNotConnected.into());
            }
            if !self.valves.any_lane_open().await {
                return Err(InterlockViolation::NoLaneOpen.into());
            }
        }
        self.valves.open(valve).await?;
        Ok(())
    }

    /// Close a valve. Closing the last open flow path stops a running
    /// pump in the same transaction.
    pub async fn close_valve(&self, valve: ValveId) -> Result<(), ManualControlError> {
        self.valves.close(valve).await?;

        if matches!(valve, ValveId::Sv1 | ValveId::BvBypass) {
            let snap = self.hub.latest();
            if snap.pump_running && !self.valves.flow_path_open().await {
                warn!("last flow path closed with pump running, stopping pump");
                self.pump.stop().await?;
            }
        }
        Ok(())
    }

    /// Start the pump, enforcing reservoir and flow-path interlocks.
    pub async fn start_pump(&self, frequency_hz: f64) -> Result<(), ManualControlError> {
        let snap = self.hub.latest();
        if snap.reservoir_level_pct < PUMP_RESERVOIR_MIN_PCT {
            return Err(InterlockViolation::ReservoirLow {
                level_pct: snap.reservoir_level_pct,
            }
            .into());
        }
        if !self.valves.flow_path_open().await {
            return Err(InterlockViolation::NoFlowPath.into());
        }
        self.pump.start(frequency_hz).await?;
        Ok(())
    }

    pub async fn stop_pump(&self) -> Result<(), ManualControlError> {
        self.pump.stop().await?;
        Ok(())
    }
}

/// Snapshot-driven guard: a DUT disconnect closes the main inlet.
pub struct DutGuard {
    task: JoinHandle<()>,
}

impl DutGuard {
    /// Spawn the guard on the hub's snapshot stream.
    pub fn spawn(
        hub: &SensorHub,
        valves: Arc<ValveController>,
        pump: Arc<PumpController>,
    ) -> Self {
        let mut rx: watch::Receiver<SensorSnapshot> = hub.subscribe();
        let task = tokio::spawn(async move {
            let mut was_connected = rx.borrow().dut_connected;
            while rx.changed().await.is_ok() {
                let (connected, pump_running) = {
                    let snap = rx.borrow();
                    (snap.dut_connected, snap.pump_running)
                };
                if was_connected && !connected {
                    if valves.state(ValveId::Sv1).await {
                        warn!("DUT disconnected with SV1 open, closing main inlet");
                        let _ = valves.close(ValveId::Sv1).await;
                        if pump_running && !valves.state(ValveId::BvBypass).await {
                            info!("no bypass path, stopping pump");
                            let _ = pump.stop().await;
                        }
                    }
                }
                was_connected = connected;
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::HardwareBackend;
    use crate::sensors::POLL_INTERVAL;
    use crate::sim::Simulator;
    use std::time::Duration;

    struct Bench {
        sim: Arc<Simulator>,
        hub: Arc<SensorHub>,
        valves: Arc<ValveController>,
        pump: Arc<PumpController>,
        panel: ManualPanel,
    }

    async fn bench() -> Bench {
        let sim = Arc::new(Simulator::new());
        sim.set_noise(false);
        let hub = SensorHub::new(sim.clone(), POLL_INTERVAL);
        let valves = ValveController::new(sim.clone());
        let pump = PumpController::new(sim.clone());
        let panel = ManualPanel::new(hub.clone(), valves.clone(), pump.clone());
        hub.start();
        tokio::time::advance(Duration::from_millis(450)).await;
        Bench {
            sim,
            hub,
            valves,
            pump,
            panel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sv1_requires_dut_connected() {
        let b = bench().await;
        b.valves.open(ValveId::BvL1).await.unwrap();
        let err = b.panel.open_valve(ValveId::Sv1).await.unwrap_err();
        assert!(matches!(
            err,
            ManualControlError::Interlock(InterlockViolation::DutNotConnected)
        ));
        assert!(!b.valves.state(ValveId::Sv1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sv1_requires_an_open_lane() {
        let b = bench().await;
        b.sim.connect_dut(1.0);
        tokio::time::advance(Duration::from_millis(250)).await;

        let err = b.panel.open_valve(ValveId::Sv1).await.unwrap_err();
        assert!(matches!(
            err,
            ManualControlError::Interlock(InterlockViolation::NoLaneOpen)
        ));

        b.valves.open(ValveId::BvL2).await.unwrap();
        b.panel.open_valve(ValveId::Sv1).await.unwrap();
        assert!(b.valves.state(ValveId::Sv1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn pump_requires_reservoir_and_flow_path() {
        let b = bench().await;
        b.sim.set_reservoir_level(60.0);
        tokio::time::advance(Duration::from_millis(250)).await;

        b.valves.open(ValveId::BvBypass).await.unwrap();
        let err = b.panel.start_pump(30.0).await.unwrap_err();
        assert!(matches!(
            err,
            ManualControlError::Interlock(InterlockViolation::ReservoirLow { .. })
        ));

        b.sim.set_reservoir_level(85.0);
        b.valves.close(ValveId::BvBypass).await.unwrap();
        tokio::time::advance(Duration::from_millis(250)).await;
        let err = b.panel.start_pump(30.0).await.unwrap_err();
        assert!(matches!(
            err,
            ManualControlError::Interlock(InterlockViolation::NoFlowPath)
        ));

        b.valves.open(ValveId::BvBypass).await.unwrap();
        b.panel.start_pump(30.0).await.unwrap();
        assert!(b.sim.with_state(|s| s.vfd_running));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_last_flow_path_stops_the_pump() {
        let b = bench().await;
        b.sim.set_reservoir_level(85.0);
        b.valves.open(ValveId::BvBypass).await.unwrap();
        tokio::time::advance(Duration::from_millis(250)).await;
        b.panel.start_pump(30.0).await.unwrap();
        tokio::time::advance(Duration::from_millis(450)).await;
        assert!(b.hub.latest().pump_running);

        // SV1 is closed; the bypass was the only path.
        b.panel.close_valve(ValveId::BvBypass).await.unwrap();
        assert!(!b.sim.with_state(|s| s.vfd_running));
    }

    #[tokio::test(start_paused = true)]
    async fn dut_disconnect_closes_sv1_and_stops_pump() {
        use crate::safety::{SafetyMonitor, SafetySettings};

        let b = bench().await;
        let _guard = DutGuard::spawn(&b.hub, b.valves.clone(), b.pump.clone());
        let safety = SafetyMonitor::new(SafetySettings::default(), b.hub.clone(), Arc::new(|| {}));
        safety.start();

        b.sim.connect_dut(1.0);
        tokio::time::advance(Duration::from_millis(250)).await;
        b.valves.open(ValveId::BvL1).await.unwrap();
        b.panel.open_valve(ValveId::Sv1).await.unwrap();
        b.panel.start_pump(25.0).await.unwrap();
        tokio::time::advance(Duration::from_millis(450)).await;
        assert!(b.hub.latest().pump_running);

        b.sim.disconnect_dut();
        // Next tick observes the disconnect; the guard then acts.
        tokio::time::advance(Duration::from_millis(450)).await;
        assert!(!b.valves.state(ValveId::Sv1).await);
        assert!(!b.sim.with_state(|s| s.vfd_running));
        assert!(!b.sim.valve_states().await.unwrap().is_open(ValveId::Sv1));

        // A disconnect is an operational event, not a fault: the watchdog
        // stays clear throughout.
        assert!(!safety.has_active_alarms());
        safety.stop();
    }
}
