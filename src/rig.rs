//! Bench rig: constructs and owns every hardware-facing service
//!
//! One [`Rig`] is built at startup from the [`BenchConfig`] and threaded
//! through call sites; there are no ambient globals. It selects the
//! backend (six serial bridges or the physics simulator), wires the
//! sensor hub, the actuator controllers, the PID loop, the gravimetric
//! and DUT engines, and the safety watchdog.
//!
//! The watchdog's hardware emergency-stop action is a closure over the
//! rig's own controllers, injected at construction; that function value
//! is what breaks the hardware ↔ safety reference cycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{BackendKind, BenchConfig, ConfigError};
use crate::dut::{DutInterface, DutMode};
use crate::gravimetric::GravimetricEngine;
use crate::hardware::{HardwareBackend, SerialBackend};
use crate::interlock::{DutGuard, ManualPanel};
use crate::pid::PidController;
use crate::pump::PumpController;
use crate::safety::SafetyMonitor;
use crate::sensors::SensorHub;
use crate::sim::Simulator;
use crate::tower::{LightPattern, TowerLight};
use crate::valves::ValveController;

/// The assembled bench control plane.
pub struct Rig {
    pub backend: Arc<dyn HardwareBackend>,
    /// Present only when the simulator backend is active; used by the
    /// binaries and tests for scenario control.
    pub simulator: Option<Arc<Simulator>>,
    pub hub: Arc<SensorHub>,
    pub valves: Arc<ValveController>,
    pub pump: Arc<PumpController>,
    pub tower: Arc<TowerLight>,
    pub pid: Arc<PidController>,
    pub safety: Arc<SafetyMonitor>,
    pub gravimetric: Arc<GravimetricEngine>,
    pub dut: Arc<DutInterface>,
    pub panel: ManualPanel,
    dut_guard: DutGuard,
}

impl Rig {
    /// Build the full rig from a validated configuration.
    pub async fn build(config: &BenchConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let (backend, simulator): (Arc<dyn HardwareBackend>, Option<Arc<Simulator>>) =
            match config.backend {
                BackendKind::Simulator => {
                    let sim = Arc::new(Simulator::new());
                    info!("hardware backend: simulator");
                    (sim.clone(), Some(sim))
                }
                BackendKind::Real => {
                    let serial = Arc::new(SerialBackend::new(
                        &config.bridge_ports,
                        config.bridge_baud,
                    ));
                    serial.connect_all().await;
                    info!("hardware backend: serial bridges");
                    (serial, None)
                }
            };

        let hub = SensorHub::new(
            backend.clone(),
            Duration::from_millis(config.poll_interval_ms),
        );
        let valves = ValveController::new(backend.clone());
        let pump = PumpController::new(backend.clone());
        let tower = TowerLight::new(backend.clone());
        let pid = Arc::new(PidController::new(config.pid_settings()));
        let gravimetric = GravimetricEngine::new(hub.clone(), valves.clone(), backend.clone());
        let dut = DutInterface::new(backend.clone(), DutMode::FieldBus);
        let panel = ManualPanel::new(hub.clone(), valves.clone(), pump.clone());
        let dut_guard = DutGuard::spawn(&hub, valves.clone(), pump.clone());

        // The watchdog's emergency-stop action closes over the actuator
        // controllers, never the rig itself.
        let estop_pid = pid.clone();
        let estop_pump = pump.clone();
        let estop_valves = valves.clone();
        let estop_tower = tower.clone();
        let safety = SafetyMonitor::new(
            config.safety,
            hub.clone(),
            Arc::new(move || {
                let pid = estop_pid.clone();
                let pump = estop_pump.clone();
                let valves = estop_valves.clone();
                let tower = estop_tower.clone();
                tokio::spawn(async move {
                    pid.disable();
                    if let Err(e) = pump.emergency_stop().await {
                        warn!(error = %e, "emergency pump stop failed");
                    }
                    if let Err(e) = valves.close_all().await {
                        warn!(error = %e, "emergency valve close failed");
                    }
                    let _ = tower.set(LightPattern::Estop).await;
                });
            }),
        );

        Ok(Arc::new(Self {
            backend,
            simulator,
            hub,
            valves,
            pump,
            tower,
            pid,
            safety,
            gravimetric,
            dut,
            panel,
            dut_guard,
        }))
    }

    /// Start the periodic services and show READY.
    pub async fn start(&self) {
        self.hub.start();
        self.safety.start();
        let _ = self.tower.set(LightPattern::Ready).await;
        info!("bench rig started");
    }

    /// Engine-path emergency stop: runs to completion in the caller's
    /// task.
    pub async fn emergency_stop(&self) {
        self.pid.disable();
        if let Err(e) = self.pump.emergency_stop().await {
            warn!(error = %e, "pump emergency stop failed");
        }
        if let Err(e) = self.valves.close_all().await {
            warn!(error = %e, "valve close_all failed");
        }
        let _ = self.tower.set(LightPattern::Estop).await;
        warn!("rig emergency stop executed");
    }

    /// Orderly shutdown of every service.
    pub async fn shutdown(&self) {
        self.safety.stop();
        self.hub.stop();
        self.dut_guard.stop();
        self.pid.disable();
        let _ = self.pump.stop().await;
        let _ = self.valves.close_all().await;
        self.tower.stop().await;
        info!("bench rig shut down");
    }
}
