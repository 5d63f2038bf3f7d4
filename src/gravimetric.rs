//! Gravimetric measurement engine
//!
//! Determines a delivered water volume by weighing the collected water and
//! dividing by temperature-corrected density:
//!
//! ```text
//! tare → divert to COLLECT → collect → divert to BYPASS → settle →
//! read weight + temperature → volume = net_mass / density(T)
//! ```
//!
//! State machine: IDLE → TARING → IDLE → COLLECTING → SETTLING → READING →
//! COMPLETE, with ERROR reachable from any step. The settle pause lets
//! free-falling water finish entering the tank before the scale is read.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::hardware::{BusError, DiverterPos, HardwareBackend};
use crate::sensors::SensorHub;
use crate::standards::water_density;
use crate::valves::ValveController;

/// Scale must read within ±20 g of zero after a tare.
pub const TARE_TOLERANCE_KG: f64 = 0.020;
/// Default wait for the scale to settle during tare.
pub const TARE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default settle pause after the diverter closes.
pub const SETTLE_TIME: Duration = Duration::from_secs(2);
/// Default drain window.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
/// Tank counts as empty below this tared weight.
pub const DRAIN_THRESHOLD_KG: f64 = 0.1;

/// Where the engine is in the measurement cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeasureState {
    Idle,
    Taring,
    Collecting,
    Settling,
    Reading,
    Complete,
    Error,
}

/// One completed gravimetric measurement.
#[derive(Clone, Copy, Debug)]
pub struct Measurement {
    pub net_mass_kg: f64,
    pub gross_weight_kg: f64,
    pub temperature_c: f64,
    pub density_kg_per_l: f64,
    pub volume_l: f64,
    pub collect_time_s: f64,
    pub avg_flow_lph: f64,
}

/// Gravimetric failures.
#[derive(Debug, thiserror::Error)]
pub enum GravimetricError {
    #[error("no sensor data available")]
    NoSensorData,
    #[error("tare timeout: scale reads {reading_kg:.3} kg, tolerance ±{TARE_TOLERANCE_KG} kg")]
    TareTimeout { reading_kg: f64 },
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Static helper: density-corrected volume from a net mass.
pub fn volume_from_mass(net_mass_kg: f64, temperature_c: f64) -> (f64, f64) {
    let density = water_density(temperature_c);
    let volume = if density > 0.0 { net_mass_kg / density } else { 0.0 };
    (volume, density)
}

struct Cycle {
    state: MeasureState,
    tare_offset_kg: f64,
    collect_start: Option<Instant>,
    totalizer_start_l: f64,
}

/// The measurement engine. One per bench.
pub struct GravimetricEngine {
    hub: Arc<SensorHub>,
    valves: Arc<ValveController>,
    backend: Arc<dyn HardwareBackend>,
    cycle: Mutex<Cycle>,
}

impl GravimetricEngine {
    pub fn new(
        hub: Arc<SensorHub>,
        valves: Arc<ValveController>,
        backend: Arc<dyn HardwareBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            valves,
            backend,
            cycle: Mutex::new(Cycle {
                state: MeasureState::Idle,
                tare_offset_kg: 0.0,
                collect_start: None,
                totalizer_start_l: 0.0,
            }),
        })
    }

    pub fn state(&self) -> MeasureState {
        self.cycle.lock().unwrap().state
    }

    fn set_state(&self, state: MeasureState) {
        self.cycle.lock().unwrap().state = state;
    }

    // -------------------------------------------------------------------------------------------
    // Tare
    // -------------------------------------------------------------------------------------------

    /// Zero the scale: divert to BYPASS, command a tare, then poll until
    /// the tared reading sits inside ±20 g or the timeout lapses.
    pub async fn tare(&self, timeout: Duration) -> Result<(), GravimetricError> {
        self.set_state(MeasureState::Taring);
        info!("gravimetric: taring scale");

        self.valves.set_diverter(DiverterPos::Bypass).await?;
        if let Err(e) = self.backend.scale_tare().await {
            self.set_state(MeasureState::Error);
            return Err(e.into());
        }

        let deadline = Instant::now() + timeout;
        loop {
            let snap = self.hub.latest();
            if snap.timestamp == 0.0 {
                self.set_state(MeasureState::Error);
                return Err(GravimetricError::NoSensorData);
            }
            if snap.weight_kg.abs() <= TARE_TOLERANCE_KG {
                let mut cycle = self.cycle.lock().unwrap();
                cycle.tare_offset_kg = snap.weight_raw_kg;
                cycle.state = MeasureState::Idle;
                info!(
                    offset_kg = cycle.tare_offset_kg,
                    reading_kg = snap.weight_kg,
                    "tare complete"
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.set_state(MeasureState::Error);
                warn!(reading_kg = snap.weight_kg, "tare timeout");
                return Err(GravimetricError::TareTimeout {
                    reading_kg: snap.weight_kg,
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // -------------------------------------------------------------------------------------------
    // Collection
    // -------------------------------------------------------------------------------------------

    /// Divert to COLLECT and mark the start time and reference totalizer.
    pub async fn start_collection(&self) -> Result<(), GravimetricError> {
        self.valves.set_diverter(DiverterPos::Collect).await?;
        let snap = self.hub.latest();
        let mut cycle = self.cycle.lock().unwrap();
        cycle.collect_start = Some(Instant::now());
        cycle.totalizer_start_l = snap.em_totalizer_l;
        cycle.state = MeasureState::Collecting;
        info!("gravimetric: collection started");
        Ok(())
    }

    /// End collection and measure: divert to BYPASS, settle, read the
    /// scale and temperature, density-correct to litres.
    pub async fn stop_and_measure(
        &self,
        settle: Duration,
    ) -> Result<Measurement, GravimetricError> {
        self.set_state(MeasureState::Settling);
        self.valves.set_diverter(DiverterPos::Bypass).await?;

        let collect_time_s = {
            let cycle = self.cycle.lock().unwrap();
            cycle
                .collect_start
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0)
        };
        info!(collect_time_s, "collection stopped, settling");
        tokio::time::sleep(settle).await;

        self.set_state(MeasureState::Reading);
        let snap = self.hub.latest();
        if snap.timestamp == 0.0 {
            self.set_state(MeasureState::Error);
            return Err(GravimetricError::NoSensorData);
        }

        let (volume_l, density) = volume_from_mass(snap.weight_kg, snap.water_temp_c);
        let avg_flow_lph = if collect_time_s > 0.0 {
            volume_l / collect_time_s * 3600.0
        } else {
            0.0
        };

        let measurement = Measurement {
            net_mass_kg: snap.weight_kg,
            gross_weight_kg: snap.weight_raw_kg,
            temperature_c: snap.water_temp_c,
            density_kg_per_l: density,
            volume_l,
            collect_time_s,
            avg_flow_lph,
        };
        self.set_state(MeasureState::Complete);
        info!(
            net_mass_kg = measurement.net_mass_kg,
            temperature_c = measurement.temperature_c,
            density = measurement.density_kg_per_l,
            volume_l = measurement.volume_l,
            "gravimetric measurement"
        );
        Ok(measurement)
    }

    // -------------------------------------------------------------------------------------------
    // Drain
    // -------------------------------------------------------------------------------------------

    /// Empty the collection tank back to the reservoir.
    ///
    /// Opens the drain valve until the tared weight drops under
    /// `threshold_kg`. A timeout is non-fatal: the valve is closed and
    /// `false` returned.
    pub async fn drain(&self, timeout: Duration, threshold_kg: f64) -> Result<bool, BusError> {
        info!("gravimetric: draining collection tank");
        self.valves.open(crate::hardware::ValveId::SvDrain).await?;

        let deadline = Instant::now() + timeout;
        let drained = loop {
            let snap = self.hub.latest();
            if snap.weight_kg <= threshold_kg {
                break true;
            }
            if Instant::now() >= deadline {
                warn!(weight_kg = snap.weight_kg, "drain timeout");
                break false;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        };

        self.valves.close(crate::hardware::ValveId::SvDrain).await?;
        if drained {
            info!("tank drained");
        }
        Ok(drained)
    }

    /// Back to IDLE for the next Q-point.
    pub fn reset(&self) {
        let mut cycle = self.cycle.lock().unwrap();
        cycle.state = MeasureState::Idle;
        cycle.tare_offset_kg = 0.0;
        cycle.collect_start = None;
        cycle.totalizer_start_l = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::ValveId;
    use crate::sensors::{SensorHub, POLL_INTERVAL};
    use crate::sim::Simulator;

    fn rig() -> (Arc<Simulator>, Arc<SensorHub>, Arc<ValveController>, Arc<GravimetricEngine>) {
        let sim = Arc::new(Simulator::new());
        sim.set_noise(false);
        let hub = SensorHub::new(sim.clone(), POLL_INTERVAL);
        let valves = ValveController::new(sim.clone());
        let grav = GravimetricEngine::new(hub.clone(), valves.clone(), sim.clone());
        (sim, hub, valves, grav)
    }

    #[test]
    fn volume_from_mass_density_correction() {
        let (volume, density) = volume_from_mass(9.982, 20.0);
        assert!((density - 0.99820).abs() < 1e-9);
        assert!((volume - 10.0).abs() < 1e-3);

        // Warmer water is less dense, so the same mass is more volume.
        let (v_warm, _) = volume_from_mass(9.982, 35.0);
        assert!(v_warm > volume);
    }

    #[tokio::test(start_paused = true)]
    async fn tare_settles_within_tolerance() {
        let (_sim, hub, _valves, grav) = rig();
        hub.start();
        tokio::time::advance(Duration::from_millis(450)).await;

        grav.tare(TARE_TIMEOUT).await.unwrap();
        assert_eq!(grav.state(), MeasureState::Idle);
        let snap = hub.latest();
        assert!(snap.weight_kg.abs() <= TARE_TOLERANCE_KG);
    }

    #[tokio::test(start_paused = true)]
    async fn tare_command_failure_is_an_error() {
        let (sim, hub, _valves, grav) = rig();
        hub.start();
        tokio::time::advance(Duration::from_millis(450)).await;

        sim.inject_tare_failures(1);
        let err = grav.tare(TARE_TIMEOUT).await;
        assert!(err.is_err());
        assert_eq!(grav.state(), MeasureState::Error);

        grav.reset();
        grav.tare(TARE_TIMEOUT).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn collect_measure_drain_cycle() {
        let (sim, hub, valves, grav) = rig();
        hub.start();
        tokio::time::advance(Duration::from_millis(450)).await;

        // Establish flow through lane 3 at ~1000 L/h.
        valves.open(ValveId::Sv1).await.unwrap();
        valves.open(ValveId::BvL3).await.unwrap();
        sim.with_state(|s| s.vfd_run(20.0));
        tokio::time::advance(Duration::from_secs(10)).await;

        grav.tare(TARE_TIMEOUT).await.unwrap();
        grav.start_collection().await.unwrap();
        assert_eq!(grav.state(), MeasureState::Collecting);

        // ~2 L at 1000 L/h.
        tokio::time::advance(Duration::from_secs(8)).await;
        let m = grav.stop_and_measure(SETTLE_TIME).await.unwrap();
        assert_eq!(grav.state(), MeasureState::Complete);
        assert!(m.net_mass_kg > 1.5, "collected {:.3} kg", m.net_mass_kg);
        assert!(m.volume_l > m.net_mass_kg, "density correction should exceed 1 kg/L");
        assert!((m.volume_l - m.net_mass_kg / m.density_kg_per_l).abs() < 1e-9);
        assert!(m.collect_time_s > 7.0 && m.collect_time_s < 11.0);
        assert!(m.avg_flow_lph > 500.0);

        let drained = grav.drain(DRAIN_TIMEOUT, DRAIN_THRESHOLD_KG).await.unwrap();
        assert!(drained);
        tokio::time::advance(Duration::from_millis(450)).await;
        assert!(hub.latest().weight_kg <= DRAIN_THRESHOLD_KG + 0.05);
        assert!(!hub.latest().valve_open(ValveId::SvDrain));
    }
}
