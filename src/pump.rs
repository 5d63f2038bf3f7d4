//! Pump / VFD controller (Delta drive over the field bus)
//!
//! Register map:
//!
//! ```text
//! 0x2000  control word   (0x0001 run fwd, 0x0003 emergency stop, 0x0005 stop)
//! 0x2001  frequency setpoint, Hz × 100
//! 0x2100  status word (bit 0 = running)
//! 0x2103  actual output frequency, Hz × 100
//! 0x2104  output current, A × 100
//! 0x2105  fault code (0 = none)
//! ```
//!
//! Commanded frequency is clamped to the drive's working band of
//! [5, 50] Hz. Emergency stop writes the e-stop control word; in the
//! simulator that snaps both actual and commanded frequency to zero.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::hardware::{vfd_regs, BusChannel, BusError, HardwareBackend, VFD_ADDR};

/// Drive working band, Hz.
pub const FREQ_MIN_HZ: f64 = 5.0;
pub const FREQ_MAX_HZ: f64 = 50.0;

/// Last known drive state, refreshed by [`PumpController::status`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PumpStatus {
    pub running: bool,
    pub frequency_hz: f64,
    pub target_hz: f64,
    pub current_a: f64,
    pub fault_code: u16,
    pub connected: bool,
}

impl PumpStatus {
    pub fn faulted(&self) -> bool {
        self.fault_code != 0
    }
}

/// High-level pump controller; serializes its commands internally.
pub struct PumpController {
    backend: Arc<dyn HardwareBackend>,
    status: Mutex<PumpStatus>,
}

impl PumpController {
    pub fn new(backend: Arc<dyn HardwareBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            status: Mutex::new(PumpStatus::default()),
        })
    }

    fn clamp(frequency_hz: f64) -> f64 {
        frequency_hz.clamp(FREQ_MIN_HZ, FREQ_MAX_HZ)
    }

    /// Start the drive: setpoint first, then the run command.
    pub async fn start(&self, frequency_hz: f64) -> Result<(), BusError> {
        let hz = Self::clamp(frequency_hz);
        let mut status = self.status.lock().await;
        self.write_setpoint(hz).await?;
        self.write_control(vfd_regs::CMD_RUN_FORWARD).await?;
        status.running = true;
        status.target_hz = hz;
        info!(frequency_hz = hz, "pump started");
        Ok(())
    }

    /// Normal stop; the drive ramps down on its own.
    pub async fn stop(&self) -> Result<(), BusError> {
        let mut status = self.status.lock().await;
        self.write_control(vfd_regs::CMD_NORMAL_STOP).await?;
        status.running = false;
        status.target_hz = 0.0;
        info!("pump stopped");
        Ok(())
    }

    /// Immediate halt via the drive's e-stop control word.
    pub async fn emergency_stop(&self) -> Result<(), BusError> {
        let mut status = self.status.lock().await;
        self.write_control(vfd_regs::CMD_EMERGENCY_STOP).await?;
        status.running = false;
        status.target_hz = 0.0;
        status.frequency_hz = 0.0;
        warn!("pump EMERGENCY STOP");
        Ok(())
    }

    /// Change the setpoint while running.
    pub async fn set_frequency(&self, frequency_hz: f64) -> Result<(), BusError> {
        let hz = Self::clamp(frequency_hz);
        let mut status = self.status.lock().await;
        self.write_setpoint(hz).await?;
        status.target_hz = hz;
        debug!(frequency_hz = hz, "pump setpoint updated");
        Ok(())
    }

    /// Read the full drive status from the bus.
    ///
    /// A failed read leaves the cached values and marks the drive
    /// disconnected rather than erroring.
    pub async fn status(&self) -> PumpStatus {
        let mut status = self.status.lock().await;
        let read = async {
            let running = self.read_reg(vfd_regs::REG_STATUS).await?;
            let freq = self.read_reg(vfd_regs::REG_ACTUAL_FREQ).await?;
            let current = self.read_reg(vfd_regs::REG_ACTUAL_CURRENT).await?;
            let fault = self.read_reg(vfd_regs::REG_FAULT).await?;
            Ok::<_, BusError>((running, freq, current, fault))
        };
        match read.await {
            Ok((running, freq, current, fault)) => {
                status.connected = true;
                status.running = running >= 1.0;
                status.frequency_hz = freq / 100.0;
                status.current_a = current / 100.0;
                status.fault_code = fault as u16;
            }
            Err(e) => {
                debug!(error = %e, "pump status read failed");
                status.connected = false;
            }
        }
        *status
    }

    async fn read_reg(&self, reg: u16) -> Result<f64, BusError> {
        let values = self.backend.mb_read(BusChannel::Vfd, VFD_ADDR, reg, 1).await?;
        Ok(values.first().copied().unwrap_or(0.0))
    }

    async fn write_control(&self, word: u16) -> Result<(), BusError> {
        self.backend
            .mb_write(BusChannel::Vfd, VFD_ADDR, vfd_regs::REG_CONTROL, word)
            .await
    }

    async fn write_setpoint(&self, hz: f64) -> Result<(), BusError> {
        self.backend
            .mb_write(
                BusChannel::Vfd,
                VFD_ADDR,
                vfd_regs::REG_FREQ_SETPOINT,
                (hz * 100.0).round() as u16,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulator;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn start_run_and_status() {
        let sim = Arc::new(Simulator::new());
        sim.set_noise(false);
        let pump = PumpController::new(sim.clone());

        pump.start(30.0).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let status = pump.status().await;
        assert!(status.connected);
        assert!(status.running);
        assert!((status.frequency_hz - 30.0).abs() < 1.0);
        assert!(!status.faulted());
    }

    #[tokio::test]
    async fn frequency_clamped_to_drive_band() {
        let sim = Arc::new(Simulator::new());
        let pump = PumpController::new(sim.clone());
        pump.start(2.0).await.unwrap();
        assert!((sim.with_state(|s| s.vfd_target_freq) - FREQ_MIN_HZ).abs() < 1e-9);
        pump.set_frequency(90.0).await.unwrap();
        assert!((sim.with_state(|s| s.vfd_target_freq) - FREQ_MAX_HZ).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_zeroes_frequency_immediately() {
        let sim = Arc::new(Simulator::new());
        sim.set_noise(false);
        let pump = PumpController::new(sim.clone());
        pump.start(40.0).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        pump.emergency_stop().await.unwrap();
        let (actual, target) = sim.with_state(|s| (s.vfd_actual_freq, s.vfd_target_freq));
        assert_eq!(actual, 0.0);
        assert_eq!(target, 0.0);
        let status = pump.status().await;
        assert!(!status.running);
    }

    #[tokio::test]
    async fn disconnected_drive_degrades_status() {
        let sim = Arc::new(Simulator::new());
        sim.set_bridge_online(BusChannel::Vfd, false);
        let pump = PumpController::new(sim);
        let status = pump.status().await;
        assert!(!status.connected);
    }
}
