//! Flow PID controller
//!
//! Computes the pump frequency setpoint that tracks a target flow rate.
//! Parallel form with three hardening details that matter on a real rig:
//!
//! - **Derivative on measurement**, not on error, so setpoint changes do
//!   not kick the output.
//! - **Anti-windup by back-calculation**: whenever the unclamped output
//!   leaves the actuator range the integral is recomputed so the output
//!   sits exactly on the bound, instead of winding past it.
//! - **dt from the wall clock**, clamped to a minimum, so irregular call
//!   cadence cannot divide by zero or spike the derivative.
//!
//! Stability detection: the controller is "stable" once the last N error
//! ratios (|error| / target × 100) all fall inside the configured
//! tolerance. Gains and limits are configuration inputs, not constants.
//!
//! All state sits behind one lock; `compute` is the single mutator.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

/// PID tuning and limits. Defaults match the bench commissioning values.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PidSettings {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Actuator floor, Hz.
    pub output_min: f64,
    /// Actuator ceiling, Hz.
    pub output_max: f64,
    /// Nominal sample interval, seconds.
    pub sample_rate_s: f64,
    /// Stability band as a percentage of the target.
    pub stability_tolerance_pct: f64,
    /// Consecutive in-band samples required for `is_stable`.
    pub stability_count: usize,
}

impl Default for PidSettings {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.1,
            kd: 0.05,
            output_min: 5.0,
            output_max: 50.0,
            sample_rate_s: 0.2,
            stability_tolerance_pct: 2.0,
            stability_count: 5,
        }
    }
}

/// Observable controller state.
#[derive(Clone, Copy, Debug, Default)]
pub struct PidState {
    pub target_lph: f64,
    pub measured_lph: f64,
    pub output_hz: f64,
    pub error: f64,
    pub stable: bool,
    pub enabled: bool,
}

struct PidCore {
    settings: PidSettings,
    target: f64,
    enabled: bool,
    manual_output: Option<f64>,
    integral: f64,
    prev_measurement: f64,
    output: f64,
    last_time: Option<Instant>,
    error_history: VecDeque<f64>,
}

/// Thread-safe PID controller.
pub struct PidController {
    core: Mutex<PidCore>,
}

impl PidController {
    pub fn new(settings: PidSettings) -> Self {
        Self {
            core: Mutex::new(PidCore {
                settings,
                target: 0.0,
                enabled: false,
                manual_output: None,
                integral: 0.0,
                prev_measurement: 0.0,
                output: 0.0,
                last_time: None,
                error_history: VecDeque::with_capacity(settings.stability_count),
            }),
        }
    }

    // -------------------------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------------------------

    /// Set the target flow in L/h; clears the stability window.
    pub fn set_target(&self, target_lph: f64) {
        let mut core = self.core.lock().unwrap();
        core.target = target_lph.max(0.0);
        core.error_history.clear();
        info!(target_lph = core.target, "PID target set");
    }

    /// Update gains on the fly.
    pub fn set_gains(&self, kp: f64, ki: f64, kd: f64) {
        let mut core = self.core.lock().unwrap();
        core.settings.kp = kp;
        core.settings.ki = ki;
        core.settings.kd = kd;
        info!(kp, ki, kd, "PID gains updated");
    }

    /// Enable the loop with fresh internal state.
    pub fn enable(&self) {
        let mut core = self.core.lock().unwrap();
        core.enabled = true;
        core.integral = 0.0;
        core.prev_measurement = 0.0;
        core.last_time = Some(Instant::now());
        core.manual_output = None;
        core.error_history.clear();
        debug!("PID enabled");
    }

    /// Disable the loop; output falls to zero.
    pub fn disable(&self) {
        let mut core = self.core.lock().unwrap();
        core.enabled = false;
        core.output = 0.0;
        core.integral = 0.0;
        core.error_history.clear();
        debug!("PID disabled");
    }

    /// Clear accumulated state without toggling enablement.
    pub fn reset(&self) {
        let mut core = self.core.lock().unwrap();
        core.integral = 0.0;
        core.prev_measurement = 0.0;
        core.output = 0.0;
        core.last_time = Some(Instant::now());
        core.error_history.clear();
    }

    /// Override the output with a fixed frequency; `None` resumes auto.
    pub fn set_manual(&self, hz: Option<f64>) {
        self.core.lock().unwrap().manual_output = hz;
    }

    // -------------------------------------------------------------------------------------------
    // Core computation
    // -------------------------------------------------------------------------------------------

    /// One controller step: measurement in L/h → pump setpoint in Hz.
    pub fn compute(&self, measured_lph: f64) -> f64 {
        let mut core = self.core.lock().unwrap();
        if !core.enabled {
            return 0.0;
        }
        let s = core.settings;

        if let Some(manual) = core.manual_output {
            core.output = manual.clamp(s.output_min, s.output_max);
            return core.output;
        }

        let now = Instant::now();
        let dt = match core.last_time {
            Some(last) => now.duration_since(last).as_secs_f64().max(0.001),
            None => s.sample_rate_s,
        };
        core.last_time = Some(now);

        let error = core.target - measured_lph;
        let p_term = s.kp * error;

        core.integral += error * dt;
        let mut i_term = s.ki * core.integral;

        // Back-calculate the integral when P+I alone would leave the band.
        let unclamped = p_term + i_term;
        if unclamped > s.output_max && s.ki != 0.0 {
            core.integral = (s.output_max - p_term) / s.ki;
            i_term = s.ki * core.integral;
        } else if unclamped < s.output_min && core.target > 0.0 && s.ki != 0.0 {
            core.integral = (s.output_min - p_term) / s.ki;
            i_term = s.ki * core.integral;
        }

        let d_measurement = (measured_lph - core.prev_measurement) / dt;
        let d_term = -s.kd * d_measurement;

        let output = if core.target <= 0.0 {
            0.0
        } else {
            (p_term + i_term + d_term).clamp(s.output_min, s.output_max)
        };

        core.output = output;
        core.prev_measurement = measured_lph;

        if core.target > 0.0 {
            let error_pct = (error / core.target).abs() * 100.0;
            if core.error_history.len() == s.stability_count {
                core.error_history.pop_front();
            }
            core.error_history.push_back(error_pct);
        }

        output
    }

    // -------------------------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------------------------

    pub fn is_stable(&self) -> bool {
        let core = self.core.lock().unwrap();
        is_stable(&core)
    }

    pub fn output(&self) -> f64 {
        self.core.lock().unwrap().output
    }

    pub fn target(&self) -> f64 {
        self.core.lock().unwrap().target
    }

    pub fn enabled(&self) -> bool {
        self.core.lock().unwrap().enabled
    }

    pub fn settings(&self) -> PidSettings {
        self.core.lock().unwrap().settings
    }

    pub fn state(&self) -> PidState {
        let core = self.core.lock().unwrap();
        PidState {
            target_lph: core.target,
            measured_lph: core.prev_measurement,
            output_hz: core.output,
            error: core.target - core.prev_measurement,
            stable: is_stable(&core),
            enabled: core.enabled,
        }
    }
}

fn is_stable(core: &PidCore) -> bool {
    core.error_history.len() == core.settings.stability_count
        && core
            .error_history
            .iter()
            .all(|e| *e <= core.settings.stability_tolerance_pct)
}
