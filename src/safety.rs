//! Safety watchdog
//!
//! A parallel monitor that consumes the sensor snapshot stream at 200 ms
//! cadence and preempts everything else when the bench leaves its safe
//! envelope. Checks, each gated by the owning bridge's online flag so a
//! dead sensor never fabricates an alarm:
//!
//! | code            | condition                          | severity  |
//! |-----------------|------------------------------------|-----------|
//! | `Overpressure`  | upstream pressure > max            | EMERGENCY |
//! | `LowReservoir`  | level < min                        | CRITICAL  |
//! | `TempHigh/Low`  | water temp outside [min, max]      | CRITICAL  |
//! | `ScaleOverload` | raw weight > max                   | EMERGENCY |
//! | `EstopActive`   | hardware E-stop input              | EMERGENCY |
//! | `ContactorTrip` | contactor off while expected on    | EMERGENCY |
//! | `McbTrip`       | breaker off                        | EMERGENCY |
//! | `VfdFault`      | nonzero drive fault code           | CRITICAL  |
//!
//! Alarm lifecycle: the active set is diffed per tick. Alarms that vanish
//! are logged CLEARED, fresh ones fire the registered callbacks. The first
//! EMERGENCY alarm latches the injected hardware emergency-stop action and
//! suppresses re-entry until `reset_latch`. The emergency-stop action is a
//! function value injected at construction, which is what breaks the
//! hardware ↔ safety reference cycle.
//!
//! `check(snapshot)` is the pure, callback-free variant used for engine
//! pre-flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::sensors::{SensorHub, SensorSnapshot};

/// Watchdog poll cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Configured safety limits. Defaults match the commissioning values.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    pub pressure_max_bar: f64,
    pub reservoir_min_pct: f64,
    pub scale_max_kg: f64,
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    /// Valve actuation confirmation window, seconds.
    pub valve_timeout_s: f64,
    /// Flow stability band handed to the PID loop, % of target.
    pub flow_stability_pct: f64,
    /// Consecutive in-band samples required for stability.
    pub stability_count: usize,
    /// Gate for the weight-derived checks; cleared when the scale relay
    /// is intentionally powered down.
    pub scale_checks_enabled: bool,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            pressure_max_bar: 8.0,
            reservoir_min_pct: 20.0,
            scale_max_kg: 180.0,
            temp_min_c: 5.0,
            temp_max_c: 40.0,
            valve_timeout_s: 5.0,
            flow_stability_pct: 2.0,
            stability_count: 5,
            scale_checks_enabled: true,
        }
    }
}

/// Alarm identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum AlarmCode {
    Overpressure,
    LowReservoir,
    TempHigh,
    TempLow,
    ScaleOverload,
    EstopActive,
    ContactorTrip,
    McbTrip,
    VfdFault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AlarmSeverity {
    Warning,
    Critical,
    Emergency,
}

/// A single alarm event.
#[derive(Clone, Debug, Serialize)]
pub struct Alarm {
    pub code: AlarmCode,
    pub severity: AlarmSeverity,
    pub message: String,
    pub value: Option<f64>,
    pub limit: Option<f64>,
}

impl Alarm {
    pub fn is_emergency(&self) -> bool {
        self.severity == AlarmSeverity::Emergency
    }
}

/// Evaluate every safety check against one snapshot.
///
/// Pure and callback-free; each check honours the snapshot's own
/// per-bridge online flags.
pub fn check(snapshot: &SensorSnapshot, settings: &SafetySettings) -> Vec<Alarm> {
    let mut alarms = Vec::new();

    if snapshot.bridges.scale && snapshot.pressure_upstream_bar > settings.pressure_max_bar {
        alarms.push(Alarm {
            code: AlarmCode::Overpressure,
            severity: AlarmSeverity::Emergency,
            message: format!(
                "upstream pressure {:.2} bar > {:.1} bar limit",
                snapshot.pressure_upstream_bar, settings.pressure_max_bar
            ),
            value: Some(snapshot.pressure_upstream_bar),
            limit: Some(settings.pressure_max_bar),
        });
    }

    if snapshot.bridges.tank && snapshot.reservoir_level_pct < settings.reservoir_min_pct {
        alarms.push(Alarm {
            code: AlarmCode::LowReservoir,
            severity: AlarmSeverity::Critical,
            message: format!(
                "reservoir level {:.1}% < {:.0}% minimum",
                snapshot.reservoir_level_pct, settings.reservoir_min_pct
            ),
            value: Some(snapshot.reservoir_level_pct),
            limit: Some(settings.reservoir_min_pct),
        });
    }

    if snapshot.bridges.tank && snapshot.water_temp_c > settings.temp_max_c {
        alarms.push(Alarm {
            code: AlarmCode::TempHigh,
            severity: AlarmSeverity::Critical,
            message: format!(
                "water temperature {:.1} °C > {:.0} °C limit",
                snapshot.water_temp_c, settings.temp_max_c
            ),
            value: Some(snapshot.water_temp_c),
            limit: Some(settings.temp_max_c),
        });
    }
    if snapshot.bridges.tank && snapshot.water_temp_c < settings.temp_min_c {
        alarms.push(Alarm {
            code: AlarmCode::TempLow,
            severity: AlarmSeverity::Critical,
            message: format!(
                "water temperature {:.1} °C < {:.0} °C limit",
                snapshot.water_temp_c, settings.temp_min_c
            ),
            value: Some(snapshot.water_temp_c),
            limit: Some(settings.temp_min_c),
        });
    }

    if settings.scale_checks_enabled
        && snapshot.bridges.scale
        && snapshot.weight_raw_kg > settings.scale_max_kg
    {
        alarms.push(Alarm {
            code: AlarmCode::ScaleOverload,
            severity: AlarmSeverity::Emergency,
            message: format!(
                "scale weight {:.1} kg > {:.0} kg limit",
                snapshot.weight_raw_kg, settings.scale_max_kg
            ),
            value: Some(snapshot.weight_raw_kg),
            limit: Some(settings.scale_max_kg),
        });
    }

    if snapshot.bridges.gpio && snapshot.estop_active {
        alarms.push(Alarm {
            code: AlarmCode::EstopActive,
            severity: AlarmSeverity::Emergency,
            message: "hardware E-STOP is active".into(),
            value: None,
            limit: None,
        });
    }

    if snapshot.bridges.gpio && !snapshot.contactor_on {
        alarms.push(Alarm {
            code: AlarmCode::ContactorTrip,
            severity: AlarmSeverity::Emergency,
            message: "main contactor has tripped".into(),
            value: None,
            limit: None,
        });
    }

    if snapshot.bridges.gpio && !snapshot.mcb_on {
        alarms.push(Alarm {
            code: AlarmCode::McbTrip,
            severity: AlarmSeverity::Emergency,
            message: "MCB has tripped".into(),
            value: None,
            limit: None,
        });
    }

    if snapshot.bridges.vfd && snapshot.pump_fault != 0 {
        alarms.push(Alarm {
            code: AlarmCode::VfdFault,
            severity: AlarmSeverity::Critical,
            message: format!("VFD fault code {}", snapshot.pump_fault),
            value: Some(snapshot.pump_fault as f64),
            limit: None,
        });
    }

    alarms
}

/// Hardware emergency-stop action injected at construction.
pub type EmergencyStopFn = Arc<dyn Fn() + Send + Sync>;
/// Callback fired once per newly raised alarm.
pub type AlarmCallback = Box<dyn Fn(&Alarm) + Send + Sync>;

struct MonitorState {
    active: HashMap<AlarmCode, Alarm>,
    history: Vec<Alarm>,
    callbacks: Vec<AlarmCallback>,
    latched: bool,
}

/// The watchdog service.
pub struct SafetyMonitor {
    settings: SafetySettings,
    hub: Arc<SensorHub>,
    emergency_stop: EmergencyStopFn,
    state: Mutex<MonitorState>,
    running: AtomicBool,
}

impl SafetyMonitor {
    pub fn new(
        settings: SafetySettings,
        hub: Arc<SensorHub>,
        emergency_stop: EmergencyStopFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            hub,
            emergency_stop,
            state: Mutex::new(MonitorState {
                active: HashMap::new(),
                history: Vec::new(),
                callbacks: Vec::new(),
                latched: false,
            }),
            running: AtomicBool::new(false),
        })
    }

    /// Register an alarm callback (engine abort hook, link notifier, ...).
    pub fn on_alarm(&self, callback: AlarmCallback) {
        self.state.lock().unwrap().callbacks.push(callback);
    }

    /// Spawn the monitoring task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            while monitor.running.load(Ordering::SeqCst) {
                tick.tick().await;
                let snapshot = monitor.hub.latest();
                monitor.process(&snapshot);
            }
        });
        info!("safety monitor started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Pre-flight variant: evaluate one snapshot without touching the
    /// active set or firing callbacks.
    pub fn check(&self, snapshot: &SensorSnapshot) -> Vec<Alarm> {
        check(snapshot, &self.settings)
    }

    /// Diff one tick's alarms against the active set.
    pub(crate) fn process(&self, snapshot: &SensorSnapshot) {
        let alarms = check(snapshot, &self.settings);

        // Collect actions while holding the lock, run them after.
        let mut fired: Vec<Alarm> = Vec::new();
        let mut trigger_estop = false;
        {
            let mut state = self.state.lock().unwrap();
            let current: Vec<AlarmCode> = alarms.iter().map(|a| a.code).collect();

            let cleared: Vec<AlarmCode> = state
                .active
                .keys()
                .filter(|code| !current.contains(code))
                .copied()
                .collect();
            for code in cleared {
                state.active.remove(&code);
                info!(?code, "safety alarm CLEARED");
            }

            for alarm in alarms {
                if state.active.contains_key(&alarm.code) {
                    continue;
                }
                warn!(code = ?alarm.code, severity = ?alarm.severity, message = %alarm.message,
                      "safety alarm RAISED");
                state.active.insert(alarm.code, alarm.clone());
                state.history.push(alarm.clone());
                fired.push(alarm.clone());

                if alarm.is_emergency() && !state.latched {
                    state.latched = true;
                    trigger_estop = true;
                }
            }
        }

        if !fired.is_empty() {
            let state = self.state.lock().unwrap();
            for alarm in &fired {
                for cb in &state.callbacks {
                    cb(alarm);
                }
            }
        }

        if trigger_estop {
            error!("EMERGENCY STOP triggered by safety monitor");
            (self.emergency_stop)();
        }
    }

    // -------------------------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------------------------

    pub fn active_alarms(&self) -> Vec<Alarm> {
        self.state.lock().unwrap().active.values().cloned().collect()
    }

    pub fn has_active_alarms(&self) -> bool {
        !self.state.lock().unwrap().active.is_empty()
    }

    /// True while no emergency-severity alarm is active.
    pub fn is_safe(&self) -> bool {
        !self
            .state
            .lock()
            .unwrap()
            .active
            .values()
            .any(|a| a.is_emergency())
    }

    pub fn alarm_history(&self) -> Vec<Alarm> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn latched(&self) -> bool {
        self.state.lock().unwrap().latched
    }

    /// Clear the emergency-stop latch so a later emergency can act again.
    pub fn reset_latch(&self) {
        self.state.lock().unwrap().latched = false;
        info!("safety monitor latch cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::BridgeOnline;
    use std::sync::atomic::AtomicUsize;

    fn live_snapshot() -> SensorSnapshot {
        SensorSnapshot {
            timestamp: 1.0,
            reservoir_level_pct: 85.0,
            water_temp_c: 22.0,
            bridges: BridgeOnline {
                lora: true,
                vfd: true,
                meter: true,
                scale: true,
                gpio: true,
                tank: true,
            },
            ..SensorSnapshot::default()
        }
    }

    #[test]
    fn overpressure_raises_emergency() {
        let mut snap = live_snapshot();
        snap.pressure_upstream_bar = 9.5;
        let alarms = check(&snap, &SafetySettings::default());
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].code, AlarmCode::Overpressure);
        assert_eq!(alarms[0].severity, AlarmSeverity::Emergency);
        assert_eq!(alarms[0].value, Some(9.5));
    }

    #[test]
    fn temp_and_scale_alarms() {
        let mut snap = live_snapshot();
        snap.water_temp_c = 45.0;
        let alarms = check(&snap, &SafetySettings::default());
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].code, AlarmCode::TempHigh);
        assert_eq!(alarms[0].severity, AlarmSeverity::Critical);

        let mut snap = live_snapshot();
        snap.weight_raw_kg = 200.0;
        let alarms = check(&snap, &SafetySettings::default());
        assert_eq!(alarms[0].code, AlarmCode::ScaleOverload);
        assert!(alarms[0].is_emergency());
    }

    #[test]
    fn combined_conditions_produce_the_union() {
        let mut snap = live_snapshot();
        snap.pressure_upstream_bar = 9.5;
        snap.water_temp_c = 45.0;
        snap.weight_raw_kg = 200.0;
        snap.estop_active = true;
        snap.pump_fault = 3;
        let codes: Vec<AlarmCode> = check(&snap, &SafetySettings::default())
            .iter()
            .map(|a| a.code)
            .collect();
        assert_eq!(codes.len(), 5);
        assert!(codes.contains(&AlarmCode::Overpressure));
        assert!(codes.contains(&AlarmCode::TempHigh));
        assert!(codes.contains(&AlarmCode::ScaleOverload));
        assert!(codes.contains(&AlarmCode::EstopActive));
        assert!(codes.contains(&AlarmCode::VfdFault));
    }

    #[test]
    fn offline_bridge_suppresses_its_alarms() {
        let mut snap = live_snapshot();
        snap.pressure_upstream_bar = 9.5;
        snap.weight_raw_kg = 200.0;
        snap.bridges.scale = false;
        assert!(check(&snap, &SafetySettings::default()).is_empty());

        // Default (startup) snapshot raises nothing despite zeroed fields.
        assert!(check(&SensorSnapshot::default(), &SafetySettings::default()).is_empty());
    }

    #[test]
    fn scale_checks_toggle_gates_weight_alarms() {
        let mut snap = live_snapshot();
        snap.weight_raw_kg = 200.0;
        let settings = SafetySettings {
            scale_checks_enabled: false,
            ..SafetySettings::default()
        };
        assert!(check(&snap, &settings).is_empty());
        // Pressure checks stay live on the same bridge.
        snap.pressure_upstream_bar = 9.5;
        assert_eq!(check(&snap, &settings).len(), 1);
    }

    #[tokio::test]
    async fn latch_fires_estop_once_until_reset() {
        use crate::sensors::SensorHub;
        use crate::sim::Simulator;

        let sim = std::sync::Arc::new(Simulator::new());
        let hub = SensorHub::new(sim, Duration::from_millis(200));
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        let monitor = SafetyMonitor::new(
            SafetySettings::default(),
            hub,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut snap = live_snapshot();
        snap.estop_active = true;
        monitor.process(&snap);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(monitor.latched());
        assert!(!monitor.is_safe());

        // Alarm clears; a second emergency is suppressed by the latch.
        monitor.process(&live_snapshot());
        assert!(monitor.is_safe());
        monitor.process(&snap);
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        // After an explicit reset the next emergency acts again.
        monitor.process(&live_snapshot());
        monitor.reset_latch();
        monitor.process(&snap);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn callbacks_fire_once_per_raise() {
        use crate::sensors::SensorHub;
        use crate::sim::Simulator;

        let sim = std::sync::Arc::new(Simulator::new());
        let hub = SensorHub::new(sim, Duration::from_millis(200));
        let monitor = SafetyMonitor::new(SafetySettings::default(), hub, Arc::new(|| {}));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        monitor.on_alarm(Box::new(move |alarm| {
            assert_eq!(alarm.code, AlarmCode::LowReservoir);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut snap = live_snapshot();
        snap.reservoir_level_pct = 10.0;
        monitor.process(&snap);
        monitor.process(&snap); // still active, no re-fire
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        monitor.process(&live_snapshot()); // cleared
        monitor.process(&snap); // raised again
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
