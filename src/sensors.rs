//! Sensor aggregation: one timestamped snapshot of the whole bench
//!
//! A single producer task polls every read the active backend exposes at a
//! fixed 200 ms cadence and publishes the result as an immutable
//! [`SensorSnapshot`] through a `tokio::sync::watch` channel. Readers see
//! snapshots by value; publication never blocks on readers.
//!
//! Degradation policy: a failed bridge read keeps that bridge's fields at
//! their last published values and drops the bridge's online flag for the
//! tick. At startup every flag is false until the first successful read.
//! A missing sensor therefore never fabricates data; the safety watchdog
//! gates each alarm on the matching online flag.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::hardware::{
    vfd_regs, BusChannel, DiverterPos, HardwareBackend, TowerChannels, ValveId, DUT_ADDR,
    EM_ADDR, VFD_ADDR,
};

/// Default polling cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Per-bridge liveness as observed on the most recent tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BridgeOnline {
    pub lora: bool,
    pub vfd: bool,
    pub meter: bool,
    pub scale: bool,
    pub gpio: bool,
    pub tank: bool,
}

/// Immutable record of every bench observable at one instant.
///
/// Produced only by [`SensorHub`]; everything else holds read-only copies.
#[derive(Clone, Debug, Serialize)]
pub struct SensorSnapshot {
    /// Unix seconds; 0.0 until the hub publishes its first tick.
    pub timestamp: f64,

    // Flow (EM reference meter)
    pub flow_rate_lph: f64,
    pub em_totalizer_l: f64,

    // Collection scale
    pub weight_kg: f64,
    pub weight_raw_kg: f64,
    pub scale_power_on: bool,

    // Line pressures
    pub pressure_upstream_bar: f64,
    pub pressure_downstream_bar: f64,

    // Temperatures / environment
    pub water_temp_c: f64,
    pub atm_temp_c: f64,
    pub atm_humidity_pct: f64,

    // Reservoir
    pub reservoir_level_pct: f64,

    // Device under test
    pub dut_connected: bool,
    pub dut_totalizer_l: Option<f64>,

    // Pump / VFD
    pub pump_running: bool,
    pub pump_freq_hz: f64,
    pub pump_target_hz: f64,
    pub pump_current_a: f64,
    pub pump_fault: u16,

    // Manifold
    pub valves: BTreeMap<ValveId, bool>,
    pub diverter: DiverterPos,

    // Indicators
    pub tower: TowerChannels,

    // Protection circuit
    pub estop_active: bool,
    pub contactor_on: bool,
    pub mcb_on: bool,

    // Comms
    pub bridges: BridgeOnline,
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            flow_rate_lph: 0.0,
            em_totalizer_l: 0.0,
            weight_kg: 0.0,
            weight_raw_kg: 0.0,
            scale_power_on: false,
            pressure_upstream_bar: 0.0,
            pressure_downstream_bar: 0.0,
            water_temp_c: 0.0,
            atm_temp_c: 0.0,
            atm_humidity_pct: 0.0,
            reservoir_level_pct: 0.0,
            dut_connected: false,
            dut_totalizer_l: None,
            pump_running: false,
            pump_freq_hz: 0.0,
            pump_target_hz: 0.0,
            pump_current_a: 0.0,
            pump_fault: 0,
            valves: ValveId::ALL.iter().map(|v| (*v, false)).collect(),
            diverter: DiverterPos::Bypass,
            tower: TowerChannels::default(),
            estop_active: false,
            contactor_on: true,
            mcb_on: true,
            bridges: BridgeOnline::default(),
        }
    }
}

impl SensorSnapshot {
    pub fn valve_open(&self, valve: ValveId) -> bool {
        self.valves.get(&valve).copied().unwrap_or(false)
    }

    /// Whether any water path exists from pump to reservoir.
    pub fn flow_path_open(&self) -> bool {
        self.valve_open(ValveId::Sv1) || self.valve_open(ValveId::BvBypass)
    }
}

/// Callback invoked with each freshly published snapshot.
pub type SnapshotListener = Box<dyn Fn(&SensorSnapshot) + Send + Sync>;

/// The polling aggregator.
pub struct SensorHub {
    backend: Arc<dyn HardwareBackend>,
    tx: watch::Sender<SensorSnapshot>,
    listeners: Mutex<Vec<SnapshotListener>>,
    running: AtomicBool,
    poll_interval: Duration,
}

impl SensorHub {
    pub fn new(backend: Arc<dyn HardwareBackend>, poll_interval: Duration) -> Arc<Self> {
        let (tx, _) = watch::channel(SensorSnapshot::default());
        Arc::new(Self {
            backend,
            tx,
            listeners: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            poll_interval,
        })
    }

    /// Most recent snapshot by value.
    pub fn latest(&self) -> SensorSnapshot {
        self.tx.borrow().clone()
    }

    /// A receiver for change-driven consumers (safety watchdog, guards).
    pub fn subscribe(&self) -> watch::Receiver<SensorSnapshot> {
        self.tx.subscribe()
    }

    /// Register a per-tick callback. Intended to be done during wiring,
    /// before `start`.
    pub fn add_listener(&self, listener: SnapshotListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Spawn the polling task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(hub.poll_interval);
            while hub.running.load(Ordering::SeqCst) {
                tick.tick().await;
                let snapshot = hub.read_all().await;
                hub.tx.send_replace(snapshot.clone());
                for listener in hub.listeners.lock().unwrap().iter() {
                    listener(&snapshot);
                }
            }
        });
        info!(interval_ms = self.poll_interval.as_millis() as u64, "sensor hub started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One full acquisition pass. Failed reads keep the previous values
    /// and clear the bridge's online flag.
    async fn read_all(&self) -> SensorSnapshot {
        let mut snap = self.tx.borrow().clone();
        snap.timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;

        // Meter bridge: reference flow + totalizer, then the DUT.
        match self.backend.mb_read(BusChannel::Meter, EM_ADDR, 0, 2).await {
            Ok(values) => {
                snap.bridges.meter = true;
                snap.flow_rate_lph = values.first().copied().unwrap_or(snap.flow_rate_lph);
                snap.em_totalizer_l = values.get(1).copied().unwrap_or(snap.em_totalizer_l);

                match self.backend.mb_read(BusChannel::Meter, DUT_ADDR, 0, 2).await {
                    Ok(dut) => {
                        snap.dut_connected = true;
                        snap.dut_totalizer_l = dut.first().copied();
                    }
                    Err(_) => {
                        snap.dut_connected = false;
                        snap.dut_totalizer_l = None;
                    }
                }
            }
            Err(_) => snap.bridges.meter = false,
        }

        // VFD bridge.
        let vfd_read = async {
            let status = self
                .backend
                .mb_read(BusChannel::Vfd, VFD_ADDR, vfd_regs::REG_STATUS, 1)
                .await?;
            let freq = self
                .backend
                .mb_read(BusChannel::Vfd, VFD_ADDR, vfd_regs::REG_ACTUAL_FREQ, 1)
                .await?;
            let target = self
                .backend
                .mb_read(BusChannel::Vfd, VFD_ADDR, vfd_regs::REG_FREQ_SETPOINT, 1)
                .await?;
            let current = self
                .backend
                .mb_read(BusChannel::Vfd, VFD_ADDR, vfd_regs::REG_ACTUAL_CURRENT, 1)
                .await?;
            let fault = self
                .backend
                .mb_read(BusChannel::Vfd, VFD_ADDR, vfd_regs::REG_FAULT, 1)
                .await?;
            Ok::<_, crate::hardware::BusError>((status, freq, target, current, fault))
        };
        match vfd_read.await {
            Ok((status, freq, target, current, fault)) => {
                snap.bridges.vfd = true;
                snap.pump_running = status.first().copied().unwrap_or(0.0) >= 1.0;
                snap.pump_freq_hz = freq.first().copied().unwrap_or(0.0) / 100.0;
                snap.pump_target_hz = target.first().copied().unwrap_or(0.0) / 100.0;
                snap.pump_current_a = current.first().copied().unwrap_or(0.0) / 100.0;
                snap.pump_fault = fault.first().copied().unwrap_or(0.0) as u16;
            }
            Err(_) => snap.bridges.vfd = false,
        }

        // Scale bridge: weight and line pressures.
        let scale_read = async {
            let scale = self.backend.scale_read().await?;
            let pressure = self.backend.pressure_read().await?;
            Ok::<_, crate::hardware::BusError>((scale, pressure))
        };
        match scale_read.await {
            Ok((scale, pressure)) => {
                snap.bridges.scale = true;
                snap.weight_kg = scale.weight_kg;
                snap.weight_raw_kg = scale.raw_kg;
                snap.pressure_upstream_bar = pressure.upstream_bar;
                snap.pressure_downstream_bar = pressure.downstream_bar;
            }
            Err(_) => snap.bridges.scale = false,
        }

        // GPIO bridge: protection circuit, ambient, valves, tower.
        let gpio_read = async {
            let sensors = self.backend.sensor_read().await?;
            let bank = self.backend.valve_states().await?;
            Ok::<_, crate::hardware::BusError>((sensors, bank))
        };
        match gpio_read.await {
            Ok((sensors, bank)) => {
                snap.bridges.gpio = true;
                snap.estop_active = sensors.estop_active;
                snap.contactor_on = sensors.contactor_on;
                snap.mcb_on = sensors.mcb_on;
                snap.atm_temp_c = sensors.atm_temp_c;
                snap.atm_humidity_pct = sensors.atm_humidity_pct;
                snap.scale_power_on = sensors.scale_power_on;
                snap.tower = sensors.tower;
                snap.valves = bank.valves;
                snap.diverter = bank.diverter;
            }
            Err(_) => snap.bridges.gpio = false,
        }

        // Reservoir monitor.
        match self.backend.tank_read().await {
            Ok(tank) => {
                snap.bridges.tank = true;
                snap.reservoir_level_pct = tank.level_pct;
                snap.water_temp_c = tank.temp_c;
            }
            Err(_) => snap.bridges.tank = false,
        }

        // Radio modem liveness (owned by the link service; probe only).
        snap.bridges.lora = self.backend.status(BusChannel::Lora).await.unwrap_or(false);

        snap
    }
}
