//! Test execution engine
//!
//! The twelve-state orchestrator that drives one full calibration cycle
//! across the run's Q-points:
//!
//! ```text
//! IDLE → PRE_CHECK → LINE_SELECT → PUMP_START
//!   per Q-point: FLOW_STABILIZE → TARE_SCALE → MEASURE → CALCULATE
//!                → DRAIN → NEXT_POINT
//! → COMPLETE            (or EMERGENCY_STOP from anywhere)
//! ```
//!
//! Abort discipline: a single abort flag is polled at every cooperative
//! suspension point (≥ 5 Hz) and between states; once set, the next poll
//! unwinds the run into EMERGENCY_STOP. Safety callbacks route every
//! EMERGENCY-severity alarm into that same flag. Manual-DUT waits listen
//! on the same wakeup and impose their own 300 s timeout.
//!
//! Every persistence call is best-effort: a failing store is logged and
//! the physical shutdown path stays reachable.
//!
//! Exactly one engine may be active per process; [`EngineRegistry`]
//! enforces that and is the module's public entry point.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::dut::{DutMode, ReadingKind};
use crate::gravimetric::{Measurement, DRAIN_THRESHOLD_KG, SETTLE_TIME, TARE_TIMEOUT};
use crate::report::{self, PointResult, RunStatus, RunSummary, TestDescriptor};
use crate::rig::Rig;
use crate::safety::SafetyMonitor;
use crate::standards::{QLabel, QPointSpec};
use crate::store::{StoreError, TestStore, TickTrigger};
use crate::tower::LightPattern;

// ===============================================================================================
// Tunables
// ===============================================================================================

/// Bounded retries for tare and DUT reads.
pub const MAX_RETRIES: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Throttle for periodic sensor-tick persistence.
pub const SENSOR_RECORD_INTERVAL: Duration = Duration::from_secs(2);
/// Flow stabilization window; expiry is non-fatal.
pub const FLOW_STABILIZE_TIMEOUT: Duration = Duration::from_secs(120);
/// The drive must confirm rotation within this window.
pub const PUMP_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
/// Drain window; expiry is non-fatal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
/// Operator wait for a manual DUT entry.
pub const MANUAL_DUT_TIMEOUT: Duration = Duration::from_secs(300);
/// Abort-flag polling cadence at suspension points.
pub const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(200);

// ===============================================================================================
// Types
// ===============================================================================================

/// Engine states, in transition order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestState {
    Idle,
    PreCheck,
    LineSelect,
    PumpStart,
    FlowStabilize,
    TareScale,
    Measure,
    Calculate,
    Drain,
    NextPoint,
    Complete,
    EmergencyStop,
}

impl TestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestState::Idle => "IDLE",
            TestState::PreCheck => "PRE_CHECK",
            TestState::LineSelect => "LINE_SELECT",
            TestState::PumpStart => "PUMP_START",
            TestState::FlowStabilize => "FLOW_STABILIZE",
            TestState::TareScale => "TARE_SCALE",
            TestState::Measure => "MEASURE",
            TestState::Calculate => "CALCULATE",
            TestState::Drain => "DRAIN",
            TestState::NextPoint => "NEXT_POINT",
            TestState::Complete => "COMPLETE",
            TestState::EmergencyStop => "EMERGENCY_STOP",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TestState::Complete | TestState::EmergencyStop)
    }
}

/// Internal unwind channel: either the cooperative abort flag fired, or
/// pre-flight validation refused to start the cycle.
#[derive(Debug, thiserror::Error)]
enum EngineError {
    #[error("{0}")]
    AbortRequested(String),
    #[error("{0}")]
    PreCheckFailed(String),
}

/// A second engine was started while one is running.
#[derive(Debug, thiserror::Error)]
#[error("test #{active_test_id} is already running")]
pub struct EngineBusy {
    pub active_test_id: u64,
}

/// Progress events the engine emits; the daemon forwards them to the
/// secure link.
#[derive(Clone, Debug)]
pub enum EngineReport {
    StateChanged {
        test_id: u64,
        state: TestState,
        q_point: Option<QLabel>,
    },
    PointCalculated {
        test_id: u64,
        point: PointResult,
    },
    ManualDutNeeded {
        test_id: u64,
        q_point: QLabel,
        kind: ReadingKind,
    },
    RunCompleted(RunSummary),
    RunAborted {
        test_id: u64,
        reason: String,
    },
}

struct EngineShared {
    abort: Mutex<Option<String>>,
    wake: Notify,
}

impl EngineShared {
    fn request_abort(&self, reason: &str) {
        let mut slot = self.abort.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
        drop(slot);
        self.wake.notify_waiters();
    }
}

/// Handle to a running (or finished) engine.
pub struct EngineHandle {
    descriptor: TestDescriptor,
    shared: Arc<EngineShared>,
    state_rx: watch::Receiver<TestState>,
    store: Arc<dyn TestStore>,
    dut: Arc<crate::dut::DutInterface>,
    current_q: watch::Receiver<Option<QLabel>>,
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("test_id", &self.descriptor.test_id)
            .finish()
    }
}

impl EngineHandle {
    pub fn test_id(&self) -> u64 {
        self.descriptor.test_id
    }

    pub fn state(&self) -> TestState {
        *self.state_rx.borrow()
    }

    pub fn current_q_point(&self) -> Option<QLabel> {
        *self.current_q.borrow()
    }

    pub fn is_running(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TestState> {
        self.state_rx.clone()
    }

    /// Request abort from any task (UI, safety callback, lab command).
    pub fn abort(&self, reason: &str) {
        warn!(test_id = self.test_id(), reason, "abort requested");
        self.shared.request_abort(reason);
    }

    /// Operator entry for a manual-mode DUT reading; wakes the engine's
    /// manual wait.
    pub fn submit_manual_dut(
        &self,
        kind: ReadingKind,
        value: f64,
        entered_by: &str,
    ) -> Result<(), crate::dut::DutSubmitError> {
        self.dut.submit(kind, value)?;
        best_effort(self.store.record_manual_entry(
            self.test_id(),
            self.current_q_point(),
            kind,
            value,
            entered_by,
        ));
        self.shared.wake.notify_waiters();
        Ok(())
    }

    /// Wait for the engine task to finish.
    pub async fn wait(&self) {
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.await;
        } else {
            // Someone else is waiting; fall back to watching the state.
            let mut rx = self.state_rx.clone();
            while !rx.borrow().is_terminal() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

// ===============================================================================================
// Registry
// ===============================================================================================

/// Process-wide singleton enforcing one active engine.
#[derive(Default)]
pub struct EngineRegistry {
    active: Mutex<Option<Arc<EngineHandle>>>,
}

impl EngineRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route EMERGENCY alarms from the watchdog into the active engine.
    pub fn wire_safety(self: &Arc<Self>, safety: &SafetyMonitor) {
        let registry = Arc::downgrade(self);
        safety.on_alarm(Box::new(move |alarm| {
            if alarm.is_emergency() {
                if let Some(registry) = registry.upgrade() {
                    registry.abort_active(&format!("Safety alarm: {}", alarm.message));
                }
            }
        }));
    }

    /// Start a calibration run. Fails with [`EngineBusy`] while another
    /// run is live.
    pub fn start(
        &self,
        rig: Arc<Rig>,
        store: Arc<dyn TestStore>,
        descriptor: TestDescriptor,
        reports: mpsc::UnboundedSender<EngineReport>,
    ) -> Result<Arc<EngineHandle>, EngineBusy> {
        let mut active = self.active.lock().unwrap();
        if let Some(handle) = active.as_ref() {
            if handle.is_running() {
                return Err(EngineBusy {
                    active_test_id: handle.test_id(),
                });
            }
        }

        rig.dut.set_mode(descriptor.dut_mode);

        let shared = Arc::new(EngineShared {
            abort: Mutex::new(None),
            wake: Notify::new(),
        });
        let (state_tx, state_rx) = watch::channel(TestState::Idle);
        let (q_tx, q_rx) = watch::channel(None);

        let engine = TestEngine {
            descriptor: descriptor.clone(),
            rig: rig.clone(),
            store: store.clone(),
            reports,
            shared: shared.clone(),
            state_tx,
            q_tx,
            points: Mutex::new(descriptor.q_points.iter().map(PointResult::planned).collect()),
            last_measurement: Mutex::new(None),
            last_sensor_record: Mutex::new(None),
        };
        let join = tokio::spawn(engine.run());

        let handle = Arc::new(EngineHandle {
            descriptor,
            shared,
            state_rx,
            store,
            dut: rig.dut.clone(),
            current_q: q_rx,
            join: Mutex::new(Some(join)),
        });
        info!(test_id = handle.test_id(), "test engine started");
        *active = Some(handle.clone());
        Ok(handle)
    }

    /// The currently running engine, if any.
    pub fn active(&self) -> Option<Arc<EngineHandle>> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .filter(|h| h.is_running())
            .cloned()
    }

    /// Abort the active engine. Returns whether one was running.
    pub fn abort_active(&self, reason: &str) -> bool {
        match self.active() {
            Some(handle) => {
                handle.abort(reason);
                true
            }
            None => false,
        }
    }
}

fn best_effort(result: Result<(), StoreError>) {
    if let Err(e) = result {
        warn!(error = %e, "persistence call failed (continuing)");
    }
}

// ===============================================================================================
// The engine proper
// ===============================================================================================

struct TestEngine {
    descriptor: TestDescriptor,
    rig: Arc<Rig>,
    store: Arc<dyn TestStore>,
    reports: mpsc::UnboundedSender<EngineReport>,
    shared: Arc<EngineShared>,
    state_tx: watch::Sender<TestState>,
    q_tx: watch::Sender<Option<QLabel>>,
    points: Mutex<Vec<PointResult>>,
    last_measurement: Mutex<Option<Measurement>>,
    last_sensor_record: Mutex<Option<Instant>>,
}

impl TestEngine {
    async fn run(self) {
        let outcome = self.execute().await;
        match outcome {
            Ok(()) => {}
            Err(EngineError::AbortRequested(reason)) => self.emergency_stop(&reason).await,
            Err(EngineError::PreCheckFailed(reason)) => {
                self.emergency_stop(&format!("Pre-check failed: {reason}")).await
            }
        }
        info!(
            test_id = self.descriptor.test_id,
            state = self.state_tx.borrow().as_str(),
            "test engine finished"
        );
    }

    async fn execute(&self) -> Result<(), EngineError> {
        best_effort(self.store.start_run(self.descriptor.test_id));

        self.pre_check().await?;
        self.line_select().await?;
        self.pump_start().await?;

        let q_points = self.descriptor.q_points.clone();
        for (idx, q) in q_points.iter().enumerate() {
            self.q_tx.send_replace(Some(q.q_point));
            self.flow_stabilize(q).await?;
            self.tare_scale(q).await?;
            self.measure(q).await?;
            self.calculate(q).await?;
            self.drain(q).await?;
            self.next_point(idx, &q_points).await?;
        }

        self.complete().await;
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // State handlers
    // -------------------------------------------------------------------------------------------

    async fn pre_check(&self) -> Result<(), EngineError> {
        self.set_state(TestState::PreCheck).await;
        self.check_abort()?;
        let _ = self.rig.tower.set(LightPattern::Testing).await;

        let snap = self.rig.hub.latest();
        if snap.timestamp == 0.0 {
            return Err(EngineError::PreCheckFailed("sensor hub has no data".into()));
        }

        let emergencies: Vec<String> = self
            .rig
            .safety
            .check(&snap)
            .into_iter()
            .filter(|a| a.is_emergency())
            .map(|a| a.message)
            .collect();
        if !emergencies.is_empty() {
            return Err(EngineError::PreCheckFailed(format!(
                "Safety alarms: {}",
                emergencies.join("; ")
            )));
        }

        let pump = self.rig.pump.status().await;
        if pump.faulted() {
            return Err(EngineError::PreCheckFailed(format!(
                "VFD fault code {}",
                pump.fault_code
            )));
        }
        if !pump.connected {
            return Err(EngineError::PreCheckFailed("VFD not connected".into()));
        }

        if self.descriptor.dut_mode == DutMode::FieldBus && !self.rig.dut.is_connected().await {
            return Err(EngineError::PreCheckFailed(
                "DUT meter not responding on field bus".into(),
            ));
        }

        if snap.reservoir_level_pct < 30.0 {
            return Err(EngineError::PreCheckFailed(format!(
                "Reservoir level too low: {:.1}%",
                snap.reservoir_level_pct
            )));
        }

        self.record_sensor_event(None, "pre_check_pass");
        info!(test_id = self.descriptor.test_id, "PRE_CHECK passed");
        Ok(())
    }

    async fn line_select(&self) -> Result<(), EngineError> {
        self.set_state(TestState::LineSelect).await;
        self.check_abort()?;

        let lane = self
            .rig
            .valves
            .select_lane(self.descriptor.size)
            .await
            .map_err(|e| {
                EngineError::AbortRequested(format!(
                    "Failed to select lane for {}: {e}",
                    self.descriptor.size
                ))
            })?;
        self.rig
            .valves
            .open(crate::hardware::ValveId::Sv1)
            .await
            .map_err(|e| EngineError::AbortRequested(format!("Failed to open main inlet: {e}")))?;
        self.rig
            .valves
            .set_diverter(crate::hardware::DiverterPos::Bypass)
            .await
            .map_err(|e| EngineError::AbortRequested(format!("Failed to set diverter: {e}")))?;

        info!(
            test_id = self.descriptor.test_id,
            lane = %lane,
            "LINE_SELECT complete, SV1 open, diverter BYPASS"
        );
        Ok(())
    }

    async fn pump_start(&self) -> Result<(), EngineError> {
        self.set_state(TestState::PumpStart).await;
        self.check_abort()?;

        let floor_hz = self.rig.pid.settings().output_min;
        self.rig
            .pump
            .start(floor_hz)
            .await
            .map_err(|e| EngineError::AbortRequested(format!("VFD start command failed: {e}")))?;

        let deadline = Instant::now() + PUMP_CONFIRM_TIMEOUT;
        loop {
            self.check_abort()?;
            let status = self.rig.pump.status().await;
            if status.running && status.frequency_hz > 0.0 {
                info!(
                    test_id = self.descriptor.test_id,
                    frequency_hz = status.frequency_hz,
                    "PUMP_START confirmed"
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::AbortRequested(
                    "VFD did not confirm running within timeout".into(),
                ));
            }
            tokio::time::sleep(ABORT_CHECK_INTERVAL).await;
        }
    }

    async fn flow_stabilize(&self, q: &QPointSpec) -> Result<(), EngineError> {
        self.set_state(TestState::FlowStabilize).await;
        let _ = self.rig.tower.set(LightPattern::Stabilizing).await;

        self.rig.pid.reset();
        self.rig.pid.set_target(q.flow_rate_lph);
        self.rig.pid.enable();

        let deadline = Instant::now() + FLOW_STABILIZE_TIMEOUT;
        while Instant::now() < deadline {
            self.check_abort()?;

            let snap = self.rig.hub.latest();
            let output_hz = self.rig.pid.compute(snap.flow_rate_lph);
            let _ = self.rig.pump.set_frequency(output_hz).await;
            self.maybe_record_sensor(Some(q.q_point));

            if self.rig.pid.is_stable() {
                info!(
                    test_id = self.descriptor.test_id,
                    q_point = %q.q_point,
                    flow_lph = snap.flow_rate_lph,
                    target_lph = q.flow_rate_lph,
                    "flow stable"
                );
                let _ = self.rig.tower.set(LightPattern::Testing).await;
                return Ok(());
            }
            tokio::time::sleep(ABORT_CHECK_INTERVAL).await;
        }

        // Non-fatal: proceed and let MEASURE average out the flow.
        warn!(
            test_id = self.descriptor.test_id,
            q_point = %q.q_point,
            "FLOW_STABILIZE timeout"
        );
        let _ = self.rig.tower.set(LightPattern::Testing).await;
        Ok(())
    }

    async fn tare_scale(&self, q: &QPointSpec) -> Result<(), EngineError> {
        self.set_state(TestState::TareScale).await;
        self.check_abort()?;

        let _ = self
            .rig
            .valves
            .set_diverter(crate::hardware::DiverterPos::Bypass)
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.check_abort()?;
            match self.rig.gravimetric.tare(TARE_TIMEOUT).await {
                Ok(()) => break,
                Err(e) if attempt < MAX_RETRIES => {
                    warn!(
                        attempt,
                        max = MAX_RETRIES,
                        error = %e,
                        "scale tare failed, retrying"
                    );
                    self.sleep_checked(RETRY_DELAY).await?;
                }
                Err(e) => {
                    return Err(EngineError::AbortRequested(format!(
                        "Scale tare failed after {MAX_RETRIES} attempts: {e}"
                    )));
                }
            }
        }

        self.record_sensor_event(Some(q.q_point), "tare_complete");
        info!(test_id = self.descriptor.test_id, q_point = %q.q_point, "TARE complete");
        Ok(())
    }

    async fn measure(&self, q: &QPointSpec) -> Result<(), EngineError> {
        self.set_state(TestState::Measure).await;
        self.check_abort()?;

        self.rig.dut.reset();
        self.read_dut(ReadingKind::Before, q).await?;

        self.record_sensor_event(Some(q.q_point), "collect_start");
        self.rig
            .gravimetric
            .start_collection()
            .await
            .map_err(|e| EngineError::AbortRequested(format!("Failed to start collection: {e}")))?;

        // Collect until the scale carries the target volume's mass, with
        // a generous time ceiling.
        let target_weight_kg = q.test_volume_l * 0.998;
        let deadline = Instant::now() + Duration::from_secs(u64::from(q.duration_s) * 2);
        while Instant::now() < deadline {
            self.check_abort()?;
            let snap = self.rig.hub.latest();
            self.maybe_record_sensor(Some(q.q_point));

            let output_hz = self.rig.pid.compute(snap.flow_rate_lph);
            let _ = self.rig.pump.set_frequency(output_hz).await;

            if snap.weight_kg >= target_weight_kg {
                break;
            }
            tokio::time::sleep(ABORT_CHECK_INTERVAL).await;
        }

        // The after reading is taken at the diverter switch, before the
        // settle pause, so the DUT window matches the collected window.
        self.read_dut(ReadingKind::After, q).await?;

        match self.rig.gravimetric.stop_and_measure(SETTLE_TIME).await {
            Ok(measurement) => {
                *self.last_measurement.lock().unwrap() = Some(measurement);
            }
            Err(e) => {
                // CALCULATE will log the missing measurement; the run
                // itself carries on.
                error!(q_point = %q.q_point, error = %e, "gravimetric measurement failed");
                *self.last_measurement.lock().unwrap() = None;
            }
        }

        self.record_sensor_event(Some(q.q_point), "collect_end");
        Ok(())
    }

    async fn calculate(&self, q: &QPointSpec) -> Result<(), EngineError> {
        self.set_state(TestState::Calculate).await;
        self.check_abort()?;

        let measurement = *self.last_measurement.lock().unwrap();
        let Some(measurement) = measurement else {
            error!(q_point = %q.q_point, "no gravimetric result to calculate from");
            return Ok(());
        };
        let dut_volume = self.rig.dut.volume_l();
        let snap = self.rig.hub.latest();

        match report::calculate_point(
            q,
            &measurement,
            dut_volume,
            snap.pressure_upstream_bar,
            snap.pressure_downstream_bar,
        ) {
            Ok(point) => {
                info!(
                    test_id = self.descriptor.test_id,
                    q_point = %q.q_point,
                    error_pct = point.error_pct.unwrap_or(0.0),
                    mpe_pct = point.mpe_pct,
                    passed = point.passed.unwrap_or(false),
                    "point calculated"
                );
                {
                    let mut points = self.points.lock().unwrap();
                    if let Some(slot) = points.iter_mut().find(|p| p.q_point == q.q_point) {
                        *slot = point.clone();
                    }
                }
                best_effort(self.store.record_point(self.descriptor.test_id, &point));
                let _ = self.reports.send(EngineReport::PointCalculated {
                    test_id: self.descriptor.test_id,
                    point,
                });
            }
            Err(e) => {
                error!(q_point = %q.q_point, error = %e, "measurement validation failed");
            }
        }
        Ok(())
    }

    async fn drain(&self, q: &QPointSpec) -> Result<(), EngineError> {
        self.set_state(TestState::Drain).await;
        self.check_abort()?;
        let _ = self.rig.tower.set(LightPattern::Draining).await;

        self.rig.pid.disable();
        let _ = self
            .rig
            .pump
            .set_frequency(self.rig.pid.settings().output_min)
            .await;

        match self
            .rig
            .gravimetric
            .drain(DRAIN_TIMEOUT, DRAIN_THRESHOLD_KG)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(q_point = %q.q_point, "DRAIN timeout"),
            Err(e) => warn!(q_point = %q.q_point, error = %e, "DRAIN failed"),
        }

        let _ = self.rig.tower.set(LightPattern::Testing).await;
        Ok(())
    }

    async fn next_point(&self, idx: usize, q_points: &[QPointSpec]) -> Result<(), EngineError> {
        self.set_state(TestState::NextPoint).await;
        self.check_abort()?;
        if let Some(next) = q_points.get(idx + 1) {
            info!(
                test_id = self.descriptor.test_id,
                from = %q_points[idx].q_point,
                to = %next.q_point,
                "advancing to next Q-point"
            );
        }
        Ok(())
    }

    async fn complete(&self) {
        self.set_state(TestState::Complete).await;

        self.rig.pid.disable();
        let _ = self.rig.pump.stop().await;
        let _ = self.rig.valves.close_all().await;

        let points = self.points.lock().unwrap().clone();
        let mut summary = report::summarize(&self.descriptor, RunStatus::Completed, &points);

        if summary.overall_pass == Some(true) {
            match self.store.issue_certificate(self.descriptor.test_id) {
                Ok(number) => {
                    info!(
                        test_id = self.descriptor.test_id,
                        certificate = %number,
                        "test COMPLETE: PASS"
                    );
                    summary.certificate_number = Some(number);
                }
                Err(e) => warn!(error = %e, "certificate issue failed"),
            }
            let _ = self.rig.tower.set(LightPattern::TestPass).await;
        } else {
            info!(test_id = self.descriptor.test_id, "test COMPLETE: FAIL");
            let _ = self.rig.tower.set(LightPattern::TestFail).await;
        }

        best_effort(self.store.complete_run(self.descriptor.test_id, &summary));
        self.record_sensor_event(None, "test_complete");
        let _ = self.reports.send(EngineReport::RunCompleted(summary));
    }

    async fn emergency_stop(&self, reason: &str) {
        self.set_state(TestState::EmergencyStop).await;
        error!(
            test_id = self.descriptor.test_id,
            reason, "EMERGENCY_STOP"
        );

        self.rig.emergency_stop().await;
        best_effort(self.store.abort_run(self.descriptor.test_id, reason));
        let _ = self.reports.send(EngineReport::RunAborted {
            test_id: self.descriptor.test_id,
            reason: reason.to_string(),
        });
    }

    // -------------------------------------------------------------------------------------------
    // DUT reads
    // -------------------------------------------------------------------------------------------

    async fn read_dut(&self, kind: ReadingKind, q: &QPointSpec) -> Result<(), EngineError> {
        match self.descriptor.dut_mode {
            DutMode::FieldBus => {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    self.check_abort()?;
                    let value = match kind {
                        ReadingKind::Before => self.rig.dut.read_before().await,
                        ReadingKind::After => self.rig.dut.read_after().await,
                    };
                    if value.is_some() {
                        return Ok(());
                    }
                    if attempt >= MAX_RETRIES {
                        return Err(EngineError::AbortRequested(format!(
                            "DUT {} reading failed for {}",
                            kind.as_str(),
                            q.q_point
                        )));
                    }
                    warn!(
                        attempt,
                        kind = kind.as_str(),
                        "DUT read failed, retrying"
                    );
                    self.sleep_checked(RETRY_DELAY).await?;
                }
            }
            DutMode::Manual => self.wait_manual_dut(kind, q).await,
        }
    }

    /// Block until the operator submits a manual reading, the run aborts,
    /// or the manual-entry window lapses.
    async fn wait_manual_dut(&self, kind: ReadingKind, q: &QPointSpec) -> Result<(), EngineError> {
        // Puts the interface into the matching WAITING state.
        let _ = match kind {
            ReadingKind::Before => self.rig.dut.read_before().await,
            ReadingKind::After => self.rig.dut.read_after().await,
        };
        let _ = self.reports.send(EngineReport::ManualDutNeeded {
            test_id: self.descriptor.test_id,
            q_point: q.q_point,
            kind,
        });
        info!(
            test_id = self.descriptor.test_id,
            q_point = %q.q_point,
            kind = kind.as_str(),
            "waiting for manual DUT entry"
        );

        let wanted = match kind {
            ReadingKind::Before => crate::dut::DutState::Measuring,
            ReadingKind::After => crate::dut::DutState::Complete,
        };
        let deadline = Instant::now() + MANUAL_DUT_TIMEOUT;
        loop {
            self.check_abort()?;
            if self.rig.dut.state() == wanted {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::AbortRequested(format!(
                    "Manual DUT {} timeout for {}",
                    kind.as_str(),
                    q.q_point
                )));
            }
            let _ = tokio::time::timeout(ABORT_CHECK_INTERVAL, self.shared.wake.notified()).await;
        }
    }

    // -------------------------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------------------------

    async fn set_state(&self, state: TestState) {
        self.state_tx.send_replace(state);
        let q_point = *self.q_tx.borrow();
        best_effort(
            self.store
                .update_state(self.descriptor.test_id, q_point, state.as_str()),
        );
        let _ = self.reports.send(EngineReport::StateChanged {
            test_id: self.descriptor.test_id,
            state,
            q_point,
        });
    }

    fn check_abort(&self) -> Result<(), EngineError> {
        if let Some(reason) = self.shared.abort.lock().unwrap().clone() {
            return Err(EngineError::AbortRequested(reason));
        }
        Ok(())
    }

    /// Sleep in abort-poll sized slices.
    async fn sleep_checked(&self, duration: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.check_abort()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(remaining.min(ABORT_CHECK_INTERVAL)).await;
        }
        self.check_abort()
    }

    fn record_sensor_event(&self, q_point: Option<QLabel>, label: &str) {
        let snap = self.rig.hub.latest();
        best_effort(self.store.record_sensor_tick(
            self.descriptor.test_id,
            &snap,
            q_point,
            TickTrigger::Event,
            label,
        ));
        *self.last_sensor_record.lock().unwrap() = Some(Instant::now());
    }

    fn maybe_record_sensor(&self, q_point: Option<QLabel>) {
        let due = {
            let last = self.last_sensor_record.lock().unwrap();
            last.map_or(true, |t| t.elapsed() >= SENSOR_RECORD_INTERVAL)
        };
        if due {
            let snap = self.rig.hub.latest();
            best_effort(self.store.record_sensor_tick(
                self.descriptor.test_id,
                &snap,
                q_point,
                TickTrigger::Periodic,
                "",
            ));
            *self.last_sensor_record.lock().unwrap() = Some(Instant::now());
        }
    }
}

// ===============================================================================================
// Tests
// ===============================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchConfig;
    use crate::standards::{MeterClass, MeterSize, Zone};
    use crate::store::MemoryStore;

    /// A short two-point plan so the end-to-end cycle stays tight.
    fn two_point_plan(dut_mode: DutMode) -> TestDescriptor {
        TestDescriptor {
            test_id: 42,
            meter_serial: "WM-2042".into(),
            size: MeterSize::Dn15,
            class: MeterClass::B,
            dut_mode,
            q_points: vec![
                QPointSpec {
                    q_point: QLabel::Q1,
                    flow_rate_lph: 500.0,
                    test_volume_l: 2.0,
                    duration_s: 20,
                    mpe_pct: 5.0,
                    zone: Zone::Lower,
                },
                QPointSpec {
                    q_point: QLabel::Q2,
                    flow_rate_lph: 1000.0,
                    test_volume_l: 2.0,
                    duration_s: 10,
                    mpe_pct: 2.0,
                    zone: Zone::Upper,
                },
            ],
        }
    }

    struct TestBench {
        rig: Arc<Rig>,
        store: Arc<MemoryStore>,
        registry: Arc<EngineRegistry>,
        reports: mpsc::UnboundedReceiver<EngineReport>,
        reports_tx: mpsc::UnboundedSender<EngineReport>,
    }

    async fn bench(reservoir_pct: f64, dut_error_pct: Option<f64>) -> TestBench {
        let config = BenchConfig::default();
        let rig = Rig::build(&config).await.unwrap();
        let sim = rig.simulator.as_ref().unwrap();
        sim.set_noise(false);
        sim.set_reservoir_level(reservoir_pct);
        if let Some(err) = dut_error_pct {
            sim.connect_dut(err);
        }
        rig.start().await;
        tokio::time::advance(Duration::from_millis(450)).await;

        let registry = EngineRegistry::new();
        registry.wire_safety(&rig.safety);
        let (reports_tx, reports) = mpsc::unbounded_channel();
        TestBench {
            rig,
            store: Arc::new(MemoryStore::new()),
            registry,
            reports,
            reports_tx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_field_bus_dut() {
        let mut b = bench(85.0, Some(1.5)).await;
        let handle = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap();

        handle.wait().await;
        assert_eq!(handle.state(), TestState::Complete);

        let record = b.store.run(42).unwrap();
        assert_eq!(record.status, Some(RunStatus::Completed));
        let summary = record.summary.unwrap();
        assert_eq!(summary.overall_pass, Some(true));
        assert_eq!(summary.completed_points, 2);
        assert!(summary.certificate_number.unwrap().starts_with("CAL-"));

        for point in &summary.points {
            let ref_v = point.ref_volume_l.unwrap();
            let dut_v = point.dut_volume_l.unwrap();
            let err = point.error_pct.unwrap();
            assert!(ref_v > 0.0);
            assert!(dut_v > ref_v, "DUT runs fast by construction");
            assert!(err.abs() < point.mpe_pct, "{}: err {err}", point.q_point);
            assert_eq!(point.passed, Some(true));
        }

        // Bench parked: pump stopped, valves closed.
        let sim = b.rig.simulator.as_ref().unwrap();
        assert!(!sim.with_state(|s| s.vfd_running));
        let bank = b.rig.valves.states().await;
        assert!(bank.valves.values().all(|open| !open));

        // Reports include per-point results and the final summary.
        let mut saw_point = 0;
        let mut saw_complete = false;
        while let Ok(report) = b.reports.try_recv() {
            match report {
                EngineReport::PointCalculated { .. } => saw_point += 1,
                EngineReport::RunCompleted(_) => saw_complete = true,
                _ => {}
            }
        }
        assert_eq!(saw_point, 2);
        assert!(saw_complete);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_run_abort_unwinds_to_emergency_stop() {
        let b = bench(85.0, Some(1.5)).await;
        let handle = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap();

        let mut states = handle.subscribe();
        while *states.borrow() != TestState::FlowStabilize {
            states.changed().await.unwrap();
        }
        assert!(b.registry.abort_active("operator request"));

        tokio::time::timeout(Duration::from_secs(15), handle.wait())
            .await
            .expect("engine must unwind within 15 s");
        assert_eq!(handle.state(), TestState::EmergencyStop);

        let record = b.store.run(42).unwrap();
        assert_eq!(record.status, Some(RunStatus::Aborted));
        assert!(record.abort_reason.unwrap().contains("operator"));

        let sim = b.rig.simulator.as_ref().unwrap();
        assert!(!sim.with_state(|s| s.vfd_running));
        assert_eq!(sim.with_state(|s| s.vfd_actual_freq), 0.0);
        let bank = b.rig.valves.states().await;
        assert!(bank.valves.values().all(|open| !open));
    }

    #[tokio::test(start_paused = true)]
    async fn pre_check_fails_on_low_reservoir() {
        let b = bench(20.0, Some(1.5)).await;
        let handle = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap();

        handle.wait().await;
        assert_eq!(handle.state(), TestState::EmergencyStop);
        let record = b.store.run(42).unwrap();
        assert_eq!(record.status, Some(RunStatus::Aborted));
        assert!(record.abort_reason.unwrap().contains("Reservoir"));
    }

    #[tokio::test(start_paused = true)]
    async fn pre_check_fails_without_dut_in_field_bus_mode() {
        let b = bench(85.0, None).await;
        let handle = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap();
        handle.wait().await;
        assert_eq!(handle.state(), TestState::EmergencyStop);
        let record = b.store.run(42).unwrap();
        assert!(record.abort_reason.unwrap().contains("DUT"));
    }

    #[tokio::test(start_paused = true)]
    async fn tare_retries_then_succeeds_or_aborts() {
        // Two failures: the retry helper absorbs them.
        let b = bench(85.0, Some(1.0)).await;
        b.rig.simulator.as_ref().unwrap().inject_tare_failures(2);
        let handle = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap();
        handle.wait().await;
        assert_eq!(handle.state(), TestState::Complete);

        // Three failures: the first point's tare exhausts its retries.
        let b = bench(85.0, Some(1.0)).await;
        b.rig.simulator.as_ref().unwrap().inject_tare_failures(3);
        let handle = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap();
        handle.wait().await;
        assert_eq!(handle.state(), TestState::EmergencyStop);
        let record = b.store.run(42).unwrap();
        assert!(record.abort_reason.unwrap().to_lowercase().contains("tare"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_dut_round_trip() {
        let mut b = bench(85.0, None).await;
        // Manual mode skips the field-bus DUT pre-check.
        let handle = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                TestDescriptor {
                    q_points: two_point_plan(DutMode::Manual).q_points[..1].to_vec(),
                    ..two_point_plan(DutMode::Manual)
                },
                b.reports_tx.clone(),
            )
            .unwrap();

        // Answer each manual request as it arrives.
        let mut before_done = false;
        loop {
            match b.reports.recv().await.expect("engine reports") {
                EngineReport::ManualDutNeeded { kind, .. } => match kind {
                    ReadingKind::Before => {
                        handle
                            .submit_manual_dut(ReadingKind::Before, 100.0, "operator")
                            .unwrap();
                        before_done = true;
                    }
                    ReadingKind::After => {
                        assert!(before_done);
                        handle
                            .submit_manual_dut(ReadingKind::After, 102.01, "operator")
                            .unwrap();
                    }
                },
                EngineReport::RunCompleted(summary) => {
                    assert_eq!(summary.completed_points, 1);
                    let point = &summary.points[0];
                    assert!((point.dut_volume_l.unwrap() - 2.01).abs() < 1e-9);
                    break;
                }
                EngineReport::RunAborted { reason, .. } => panic!("aborted: {reason}"),
                _ => {}
            }
        }
        handle.wait().await;
        assert_eq!(handle.state(), TestState::Complete);

        let record = b.store.run(42).unwrap();
        assert_eq!(record.manual_entries.len(), 2);
        assert_eq!(record.manual_entries[0].entered_by, "operator");
    }

    #[tokio::test(start_paused = true)]
    async fn second_engine_is_rejected_while_running() {
        let b = bench(85.0, Some(1.5)).await;
        let handle = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap();

        let err = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap_err();
        assert_eq!(err.active_test_id, 42);
        assert!(b.registry.active().is_some());

        handle.wait().await;
        assert!(b.registry.active().is_none());

        // A finished engine frees the slot.
        b.registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_alarm_aborts_the_active_run() {
        let b = bench(85.0, Some(1.5)).await;
        let handle = b
            .registry
            .start(
                b.rig.clone(),
                b.store.clone(),
                two_point_plan(DutMode::FieldBus),
                b.reports_tx.clone(),
            )
            .unwrap();

        let mut states = handle.subscribe();
        while *states.borrow() != TestState::FlowStabilize {
            states.changed().await.unwrap();
        }
        b.rig.simulator.as_ref().unwrap().trigger_estop();

        tokio::time::timeout(Duration::from_secs(15), handle.wait())
            .await
            .expect("safety abort must unwind the engine");
        assert_eq!(handle.state(), TestState::EmergencyStop);
        let record = b.store.run(42).unwrap();
        assert!(record.abort_reason.unwrap().contains("Safety alarm"));
    }
}
