//! benchd: the bench control-plane daemon
//!
//! Wires the full rig (hardware backend, sensor hub, safety watchdog,
//! actuator controllers), the secure lab link, and the test engine
//! registry, then serves lab commands until interrupted:
//!
//! - `START_TEST`      → starts a calibration run (auto-ACKed)
//! - `EMERGENCY_STOP`  → aborts the active run (auto-ACKed)
//! - `RESULT_REQUEST`  → replays the stored summary for a run
//!
//! Engine progress is pushed back as TEST_STATUS / TEST_RESULT /
//! TEST_COMPLETE.
//!
//! Flags:
//!   --config <path>   JSON configuration file (defaults + env otherwise)
//!
//! Environment: AQUABENCH_BACKEND, AQUABENCH_AES_KEY, AQUABENCH_HMAC_KEY,
//! AQUABENCH_RADIO_PORT (see `config`).

#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aquabench::dut::DutMode;
use aquabench::engine::{EngineReport, EngineRegistry};
use aquabench::link::{self, LinkService, HEARTBEAT_INTERVAL};
use aquabench::report::TestDescriptor;
use aquabench::store::MemoryStore;
use aquabench::{BenchConfig, MeterClass, MeterSize, Rig};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = env::args().collect();
    let config = match parse_flag(&args, "--config") {
        Some(path) => BenchConfig::load(&path)?,
        None => BenchConfig::from_env()?,
    };

    let rig = Rig::build(&config).await?;
    rig.start().await;

    let store = Arc::new(MemoryStore::new());
    let registry = EngineRegistry::new();
    registry.wire_safety(&rig.safety);

    // Radio attachment; a missing modem starts the link in offline mode
    // and the queue buffers until it comes up.
    let (radio_tx, radio_rx, radio_online) =
        match link::serial_radio(&config.radio.port, config.radio.baud) {
            Ok((tx, rx)) => (tx, rx, true),
            Err(e) => {
                warn!(port = %config.radio.port, error = %e, "radio unavailable, link offline");
                let (tx, _parked) = mpsc::channel(64);
                let (_tx_in, rx) = mpsc::channel(64);
                (tx, rx, false)
            }
        };
    let link = LinkService::start(
        config.device_id,
        config.aes_key()?,
        config.hmac_key()?,
        radio_tx,
        radio_rx,
        radio_online,
        Some(HEARTBEAT_INTERVAL),
    );

    // Engine progress → lab.
    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel::<EngineReport>();
    {
        let link = link.clone();
        let hub = rig.hub.clone();
        tokio::spawn(async move {
            while let Some(report) = reports_rx.recv().await {
                match report {
                    EngineReport::StateChanged { test_id, state, q_point } => {
                        let snap = hub.latest();
                        link.send_test_status(
                            test_id,
                            q_point.map(|q| q.as_str()).unwrap_or(""),
                            state.as_str(),
                            snap.flow_rate_lph,
                            snap.pressure_upstream_bar,
                            snap.water_temp_c,
                        );
                    }
                    EngineReport::PointCalculated { test_id, point } => {
                        link.send_test_result(test_id, &point);
                    }
                    EngineReport::RunCompleted(summary) => {
                        link.send_test_complete(&summary);
                    }
                    EngineReport::RunAborted { test_id, reason } => {
                        let snap = hub.latest();
                        link.send_test_status(
                            test_id,
                            "",
                            "EMERGENCY_STOP",
                            snap.flow_rate_lph,
                            snap.pressure_upstream_bar,
                            snap.water_temp_c,
                        );
                        warn!(test_id, reason, "run aborted");
                    }
                    EngineReport::ManualDutNeeded { test_id, q_point, kind } => {
                        info!(
                            test_id,
                            q_point = %q_point,
                            kind = kind.as_str(),
                            "operator entry required on the bench panel"
                        );
                    }
                }
            }
        });
    }

    // Lab → bench commands.
    {
        let rig = rig.clone();
        let store = store.clone();
        let registry = registry.clone();
        let reports_tx = reports_tx.clone();
        link.on_start_test(Box::new(move |message| {
            let aquabench::link::LabMessage::StartTest {
                test_id,
                meter_serial,
                meter_size,
                test_class,
                dut_mode,
            } = message
            else {
                return;
            };
            let size = meter_size
                .as_deref()
                .and_then(MeterSize::parse)
                .unwrap_or(MeterSize::Dn15);
            let class = test_class
                .as_deref()
                .and_then(MeterClass::parse)
                .unwrap_or(MeterClass::B);
            let mode = match dut_mode.as_deref() {
                Some("manual") => DutMode::Manual,
                _ => DutMode::FieldBus,
            };
            let serial = meter_serial.clone().unwrap_or_else(|| format!("TEST-{test_id}"));
            let Some(descriptor) =
                TestDescriptor::from_standards(*test_id, serial, size, class, mode)
            else {
                error!(test_id, "no standards for {size} {class}");
                return;
            };
            match registry.start(rig.clone(), store.clone(), descriptor, reports_tx.clone()) {
                Ok(handle) => info!(test_id = handle.test_id(), "run started from lab"),
                Err(e) => warn!(error = %e, "cannot start run"),
            }
        }));
    }
    {
        let registry = registry.clone();
        link.on_emergency_stop(Box::new(move |message| {
            let aquabench::link::LabMessage::EmergencyStop { reason } = message else {
                return;
            };
            let hit = registry.abort_active(&format!("Lab emergency stop: {reason}"));
            warn!(reason, active = hit, "lab EMERGENCY_STOP");
        }));
    }
    {
        let store = store.clone();
        let link_for_results = link.clone();
        link.on_result_request(Box::new(move |message| {
            let aquabench::link::LabMessage::ResultRequest { test_id } = message else {
                return;
            };
            match store.run(*test_id).and_then(|r| r.summary) {
                Some(summary) => {
                    link_for_results.send_test_complete(&summary);
                }
                None => warn!(test_id, "RESULT_REQUEST for unknown run"),
            }
        }));
    }
    link.on_approval_status(Box::new(|message| {
        info!(?message, "approval status from lab");
    }));

    info!("benchd up; waiting for lab commands (ctrl-c to stop)");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    registry.abort_active("daemon shutdown");
    link.stop();
    rig.shutdown().await;
    Ok(())
}
