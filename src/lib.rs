//! Crate root: the control plane of an ISO 4064 water-meter calibration bench
//!
//! This library drives one physical test bench: it steers water through a
//! manifold of valves, regulates flow to the standardized Q1–Q8 reference
//! points with a PID-controlled pump, measures reference volumes by the
//! gravimetric method, compares the device under test against its
//! maximum-permissible-error envelope, and exchanges authenticated
//! messages with a remote lab over a narrowband radio link.
//!
//! ## Invariants (enforced across the crate)
//!
//! - **Lane exclusion.** At most one of the three lane valves is open at
//!   any time; the valve controller closes siblings in the same
//!   transaction ([`valves`]).
//! - **Pump interlocks.** The pump starts only with reservoir ≥ 70 % and
//!   an open flow path; losing the last path stops it in the same
//!   transaction ([`interlock`]).
//! - **One engine.** Exactly one test execution engine is active per
//!   process ([`engine::EngineRegistry`]).
//! - **Fresh sequences.** Every outbound frame uses a strictly increasing
//!   sequence; receivers reject duplicates and stale timestamps
//!   ([`protocol`]).
//! - **Snapshot immutability.** The sensor hub is the only producer of
//!   [`sensors::SensorSnapshot`]; every other component reads by value.
//!
//! The hardware seam is [`hardware::HardwareBackend`], with the real
//! serial bridges and the [`sim`] physics model as its two
//! implementations. Failure modes are precise, typed errors; the
//! control path never panics.

#![forbid(unsafe_code)]

/// Bench configuration: backend selection, PID gains, safety limits, keys.
pub mod config;
/// AES-256-CBC + HMAC-SHA256 primitives for the lab link.
pub mod crypto;
/// Device-under-test interface (field-bus or manual entry).
pub mod dut;
/// The twelve-state test execution engine and its registry.
pub mod engine;
/// Gravimetric measurement: tare / collect / settle / read / drain.
pub mod gravimetric;
/// Bridge channels, device types, and the hardware backend trait.
pub mod hardware;
/// Manual-control interlocks and the DUT-disconnect guard.
pub mod interlock;
/// Secure link service: typed messages, health, heartbeat, history.
pub mod link;
/// Flow PID controller with anti-windup and stability detection.
pub mod pid;
/// Frame codec, replay protection, and radio fragmentation.
pub mod protocol;
/// Pump / VFD controller.
pub mod pump;
/// Outbound message queue with ACK tracking and offline buffering.
pub mod queue;
/// Per-point results and run summaries.
pub mod report;
/// Rig assembly: every hardware-facing service, wired once at startup.
pub mod rig;
/// The safety watchdog.
pub mod safety;
/// Sensor aggregation into immutable snapshots.
pub mod sensors;
/// Physics simulator backend.
pub mod sim;
/// ISO 4064 standards tables, water density, error math.
pub mod standards;
/// Persistence hooks (trait) and the in-memory store.
pub mod store;
/// Tower light patterns.
pub mod tower;
/// Valve controller with lane mutual exclusion.
pub mod valves;

pub use config::{BackendKind, BenchConfig, ConfigError};
pub use engine::{EngineBusy, EngineHandle, EngineRegistry, EngineReport, TestState};
pub use hardware::{BusChannel, DiverterPos, HardwareBackend, ValveId};
pub use link::{LinkError, LinkHealth, LinkService};
pub use report::{PointResult, RunStatus, RunSummary, TestDescriptor};
pub use rig::Rig;
pub use sensors::{SensorHub, SensorSnapshot};
pub use standards::{MeterClass, MeterSize, QLabel};
pub use store::{MemoryStore, TestStore};
