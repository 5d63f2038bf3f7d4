//! Hardware abstraction: bridge channels, device types, and the backend trait
//!
//! The bench talks to its field devices through up to six USB-serial bridge
//! channels (`vfd`, `meter`, `scale`, `gpio`, `tank`, `lora`), each speaking
//! line-delimited JSON at 115200 baud: a request carries a `cmd` tag plus
//! typed fields, a response carries `ok` and either `data` or `error`.
//!
//! [`HardwareBackend`] is the single seam between the control plane and the
//! physical world. Two implementations exist: [`SerialBackend`] here (real
//! bridges) and [`crate::sim::Simulator`] (physics model). Controllers hold
//! the backend as a field; nothing does runtime backend lookups.
//!
//! Command dictionary routed through the trait:
//! `MB_READ`/`MB_WRITE` (field-bus frames, routed by address),
//! `VALVE`, `DIVERTER`, `SCALE_READ`, `SCALE_TARE`, `PRESSURE_READ`,
//! `SENSOR_READ`, `TANK_READ`, `TOWER`, `GPIO_SET`, `GPIO_GET`, `STATUS`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Per-command response timeout on a bridge channel.
pub const BRIDGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Field-bus address of the pump drive on the `vfd` bridge.
pub const VFD_ADDR: u8 = 1;
/// Field-bus address of the reference EM flow meter on the `meter` bridge.
pub const EM_ADDR: u8 = 1;
/// Field-bus address of the meter under test on the `meter` bridge.
pub const DUT_ADDR: u8 = 20;

/// Register map of the Delta pump drive.
pub mod vfd_regs {
    pub const REG_CONTROL: u16 = 0x2000;
    pub const REG_FREQ_SETPOINT: u16 = 0x2001;
    pub const REG_STATUS: u16 = 0x2100;
    pub const REG_ACTUAL_FREQ: u16 = 0x2103;
    pub const REG_ACTUAL_CURRENT: u16 = 0x2104;
    pub const REG_FAULT: u16 = 0x2105;

    pub const CMD_RUN_FORWARD: u16 = 0x0001;
    pub const CMD_EMERGENCY_STOP: u16 = 0x0003;
    pub const CMD_NORMAL_STOP: u16 = 0x0005;
}

// ===============================================================================================
// Channels and device identifiers
// ===============================================================================================

/// One of the six serial bridge channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusChannel {
    Vfd,
    Meter,
    Scale,
    Gpio,
    Tank,
    Lora,
}

impl BusChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusChannel::Vfd => "vfd",
            BusChannel::Meter => "meter",
            BusChannel::Scale => "scale",
            BusChannel::Gpio => "gpio",
            BusChannel::Tank => "tank",
            BusChannel::Lora => "lora",
        }
    }
}

impl fmt::Display for BusChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controllable valves on the manifold.
///
/// `Sv1` is the normally-closed main inlet solenoid; `BvL1..L3` are the
/// lane ball valves (1", 3/4", 1/2"); `SvDrain` empties the collection tank
/// back to the reservoir; `BvBypass` recirculates around the test lanes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValveId {
    #[serde(rename = "SV1")]
    Sv1,
    #[serde(rename = "BV-L1")]
    BvL1,
    #[serde(rename = "BV-L2")]
    BvL2,
    #[serde(rename = "BV-L3")]
    BvL3,
    #[serde(rename = "SV-DRN")]
    SvDrain,
    #[serde(rename = "BV-BP")]
    BvBypass,
}

impl ValveId {
    pub const ALL: [ValveId; 6] = [
        ValveId::Sv1,
        ValveId::BvL1,
        ValveId::BvL2,
        ValveId::BvL3,
        ValveId::SvDrain,
        ValveId::BvBypass,
    ];

    /// The mutually-exclusive lane group.
    pub const LANES: [ValveId; 3] = [ValveId::BvL1, ValveId::BvL2, ValveId::BvL3];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValveId::Sv1 => "SV1",
            ValveId::BvL1 => "BV-L1",
            ValveId::BvL2 => "BV-L2",
            ValveId::BvL3 => "BV-L3",
            ValveId::SvDrain => "SV-DRN",
            ValveId::BvBypass => "BV-BP",
        }
    }

    pub fn is_lane(&self) -> bool {
        ValveId::LANES.contains(self)
    }
}

impl fmt::Display for ValveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-way diverter position: to the collection tank or recirculating.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiverterPos {
    Collect,
    #[default]
    Bypass,
}

impl DiverterPos {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiverterPos::Collect => "COLLECT",
            DiverterPos::Bypass => "BYPASS",
        }
    }
}

impl fmt::Display for DiverterPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw tower light channel state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TowerChannels {
    pub red: bool,
    pub yellow: bool,
    pub green: bool,
    pub buzzer: bool,
}

// ===============================================================================================
// Typed readings
// ===============================================================================================

/// Scale bridge reading: tared and raw weight.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScaleReading {
    pub weight_kg: f64,
    pub raw_kg: f64,
}

/// Upstream/downstream line pressure.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PressureReading {
    pub upstream_bar: f64,
    pub downstream_bar: f64,
}

/// GPIO bridge sensors: protection circuit, ambient conditions, and the
/// tower light readback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GpioSensors {
    pub estop_active: bool,
    pub contactor_on: bool,
    pub mcb_on: bool,
    pub atm_temp_c: f64,
    pub atm_humidity_pct: f64,
    pub scale_power_on: bool,
    pub tower: TowerChannels,
}

impl Default for GpioSensors {
    fn default() -> Self {
        Self {
            estop_active: false,
            contactor_on: true,
            mcb_on: true,
            atm_temp_c: 25.0,
            atm_humidity_pct: 55.0,
            scale_power_on: true,
            tower: TowerChannels::default(),
        }
    }
}

/// Reservoir monitor reading.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TankReading {
    pub level_pct: f64,
    pub temp_c: f64,
}

/// Valve and diverter positions as reported by the hardware.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValveBank {
    pub valves: BTreeMap<ValveId, bool>,
    pub diverter: DiverterPos,
}

impl ValveBank {
    pub fn closed() -> Self {
        Self {
            valves: ValveId::ALL.iter().map(|v| (*v, false)).collect(),
            diverter: DiverterPos::Bypass,
        }
    }

    pub fn is_open(&self, valve: ValveId) -> bool {
        self.valves.get(&valve).copied().unwrap_or(false)
    }
}

// ===============================================================================================
// Errors
// ===============================================================================================

/// Bridge I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bridge {0} not connected")]
    NotConnected(BusChannel),
    #[error("timeout waiting for {channel} response to {cmd}")]
    Timeout { channel: BusChannel, cmd: String },
    #[error("protocol error from {channel}: {code}: {message}")]
    Protocol {
        channel: BusChannel,
        code: String,
        message: String,
    },
    #[error("serial I/O on {channel}: {source}")]
    Io {
        channel: BusChannel,
        source: std::io::Error,
    },
}

// ===============================================================================================
// Backend trait
// ===============================================================================================

/// The single seam between controllers and physical hardware.
///
/// Implementations must be safe to call concurrently; each serializes
/// access to its own transport internally.
#[async_trait]
pub trait HardwareBackend: Send + Sync {
    /// Field-bus register read, routed to a bridge channel by address.
    async fn mb_read(&self, channel: BusChannel, addr: u8, reg: u16, count: u8)
        -> Result<Vec<f64>, BusError>;

    /// Field-bus register write.
    async fn mb_write(&self, channel: BusChannel, addr: u8, reg: u16, value: u16)
        -> Result<(), BusError>;

    async fn set_valve(&self, valve: ValveId, open: bool) -> Result<(), BusError>;
    async fn set_diverter(&self, pos: DiverterPos) -> Result<(), BusError>;
    async fn valve_states(&self) -> Result<ValveBank, BusError>;

    async fn scale_read(&self) -> Result<ScaleReading, BusError>;
    async fn scale_tare(&self) -> Result<(), BusError>;
    async fn pressure_read(&self) -> Result<PressureReading, BusError>;
    async fn sensor_read(&self) -> Result<GpioSensors, BusError>;
    async fn tank_read(&self) -> Result<TankReading, BusError>;

    async fn tower(&self, state: TowerChannels) -> Result<(), BusError>;
    async fn gpio_set(&self, pin: &str, value: bool) -> Result<(), BusError>;
    async fn gpio_get(&self, pin: &str) -> Result<bool, BusError>;

    /// Liveness probe for one bridge channel.
    async fn status(&self, channel: BusChannel) -> Result<bool, BusError>;
}

// ===============================================================================================
// Real serial backend
// ===============================================================================================

#[derive(Deserialize)]
struct WireResponse {
    ok: bool,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

struct BridgeConn {
    reader: BufReader<ReadHalf<SerialStream>>,
    writer: WriteHalf<SerialStream>,
}

/// One line-JSON serial bridge.
struct Bridge {
    channel: BusChannel,
    port: String,
    baud: u32,
    conn: Mutex<Option<BridgeConn>>,
}

impl Bridge {
    fn new(channel: BusChannel, port: String, baud: u32) -> Self {
        Self {
            channel,
            port,
            baud,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<(), BusError> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Ok(());
        }
        let stream = tokio_serial::new(&self.port, self.baud)
            .open_native_async()
            .map_err(|e| BusError::Io {
                channel: self.channel,
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;
        let (r, w) = tokio::io::split(stream);
        *conn = Some(BridgeConn {
            reader: BufReader::new(r),
            writer: w,
        });
        info!(channel = %self.channel, port = %self.port, baud = self.baud, "bridge connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let mut conn = self.conn.lock().await;
        if conn.take().is_some() {
            info!(channel = %self.channel, "bridge disconnected");
        }
    }

    /// Send one JSON command line and wait for the JSON response line.
    async fn request(&self, cmd: serde_json::Value) -> Result<serde_json::Value, BusError> {
        let cmd_tag = cmd
            .get("cmd")
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string();
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or(BusError::NotConnected(self.channel))?;

        let mut line = serde_json::to_string(&cmd).expect("command serializes");
        line.push('\n');
        let io_err = |source| BusError::Io {
            channel: self.channel,
            source,
        };
        conn.writer.write_all(line.as_bytes()).await.map_err(io_err)?;
        conn.writer.flush().await.map_err(io_err)?;

        let mut response = String::new();
        let read = tokio::time::timeout(BRIDGE_TIMEOUT, conn.reader.read_line(&mut response)).await;
        match read {
            Err(_) => Err(BusError::Timeout {
                channel: self.channel,
                cmd: cmd_tag,
            }),
            Ok(Err(e)) => {
                // A dead port means reconnect on the next command.
                *guard = None;
                Err(BusError::Io {
                    channel: self.channel,
                    source: e,
                })
            }
            Ok(Ok(0)) => {
                *guard = None;
                Err(BusError::NotConnected(self.channel))
            }
            Ok(Ok(_)) => {
                let parsed: WireResponse =
                    serde_json::from_str(response.trim()).map_err(|e| BusError::Protocol {
                        channel: self.channel,
                        code: "BAD_JSON".into(),
                        message: e.to_string(),
                    })?;
                if parsed.ok {
                    Ok(parsed.data.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(BusError::Protocol {
                        channel: self.channel,
                        code: parsed.error.unwrap_or_else(|| "ERROR".into()),
                        message: parsed.message.unwrap_or_default(),
                    })
                }
            }
        }
    }
}

/// Real hardware backend over the configured bridge channels.
///
/// Channels absent from the port map simply report `NotConnected`; the
/// sensor hub degrades the matching online flag instead of failing the
/// tick.
pub struct SerialBackend {
    bridges: HashMap<BusChannel, Bridge>,
}

impl SerialBackend {
    /// Build from a channel → port-path map (see `BenchConfig::bridge_ports`).
    pub fn new(ports: &HashMap<BusChannel, String>, baud: u32) -> Self {
        let bridges = ports
            .iter()
            .map(|(ch, port)| (*ch, Bridge::new(*ch, port.clone(), baud)))
            .collect();
        Self { bridges }
    }

    /// Open every configured channel, logging failures without aborting.
    pub async fn connect_all(&self) {
        for bridge in self.bridges.values() {
            if let Err(e) = bridge.connect().await {
                warn!(channel = %bridge.channel, error = %e, "bridge connect failed");
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for bridge in self.bridges.values() {
            bridge.disconnect().await;
        }
    }

    fn bridge(&self, channel: BusChannel) -> Result<&Bridge, BusError> {
        self.bridges
            .get(&channel)
            .ok_or(BusError::NotConnected(channel))
    }

    async fn gpio_request(&self, cmd: serde_json::Value) -> Result<serde_json::Value, BusError> {
        self.bridge(BusChannel::Gpio)?.request(cmd).await
    }
}

fn f64_field(data: &serde_json::Value, key: &str) -> f64 {
    data.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

fn bool_field(data: &serde_json::Value, key: &str, default: bool) -> bool {
    data.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

#[async_trait]
impl HardwareBackend for SerialBackend {
    async fn mb_read(
        &self,
        channel: BusChannel,
        addr: u8,
        reg: u16,
        count: u8,
    ) -> Result<Vec<f64>, BusError> {
        let data = self
            .bridge(channel)?
            .request(json!({ "cmd": "MB_READ", "addr": addr, "reg": reg, "count": count }))
            .await?;
        let values = data
            .get("values")
            .and_then(|v| v.as_array())
            .ok_or_else(|| BusError::Protocol {
                channel,
                code: "BAD_DATA".into(),
                message: "MB_READ response missing values".into(),
            })?;
        Ok(values.iter().filter_map(|v| v.as_f64()).collect())
    }

    async fn mb_write(
        &self,
        channel: BusChannel,
        addr: u8,
        reg: u16,
        value: u16,
    ) -> Result<(), BusError> {
        self.bridge(channel)?
            .request(json!({ "cmd": "MB_WRITE", "addr": addr, "reg": reg, "value": value }))
            .await?;
        Ok(())
    }

    async fn set_valve(&self, valve: ValveId, open: bool) -> Result<(), BusError> {
        let action = if open { "OPEN" } else { "CLOSE" };
        debug!(valve = %valve, action, "valve command");
        self.gpio_request(json!({ "cmd": "VALVE", "name": valve.as_str(), "action": action }))
            .await?;
        Ok(())
    }

    async fn set_diverter(&self, pos: DiverterPos) -> Result<(), BusError> {
        self.gpio_request(json!({ "cmd": "DIVERTER", "position": pos.as_str() }))
            .await?;
        Ok(())
    }

    async fn valve_states(&self) -> Result<ValveBank, BusError> {
        let data = self.gpio_request(json!({ "cmd": "STATUS" })).await?;
        let mut bank = ValveBank::closed();
        if let Some(valves) = data.get("valves").and_then(|v| v.as_object()) {
            for valve in ValveId::ALL {
                if let Some(open) = valves.get(valve.as_str()).and_then(|v| v.as_bool()) {
                    bank.valves.insert(valve, open);
                }
            }
        }
        if data.get("diverter").and_then(|v| v.as_str()) == Some("COLLECT") {
            bank.diverter = DiverterPos::Collect;
        }
        Ok(bank)
    }

    async fn scale_read(&self) -> Result<ScaleReading, BusError> {
        let data = self
            .bridge(BusChannel::Scale)?
            .request(json!({ "cmd": "SCALE_READ" }))
            .await?;
        Ok(ScaleReading {
            weight_kg: f64_field(&data, "weight_kg"),
            raw_kg: f64_field(&data, "raw_kg"),
        })
    }

    async fn scale_tare(&self) -> Result<(), BusError> {
        self.bridge(BusChannel::Scale)?
            .request(json!({ "cmd": "SCALE_TARE" }))
            .await?;
        Ok(())
    }

    async fn pressure_read(&self) -> Result<PressureReading, BusError> {
        let data = self
            .bridge(BusChannel::Scale)?
            .request(json!({ "cmd": "PRESSURE_READ" }))
            .await?;
        Ok(PressureReading {
            upstream_bar: f64_field(&data, "upstream_bar"),
            downstream_bar: f64_field(&data, "downstream_bar"),
        })
    }

    async fn sensor_read(&self) -> Result<GpioSensors, BusError> {
        let data = self.gpio_request(json!({ "cmd": "SENSOR_READ" })).await?;
        let tower = data.get("tower").cloned().unwrap_or(serde_json::Value::Null);
        Ok(GpioSensors {
            estop_active: bool_field(&data, "estop", false),
            contactor_on: bool_field(&data, "contactor", true),
            mcb_on: bool_field(&data, "mcb", true),
            atm_temp_c: f64_field(&data, "atm_temp_c"),
            atm_humidity_pct: f64_field(&data, "atm_humidity_pct"),
            scale_power_on: bool_field(&data, "scale_power", true),
            tower: TowerChannels {
                red: bool_field(&tower, "r", false),
                yellow: bool_field(&tower, "y", false),
                green: bool_field(&tower, "g", false),
                buzzer: bool_field(&tower, "buz", false),
            },
        })
    }

    async fn tank_read(&self) -> Result<TankReading, BusError> {
        let data = self
            .bridge(BusChannel::Tank)?
            .request(json!({ "cmd": "TANK_READ" }))
            .await?;
        Ok(TankReading {
            level_pct: f64_field(&data, "level_pct"),
            temp_c: f64_field(&data, "temp_c"),
        })
    }

    async fn tower(&self, state: TowerChannels) -> Result<(), BusError> {
        self.gpio_request(json!({
            "cmd": "TOWER",
            "r": state.red,
            "y": state.yellow,
            "g": state.green,
            "buz": state.buzzer,
        }))
        .await?;
        Ok(())
    }

    async fn gpio_set(&self, pin: &str, value: bool) -> Result<(), BusError> {
        self.gpio_request(json!({ "cmd": "GPIO_SET", "pin": pin, "value": value }))
            .await?;
        Ok(())
    }

    async fn gpio_get(&self, pin: &str) -> Result<bool, BusError> {
        let data = self
            .gpio_request(json!({ "cmd": "GPIO_GET", "pin": pin }))
            .await?;
        Ok(bool_field(&data, "value", false))
    }

    async fn status(&self, channel: BusChannel) -> Result<bool, BusError> {
        let Some(bridge) = self.bridges.get(&channel) else {
            return Ok(false);
        };
        match bridge.request(json!({ "cmd": "STATUS" })).await {
            Ok(_) => Ok(true),
            Err(BusError::NotConnected(_)) | Err(BusError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valve_wire_names_are_stable() {
        assert_eq!(ValveId::Sv1.as_str(), "SV1");
        assert_eq!(ValveId::BvL2.as_str(), "BV-L2");
        assert_eq!(ValveId::SvDrain.as_str(), "SV-DRN");
        assert_eq!(
            serde_json::to_string(&ValveId::BvBypass).unwrap(),
            "\"BV-BP\""
        );
        let parsed: ValveId = serde_json::from_str("\"BV-L1\"").unwrap();
        assert_eq!(parsed, ValveId::BvL1);
    }

    #[test]
    fn lane_membership() {
        assert!(ValveId::BvL1.is_lane());
        assert!(ValveId::BvL3.is_lane());
        assert!(!ValveId::Sv1.is_lane());
        assert!(!ValveId::BvBypass.is_lane());
    }

    #[test]
    fn closed_bank_has_all_valves_shut_and_bypass() {
        let bank = ValveBank::closed();
        assert_eq!(bank.valves.len(), 6);
        assert!(ValveId::ALL.iter().all(|v| !bank.is_open(*v)));
        assert_eq!(bank.diverter, DiverterPos::Bypass);
    }
}
