//! Bench configuration
//!
//! One serde-deserializable [`BenchConfig`] covers every tunable the
//! control plane accepts: hardware backend selection, PID gains, safety
//! limits, the secure-link identity and keys, and the serial port map.
//! Defaults mirror the commissioning values; a JSON file and a small set
//! of environment overrides layer on top. `validate` turns bad input into
//! a structured [`ConfigError`] before anything touches hardware.
//!
//! Environment overrides:
//! - `AQUABENCH_BACKEND`: `real` or `simulator`
//! - `AQUABENCH_AES_KEY`: 64 hex chars
//! - `AQUABENCH_HMAC_KEY`: 64 hex chars
//! - `AQUABENCH_RADIO_PORT`

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::hardware::BusChannel;
use crate::pid::PidSettings;
use crate::protocol::DEVICE_BENCH;
use crate::safety::SafetySettings;

/// Which hardware backend to drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Real,
    Simulator,
}

/// Radio modem attachment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub port: String,
    pub baud: u32,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyLORA".into(),
            baud: 115_200,
        }
    }
}

/// Secure-link key material, hex-encoded.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkKeys {
    pub aes_key_hex: String,
    pub hmac_key_hex: String,
}

impl Default for LinkKeys {
    fn default() -> Self {
        // Placeholder zero keys; deployments provision real ones via file
        // or environment.
        Self {
            aes_key_hex: "00".repeat(32),
            hmac_key_hex: "00".repeat(32),
        }
    }
}

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// The complete bench configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub backend: BackendKind,
    /// This device's identity on the secure link.
    pub device_id: u32,
    pub pid: PidSettings,
    pub safety: SafetySettings,
    pub radio: RadioConfig,
    /// Bridge channel → serial port path.
    pub bridge_ports: HashMap<BusChannel, String>,
    pub bridge_baud: u32,
    pub keys: LinkKeys,
    /// Sensor aggregation cadence, milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        let bridge_ports = [
            (BusChannel::Vfd, "/dev/ttyVFD"),
            (BusChannel::Meter, "/dev/ttyMETER"),
            (BusChannel::Scale, "/dev/ttySCALE"),
            (BusChannel::Gpio, "/dev/ttyGPIO"),
            (BusChannel::Tank, "/dev/ttyTANK"),
        ]
        .into_iter()
        .map(|(ch, port)| (ch, port.to_string()))
        .collect();

        Self {
            backend: BackendKind::Simulator,
            device_id: DEVICE_BENCH,
            pid: PidSettings::default(),
            safety: SafetySettings::default(),
            radio: RadioConfig::default(),
            bridge_ports,
            bridge_baud: 115_200,
            keys: LinkKeys::default(),
            poll_interval_ms: 200,
        }
    }
}

impl BenchConfig {
    /// Load from a JSON file, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: BenchConfig = serde_json::from_str(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Layer the `AQUABENCH_*` environment variables over this config.
    pub fn apply_env(&mut self) {
        if let Ok(backend) = std::env::var("AQUABENCH_BACKEND") {
            match backend.as_str() {
                "real" => self.backend = BackendKind::Real,
                "simulator" => self.backend = BackendKind::Simulator,
                _ => {}
            }
        }
        if let Ok(key) = std::env::var("AQUABENCH_AES_KEY") {
            self.keys.aes_key_hex = key;
        }
        if let Ok(key) = std::env::var("AQUABENCH_HMAC_KEY") {
            self.keys.hmac_key_hex = key;
        }
        if let Ok(port) = std::env::var("AQUABENCH_RADIO_PORT") {
            self.radio.port = port;
        }
    }

    /// Structural validation; every failure names the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.aes_key()?;
        self.hmac_key()?;

        if self.pid.output_min < 0.0 || self.pid.output_min >= self.pid.output_max {
            return Err(invalid(
                "pid.output_min",
                format!(
                    "must satisfy 0 <= min < max, got [{}, {}]",
                    self.pid.output_min, self.pid.output_max
                ),
            ));
        }
        if self.pid.sample_rate_s <= 0.0 {
            return Err(invalid("pid.sample_rate_s", "must be positive"));
        }
        if self.safety.temp_min_c >= self.safety.temp_max_c {
            return Err(invalid("safety.temp_min_c", "min must be below max"));
        }
        if self.safety.stability_count == 0 {
            return Err(invalid("safety.stability_count", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be positive"));
        }
        if self.backend == BackendKind::Real && self.bridge_ports.is_empty() {
            return Err(invalid("bridge_ports", "real backend needs at least one port"));
        }
        Ok(())
    }

    /// Decoded AES key (32 bytes).
    pub fn aes_key(&self) -> Result<Vec<u8>, ConfigError> {
        decode_key("keys.aes_key_hex", &self.keys.aes_key_hex)
    }

    /// Decoded HMAC key (32 bytes).
    pub fn hmac_key(&self) -> Result<Vec<u8>, ConfigError> {
        decode_key("keys.hmac_key_hex", &self.keys.hmac_key_hex)
    }

    /// PID settings with the stability window taken from the safety
    /// section, which owns those two knobs.
    pub fn pid_settings(&self) -> PidSettings {
        PidSettings {
            stability_tolerance_pct: self.safety.flow_stability_pct,
            stability_count: self.safety.stability_count,
            ..self.pid
        }
    }
}

fn decode_key(field: &'static str, hex_str: &str) -> Result<Vec<u8>, ConfigError> {
    let bytes = hex::decode(hex_str).map_err(|e| invalid(field, e.to_string()))?;
    if bytes.len() != 32 {
        return Err(invalid(
            field,
            format!("must decode to 32 bytes, got {}", bytes.len()),
        ));
    }
    Ok(bytes)
}
