//! Exchange, queue and routing-key names plus the records that travel on them.
//!
//! Routing keys follow `sensor.<serial>.<kind>[.<suffix>]`.

use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const EXCHANGE_IOT: &str = "iot";

pub const QUEUE_MEASUREMENTS_STREAM: &str = "sensor.all.measurements.db_writer";
pub const QUEUE_SENSOR_REGISTRY: &str = "sensor.all.registry";
pub const QUEUE_SENSOR_LOGS: &str = "sensor.all.logs";

/// Matches every device when used in place of a serial number.
pub const ANY_SENSOR: &str = "*";

pub const COMMAND_SLEEP: &str = "sleep";
pub const COMMAND_AWAKE: &str = "awake";
pub const COMMAND_CHANGE_SAMPLE_FREQUENCY: &str = "changeSampleFrequency";

/// Parameter carrying the new rate of `changeSampleFrequency`, in Hz.
pub const PARAM_SAMPLE_FREQUENCY: &str = "sampleFrequency";

pub const KNOWN_COMMANDS: [&str; 3] = [COMMAND_SLEEP, COMMAND_AWAKE, COMMAND_CHANGE_SAMPLE_FREQUENCY];

pub const SERIAL_MAX_LEN: usize = 8;

/// Checks that a serial number is one the registry accepts and that it can be
/// placed inside a routing key.
pub fn validate_serial_number(serial_number: &str) -> Result<()> {
    if serial_number.is_empty() {
        return Err(Error::InvalidSerialNumber(
            "serial number cannot be empty".to_string(),
        ));
    }

    if serial_number.chars().count() > SERIAL_MAX_LEN {
        return Err(Error::InvalidSerialNumber(format!(
            "{} is longer than {} characters",
            serial_number, SERIAL_MAX_LEN
        )));
    }

    if !serial_number.chars().any(|c| c.is_ascii_alphabetic()) {
        return Err(Error::InvalidSerialNumber(format!(
            "{} must contain a letter",
            serial_number
        )));
    }

    // '.' '*' '#' are routing key syntax.
    if let Some(c) = serial_number
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
    {
        return Err(Error::InvalidSerialNumber(format!(
            "{} contains invalid character {:?}",
            serial_number, c
        )));
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Measurements,
    Commands,
    Registry,
    Logs,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Measurements => "measurements",
            KeyKind::Commands => "commands",
            KeyKind::Registry => "registry",
            KeyKind::Logs => "logs",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `sensor.<serial>.<kind>`
pub fn sensor_key(serial: &str, kind: KeyKind) -> String {
    format!("sensor.{}.{}", serial, kind)
}

/// `sensor.<serial>.<kind>.<suffix>`
pub fn sensor_key_with(serial: &str, kind: KeyKind, suffix: &str) -> String {
    format!("{}.{}", sensor_key(serial, kind), suffix)
}

/// Binding that catches the bare key and any suffix below it.
pub fn sensor_binding(serial: &str, kind: KeyKind) -> String {
    sensor_key_with(serial, kind, "#")
}

/// Queue a single device reads its commands from.
pub fn sensor_command_queue(serial: &str) -> String {
    sensor_key(serial, KeyKind::Commands)
}

/// Registration published by a device when it boots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRegistration {
    pub serial_number: String,
    pub sample_frequency: f64,
}

/// One sample inside a measurement batch; a batch is a JSON array of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMeasurement {
    #[serde(alias = "SerialNumber")]
    pub serial: String,
    #[serde(alias = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "Value")]
    pub value: f64,
}

/// Operator instruction addressed to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorCommand {
    pub serial_number: String,
    pub timestamp: DateTime<Utc>,
    pub command: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl SensorCommand {
    pub fn new(serial_number: &str, command: &str) -> Self {
        Self {
            serial_number: serial_number.to_string(),
            timestamp: Utc::now(),
            command: command.to_string(),
            params: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(level)
    }
}

/// Log line emitted by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorLog {
    pub serial_number: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}
