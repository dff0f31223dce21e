//! SEL temperature instrument reader.
//!
//! The instrument emits one line per reading with one `Cnn=dddd.dddd` item
//! per channel. A disconnected channel reports [`DISCONNECTED_VALUE`], which
//! becomes NaN in the telemetry (and `null` on the wire).

use chrono::Utc;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

use crate::device::SensorDevice;
use crate::error::Result;
use crate::protocol::DISCONNECTED_VALUE;
use crate::response::ResponseCode;

/// One telemetry reading: `[name, timestamp, error_code, value_1, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub name: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub error_code: ResponseCode,
    pub values: Vec<f64>,
}

impl Serialize for TelemetryRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3 + self.values.len()))?;
        seq.serialize_element(&self.name)?;
        seq.serialize_element(&self.timestamp)?;
        seq.serialize_element(&self.error_code)?;
        for value in &self.values {
            if value.is_nan() {
                seq.serialize_element(&Option::<f64>::None)?;
            } else {
                seq.serialize_element(value)?;
            }
        }
        seq.end()
    }
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Parse one SEL line into `channels` values.
///
/// Returns `None` when the line does not hold exactly `channels` well-formed
/// items.
pub fn parse_line(line: &str, channels: usize) -> Option<Vec<f64>> {
    let items: Vec<&str> = line.trim().split(',').collect();
    if items.len() != channels {
        return None;
    }
    items
        .into_iter()
        .map(|item| {
            let (channel, value) = item.trim().split_once('=')?;
            if !channel.starts_with('C') {
                return None;
            }
            if value == DISCONNECTED_VALUE {
                return Some(f64::NAN);
            }
            value.parse::<f64>().ok()
        })
        .collect()
}

/// Build the telemetry record for a raw line.
pub fn telemetry_from_line(name: &str, channels: usize, line: &str) -> TelemetryRecord {
    let (error_code, values) = match parse_line(line, channels) {
        Some(values) => (ResponseCode::Ok, values),
        None => (ResponseCode::DeviceReadError, vec![f64::NAN; channels]),
    };
    TelemetryRecord {
        name: name.to_string(),
        timestamp: now_seconds(),
        error_code,
        values,
    }
}

/// A telemetry record for a failed read.
pub fn read_error_record(name: &str, channels: usize) -> TelemetryRecord {
    TelemetryRecord {
        name: name.to_string(),
        timestamp: now_seconds(),
        error_code: ResponseCode::DeviceReadError,
        values: vec![f64::NAN; channels],
    }
}

/// Reads SEL temperature telemetry from a device.
pub struct SelTemperature {
    name: String,
    channels: usize,
    device: Box<dyn SensorDevice>,
}

impl SelTemperature {
    pub fn new(name: impl Into<String>, channels: usize, device: Box<dyn SensorDevice>) -> Self {
        Self {
            name: name.into(),
            channels,
            device,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub async fn start(&mut self) -> Result<()> {
        self.device.open().await
    }

    /// Read and parse one line.
    pub async fn read(&mut self) -> Result<TelemetryRecord> {
        let line = self.device.read_line().await?;
        Ok(telemetry_from_line(&self.name, self.channels, &line))
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.device.close().await
    }
}
