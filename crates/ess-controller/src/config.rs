//! Device configuration and its validation.
//!
//! A configuration is a JSON object with exactly one key, `devices`, holding
//! a non-empty list of device configurations:
//!
//! ```json
//! {"devices": [{"name": "Test", "channels": 4, "type": "FTDI", "ftdi_id": "ABC"}]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;
use crate::protocol::{key, DeviceType, SensorType};

/// Most channels a single device may declare.
pub const MAX_CHANNELS: usize = 64;

/// Configuration of one sensor device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub channels: usize,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftdi_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    #[serde(default)]
    pub sensor_type: SensorType,
}

/// A validated controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub devices: Vec<DeviceConfig>,
}

impl Configuration {
    /// Validate a raw configuration and convert it.
    pub fn from_value(configuration: &Value) -> Result<Self, CommandError> {
        validate_configuration(configuration)?;
        serde_json::from_value(configuration.clone())
            .map_err(|e| CommandError::invalid_configuration(format!("Invalid configuration: {e}")))
    }
}

/// Check a raw configuration against the controller's rules.
pub fn validate_configuration(configuration: &Value) -> Result<(), CommandError> {
    let Some(object) = configuration.as_object() else {
        return Err(CommandError::invalid_configuration(
            "The configuration must be an object.",
        ));
    };
    if !object.contains_key(key::DEVICES) {
        return Err(CommandError::invalid_configuration(format!(
            "Missing configuration key {}.",
            key::DEVICES
        )));
    }
    if object.len() != 1 {
        return Err(CommandError::invalid_configuration(format!(
            "Expected one configuration key but got {}.",
            object.len()
        )));
    }

    let devices = match &object[key::DEVICES] {
        Value::Array(devices) if !devices.is_empty() => devices,
        Value::Array(_) | Value::Null => {
            return Err(CommandError::invalid_configuration(format!(
                "The configuration data for key {} is missing.",
                key::DEVICES
            )))
        }
        _ => {
            return Err(CommandError::invalid_configuration(format!(
                "The value for key {} must be a list.",
                key::DEVICES
            )))
        }
    };

    for device in devices {
        validate_device_configuration(device)?;
    }
    Ok(())
}

/// Check one device configuration.
pub fn validate_device_configuration(device: &Value) -> Result<(), CommandError> {
    let mandatory = || {
        CommandError::invalid_configuration(format!(
            "The configuration keys {}, {} and {} are mandatory.",
            key::NAME,
            key::CHANNELS,
            key::TYPE
        ))
    };
    let Some(device) = device.as_object() else {
        return Err(mandatory());
    };
    if ![key::NAME, key::CHANNELS, key::TYPE]
        .iter()
        .all(|k| device.contains_key(*k))
    {
        return Err(mandatory());
    }

    if !device[key::CHANNELS]
        .as_u64()
        .is_some_and(|c| (1..=MAX_CHANNELS as u64).contains(&c))
    {
        return Err(CommandError::invalid_configuration(format!(
            "The value for key {} must be a positive integer of at most {}.",
            key::CHANNELS,
            MAX_CHANNELS
        )));
    }

    let device_type = match device[key::TYPE].as_str() {
        Some("FTDI") => DeviceType::Ftdi,
        Some("Serial") => DeviceType::Serial,
        _ => {
            return Err(CommandError::invalid_configuration(format!(
                "The value for key {} must be either {} or {}",
                key::TYPE,
                DeviceType::Ftdi,
                DeviceType::Serial
            )))
        }
    };

    let required = match device_type {
        DeviceType::Ftdi => key::FTDI_ID,
        DeviceType::Serial => key::SERIAL_PORT,
    };
    if !device.contains_key(required) {
        return Err(CommandError::invalid_configuration(format!(
            "Missing configuration key {} for device of type {}",
            required, device_type
        )));
    }
    Ok(())
}
