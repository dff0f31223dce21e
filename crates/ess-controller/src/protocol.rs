//! Wire protocol constants shared by the socket server and command handler.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Value emitted by a disconnected temperature channel.
pub const DISCONNECTED_VALUE: &str = "9999.9990";

/// Range (deg C) of the random temperatures produced by the mock sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockTemperatureRange {
    pub min: f64,
    pub max: f64,
}

pub const MOCK_TEMPERATURE: MockTemperatureRange = MockTemperatureRange {
    min: 18.0,
    max: 30.0,
};

/// Commands accepted by the socket server and command handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Configure,
    Disconnect,
    Exit,
    Start,
    Stop,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Configure => "configure",
            Command::Disconnect => "disconnect",
            Command::Exit => "exit",
            Command::Start => "start",
            Command::Stop => "stop",
        }
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configure" => Ok(Command::Configure),
            "disconnect" => Ok(Command::Disconnect),
            "exit" => Ok(Command::Exit),
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys of command messages, parameters and device configurations.
pub mod key {
    pub const CHANNELS: &str = "channels";
    pub const COMMAND: &str = "command";
    pub const CONFIGURATION: &str = "configuration";
    pub const DEVICES: &str = "devices";
    pub const FTDI_ID: &str = "ftdi_id";
    pub const NAME: &str = "name";
    pub const PARAMETERS: &str = "parameters";
    pub const RESPONSE: &str = "response";
    pub const SENSOR_TYPE: &str = "sensor_type";
    pub const SERIAL_PORT: &str = "serial_port";
    pub const TELEMETRY: &str = "telemetry";
    pub const TYPE: &str = "type";
}

/// Supported device types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "FTDI")]
    Ftdi,
    #[serde(rename = "Serial")]
    Serial,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Ftdi => "FTDI",
            DeviceType::Serial => "Serial",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported sensor types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorType {
    #[default]
    Temperature,
    Wind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        for command in [
            Command::Configure,
            Command::Disconnect,
            Command::Exit,
            Command::Start,
            Command::Stop,
        ] {
            assert_eq!(command.as_str().parse::<Command>(), Ok(command));
            assert_eq!(
                serde_json::to_value(command).unwrap(),
                serde_json::json!(command.as_str())
            );
        }
        assert!("reboot".parse::<Command>().is_err());
    }

    #[test]
    fn test_device_type_wire_names() {
        let t: DeviceType = serde_json::from_str("\"FTDI\"").unwrap();
        assert_eq!(t, DeviceType::Ftdi);
        let t: DeviceType = serde_json::from_str("\"Serial\"").unwrap();
        assert_eq!(t, DeviceType::Serial);
        assert!(serde_json::from_str::<DeviceType>("\"serial\"").is_err());
    }
}
