//! Replies sent to the client.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::protocol::key;
use crate::sel_temperature::TelemetryRecord;

/// Result code of a command, sent as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ResponseCode {
    Ok,
    NotConfigured,
    AlreadyStarted,
    NotStarted,
    InvalidConfiguration,
    DeviceError,
    UnknownCommand,
    DeviceReadError,
}

impl ResponseCode {
    pub fn code(self) -> i32 {
        match self {
            ResponseCode::Ok => 0,
            ResponseCode::NotConfigured => 1,
            ResponseCode::AlreadyStarted => 2,
            ResponseCode::NotStarted => 3,
            ResponseCode::InvalidConfiguration => 4,
            ResponseCode::DeviceError => 5,
            ResponseCode::UnknownCommand => 6,
            ResponseCode::DeviceReadError => 7,
        }
    }
}

impl From<ResponseCode> for i32 {
    fn from(code: ResponseCode) -> i32 {
        code.code()
    }
}

impl TryFrom<i32> for ResponseCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ResponseCode::Ok,
            1 => ResponseCode::NotConfigured,
            2 => ResponseCode::AlreadyStarted,
            3 => ResponseCode::NotStarted,
            4 => ResponseCode::InvalidConfiguration,
            5 => ResponseCode::DeviceError,
            6 => ResponseCode::UnknownCommand,
            7 => ResponseCode::DeviceReadError,
            other => return Err(format!("unknown response code {other}")),
        })
    }
}

/// A message to the client: `{"response": code}` or `{"telemetry": [...]}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Response(ResponseCode),
    Telemetry(TelemetryRecord),
}

impl Serialize for Reply {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Reply::Response(code) => map.serialize_entry(key::RESPONSE, code)?,
            Reply::Telemetry(record) => map.serialize_entry(key::TELEMETRY, record)?,
        }
        map.end()
    }
}
