//! ESS controller - Environmental Sensor Suite telemetry controller
//!
//! Reads environmental sensors and forwards their telemetry to a client:
//! - Accepts `configure`, `start`, `stop`, `disconnect` and `exit` commands
//!   over a TCP socket as newline-delimited JSON
//! - Validates device configurations
//! - Runs one read loop per configured device
//! - Replaces every device with a mock sensor in simulation mode

pub mod config;
pub mod device;
pub mod error;
pub mod handler;
pub mod instrument;
pub mod protocol;
pub mod response;
pub mod sel_temperature;
pub mod server;
pub mod telemetry;

// Re-export key types
pub use config::{Configuration, DeviceConfig};
pub use device::{create_device, DeviceOptions, MockTemperatureSensor, SensorDevice, SerialDevice};
pub use error::{CommandError, ControllerError, Result};
pub use handler::CommandHandler;
pub use instrument::EssInstrument;
pub use protocol::{Command, DeviceType, SensorType};
pub use response::{Reply, ResponseCode};
pub use sel_temperature::{SelTemperature, TelemetryRecord};
pub use server::SocketServer;
pub use telemetry::init_tracing;
