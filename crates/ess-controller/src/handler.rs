//! Command handling.
//!
//! The handler is configured with sensor devices and, once started, runs one
//! read loop per device. Every command yields exactly one
//! `{"response": code}` reply; telemetry is sent as `{"telemetry": [...]}`.
//!
//! * `configure` may be sent any number of times before `start`; only the
//!   last configuration is kept. Once started, configuration is refused.
//! * `start` connects every configured device and starts its read loop.
//! * `stop` stops all read loops and disconnects the devices; afterwards the
//!   handler can be configured and started again.

use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::device::{create_device, DeviceOptions};
use crate::error::{CommandError, ControllerError, Result};
use crate::instrument::EssInstrument;
use crate::protocol::{key, Command, SensorType};
use crate::response::{Reply, ResponseCode};
use crate::sel_temperature::SelTemperature;

pub const VALID_SIMULATION_MODES: [i64; 2] = [0, 1];

pub struct CommandHandler {
    tx: mpsc::Sender<Reply>,
    simulation_mode: i64,
    device_options: DeviceOptions,
    configuration: Option<Configuration>,
    started: bool,
    instruments: Vec<EssInstrument>,
}

impl CommandHandler {
    /// Create a handler sending its replies to `tx`.
    ///
    /// `simulation_mode` 1 replaces every device with a mock sensor.
    pub fn new(tx: mpsc::Sender<Reply>, simulation_mode: i64) -> Result<Self> {
        if !VALID_SIMULATION_MODES.contains(&simulation_mode) {
            return Err(ControllerError::InvalidSimulationMode(simulation_mode));
        }
        Ok(Self {
            tx,
            simulation_mode,
            device_options: DeviceOptions {
                simulation: simulation_mode == 1,
                ..DeviceOptions::default()
            },
            configuration: None,
            started: false,
            instruments: Vec::new(),
        })
    }

    /// Make a mock channel report the disconnected value.
    pub fn with_disconnected_channel(mut self, channel: Option<usize>) -> Self {
        self.device_options.disconnected_channel = channel;
        self
    }

    pub fn with_mock_interval(mut self, interval: Duration) -> Self {
        self.device_options.mock_interval = Some(interval);
        self
    }

    pub fn simulation_mode(&self) -> i64 {
        self.simulation_mode
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    /// Execute a command and send its response.
    ///
    /// `disconnect` and `exit` stop telemetry; closing the connection or
    /// the server is up to the caller.
    pub async fn handle_command(&mut self, command: Command, parameters: &Value) -> ResponseCode {
        info!(command = %command, "handling command");
        let result = match command {
            Command::Configure => self.configure(parameters),
            Command::Start => self.start_sending_telemetry().await,
            Command::Stop => self.stop_sending_telemetry().await,
            Command::Disconnect | Command::Exit => {
                self.shutdown().await;
                Ok(())
            }
        };

        let code = match result {
            Ok(()) => ResponseCode::Ok,
            Err(e) => {
                warn!(command = %command, code = e.response_code.code(), "{}", e.msg);
                e.response_code
            }
        };
        self.reply(Reply::Response(code)).await;
        code
    }

    /// Send a reply to the client; a vanished client is not an error.
    pub async fn reply(&self, reply: Reply) {
        if self.tx.send(reply).await.is_err() {
            debug!("reply dropped, client gone");
        }
    }

    fn configure(&mut self, parameters: &Value) -> std::result::Result<(), CommandError> {
        if self.started {
            return Err(CommandError::new(
                ResponseCode::AlreadyStarted,
                "Ignoring the configuration because telemetry loop already running. Send a stop first.",
            ));
        }
        let Some(configuration) = parameters.get(key::CONFIGURATION) else {
            return Err(CommandError::invalid_configuration(format!(
                "Missing parameter {}.",
                key::CONFIGURATION
            )));
        };
        let configuration = Configuration::from_value(configuration)?;
        info!(devices = configuration.devices.len(), "configuration accepted");
        self.configuration = Some(configuration);
        Ok(())
    }

    async fn start_sending_telemetry(&mut self) -> std::result::Result<(), CommandError> {
        if self.started {
            return Err(CommandError::new(
                ResponseCode::AlreadyStarted,
                "Telemetry loop already running. Ignoring start command.",
            ));
        }
        if self.configuration.is_none() {
            return Err(CommandError::new(
                ResponseCode::NotConfigured,
                "No configuration has been received yet. Ignoring start command.",
            ));
        }

        if let Err(e) = self.connect_devices().await {
            self.stop_instruments().await;
            return Err(e);
        }
        self.started = true;
        Ok(())
    }

    async fn connect_devices(&mut self) -> std::result::Result<(), CommandError> {
        let devices = self
            .configuration
            .as_ref()
            .map(|c| c.devices.clone())
            .unwrap_or_default();

        for device_config in devices {
            if device_config.sensor_type != SensorType::Temperature {
                return Err(CommandError::new(
                    ResponseCode::DeviceError,
                    format!(
                        "Device {} has unsupported sensor type {:?}",
                        device_config.name, device_config.sensor_type
                    ),
                ));
            }
            let device = create_device(&device_config, &self.device_options)
                .map_err(|e| CommandError::new(ResponseCode::DeviceError, e.to_string()))?;
            let reader = SelTemperature::new(&device_config.name, device_config.channels, device);
            let instrument = EssInstrument::start(reader, self.tx.clone())
                .await
                .map_err(|e| CommandError::new(ResponseCode::DeviceError, e.to_string()))?;
            self.instruments.push(instrument);
        }
        Ok(())
    }

    async fn stop_sending_telemetry(&mut self) -> std::result::Result<(), CommandError> {
        if !self.started {
            return Err(CommandError::new(
                ResponseCode::NotStarted,
                "Not started yet. Ignoring stop command.",
            ));
        }
        self.stop_instruments().await;
        self.started = false;
        Ok(())
    }

    async fn stop_instruments(&mut self) {
        join_all(self.instruments.iter_mut().map(|i| i.stop())).await;
        self.instruments.clear();
    }

    /// Stop telemetry if it is running.
    pub async fn shutdown(&mut self) {
        if self.started {
            self.stop_instruments().await;
            self.started = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler(simulation_mode: i64) -> (CommandHandler, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel(64);
        let handler = CommandHandler::new(tx, simulation_mode)
            .unwrap()
            .with_mock_interval(Duration::from_millis(10));
        (handler, rx)
    }

    fn configuration() -> Value {
        json!({
            "configuration": {
                "devices": [{"name": "Test1", "channels": 4, "type": "FTDI", "ftdi_id": "ABC"}]
            }
        })
    }

    /// Next `{"response": ...}` reply, skipping telemetry.
    async fn next_response(rx: &mut mpsc::Receiver<Reply>) -> ResponseCode {
        loop {
            match rx.recv().await.expect("channel closed") {
                Reply::Response(code) => return code,
                Reply::Telemetry(_) => continue,
            }
        }
    }

    #[test]
    fn test_invalid_simulation_mode() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            CommandHandler::new(tx, 2),
            Err(ControllerError::InvalidSimulationMode(2))
        ));
    }

    #[tokio::test]
    async fn test_start_without_configuration() {
        let (mut handler, mut rx) = handler(1);
        let code = handler.handle_command(Command::Start, &json!({})).await;
        assert_eq!(code, ResponseCode::NotConfigured);
        assert_eq!(next_response(&mut rx).await, ResponseCode::NotConfigured);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let (mut handler, mut rx) = handler(1);
        handler.handle_command(Command::Stop, &json!({})).await;
        assert_eq!(next_response(&mut rx).await, ResponseCode::NotStarted);
    }

    #[tokio::test]
    async fn test_configure_start_stop() {
        let (mut handler, mut rx) = handler(1);

        handler
            .handle_command(Command::Configure, &configuration())
            .await;
        assert_eq!(next_response(&mut rx).await, ResponseCode::Ok);
        assert_eq!(handler.configuration().unwrap().devices.len(), 1);

        handler.handle_command(Command::Start, &json!({})).await;
        assert_eq!(next_response(&mut rx).await, ResponseCode::Ok);
        assert!(handler.is_started());

        // Configuration is refused while started.
        handler
            .handle_command(Command::Configure, &configuration())
            .await;
        assert_eq!(next_response(&mut rx).await, ResponseCode::AlreadyStarted);

        handler.handle_command(Command::Start, &json!({})).await;
        assert_eq!(next_response(&mut rx).await, ResponseCode::AlreadyStarted);

        handler.handle_command(Command::Stop, &json!({})).await;
        assert_eq!(next_response(&mut rx).await, ResponseCode::Ok);
        assert!(!handler.is_started());

        // Configurable again after stop.
        handler
            .handle_command(Command::Configure, &configuration())
            .await;
        assert_eq!(next_response(&mut rx).await, ResponseCode::Ok);
    }

    #[tokio::test]
    async fn test_telemetry_shape() {
        let (handler, mut rx) = handler(1);
        let mut handler = handler.with_disconnected_channel(Some(2));
        handler
            .handle_command(Command::Configure, &configuration())
            .await;
        handler.handle_command(Command::Start, &json!({})).await;

        let telemetry = loop {
            match rx.recv().await.unwrap() {
                Reply::Telemetry(record) => break record,
                Reply::Response(_) => continue,
            }
        };
        let value = serde_json::to_value(Reply::Telemetry(telemetry)).unwrap();
        let items = value["telemetry"].as_array().unwrap();
        // name, timestamp, error code and four channels
        assert_eq!(items.len(), 7);
        assert_eq!(items[0], "Test1");
        assert!(items[1].as_f64().unwrap() > 0.0);
        assert_eq!(items[2], 0);
        assert!(items[5].is_null());
        for i in [3, 4, 6] {
            let t = items[i].as_f64().unwrap();
            assert!((18.0..=30.0).contains(&t));
        }

        handler.handle_command(Command::Stop, &json!({})).await;
    }

    #[tokio::test]
    async fn test_invalid_configuration() {
        let (mut handler, mut rx) = handler(1);
        let code = handler
            .handle_command(
                Command::Configure,
                &json!({"configuration": {"devices": []}}),
            )
            .await;
        assert_eq!(code, ResponseCode::InvalidConfiguration);
        assert_eq!(next_response(&mut rx).await, ResponseCode::InvalidConfiguration);
        assert!(handler.configuration().is_none());

        let code = handler.handle_command(Command::Configure, &json!({})).await;
        assert_eq!(code, ResponseCode::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_hardware_device_unavailable() {
        let (mut handler, mut rx) = handler(0);
        handler
            .handle_command(Command::Configure, &configuration())
            .await;
        assert_eq!(next_response(&mut rx).await, ResponseCode::Ok);

        let code = handler.handle_command(Command::Start, &json!({})).await;
        assert_eq!(code, ResponseCode::DeviceError);
        assert!(!handler.is_started());
    }

    #[tokio::test]
    async fn test_unsupported_sensor_type() {
        let (mut handler, _rx) = handler(1);
        handler
            .handle_command(
                Command::Configure,
                &json!({"configuration": {"devices": [
                    {"name": "Wind", "channels": 2, "type": "Serial",
                     "serial_port": "/dev/ttyS0", "sensor_type": "Wind"}
                ]}}),
            )
            .await;
        let code = handler.handle_command(Command::Start, &json!({})).await;
        assert_eq!(code, ResponseCode::DeviceError);
    }

    #[tokio::test]
    async fn test_stop_while_client_not_reading() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut handler = CommandHandler::new(tx, 1)
            .unwrap()
            .with_mock_interval(Duration::from_millis(1));
        handler
            .handle_command(Command::Configure, &configuration())
            .await;
        assert_eq!(next_response(&mut rx).await, ResponseCode::Ok);
        let empty = json!({});
        let (code, response) = tokio::join!(
            handler.handle_command(Command::Start, &empty),
            next_response(&mut rx)
        );
        assert_eq!(code, ResponseCode::Ok);
        assert_eq!(response, ResponseCode::Ok);

        // Nothing drains the queue from here on.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(5), handler.shutdown())
            .await
            .expect("shutdown blocked on a full reply queue");
        assert!(!handler.is_started());
        assert!(handler.instruments.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_stops_telemetry() {
        let (mut handler, mut rx) = handler(1);
        handler
            .handle_command(Command::Configure, &configuration())
            .await;
        handler.handle_command(Command::Start, &json!({})).await;
        let code = handler
            .handle_command(Command::Disconnect, &json!({}))
            .await;
        assert_eq!(code, ResponseCode::Ok);
        assert!(!handler.is_started());
        assert!(handler.instruments.is_empty());
        while rx.try_recv().is_ok() {}
    }
}
