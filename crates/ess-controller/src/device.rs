//! Sensor devices.
//!
//! Every device produces newline-terminated text lines. The instrument read
//! loop only talks to the [`SensorDevice`] trait, so the mock sensor used in
//! simulation mode and the real serial device share the same code path.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::error::{ControllerError, Result};
use crate::protocol::{DeviceType, DISCONNECTED_VALUE, MOCK_TEMPERATURE};

/// Line-oriented sensor device.
#[async_trait]
pub trait SensorDevice: Send {
    fn name(&self) -> &str;

    /// Connect to the device.
    async fn open(&mut self) -> Result<()>;

    /// Read the next line, without its terminator.
    async fn read_line(&mut self) -> Result<String>;

    /// Disconnect from the device.
    async fn close(&mut self) -> Result<()>;
}

/// Default interval between two mock readings.
pub const MOCK_READ_INTERVAL: Duration = Duration::from_secs(1);

/// Simulated SEL temperature sensor producing random readings.
#[derive(Debug)]
pub struct MockTemperatureSensor {
    name: String,
    channels: usize,
    /// 0-based channel reporting the disconnected value.
    disconnected_channel: Option<usize>,
    interval: Duration,
    open: bool,
}

impl MockTemperatureSensor {
    pub fn new(name: impl Into<String>, channels: usize) -> Self {
        Self {
            name: name.into(),
            channels,
            disconnected_channel: None,
            interval: MOCK_READ_INTERVAL,
            open: false,
        }
    }

    pub fn with_disconnected_channel(mut self, channel: Option<usize>) -> Self {
        self.disconnected_channel = channel;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One reading in SEL format: `C01=0023.4560,C02=...`.
    pub fn sample_line(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.channels)
            .map(|i| {
                let value = if Some(i) == self.disconnected_channel {
                    DISCONNECTED_VALUE.to_string()
                } else {
                    let t = rng.gen_range(MOCK_TEMPERATURE.min..=MOCK_TEMPERATURE.max);
                    format!("{t:09.4}")
                };
                format!("C{:02}={}", i + 1, value)
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl SensorDevice for MockTemperatureSensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<()> {
        debug!(device = %self.name, "mock sensor opened");
        self.open = true;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        if !self.open {
            return Err(ControllerError::device(&self.name, "device is not open"));
        }
        tokio::time::sleep(self.interval).await;
        Ok(self.sample_line())
    }

    async fn close(&mut self) -> Result<()> {
        debug!(device = %self.name, "mock sensor closed");
        self.open = false;
        Ok(())
    }
}

/// Sensor attached to a serial port, read as a character device.
pub struct SerialDevice {
    name: String,
    port: PathBuf,
    reader: Option<BufReader<tokio::fs::File>>,
}

impl SerialDevice {
    pub fn new(name: impl Into<String>, port: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            port: port.into(),
            reader: None,
        }
    }
}

#[async_trait]
impl SensorDevice for SerialDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<()> {
        let file = tokio::fs::File::open(&self.port).await.map_err(|e| {
            ControllerError::device(&self.name, format!("cannot open {}: {e}", self.port.display()))
        })?;
        info!(device = %self.name, port = %self.port.display(), "serial device opened");
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ControllerError::device(&self.name, "device is not open"))?;
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(ControllerError::device(&self.name, "end of stream"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// Options the command handler applies when creating devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Use mock sensors instead of hardware.
    pub simulation: bool,
    /// Mock channel reporting the disconnected value.
    pub disconnected_channel: Option<usize>,
    /// Mock read interval; [`MOCK_READ_INTERVAL`] when `None`.
    pub mock_interval: Option<Duration>,
    /// Allow serial devices on any architecture (the controller hardware is
    /// aarch64).
    pub allow_any_arch: bool,
}

/// Create the device for a configuration entry.
pub fn create_device(
    config: &DeviceConfig,
    options: &DeviceOptions,
) -> Result<Box<dyn SensorDevice>> {
    if options.simulation {
        info!(device = %config.name, "connecting to the mock sensor");
        let sensor = MockTemperatureSensor::new(&config.name, config.channels)
            .with_disconnected_channel(options.disconnected_channel)
            .with_interval(options.mock_interval.unwrap_or(MOCK_READ_INTERVAL));
        return Ok(Box::new(sensor));
    }

    match config.device_type {
        DeviceType::Serial if cfg!(target_arch = "aarch64") || options.allow_any_arch => {
            let port = config.serial_port.as_deref().ok_or_else(|| {
                ControllerError::device(&config.name, "missing serial_port")
            })?;
            Ok(Box::new(SerialDevice::new(&config.name, port)))
        }
        device_type => Err(ControllerError::device(
            &config.name,
            format!(
                "could not get a {} device on architecture {}; please check the configuration",
                device_type,
                std::env::consts::ARCH
            ),
        )),
    }
}
