//! Per-device read loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::response::Reply;
use crate::sel_temperature::{read_error_record, SelTemperature, TelemetryRecord};

/// Pause after a failed read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A configured device plus the task reading it.
pub struct EssInstrument {
    name: String,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EssInstrument {
    /// Open the reader's device and start forwarding its telemetry to `tx`.
    pub async fn start(mut reader: SelTemperature, tx: mpsc::Sender<Reply>) -> Result<Self> {
        let name = reader.name().to_string();
        debug!(instrument = %name, "starting read loop");
        reader.start().await?;

        let stop = CancellationToken::new();
        let task = tokio::spawn(read_loop(reader, tx, stop.clone()));
        Ok(Self {
            name,
            stop,
            task: Some(task),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the read loop and wait for the device to be closed.
    pub async fn stop(&mut self) {
        debug!(instrument = %self.name, "stopping read loop");
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(instrument = %self.name, error = %e, "read loop ended abnormally");
            }
        }
    }
}

impl Drop for EssInstrument {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn read_loop(mut reader: SelTemperature, tx: mpsc::Sender<Reply>, stop: CancellationToken) {
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = reader.read() => read,
        };
        let record = match read {
            Ok(record) => record,
            Err(e) => {
                warn!(instrument = %reader.name(), error = %e, "read failed");
                let record = read_error_record(reader.name(), reader.channels());
                if !forward(&tx, &stop, record).await {
                    break;
                }
                let stopped = tokio::select! {
                    _ = stop.cancelled() => true,
                    _ = tokio::time::sleep(READ_ERROR_BACKOFF) => false,
                };
                if stopped {
                    break;
                }
                continue;
            }
        };
        if !forward(&tx, &stop, record).await {
            debug!(instrument = %reader.name(), "telemetry forwarding ended");
            break;
        }
    }

    if let Err(e) = reader.stop().await {
        warn!(instrument = %reader.name(), error = %e, "failed to close device");
    }
}

/// Queue a record for the client. A client that stops reading fills the
/// queue, so the send gives way to `stop`. Returns false when the loop
/// should end.
async fn forward(
    tx: &mpsc::Sender<Reply>,
    stop: &CancellationToken,
    record: TelemetryRecord,
) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        sent = tx.send(Reply::Telemetry(record)) => sent.is_ok(),
    }
}
