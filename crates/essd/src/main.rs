//! essd - ESS controller daemon
//!
//! Serves sensor telemetry to one client at a time over a TCP socket until
//! a client sends `exit` or the process is interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use ess_controller::server::{DEFAULT_HOST, DEFAULT_PORT};
use ess_controller::SocketServer;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "essd")]
#[command(author = "ESS Developers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Environmental Sensor Suite controller daemon", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "ESS_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "ESS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// 0 reads the configured hardware, 1 replaces it with mock sensors
    #[arg(short, long, env = "ESS_SIMULATION_MODE", default_value_t = 0)]
    simulation_mode: i64,

    /// Mock channel (0-based) reporting a disconnected sensor
    #[arg(long)]
    disconnected_channel: Option<usize>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ess_controller::init_tracing(args.json_logs, level);

    let mut server = SocketServer::new(&args.host, args.port, args.simulation_mode)
        .context("Invalid controller settings")?
        .with_disconnected_channel(args.disconnected_channel);
    let addr = server
        .bind()
        .await
        .with_context(|| format!("Failed to listen on {}:{}", args.host, args.port))?;
    info!(%addr, "essd started");

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.serve().await.context("Controller server failed")?;
    info!("essd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["essd"]).unwrap();
        assert_eq!(args.host, DEFAULT_HOST);
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.simulation_mode, 0);
        assert!(args.disconnected_channel.is_none());
    }

    #[test]
    fn test_simulation_flags() {
        let args = Args::try_parse_from([
            "essd",
            "--port",
            "5001",
            "--simulation-mode",
            "1",
            "--disconnected-channel",
            "2",
        ])
        .unwrap();
        assert_eq!(args.port, 5001);
        assert_eq!(args.simulation_mode, 1);
        assert_eq!(args.disconnected_channel, Some(2));
    }
}
