//! fleet-monitor: powers a fleet instance off once its work is over.
//!
//! Started detached by the orchestrator after an instance's batch succeeded.
//! The orchestrator then only observes the instance going STOPPING/STOPPED.

mod gpu;
mod watcher;

use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gpu::NvidiaSmi;
use watcher::CommandShutdown;

/// Idle watcher for fleet instances
#[derive(Parser, Debug)]
#[command(name = "fleet-monitor")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Shut down a fixed time after start
    Timed {
        #[command(flatten)]
        common: Common,
    },
    /// Shut down once every visible GPU has been idle for `--duration` seconds
    GpuIdle {
        #[command(flatten)]
        common: Common,

        /// Sampling interval in seconds
        #[arg(long, default_value = "1.0", env = "FLEET_MONITOR_INTERVAL_S")]
        interval: f64,
    },
}

#[derive(Args, Debug)]
struct Common {
    /// Seconds of idleness (gpu-idle) or of waiting (timed) before shutdown
    #[arg(long)]
    duration: u64,

    /// Seconds to sleep before observing
    #[arg(long, default_value = "0")]
    delay: u64,

    /// Command that powers the host off
    #[arg(long, default_value = "sudo shutdown -h now", env = "FLEET_MONITOR_SHUTDOWN_COMMAND")]
    shutdown_command: String,
}

fn positive_secs(value: f64, flag: &str) -> anyhow::Result<Duration> {
    if !(value.is_finite() && value > 0.0) {
        anyhow::bail!("{} must be a positive number of seconds", flag);
    }
    Ok(Duration::from_secs_f64(value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.mode {
        Mode::Timed { common } => {
            let shutdown = CommandShutdown {
                command: common.shutdown_command,
            };
            tracing::info!(duration_s = common.duration, delay_s = common.delay, "fleet-monitor timed");
            watcher::run_timed(
                &shutdown,
                Duration::from_secs(common.delay),
                Duration::from_secs(common.duration),
            )
            .await
            .context("timed watcher")
        }
        Mode::GpuIdle { common, interval } => {
            let interval = positive_secs(interval, "--interval")?;
            let shutdown = CommandShutdown {
                command: common.shutdown_command,
            };
            tracing::info!(duration_s = common.duration, delay_s = common.delay, "fleet-monitor gpu-idle");
            watcher::run_gpu_idle(
                &NvidiaSmi,
                &shutdown,
                Duration::from_secs(common.delay),
                Duration::from_secs(common.duration),
                interval,
            )
            .await
            .context("gpu-idle watcher")
        }
    }
}
