use serde::{Deserialize, Serialize};

use crate::error::FleetError;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    /// Shut down `duration_s` after being scheduled.
    Timed,
    /// Shut down once every visible GPU has been idle for `duration_s`.
    GpuIdle,
}

impl MonitorKind {
    pub fn subcommand(&self) -> &'static str {
        match self {
            MonitorKind::Timed => "timed",
            MonitorKind::GpuIdle => "gpu-idle",
        }
    }
}

/// The idle watcher installed on every instance once its batch is done.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MonitorSpec {
    pub kind: MonitorKind,
    pub duration_s: u64,
    /// GPU sampling interval; the watcher's default applies when unset.
    #[serde(default)]
    pub interval_s: Option<f64>,
    /// Path or name of the `fleet-monitor` binary on the instance image.
    #[serde(default = "default_binary")]
    pub binary: String,
}

fn default_binary() -> String {
    "fleet-monitor".to_string()
}

pub const MONITOR_LOG: &str = "~/.fleet/monitor.log";

impl MonitorSpec {
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.duration_s == 0 {
            return Err(FleetError::Config("monitor.duration_s must be positive".to_string()));
        }
        if let Some(interval) = self.interval_s {
            if interval.is_nan() || interval <= 0.0 {
                return Err(FleetError::Config("monitor.interval_s must be positive".to_string()));
            }
        }
        if self.binary.trim().is_empty() {
            return Err(FleetError::Config("monitor.binary is empty".to_string()));
        }
        Ok(())
    }

    /// Start delay the watcher actually gets. The timed watcher counts from
    /// scheduling, so the cluster's delay only applies to gpu-idle.
    pub fn effective_delay(&self, delay_s: u64) -> u64 {
        match self.kind {
            MonitorKind::Timed => 0,
            MonitorKind::GpuIdle => delay_s,
        }
    }

    /// Foreground invocation of the watcher.
    pub fn invocation(&self, delay_s: u64) -> String {
        let mut cmd = format!(
            "{} {} --duration {} --delay {}",
            self.binary,
            self.kind.subcommand(),
            self.duration_s,
            self.effective_delay(delay_s)
        );
        if let (MonitorKind::GpuIdle, Some(interval)) = (self.kind, self.interval_s) {
            cmd.push_str(&format!(" --interval {}", interval));
        }
        cmd
    }

    /// Detached invocation: survives the ssh session that starts it.
    pub fn detached_command(&self, delay_s: u64) -> String {
        format!(
            "mkdir -p ~/.fleet && nohup setsid {} > {} 2>&1 < /dev/null &",
            self.invocation(delay_s),
            MONITOR_LOG
        )
    }
}
