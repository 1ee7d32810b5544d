use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::retry::Backoff;

/// Runtime knobs read from the environment (after `dotenv`).
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub cluster_spec_path: PathBuf,
    pub provider: String,
    pub aws_region: Option<String>,
    pub ssh: SshSettings,
    pub poll_interval: Duration,
    pub connect_backoff: Backoff,
    pub provider_backoff: Backoff,
    pub stopped_sync_timeout: Duration,
    pub http_addr: SocketAddr,
    pub action_log_capacity: usize,
    pub auto_sync: bool,
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub key_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// `None` lets remote commands run as long as they need.
    pub command_timeout: Option<Duration>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            key_file: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: None,
        }
    }
}

fn env_trimmed(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_trimmed(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_trimmed(key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

impl FleetSettings {
    pub fn from_env() -> Result<Self> {
        let cluster_spec_path = env_trimmed("FLEET_CLUSTER_SPEC")
            .map(PathBuf::from)
            .context("FLEET_CLUSTER_SPEC must be set")?;

        let http_addr = env_trimmed("FLEET_HTTP_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8011".to_string())
            .parse::<SocketAddr>()
            .context("FLEET_HTTP_ADDR is not a socket address")?;

        let command_timeout_s: u64 = env_parse("FLEET_COMMAND_TIMEOUT_S", 0);

        Ok(Self {
            cluster_spec_path,
            provider: env_trimmed("PROVIDER").unwrap_or_else(|| "aws".to_string()),
            aws_region: env_trimmed("AWS_REGION"),
            ssh: SshSettings {
                user: env_trimmed("FLEET_SSH_USER").unwrap_or_else(|| "ubuntu".to_string()),
                key_file: env_trimmed("FLEET_SSH_KEY_FILE").map(PathBuf::from),
                connect_timeout: Duration::from_secs(env_parse("FLEET_SSH_CONNECT_TIMEOUT_S", 10)),
                command_timeout: (command_timeout_s > 0).then(|| Duration::from_secs(command_timeout_s)),
            },
            poll_interval: Duration::from_secs(env_parse::<u64>("FLEET_POLL_INTERVAL_S", 5).max(1)),
            connect_backoff: Backoff::new(
                Duration::from_millis(env_parse("FLEET_CONNECT_BACKOFF_INITIAL_MS", 1000)),
                Duration::from_millis(env_parse("FLEET_CONNECT_BACKOFF_MAX_MS", 30_000)),
                env_parse("FLEET_CONNECT_RETRY_MAX", 30),
            ),
            provider_backoff: Backoff::new(
                Duration::from_millis(env_parse("FLEET_PROVIDER_BACKOFF_INITIAL_MS", 500)),
                Duration::from_millis(env_parse("FLEET_PROVIDER_BACKOFF_MAX_MS", 10_000)),
                env_parse("FLEET_PROVIDER_RETRY_MAX", 5),
            ),
            stopped_sync_timeout: Duration::from_secs(env_parse("FLEET_STOPPED_SYNC_TIMEOUT_S", 600)),
            http_addr,
            action_log_capacity: env_parse("FLEET_ACTION_LOG_CAPACITY", 1000),
            auto_sync: env_bool("FLEET_AUTO_SYNC", true),
        })
    }
}
