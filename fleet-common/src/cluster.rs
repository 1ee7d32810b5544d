use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::monitor::MonitorSpec;

/// What the provider needs to launch one instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceTemplate {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group: String,
}

/// One side of a file transfer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Remote { host: String, path: String },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "{}", path.display()),
            Endpoint::Remote { host, path } => write!(f, "{}:{}", host, path),
        }
    }
}

/// Where synchronised output lands.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncTarget {
    Local(PathBuf),
    Remote { host: String, path: String },
}

impl SyncTarget {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            SyncTarget::Local(path) => Endpoint::Local(path.clone()),
            SyncTarget::Remote { host, path } => Endpoint::Remote {
                host: host.clone(),
                path: path.clone(),
            },
        }
    }
}

/// Configuration of one orchestration session. Read-only once loaded.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(try_from = "ClusterSpecFile")]
pub struct ClusterSpec {
    pub template: InstanceTemplate,
    /// One batch per desired instance, in assignment order.
    pub batches: Vec<Vec<String>>,
    pub setup_commands: Vec<String>,
    pub sync_sources: Vec<String>,
    pub sync_target: Option<SyncTarget>,
    pub monitor: Option<MonitorSpec>,
    pub monitor_delay_s: u64,
    pub sync_interval_s: u64,
}

/// On-disk shape: either explicit `batches`, or flat `commands` split over `instances`.
#[derive(Debug, Deserialize)]
struct ClusterSpecFile {
    template: InstanceTemplate,
    #[serde(default)]
    batches: Option<Vec<Vec<String>>>,
    #[serde(default)]
    commands: Option<Vec<String>>,
    #[serde(default)]
    instances: Option<usize>,
    #[serde(default)]
    setup_commands: Vec<String>,
    #[serde(default)]
    sync_sources: Vec<String>,
    #[serde(default)]
    sync_target: Option<SyncTarget>,
    #[serde(default)]
    monitor: Option<MonitorSpec>,
    #[serde(default = "default_monitor_delay_s")]
    monitor_delay_s: u64,
    #[serde(default = "default_sync_interval_s")]
    sync_interval_s: u64,
}

fn default_monitor_delay_s() -> u64 {
    600
}

fn default_sync_interval_s() -> u64 {
    120
}

impl TryFrom<ClusterSpecFile> for ClusterSpec {
    type Error = FleetError;

    fn try_from(raw: ClusterSpecFile) -> Result<Self, Self::Error> {
        let batches = match (raw.batches, raw.commands) {
            (Some(_), Some(_)) => {
                return Err(FleetError::Config(
                    "give either `batches` or `commands`, not both".to_string(),
                ))
            }
            (Some(batches), None) => batches,
            (None, Some(commands)) => {
                let instances = raw.instances.ok_or_else(|| {
                    FleetError::Config("`commands` requires `instances`".to_string())
                })?;
                split_commands(&commands, instances)
            }
            (None, None) => {
                return Err(FleetError::Config(
                    "no command batches configured".to_string(),
                ))
            }
        };

        let spec = ClusterSpec {
            template: raw.template,
            batches,
            setup_commands: raw.setup_commands,
            sync_sources: raw.sync_sources,
            sync_target: raw.sync_target,
            monitor: raw.monitor,
            monitor_delay_s: raw.monitor_delay_s,
            sync_interval_s: raw.sync_interval_s,
        };
        spec.validate()?;
        Ok(spec)
    }
}

impl ClusterSpec {
    pub fn from_json_str(s: &str) -> Result<Self, FleetError> {
        serde_json::from_str(s).map_err(|e| FleetError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, FleetError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        let t = &self.template;
        for (name, value) in [
            ("image_id", &t.image_id),
            ("instance_type", &t.instance_type),
            ("key_name", &t.key_name),
            ("security_group", &t.security_group),
        ] {
            if value.trim().is_empty() {
                return Err(FleetError::Config(format!("template.{} is empty", name)));
            }
        }
        if self.batches.is_empty() {
            return Err(FleetError::Config("no command batches configured".to_string()));
        }
        if self.batches.iter().any(|b| b.is_empty()) {
            return Err(FleetError::Config("command batches must not be empty".to_string()));
        }
        if self.sync_interval_s == 0 {
            return Err(FleetError::Config("sync_interval_s must be positive".to_string()));
        }
        if !self.sync_sources.is_empty() && self.sync_target.is_none() {
            return Err(FleetError::Config(
                "sync_sources configured without sync_target".to_string(),
            ));
        }
        if let Some(monitor) = &self.monitor {
            monitor.validate()?;
        }
        Ok(())
    }
}

/// Split a flat command list into `parts` contiguous batches of near-equal size.
///
/// The first `len % parts` batches get one extra command. Empty batches are dropped.
pub fn split_commands(commands: &[String], parts: usize) -> Vec<Vec<String>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = commands.len() / parts;
    let extra = commands.len() % parts;

    let mut out = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        if len == 0 {
            break;
        }
        out.push(commands[start..start + len].to_vec());
        start += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorKind;

    fn cmds(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("run {}", i)).collect()
    }

    #[test]
    fn split_gives_remainder_to_leading_batches() {
        let batches = split_commands(&cmds(7), 3);
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 2, 2]);
        assert_eq!(batches[0][0], "run 0");
        assert_eq!(batches[1][0], "run 3");
        assert_eq!(batches[2][1], "run 6");
    }

    #[test]
    fn split_drops_empty_batches() {
        assert_eq!(split_commands(&cmds(2), 5).len(), 2);
        assert!(split_commands(&cmds(3), 0).is_empty());
    }

    #[test]
    fn parses_flat_commands_and_targets() {
        let spec = ClusterSpec::from_json_str(
            r#"{
                "template": {"image_id": "ami-1", "instance_type": "p3.2xlarge",
                             "key_name": "k", "security_group": "sg"},
                "commands": ["a", "b", "c"],
                "instances": 2,
                "sync_sources": ["~/runs"],
                "sync_target": {"local": "/tmp/out"},
                "monitor": {"kind": "gpu_idle", "duration_s": 120}
            }"#,
        )
        .unwrap();
        assert_eq!(spec.batches, vec![vec!["a", "b"], vec!["c"]]);
        assert_eq!(spec.sync_target, Some(SyncTarget::Local("/tmp/out".into())));
        assert_eq!(spec.monitor.as_ref().map(|m| m.kind), Some(MonitorKind::GpuIdle));
        assert_eq!(spec.monitor_delay_s, 600);
        assert_eq!(spec.sync_interval_s, 120);
    }

    #[test]
    fn remote_target_shape() {
        let target: SyncTarget =
            serde_json::from_str(r#"{"remote": {"host": "archive", "path": "/data"}}"#).unwrap();
        assert_eq!(
            target.endpoint().to_string(),
            "archive:/data"
        );
    }

    #[test]
    fn rejects_incomplete_specs() {
        let missing_batches = r#"{"template": {"image_id": "ami", "instance_type": "t",
                                  "key_name": "k", "security_group": "sg"}}"#;
        assert!(ClusterSpec::from_json_str(missing_batches).is_err());

        let empty_image = r#"{"template": {"image_id": " ", "instance_type": "t",
                              "key_name": "k", "security_group": "sg"},
                              "batches": [["x"]]}"#;
        assert!(ClusterSpec::from_json_str(empty_image).is_err());

        let dangling_sources = r#"{"template": {"image_id": "ami", "instance_type": "t",
                                   "key_name": "k", "security_group": "sg"},
                                   "batches": [["x"]], "sync_sources": ["out"]}"#;
        assert!(ClusterSpec::from_json_str(dangling_sources).is_err());
    }
}
