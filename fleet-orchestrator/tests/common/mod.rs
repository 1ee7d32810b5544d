// Shared fixtures: mock provider + a sandbox channel where every instance is a local directory.
#![allow(dead_code)]

use async_trait::async_trait;
use fleet_common::{ChannelError, ClusterSpec, ClusterStatus, Endpoint};
use fleet_orchestrator::channel::{CommandOutput, ExecutionChannel};
use fleet_orchestrator::retry::Backoff;
use fleet_orchestrator::{ClusterOrchestrator, OrchestratorSettings};
use fleet_providers::mock::MockProvider;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Runs commands with `sh -c` inside a per-instance directory (also its `$HOME`).
/// Only instances the mock reports as running are reachable.
pub struct SandboxChannel {
    provider: Arc<MockProvider>,
    root: PathBuf,
}

impl SandboxChannel {
    pub fn new(provider: Arc<MockProvider>, root: PathBuf) -> Self {
        Self { provider, root }
    }

    pub fn instance_dir(&self, provider_id: &str) -> PathBuf {
        self.root.join(provider_id)
    }

    fn host_dir(&self, address: &str) -> Result<PathBuf, ChannelError> {
        let provider_id = self
            .provider
            .reachable_instance(address)
            .ok_or_else(|| ChannelError::ConnectionUnavailable(format!("{}: connection refused", address)))?;
        let dir = self.instance_dir(&provider_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn resolve(&self, endpoint: &Endpoint) -> Result<PathBuf, ChannelError> {
        match endpoint {
            Endpoint::Local(path) => Ok(path.clone()),
            Endpoint::Remote { host, path } => {
                let base = self.host_dir(host)?;
                Ok(base.join(path.trim_start_matches("~/")))
            }
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst).map(|_| ())
    }
}

#[async_trait]
impl ExecutionChannel for SandboxChannel {
    async fn run(&self, address: &str, command: &str) -> Result<CommandOutput, ChannelError> {
        let dir = self.host_dir(address)?;
        let out = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .env("HOME", &dir)
            .output()
            .await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            exit_code: out.status.code().unwrap_or(-1),
        })
    }

    async fn kill_tracked(&self, address: &str) -> Result<(), ChannelError> {
        self.host_dir(address).map(|_| ())
    }

    async fn copy(&self, source: &Endpoint, dest: &Endpoint) -> Result<(), ChannelError> {
        let src = self.resolve(source)?;
        let dest_dir = self.resolve(dest)?;
        if !src.exists() {
            return Err(ChannelError::Transfer(format!("{} does not exist", src.display())));
        }
        let name = src
            .file_name()
            .ok_or_else(|| ChannelError::Transfer(format!("{} has no file name", src.display())))?;
        copy_tree(&src, &dest_dir.join(name))?;
        Ok(())
    }
}

pub struct TestCluster {
    pub orch: Arc<ClusterOrchestrator>,
    pub provider: Arc<MockProvider>,
    pub channel: Arc<SandboxChannel>,
    pub target: PathBuf,
    root: PathBuf,
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        poll_interval: Duration::from_millis(5),
        connect_backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20), 20),
        provider_backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 5),
        stopped_sync_timeout: Duration::from_secs(5),
        action_log_capacity: 500,
    }
}

/// Build a cluster over the mock provider. `extra` is merged into the spec JSON.
pub fn test_cluster(batches: &[&[&str]], extra: serde_json::Value) -> TestCluster {
    let root = std::env::temp_dir().join(format!("fleet-test-{}", Uuid::new_v4()));
    let target = root.join("target");
    let hosts = root.join("hosts");
    std::fs::create_dir_all(&hosts).unwrap();

    let mut spec = json!({
        "template": {
            "image_id": "ami-test",
            "instance_type": "g4dn.xlarge",
            "key_name": "fleet",
            "security_group": "fleet-sg"
        },
        "batches": batches,
        "sync_sources": ["r"],
        "sync_target": { "local": target },
        "sync_interval_s": 60
    });
    if let (Some(obj), Some(more)) = (spec.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            obj.insert(k.clone(), v.clone());
        }
    }
    let cluster = ClusterSpec::from_json_str(&spec.to_string()).unwrap();

    let provider = Arc::new(MockProvider::new());
    let channel = Arc::new(SandboxChannel::new(provider.clone(), hosts));
    let orch = Arc::new(ClusterOrchestrator::new(
        cluster,
        provider.clone(),
        channel.clone(),
        fast_settings(),
    ));
    TestCluster {
        orch,
        provider,
        channel,
        target,
        root,
    }
}

impl TestCluster {
    /// Reconcile until `done` holds (or give up after a couple of seconds).
    pub async fn settle<F>(&self, done: F) -> ClusterStatus
    where
        F: Fn(&ClusterStatus) -> bool,
    {
        for _ in 0..400 {
            let status = self.orch.status().await;
            if done(&status) {
                return status;
            }
            self.orch.reconcile_now().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cluster did not settle: {:?}", self.orch.status().await);
    }

    pub fn provider_ids(status: &ClusterStatus) -> Vec<String> {
        status
            .instances
            .iter()
            .filter_map(|i| i.provider_id.clone())
            .collect()
    }
}

pub fn all_in(state: fleet_common::InstanceState) -> impl Fn(&ClusterStatus) -> bool {
    move |s| !s.instances.is_empty() && s.instances.iter().all(|i| i.state == state)
}
