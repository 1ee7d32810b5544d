use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use fleet_common::{ChannelError, Endpoint};
use serde::Serialize;
use tokio::process::Command;

use crate::settings::SshSettings;

/// Where the running batch records its process group on the instance.
pub const BATCH_PID_FILE: &str = "~/.fleet/batch.pid";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote execution capability.
///
/// `Err` is reserved for "could not talk to the host" (or transfer errors);
/// a command that ran and exited non-zero comes back as `Ok` with its exit code.
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    async fn run(&self, address: &str, command: &str) -> Result<CommandOutput, ChannelError>;

    /// Run a batch command so that a later `kill_tracked` can signal it.
    async fn run_tracked(&self, address: &str, command: &str) -> Result<CommandOutput, ChannelError> {
        self.run(address, command).await
    }

    /// Best-effort signal to the batch currently running under `run_tracked`.
    async fn kill_tracked(&self, address: &str) -> Result<(), ChannelError>;

    /// Copy `source` (a file or a directory tree) into the directory `dest`.
    /// Files already at the destination are overwritten, never deleted.
    async fn copy(&self, source: &Endpoint, dest: &Endpoint) -> Result<(), ChannelError>;
}

pub fn sh_escape_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Quote a remote path for the login shell, keeping a leading `~` expandable.
fn sh_escape_path(path: &str) -> String {
    if path == "~" {
        return "\"$HOME\"".to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", sh_escape_single(rest)),
        None => sh_escape_single(path),
    }
}

/// `--rsync-path` value that creates the remote destination before receiving.
fn mkdir_rsync_path(dir: &str) -> String {
    format!("--rsync-path=mkdir -p {} && rsync", sh_escape_path(dir))
}

fn tail_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().rev().take(max_chars).collect::<String>().chars().rev().collect()
}

/// Wrap `command` so it runs in its own session with the pid recorded.
pub fn tracked_command(command: &str) -> String {
    format!(
        "mkdir -p ~/.fleet; setsid sh -c {} & echo $! > {pid}; wait $!; rc=$?; rm -f {pid}; exit $rc",
        sh_escape_single(command),
        pid = BATCH_PID_FILE,
    )
}

pub fn kill_command() -> String {
    format!(
        "if [ -f {pid} ]; then kill -TERM -- -$(cat {pid}) 2>/dev/null; fi; true",
        pid = BATCH_PID_FILE
    )
}

/// ssh for commands, rsync over ssh for copies.
pub struct SshChannel {
    settings: SshSettings,
}

impl SshChannel {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if let Some(key) = &self.settings.key_file {
            opts.push("-i".to_string());
            opts.push(key.display().to_string());
        }
        for o in [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "BatchMode=yes".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout.as_secs().max(1)),
        ] {
            opts.push("-o".to_string());
            opts.push(o);
        }
        opts
    }

    fn target(&self, host: &str) -> String {
        format!("{}@{}", self.settings.user, host)
    }

    fn remote_spec(&self, host: &str, path: &str) -> String {
        format!("{}:{}", self.target(host), path)
    }

    async fn wait(&self, mut cmd: Command, what: &str) -> Result<std::process::Output, ChannelError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn()?;
        match self.settings.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(out) => Ok(out?),
                Err(_) => Err(ChannelError::ConnectionUnavailable(format!(
                    "{} timed out after {}s",
                    what,
                    limit.as_secs()
                ))),
            },
            None => Ok(child.wait_with_output().await?),
        }
    }

    async fn rsync(&self, source: &str, dest: &str, mkdir_remote: Option<&str>) -> Result<(), ChannelError> {
        let ssh = std::iter::once("ssh".to_string())
            .chain(self.ssh_options())
            .collect::<Vec<_>>()
            .join(" ");
        let mut cmd = Command::new("rsync");
        cmd.arg("-az").arg("-e").arg(ssh);
        if let Some(dir) = mkdir_remote {
            cmd.arg(mkdir_rsync_path(dir));
        }
        cmd.arg(source).arg(dest);

        let out = self.wait(cmd, "rsync").await?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = tail_str(String::from_utf8_lossy(&out.stderr).trim(), 2000);
        // 255 comes from ssh itself; rsync reports 12 when the connection drops mid-protocol.
        match out.status.code() {
            Some(255) | Some(12) => Err(ChannelError::ConnectionUnavailable(stderr)),
            code => Err(ChannelError::Transfer(format!(
                "rsync {} -> {} exited with {:?}: {}",
                source, dest, code, stderr
            ))),
        }
    }

    fn staging_dir() -> PathBuf {
        std::env::temp_dir().join(format!("fleet-stage-{}", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl ExecutionChannel for SshChannel {
    async fn run(&self, address: &str, command: &str) -> Result<CommandOutput, ChannelError> {
        let started = Instant::now();
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_options()).arg(self.target(address)).arg(command);

        let out = self.wait(cmd, "ssh").await?;
        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        let exit_code = out.status.code().unwrap_or(-1);
        tracing::debug!(address, exit_code, elapsed_ms = started.elapsed().as_millis() as u64, "ssh command finished");

        if exit_code == 255 {
            return Err(ChannelError::ConnectionUnavailable(tail_str(stderr.trim(), 2000)));
        }
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn run_tracked(&self, address: &str, command: &str) -> Result<CommandOutput, ChannelError> {
        self.run(address, &tracked_command(command)).await
    }

    async fn kill_tracked(&self, address: &str) -> Result<(), ChannelError> {
        self.run(address, &kill_command()).await.map(|_| ())
    }

    async fn copy(&self, source: &Endpoint, dest: &Endpoint) -> Result<(), ChannelError> {
        match (source, dest) {
            (Endpoint::Remote { host: src_host, path: src_path }, Endpoint::Remote { host, path }) => {
                let stage = Self::staging_dir();
                tokio::fs::create_dir_all(&stage).await?;
                let staged = stage.display().to_string();
                let result = async {
                    self.rsync(&self.remote_spec(src_host, src_path), &staged, None).await?;
                    let name = src_path.trim_end_matches('/').rsplit('/').next().unwrap_or(src_path);
                    let local = stage.join(name).display().to_string();
                    self.rsync(&local, &format!("{}/", self.remote_spec(host, path)), Some(path)).await
                }
                .await;
                if let Err(e) = tokio::fs::remove_dir_all(&stage).await {
                    tracing::debug!(stage = %staged, error = %e, "staging cleanup failed");
                }
                result
            }
            (Endpoint::Remote { host, path }, Endpoint::Local(dir)) => {
                tokio::fs::create_dir_all(dir).await?;
                self.rsync(&self.remote_spec(host, path), &format!("{}/", dir.display()), None).await
            }
            (Endpoint::Local(src), Endpoint::Remote { host, path }) => {
                self.rsync(
                    &src.display().to_string(),
                    &format!("{}/", self.remote_spec(host, path)),
                    Some(path),
                )
                .await
            }
            (Endpoint::Local(src), Endpoint::Local(dir)) => {
                tokio::fs::create_dir_all(dir).await?;
                self.rsync(&src.display().to_string(), &format!("{}/", dir.display()), None)
                    .await
            }
        }
    }
}

impl std::fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshChannel")
            .field("user", &self.settings.user)
            .field("connect_timeout", &self.settings.connect_timeout)
            .finish()
    }
}
