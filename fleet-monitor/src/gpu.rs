use std::io::ErrorKind;

use async_trait::async_trait;

/// Where GPU utilisation samples come from.
#[async_trait]
pub trait UtilizationSource: Send + Sync {
    /// One utilisation percentage per visible GPU. Empty when none are visible.
    async fn sample(&self) -> anyhow::Result<Vec<u32>>;
}

pub struct NvidiaSmi;

#[async_trait]
impl UtilizationSource for NvidiaSmi {
    async fn sample(&self) -> anyhow::Result<Vec<u32>> {
        let out = tokio::process::Command::new("nvidia-smi")
            .arg("--query-gpu=utilization.gpu")
            .arg("--format=csv,noheader,nounits")
            .output()
            .await;
        let out = match out {
            Ok(out) => out,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("nvidia-smi not found, no GPU visible");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        if !out.status.success() {
            anyhow::bail!(
                "nvidia-smi exited with {:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(parse_utilization(&String::from_utf8_lossy(&out.stdout)))
    }
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` output.
/// Lines that are not a number count as 0.
pub fn parse_utilization(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().parse().unwrap_or(0))
        .collect()
}
