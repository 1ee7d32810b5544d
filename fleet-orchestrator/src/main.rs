use std::sync::Arc;

use anyhow::{anyhow, Context};
use fleet_common::ClusterSpec;
use fleet_orchestrator::api;
use fleet_orchestrator::channel::SshChannel;
use fleet_orchestrator::provider_manager::ProviderManager;
use fleet_orchestrator::settings::FleetSettings;
use fleet_orchestrator::{ClusterOrchestrator, OrchestratorSettings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = FleetSettings::from_env()?;
    let cluster = ClusterSpec::load(&settings.cluster_spec_path)
        .with_context(|| format!("loading {}", settings.cluster_spec_path.display()))?;
    tracing::info!(
        batches = cluster.batches.len(),
        image_id = %cluster.template.image_id,
        instance_type = %cluster.template.instance_type,
        "✅ cluster spec loaded"
    );

    let provider = ProviderManager::get_provider(&settings.provider, &settings)
        .await
        .ok_or_else(|| anyhow!("provider `{}` is not available in this build", settings.provider))?;
    if settings.ssh.key_file.is_none() {
        tracing::warn!("FLEET_SSH_KEY_FILE not set, relying on the ssh agent");
    }
    let channel = Arc::new(SshChannel::new(settings.ssh.clone()));

    let orchestrator = Arc::new(ClusterOrchestrator::new(
        cluster,
        provider,
        channel,
        OrchestratorSettings::from(&settings),
    ));
    let _jobs = orchestrator.spawn_background_jobs(settings.auto_sync);

    let app = api::router(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(settings.http_addr)
        .await
        .with_context(|| format!("binding {}", settings.http_addr))?;
    tracing::info!(addr = %settings.http_addr, provider = %settings.provider, "Fleet orchestrator listening");
    axum::serve(listener, app).await.context("http server stopped")?;
    Ok(())
}
