use std::sync::Arc;
use std::time::Duration;

use fleet_common::{InstanceState, ProviderError};
use fleet_providers::CloudProvider;

use crate::registry::{Observation, ReconcileReport, Registry};
use crate::retry::{with_provider_retry, Backoff};

/// One poll: describe every known instance and fold the answer into the registry.
///
/// This is the only path by which recorded state advances past PENDING.
pub async fn tick(
    registry: &Registry,
    provider: &dyn CloudProvider,
    backoff: &Backoff,
) -> Result<ReconcileReport, ProviderError> {
    let mut queried = registry.provider_ids().await;
    if queried.is_empty() {
        return Ok(ReconcileReport::default());
    }

    let discovered = with_provider_retry(backoff, "describe", || provider.describe(&queried)).await?;

    let mut observed = Vec::with_capacity(discovered.len());
    for d in discovered {
        match InstanceState::from_provider(&d.status) {
            Some(state) => observed.push(Observation {
                provider_id: d.provider_id,
                state,
                address: d.ip_address,
            }),
            None => {
                // Unknown provider state (e.g. "rebooting"): skip rather than read it as gone.
                tracing::debug!(provider_id = %d.provider_id, status = %d.status, "unmapped provider state");
                queried.retain(|id| id != &d.provider_id);
            }
        }
    }

    Ok(registry.reconcile(&queried, &observed).await)
}

/// job-reconcile: fixed-tick poll loop. Logs the non-terminal count whenever it changes.
pub async fn run(
    registry: Arc<Registry>,
    provider: Arc<dyn CloudProvider>,
    backoff: Backoff,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(every_s = every.as_secs_f64(), provider = provider.name(), "🔁 job-reconcile started");

    let mut last_count = None;
    loop {
        interval.tick().await;

        match tick(&registry, provider.as_ref(), &backoff).await {
            Ok(report) => {
                if !report.transitions.is_empty() || report.purged > 0 {
                    tracing::info!(
                        transitions = report.transitions.len(),
                        purged = report.purged,
                        inconsistencies = report.inconsistencies,
                        "🔁 job-reconcile: registry advanced"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "❌ job-reconcile error"),
        }

        let count = registry.status().await.non_terminal_count;
        if last_count != Some(count) {
            tracing::info!(non_terminal = count, "fleet size");
            last_count = Some(count);
        }
    }
}
