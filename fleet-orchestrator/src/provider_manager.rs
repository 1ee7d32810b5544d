use std::sync::Arc;

use fleet_common::{InstanceState, ProviderError};
use fleet_providers::CloudProvider;

use crate::retry::{with_provider_retry, Backoff};
use crate::settings::FleetSettings;

pub struct ProviderManager;

impl ProviderManager {
    pub async fn get_provider(provider_name: &str, settings: &FleetSettings) -> Option<Arc<dyn CloudProvider>> {
        let _ = settings;
        match provider_name.trim().to_lowercase().as_str() {
            #[cfg(feature = "provider-aws")]
            "aws" => Some(Arc::new(
                fleet_providers::aws::AwsProvider::from_env(settings.aws_region.clone()).await,
            )),
            #[cfg(feature = "provider-mock")]
            "mock" => Some(Arc::new(fleet_providers::mock::MockProvider::new())),
            _ => None,
        }
    }

    /// Send the provider call that moves `provider_ids` toward `target`.
    pub async fn issue(
        provider: &dyn CloudProvider,
        backoff: &Backoff,
        target: InstanceState,
        provider_ids: &[String],
    ) -> Result<(), ProviderError> {
        if provider_ids.is_empty() {
            return Ok(());
        }
        match target {
            InstanceState::Pending => {
                with_provider_retry(backoff, "start", || provider.start_instances(provider_ids)).await
            }
            InstanceState::Stopping => {
                with_provider_retry(backoff, "stop", || provider.stop_instances(provider_ids)).await
            }
            InstanceState::Terminating => {
                with_provider_retry(backoff, "terminate", || provider.terminate_instances(provider_ids))
                    .await
            }
            other => Err(ProviderError::Rejected(format!(
                "no provider request moves an instance to {}",
                other
            ))),
        }
    }
}
