use async_trait::async_trait;
use fleet_common::{InstanceTemplate, ProviderError};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Cloud instance API as seen by the orchestrator.
///
/// Every mutating call is asynchronous on the provider side: `Ok` means the
/// request was accepted, not that the instance reached the target state.
/// Progress is only observable through `describe`.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Launch `count` instances from `template`. Returns the new provider ids.
    ///
    /// Calls that share a `client_token` are one launch: a retry after an
    /// ambiguous failure returns the original ids instead of launching again.
    async fn launch(
        &self,
        template: &InstanceTemplate,
        count: usize,
        client_token: &str,
    ) -> ProviderResult<Vec<String>>;

    /// Current state of the given instances. Ids the provider no longer knows
    /// are simply absent from the answer.
    async fn describe(&self, ids: &[String]) -> ProviderResult<Vec<inventory::DiscoveredInstance>>;

    async fn stop_instances(&self, ids: &[String]) -> ProviderResult<()>;

    async fn start_instances(&self, ids: &[String]) -> ProviderResult<()>;

    async fn terminate_instances(&self, ids: &[String]) -> ProviderResult<()>;

    fn name(&self) -> &'static str;
}

pub mod inventory {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct DiscoveredInstance {
        pub provider_id: String,
        /// Raw provider state name (e.g. "running", "shutting-down").
        pub status: String,
        pub ip_address: Option<String>,
        pub launched_at: Option<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "aws")]
pub mod aws;
