pub mod api;
pub mod channel;
pub mod dispatcher;
pub mod logger;
pub mod monitor;
pub mod orchestrator;
pub mod provider_manager;
pub mod reconciliation;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod sync_engine;

pub use orchestrator::{ClusterOrchestrator, OrchestratorSettings};
