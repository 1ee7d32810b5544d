use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a cloud provider binding.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Throttling, timeouts, unreachable API. Safe to retry.
    #[error("provider transient error: {0}")]
    Transient(String),
    /// The provider refused the request (validation, permissions, quota).
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Errors returned by the remote execution channel.
///
/// A command that ran and exited non-zero is not an error at this level.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("provider transient error: {0}")]
    ProviderTransient(String),

    #[error("provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("instance {instance_id} unreachable: {reason}")]
    ConnectionUnavailable { instance_id: Uuid, reason: String },

    #[error("command `{command}` exited with {exit_code}: {stderr}")]
    CommandFailure {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("sync failed for instance {instance_id}: {reason}")]
    SyncFailure { instance_id: Uuid, reason: String },

    #[error("instance {instance_id}: recorded {recorded}, observed {observed}")]
    StateInconsistency {
        instance_id: Uuid,
        recorded: String,
        observed: String,
    },

    #[error("cancelled by operator")]
    Cancelled,

    #[error("unknown instance {0}")]
    UnknownInstance(Uuid),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<ProviderError> for FleetError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => FleetError::ProviderTransient(msg),
            ProviderError::Rejected(msg) => FleetError::ProviderRejected(msg),
        }
    }
}

impl FleetError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::ProviderTransient(_)
                | FleetError::ConnectionUnavailable { .. }
                | FleetError::SyncFailure { .. }
        )
    }
}
