use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod cluster;
pub mod error;
pub mod monitor;

pub use cluster::{split_commands, ClusterSpec, Endpoint, InstanceTemplate, SyncTarget};
pub use error::{ChannelError, FleetError, ProviderError};
pub use monitor::{MonitorKind, MonitorSpec};

// --- Enums ---

/// Lifecycle of one managed instance.
///
/// The recorded state only moves when the provider reports it (or accepts a
/// launch). Requests are tracked separately by the orchestrator.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Requested,   // Registered locally, launch not yet accepted
    Pending,     // Accepted by provider, booting
    Running,     // Up with an address
    Stopping,    // Power-off in progress (operator or idle monitor)
    Stopped,     // Powered off, no address
    Terminating, // Deletion in progress
    Terminated,  // Gone
    Failed,      // Never came up
}

impl InstanceState {
    pub const ALL: [InstanceState; 8] = [
        InstanceState::Requested,
        InstanceState::Pending,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::Stopped,
        InstanceState::Terminating,
        InstanceState::Terminated,
        InstanceState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Requested => "requested",
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
            InstanceState::Failed => "failed",
        }
    }

    /// Map a provider-reported state name (EC2 vocabulary) onto our states.
    pub fn from_provider(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requested" => Some(InstanceState::Requested),
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            "shutting-down" | "terminating" => Some(InstanceState::Terminating),
            "terminated" => Some(InstanceState::Terminated),
            "failed" => Some(InstanceState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Failed)
    }

    /// States in which an instance exposes a network endpoint.
    pub fn has_address(&self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Stopping)
    }

    /// Direct edges of the lifecycle graph.
    pub fn successors(&self) -> &'static [InstanceState] {
        match self {
            InstanceState::Requested => &[InstanceState::Pending, InstanceState::Failed],
            InstanceState::Pending => &[InstanceState::Running, InstanceState::Failed],
            InstanceState::Running => &[InstanceState::Stopping, InstanceState::Terminating],
            InstanceState::Stopping => &[InstanceState::Stopped],
            InstanceState::Stopped => &[InstanceState::Terminating, InstanceState::Pending],
            InstanceState::Terminating => &[InstanceState::Terminated],
            InstanceState::Terminated | InstanceState::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        self.successors().contains(&next)
    }

    /// Whether `target` is reachable from `self` along one or more edges.
    pub fn can_reach(&self, target: InstanceState) -> bool {
        let mut seen = Vec::with_capacity(InstanceState::ALL.len());
        let mut frontier: Vec<InstanceState> = self.successors().to_vec();
        while let Some(state) = frontier.pop() {
            if state == target {
                return true;
            }
            if seen.contains(&state) {
                continue;
            }
            seen.push(state);
            frontier.extend_from_slice(state.successors());
        }
        false
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running setup + batch on one instance. Independent of power state.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchResult {
    #[default]
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

impl DispatchResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchResult::NotStarted => "not_started",
            DispatchResult::InProgress => "in_progress",
            DispatchResult::Succeeded => "succeeded",
            DispatchResult::Failed => "failed",
        }
    }
}

// --- Views ---

/// Read-only snapshot of one registry record, as reported by status queries.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceSummary {
    pub id: Uuid,
    pub provider_id: Option<String>,
    pub state: InstanceState,
    pub requested: Option<InstanceState>,
    pub address: Option<String>,
    pub dispatch_result: DispatchResult,
    pub dispatch_error: Option<String>,
    pub batch: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClusterStatus {
    pub non_terminal_count: usize,
    pub instances: Vec<InstanceSummary>,
}

impl ClusterStatus {
    pub fn failed(&self) -> impl Iterator<Item = &InstanceSummary> {
        self.instances.iter().filter(|i| {
            i.state == InstanceState::Failed || i.dispatch_result == DispatchResult::Failed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_map_onto_states() {
        assert_eq!(InstanceState::from_provider("pending"), Some(InstanceState::Pending));
        assert_eq!(InstanceState::from_provider("RUNNING"), Some(InstanceState::Running));
        assert_eq!(
            InstanceState::from_provider("shutting-down"),
            Some(InstanceState::Terminating)
        );
        assert_eq!(InstanceState::from_provider("rebooting"), None);
        for state in InstanceState::ALL {
            assert_eq!(InstanceState::from_provider(state.as_str()), Some(state));
        }
    }

    #[test]
    fn address_only_while_running_or_stopping() {
        let with_address: Vec<_> = InstanceState::ALL
            .into_iter()
            .filter(|s| s.has_address())
            .collect();
        assert_eq!(with_address, vec![InstanceState::Running, InstanceState::Stopping]);
    }

    #[test]
    fn lifecycle_edges() {
        use InstanceState::*;
        assert!(Requested.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Pending));
        assert!(Stopped.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));

        assert!(!Pending.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Pending));
        assert!(Terminated.successors().is_empty());
        assert!(Failed.successors().is_empty());
    }

    #[test]
    fn reachability_follows_the_graph() {
        use InstanceState::*;
        assert!(Running.can_reach(Stopped));
        assert!(Stopping.can_reach(Terminating));
        assert!(Stopped.can_reach(Running));
        assert!(!Terminating.can_reach(Stopping));
        assert!(!Terminated.can_reach(Running));
        assert!(!Failed.can_reach(Terminated));
        // Terminal states are sinks; nothing loops back onto them.
        assert!(!Terminating.can_reach(Terminating));
    }
}
