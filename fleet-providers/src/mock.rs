use crate::{inventory, CloudProvider, ProviderResult};
use async_trait::async_trait;
use fleet_common::{InstanceTemplate, ProviderError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Request seen by the mock, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    Launch { image_id: String, count: usize },
    Describe(Vec<String>),
    Stop(Vec<String>),
    Start(Vec<String>),
    Terminate(Vec<String>),
}

#[derive(Clone, Debug)]
struct MockInstance {
    seq: u64,
    status: &'static str,
    ip_address: Option<String>,
    boots: u32,
}

#[derive(Default)]
struct MockState {
    next_seq: u64,
    instances: BTreeMap<String, MockInstance>,
    calls: Vec<MockCall>,
    transient_failures: u32,
    lost_launch_replies: u32,
    launches_by_token: HashMap<String, Vec<String>>,
    frozen: bool,
}

/// In-memory provider with EC2-like asynchronous behaviour.
///
/// Every `describe` reports the current states first, then moves each
/// transitional instance one step forward (pending -> running,
/// stopping -> stopped, shutting-down -> terminated). Call `freeze` to hold
/// everything in place.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_transient(state: &mut MockState) -> ProviderResult<()> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ProviderError::Transient("RequestLimitExceeded (mock)".to_string()));
        }
        Ok(())
    }

    /// Make the next `n` API calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// Accept the next `n` launches but answer them with a transient error,
    /// like a run-instances call whose reply never arrived.
    pub fn lose_next_launch_replies(&self, n: u32) {
        self.lock().lost_launch_replies = n;
    }

    /// Stop (or resume) the simulated progress of transitional states.
    pub fn freeze(&self, frozen: bool) {
        self.lock().frozen = frozen;
    }

    /// Simulate the instance powering itself off (idle watcher firing).
    pub fn simulate_self_shutdown(&self, provider_id: &str) -> bool {
        let mut state = self.lock();
        match state.instances.get_mut(provider_id) {
            Some(inst) if inst.status == "running" => {
                inst.status = "stopping";
                true
            }
            _ => false,
        }
    }

    /// Make the provider forget an instance entirely.
    pub fn forget(&self, provider_id: &str) {
        self.lock().instances.remove(provider_id);
    }

    pub fn status_of(&self, provider_id: &str) -> Option<&'static str> {
        self.lock().instances.get(provider_id).map(|i| i.status)
    }

    /// Provider id of the running instance currently holding `address`.
    pub fn reachable_instance(&self, address: &str) -> Option<String> {
        self.lock()
            .instances
            .iter()
            .find(|(_, i)| i.status == "running" && i.ip_address.as_deref() == Some(address))
            .map(|(id, _)| id.clone())
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// How many stop requests named `provider_id`.
    pub fn stop_requests_for(&self, provider_id: &str) -> usize {
        self.count_requests(provider_id, |c| match c {
            MockCall::Stop(ids) => Some(ids),
            _ => None,
        })
    }

    pub fn start_requests_for(&self, provider_id: &str) -> usize {
        self.count_requests(provider_id, |c| match c {
            MockCall::Start(ids) => Some(ids),
            _ => None,
        })
    }

    pub fn terminate_requests_for(&self, provider_id: &str) -> usize {
        self.count_requests(provider_id, |c| match c {
            MockCall::Terminate(ids) => Some(ids),
            _ => None,
        })
    }

    pub fn launched_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .map(|c| match c {
                MockCall::Launch { count, .. } => *count,
                _ => 0,
            })
            .sum()
    }

    fn count_requests(&self, provider_id: &str, pick: impl Fn(&MockCall) -> Option<&Vec<String>>) -> usize {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| pick(c))
            .filter(|ids| ids.iter().any(|id| id == provider_id))
            .count()
    }

    fn advance(state: &mut MockState) {
        if state.frozen {
            return;
        }
        for inst in state.instances.values_mut() {
            match inst.status {
                "pending" => {
                    inst.boots += 1;
                    inst.status = "running";
                    inst.ip_address = Some(format!("10.0.{}.{}", inst.seq, inst.boots));
                }
                "stopping" => {
                    inst.status = "stopped";
                    inst.ip_address = None;
                }
                "shutting-down" => {
                    inst.status = "terminated";
                    inst.ip_address = None;
                }
                _ => {}
            }
        }
    }

    fn known_ids(state: &MockState, ids: &[String]) -> ProviderResult<()> {
        match ids.iter().find(|id| !state.instances.contains_key(id.as_str())) {
            Some(missing) => Err(ProviderError::Rejected(format!(
                "InvalidInstanceID.NotFound: {}",
                missing
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn launch(
        &self,
        template: &InstanceTemplate,
        count: usize,
        client_token: &str,
    ) -> ProviderResult<Vec<String>> {
        let mut state = self.lock();
        Self::check_transient(&mut state)?;
        if let Some(ids) = state.launches_by_token.get(client_token) {
            return Ok(ids.clone());
        }
        state.calls.push(MockCall::Launch {
            image_id: template.image_id.clone(),
            count,
        });

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            state.next_seq += 1;
            let seq = state.next_seq;
            let id = format!("i-{:017x}", seq);
            state.instances.insert(
                id.clone(),
                MockInstance {
                    seq,
                    status: "pending",
                    ip_address: None,
                    boots: 0,
                },
            );
            ids.push(id);
        }
        state
            .launches_by_token
            .insert(client_token.to_string(), ids.clone());
        if state.lost_launch_replies > 0 {
            state.lost_launch_replies -= 1;
            return Err(ProviderError::Transient("run-instances reply lost (mock)".to_string()));
        }
        Ok(ids)
    }

    async fn describe(&self, ids: &[String]) -> ProviderResult<Vec<inventory::DiscoveredInstance>> {
        let mut state = self.lock();
        Self::check_transient(&mut state)?;
        state.calls.push(MockCall::Describe(ids.to_vec()));

        let found = ids
            .iter()
            .filter_map(|id| {
                state.instances.get(id).map(|inst| inventory::DiscoveredInstance {
                    provider_id: id.clone(),
                    status: inst.status.to_string(),
                    ip_address: inst.ip_address.clone(),
                    launched_at: None,
                })
            })
            .collect();
        Self::advance(&mut state);
        Ok(found)
    }

    async fn stop_instances(&self, ids: &[String]) -> ProviderResult<()> {
        let mut state = self.lock();
        Self::check_transient(&mut state)?;
        Self::known_ids(&state, ids)?;
        state.calls.push(MockCall::Stop(ids.to_vec()));
        for id in ids {
            if let Some(inst) = state.instances.get_mut(id) {
                if inst.status == "running" {
                    inst.status = "stopping";
                }
            }
        }
        Ok(())
    }

    async fn start_instances(&self, ids: &[String]) -> ProviderResult<()> {
        let mut state = self.lock();
        Self::check_transient(&mut state)?;
        Self::known_ids(&state, ids)?;
        state.calls.push(MockCall::Start(ids.to_vec()));
        for id in ids {
            if let Some(inst) = state.instances.get_mut(id) {
                if inst.status == "stopped" {
                    inst.status = "pending";
                }
            }
        }
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> ProviderResult<()> {
        let mut state = self.lock();
        Self::check_transient(&mut state)?;
        Self::known_ids(&state, ids)?;
        state.calls.push(MockCall::Terminate(ids.to_vec()));
        for id in ids {
            if let Some(inst) = state.instances.get_mut(id) {
                if inst.status != "terminated" {
                    inst.status = "shutting-down";
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> InstanceTemplate {
        InstanceTemplate {
            image_id: "ami-mock".to_string(),
            instance_type: "g4dn.xlarge".to_string(),
            key_name: "key".to_string(),
            security_group: "sg".to_string(),
        }
    }

    #[tokio::test]
    async fn pending_then_running_with_address() {
        let mock = MockProvider::new();
        let ids = mock.launch(&template(), 2, "t-1").await.unwrap();
        assert_eq!(ids.len(), 2);

        let first = mock.describe(&ids).await.unwrap();
        assert!(first.iter().all(|d| d.status == "pending" && d.ip_address.is_none()));

        let second = mock.describe(&ids).await.unwrap();
        assert!(second.iter().all(|d| d.status == "running" && d.ip_address.is_some()));
        assert_eq!(mock.reachable_instance("10.0.1.1"), Some(ids[0].clone()));
    }

    #[tokio::test]
    async fn address_changes_across_stop_start() {
        let mock = MockProvider::new();
        let ids = mock.launch(&template(), 1, "t-1").await.unwrap();
        mock.describe(&ids).await.unwrap();
        let before = mock.describe(&ids).await.unwrap()[0].ip_address.clone();

        mock.stop_instances(&ids).await.unwrap();
        mock.describe(&ids).await.unwrap();
        assert_eq!(mock.status_of(&ids[0]), Some("stopped"));

        mock.start_instances(&ids).await.unwrap();
        mock.describe(&ids).await.unwrap();
        let after = mock.describe(&ids).await.unwrap()[0].ip_address.clone();
        assert!(after.is_some());
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn transient_failures_then_recovery() {
        let mock = MockProvider::new();
        mock.fail_next(1);
        let err = mock.launch(&template(), 1, "t-1").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mock.launch(&template(), 1, "t-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let mock = MockProvider::new();
        let err = mock.stop_instances(&["i-nope".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn forgotten_instances_vanish_from_describe() {
        let mock = MockProvider::new();
        let ids = mock.launch(&template(), 1, "t-1").await.unwrap();
        mock.forget(&ids[0]);
        assert!(mock.describe(&ids).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_token_launches_once() {
        let mock = MockProvider::new();
        mock.lose_next_launch_replies(1);
        assert!(mock.launch(&template(), 2, "t-1").await.unwrap_err().is_transient());
        let ids = mock.launch(&template(), 2, "t-1").await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(mock.launched_count(), 2);

        mock.launch(&template(), 1, "t-2").await.unwrap();
        assert_eq!(mock.launched_count(), 3);
    }
}
