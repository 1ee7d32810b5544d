//! Authoritative in-memory view of every managed instance.
//!
//! Records live in an arena keyed by a local id. The map itself is only
//! write-locked to insert or purge; each record has its own mutex, so writes
//! to one instance are serialized while unrelated instances update in
//! parallel. Only two things move a record's `state`: launch acceptance and
//! `reconcile` with a provider observation. Operator commands record intent
//! in `requested`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_common::{
    ClusterStatus, DispatchResult, FleetError, InstanceState, InstanceSummary,
};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::logger::ActionLog;

#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub provider_id: Option<String>,
    pub state: InstanceState,
    pub requested: Option<InstanceState>,
    pub requested_at: Option<DateTime<Utc>>,
    pub address: Option<String>,
    /// Index of the assigned batch in the cluster's batch list.
    pub batch_index: usize,
    pub batch: Vec<String>,
    pub dispatch: DispatchResult,
    pub dispatch_error: Option<String>,
    pub cancel_requested: bool,
    /// `cancel_requested` as it was before the outstanding request.
    cancel_before_request: bool,
    pub monitor_scheduled: bool,
    pub ever_running: bool,
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id,
            provider_id: self.provider_id.clone(),
            state: self.state,
            requested: self.requested,
            address: self.address.clone(),
            dispatch_result: self.dispatch,
            dispatch_error: self.dispatch_error.clone(),
            batch: self.batch.clone(),
            created_at: self.created_at,
        }
    }
}

/// One provider-side fact about an instance, as returned by `describe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub provider_id: String,
    pub state: InstanceState,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub id: Uuid,
    pub from: InstanceState,
    pub to: InstanceState,
}

#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub transitions: Vec<Transition>,
    pub inconsistencies: usize,
    pub purged: usize,
    pub expired_requests: usize,
}

/// What the caller must send to the provider after a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub id: Uuid,
    pub provider_id: String,
    pub target: InstanceState,
}

/// Work handed to a dispatcher once it claims an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchClaim {
    pub id: Uuid,
    pub batch: Vec<String>,
}

pub struct Registry {
    records: RwLock<HashMap<Uuid, Arc<Mutex<InstanceRecord>>>>,
    log: Arc<ActionLog>,
    request_ttl: Duration,
}

impl Registry {
    pub fn new(log: Arc<ActionLog>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            log,
            request_ttl: Duration::from_secs(600),
        }
    }

    /// How long an unconfirmed request blocks re-requesting the same target.
    pub fn with_request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    async fn record(&self, id: Uuid) -> Result<Arc<Mutex<InstanceRecord>>, FleetError> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(FleetError::UnknownInstance(id))
    }

    async fn all_records(&self) -> Vec<Arc<Mutex<InstanceRecord>>> {
        self.records.read().await.values().cloned().collect()
    }

    /// Register a new instance in REQUESTED with its fixed command batch.
    pub async fn register(&self, batch_index: usize, batch: Vec<String>) -> Uuid {
        let id = Uuid::new_v4();
        let record = InstanceRecord {
            id,
            provider_id: None,
            state: InstanceState::Requested,
            requested: None,
            requested_at: None,
            address: None,
            batch_index,
            batch,
            dispatch: DispatchResult::NotStarted,
            dispatch_error: None,
            cancel_requested: false,
            cancel_before_request: false,
            monitor_scheduled: false,
            ever_running: false,
            created_at: Utc::now(),
        };
        self.records
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(record)));
        tracing::debug!(instance_id = %id, batch_index, "instance registered");
        id
    }

    /// REQUESTED -> PENDING once the provider accepted the launch.
    pub async fn record_launched(&self, id: Uuid, provider_id: String) -> Result<(), FleetError> {
        let rec = self.record(id).await?;
        let mut rec = rec.lock().await;
        if rec.state != InstanceState::Requested {
            return Ok(());
        }
        tracing::info!(instance_id = %id, provider_id = %provider_id, "launch accepted");
        rec.provider_id = Some(provider_id);
        self.apply_state(&mut rec, InstanceState::Pending);
        Ok(())
    }

    /// REQUESTED -> FAILED when the provider refused (or never accepted) the launch.
    pub async fn record_launch_failed(&self, id: Uuid, reason: &str) -> Result<(), FleetError> {
        let rec = self.record(id).await?;
        let mut rec = rec.lock().await;
        if rec.state != InstanceState::Requested {
            return Ok(());
        }
        rec.dispatch_error = Some(format!("launch failed: {}", reason));
        self.apply_state(&mut rec, InstanceState::Failed);
        Ok(())
    }

    fn apply_state(&self, rec: &mut InstanceRecord, to: InstanceState) -> Transition {
        let from = rec.state;
        rec.state = to;
        if to == InstanceState::Running {
            rec.ever_running = true;
        }
        if !to.has_address() {
            rec.address = None;
        }
        self.log.log_quick(
            "STATE_TRANSITION",
            Some(rec.id),
            Some(json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "provider_id": rec.provider_id,
            })),
        );
        Transition { id: rec.id, from, to }
    }

    /// Record the intent to move `id` to `target`.
    ///
    /// Returns `None` (nothing to send) when the instance is already there,
    /// the same request is still outstanding, the target is unreachable from
    /// the current state, or the provider does not know the instance yet.
    pub async fn request_transition(
        &self,
        id: Uuid,
        target: InstanceState,
    ) -> Result<Option<TransitionRequest>, FleetError> {
        let rec = self.record(id).await?;
        let mut rec = rec.lock().await;

        if rec.state == target || rec.requested == Some(target) || !rec.state.can_reach(target) {
            return Ok(None);
        }
        let Some(provider_id) = rec.provider_id.clone() else {
            return Ok(None);
        };

        rec.requested = Some(target);
        rec.requested_at = Some(Utc::now());
        rec.cancel_before_request = rec.cancel_requested;
        match target {
            InstanceState::Stopping | InstanceState::Terminating => rec.cancel_requested = true,
            // A restarted instance that still owes its batch may be dispatched again.
            InstanceState::Pending if rec.dispatch == DispatchResult::NotStarted => {
                rec.cancel_requested = false
            }
            _ => {}
        }
        tracing::info!(instance_id = %id, provider_id = %provider_id, from = %rec.state, target = %target, "transition requested");
        Ok(Some(TransitionRequest {
            id,
            provider_id,
            target,
        }))
    }

    /// Forget an outstanding request (the provider call itself failed).
    /// The cancel flag goes back to what it was before the request.
    pub async fn clear_request(&self, id: Uuid, target: InstanceState) -> Result<(), FleetError> {
        let rec = self.record(id).await?;
        let mut rec = rec.lock().await;
        if rec.requested == Some(target) {
            rec.requested = None;
            rec.requested_at = None;
            rec.cancel_requested = rec.cancel_before_request;
        }
        Ok(())
    }

    /// Apply fresh provider observations.
    ///
    /// `queried` lists every provider id that was asked about; ids missing
    /// from `observed` are treated as gone. The observation always wins; an
    /// observed state that is not a direct successor is logged as an
    /// inconsistency.
    pub async fn reconcile(&self, queried: &[String], observed: &[Observation]) -> ReconcileReport {
        let by_id: HashMap<&str, &Observation> = observed
            .iter()
            .map(|o| (o.provider_id.as_str(), o))
            .collect();
        let queried: HashSet<&str> = queried.iter().map(String::as_str).collect();

        let mut report = ReconcileReport::default();
        let mut purge = Vec::new();
        let now = Utc::now();

        for handle in self.all_records().await {
            let mut rec = handle.lock().await;
            let Some(provider_id) = rec.provider_id.clone() else {
                continue;
            };
            if !queried.contains(provider_id.as_str()) || rec.state.is_terminal() {
                continue;
            }

            let (observed_state, observed_address) = match by_id.get(provider_id.as_str()) {
                Some(o) => (o.state, o.address.clone()),
                None => (InstanceState::Terminated, None),
            };

            let mut next = observed_state;
            if next == InstanceState::Terminated && !rec.ever_running {
                next = InstanceState::Failed;
            }
            if next == InstanceState::Running && observed_address.is_none() && rec.address.is_none() {
                // Running is only recorded once an address is assigned.
                continue;
            }

            if next != rec.state {
                let self_shutdown = rec.monitor_scheduled
                    && rec.requested.is_none()
                    && rec.state == InstanceState::Running
                    && matches!(next, InstanceState::Stopping | InstanceState::Stopped);
                if self_shutdown {
                    tracing::info!(instance_id = %rec.id, provider_id = %provider_id, "idle monitor powered instance off");
                    self.log.log_quick(
                        "MONITOR_SHUTDOWN",
                        Some(rec.id),
                        Some(json!({ "observed": next.as_str() })),
                    );
                } else if !rec.state.can_transition_to(next) {
                    report.inconsistencies += 1;
                    let err = FleetError::StateInconsistency {
                        instance_id: rec.id,
                        recorded: rec.state.to_string(),
                        observed: next.to_string(),
                    };
                    tracing::warn!(instance_id = %rec.id, provider_id = %provider_id, error = %err, "trusting provider observation");
                    self.log.log_event(
                        "STATE_INCONSISTENCY",
                        "success",
                        Some(rec.id),
                        Some(&err.to_string()),
                    );
                }
                if next == InstanceState::Failed {
                    rec.dispatch_error
                        .get_or_insert_with(|| "terminated before ever running".to_string());
                }
                report.transitions.push(self.apply_state(&mut rec, next));
            }

            if rec.state.has_address() {
                if let Some(addr) = observed_address {
                    rec.address = Some(addr);
                }
            }

            if let Some(req) = rec.requested {
                let settled = rec.state == req
                    || req.can_transition_to(rec.state)
                    || rec.state.is_terminal()
                    || !rec.state.can_reach(req);
                let expired = rec
                    .requested_at
                    .and_then(|at| (now - at).to_std().ok())
                    .is_some_and(|age| age > self.request_ttl);
                if settled || expired {
                    if expired && !settled {
                        report.expired_requests += 1;
                        rec.cancel_requested = rec.cancel_before_request;
                        tracing::warn!(instance_id = %rec.id, requested = %req, state = %rec.state, "request not honoured by provider, expiring");
                    }
                    rec.requested = None;
                    rec.requested_at = None;
                }
            }

            if rec.state == InstanceState::Terminated {
                purge.push(rec.id);
            }
        }

        if !purge.is_empty() {
            let mut records = self.records.write().await;
            for id in &purge {
                records.remove(id);
                tracing::info!(instance_id = %id, "terminated instance purged");
            }
            report.purged = purge.len();
        }

        for violation in self.invariant_violations().await {
            tracing::error!(violation = %violation, "registry invariant violated");
        }
        report
    }

    /// Address invariant: defined iff the state exposes one.
    pub async fn invariant_violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        for handle in self.all_records().await {
            let rec = handle.lock().await;
            if rec.address.is_some() != rec.state.has_address() {
                out.push(format!(
                    "instance {} in {} with address {:?}",
                    rec.id, rec.state, rec.address
                ));
            }
        }
        out
    }

    /// Provider ids worth asking the provider about.
    pub async fn provider_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for handle in self.all_records().await {
            let rec = handle.lock().await;
            if rec.state.is_terminal() {
                continue;
            }
            if let Some(pid) = &rec.provider_id {
                ids.push(pid.clone());
            }
        }
        ids.sort();
        ids
    }

    pub async fn ids_in_state(&self, state: InstanceState) -> Vec<Uuid> {
        let mut out = Vec::new();
        for handle in self.all_records().await {
            let rec = handle.lock().await;
            if rec.state == state {
                out.push((rec.created_at, rec.id));
            }
        }
        out.sort();
        out.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn non_terminal_ids(&self) -> Vec<Uuid> {
        let mut out = Vec::new();
        for handle in self.all_records().await {
            let rec = handle.lock().await;
            if !rec.state.is_terminal() {
                out.push((rec.created_at, rec.id));
            }
        }
        out.sort();
        out.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<InstanceSummary> {
        let rec = self.record(id).await.ok()?;
        let rec = rec.lock().await;
        Some(rec.summary())
    }

    /// Address of a RUNNING instance; `None` means unreachable right now.
    pub async fn reachable_address(&self, id: Uuid) -> Option<String> {
        let rec = self.record(id).await.ok()?;
        let rec = rec.lock().await;
        if rec.state == InstanceState::Running {
            rec.address.clone()
        } else {
            None
        }
    }

    /// `(id, address)` of every RUNNING instance.
    pub async fn running_addresses(&self) -> Vec<(Uuid, String)> {
        let mut out = Vec::new();
        for handle in self.all_records().await {
            let rec = handle.lock().await;
            if rec.state != InstanceState::Running {
                continue;
            }
            if let Some(addr) = &rec.address {
                out.push((rec.created_at, rec.id, addr.clone()));
            }
        }
        out.sort();
        out.into_iter().map(|(_, id, addr)| (id, addr)).collect()
    }

    /// Batch indices held by an instance. A batch whose instance failed
    /// before ever running goes back to the pool.
    pub async fn assigned_batches(&self) -> HashSet<usize> {
        let mut out = HashSet::new();
        for handle in self.all_records().await {
            let rec = handle.lock().await;
            if rec.state == InstanceState::Failed && !rec.ever_running {
                continue;
            }
            out.insert(rec.batch_index);
        }
        out
    }

    /// Claim an instance for dispatch. Only a RUNNING instance whose dispatch
    /// has never started can be claimed, so repeated `start` calls are no-ops.
    pub async fn begin_dispatch(&self, id: Uuid) -> Option<DispatchClaim> {
        let rec = self.record(id).await.ok()?;
        let mut rec = rec.lock().await;
        if rec.state != InstanceState::Running
            || rec.dispatch != DispatchResult::NotStarted
            || rec.cancel_requested
        {
            return None;
        }
        rec.dispatch = DispatchResult::InProgress;
        Some(DispatchClaim {
            id,
            batch: rec.batch.clone(),
        })
    }

    pub async fn finish_dispatch(&self, id: Uuid, outcome: Result<(), String>) {
        let Ok(rec) = self.record(id).await else {
            return;
        };
        let mut rec = rec.lock().await;
        match outcome {
            Ok(()) => {
                rec.dispatch = DispatchResult::Succeeded;
                rec.dispatch_error = None;
            }
            Err(reason) => {
                rec.dispatch = DispatchResult::Failed;
                rec.dispatch_error = Some(reason);
            }
        }
    }

    pub async fn mark_monitor_scheduled(&self, id: Uuid) {
        if let Ok(rec) = self.record(id).await {
            rec.lock().await.monitor_scheduled = true;
        }
    }

    /// Ask in-flight dispatch for `id` to stop before its next command.
    pub async fn request_cancel(&self, id: Uuid) -> Result<bool, FleetError> {
        let rec = self.record(id).await?;
        let mut rec = rec.lock().await;
        let was_active = rec.dispatch == DispatchResult::InProgress;
        if was_active {
            rec.cancel_requested = true;
        }
        Ok(was_active)
    }

    /// Whether a dispatcher working on `id` must stop issuing commands.
    pub async fn should_halt(&self, id: Uuid) -> bool {
        match self.record(id).await {
            Ok(rec) => {
                let rec = rec.lock().await;
                rec.cancel_requested || rec.state.is_terminal()
            }
            Err(_) => true,
        }
    }

    pub async fn status(&self) -> ClusterStatus {
        let mut instances = Vec::new();
        for handle in self.all_records().await {
            instances.push(handle.lock().await.summary());
        }
        instances.sort_by_key(|i| (i.created_at, i.id));
        ClusterStatus {
            non_terminal_count: instances.iter().filter(|i| !i.state.is_terminal()).count(),
            instances,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(Arc::new(ActionLog::new(100)))
    }

    fn obs(pid: &str, state: InstanceState, address: Option<&str>) -> Observation {
        Observation {
            provider_id: pid.to_string(),
            state,
            address: address.map(str::to_string),
        }
    }

    async fn running(reg: &Registry, pid: &str) -> Uuid {
        let id = reg.register(0, vec!["true".into()]).await;
        reg.record_launched(id, pid.to_string()).await.unwrap();
        let q = vec![pid.to_string()];
        reg.reconcile(&q, &[obs(pid, InstanceState::Running, Some("1.2.3.4"))]).await;
        id
    }

    #[tokio::test]
    async fn launch_moves_requested_to_pending() {
        let reg = registry();
        let id = reg.register(0, vec!["echo hi".into()]).await;
        assert_eq!(reg.get(id).await.unwrap().state, InstanceState::Requested);

        reg.record_launched(id, "i-1".into()).await.unwrap();
        let rec = reg.get(id).await.unwrap();
        assert_eq!(rec.state, InstanceState::Pending);
        assert_eq!(rec.provider_id.as_deref(), Some("i-1"));
        assert!(rec.address.is_none());
    }

    #[tokio::test]
    async fn running_requires_an_address() {
        let reg = registry();
        let id = reg.register(0, vec!["true".into()]).await;
        reg.record_launched(id, "i-1".into()).await.unwrap();
        let q = vec!["i-1".to_string()];

        reg.reconcile(&q, &[obs("i-1", InstanceState::Running, None)]).await;
        assert_eq!(reg.get(id).await.unwrap().state, InstanceState::Pending);

        reg.reconcile(&q, &[obs("i-1", InstanceState::Running, Some("5.6.7.8"))]).await;
        let rec = reg.get(id).await.unwrap();
        assert_eq!(rec.state, InstanceState::Running);
        assert_eq!(rec.address.as_deref(), Some("5.6.7.8"));
        assert!(reg.invariant_violations().await.is_empty());
    }

    #[tokio::test]
    async fn stop_request_is_idempotent() {
        let reg = registry();
        let id = running(&reg, "i-1").await;

        let first = reg.request_transition(id, InstanceState::Stopping).await.unwrap();
        assert!(first.is_some());
        let second = reg.request_transition(id, InstanceState::Stopping).await.unwrap();
        assert!(second.is_none());
        // Recorded state waits for the provider.
        assert_eq!(reg.get(id).await.unwrap().state, InstanceState::Running);
    }

    #[tokio::test]
    async fn unreachable_targets_are_noops() {
        let reg = registry();
        let id = running(&reg, "i-1").await;
        let q = vec!["i-1".to_string()];
        reg.reconcile(&q, &[obs("i-1", InstanceState::Terminating, None)]).await;

        assert!(reg
            .request_transition(id, InstanceState::Stopping)
            .await
            .unwrap()
            .is_none());
        assert!(reg
            .request_transition(id, InstanceState::Terminating)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn requests_without_provider_id_are_noops() {
        let reg = registry();
        let id = reg.register(0, vec!["true".into()]).await;
        assert!(reg
            .request_transition(id, InstanceState::Terminating)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn observation_settles_request_and_drops_address() {
        let reg = registry();
        let id = running(&reg, "i-1").await;
        let q = vec!["i-1".to_string()];
        reg.request_transition(id, InstanceState::Stopping).await.unwrap();

        reg.reconcile(&q, &[obs("i-1", InstanceState::Stopping, Some("1.2.3.4"))]).await;
        let rec = reg.get(id).await.unwrap();
        assert_eq!(rec.state, InstanceState::Stopping);
        assert_eq!(rec.requested, None);
        assert!(rec.address.is_some());

        reg.reconcile(&q, &[obs("i-1", InstanceState::Stopped, None)]).await;
        let rec = reg.get(id).await.unwrap();
        assert_eq!(rec.state, InstanceState::Stopped);
        assert!(rec.address.is_none());
        assert!(reg.invariant_violations().await.is_empty());
    }

    #[tokio::test]
    async fn skipped_edges_are_trusted_but_counted() {
        let reg = registry();
        let id = running(&reg, "i-1").await;
        let q = vec!["i-1".to_string()];

        let report = reg.reconcile(&q, &[obs("i-1", InstanceState::Stopped, None)]).await;
        assert_eq!(report.inconsistencies, 1);
        assert_eq!(reg.get(id).await.unwrap().state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn monitor_shutdown_is_expected() {
        let reg = registry();
        let id = running(&reg, "i-1").await;
        reg.mark_monitor_scheduled(id).await;
        let q = vec!["i-1".to_string()];

        let report = reg.reconcile(&q, &[obs("i-1", InstanceState::Stopped, None)]).await;
        assert_eq!(report.inconsistencies, 0);
        assert_eq!(reg.get(id).await.unwrap().state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn vanished_before_running_fails() {
        let reg = registry();
        let id = reg.register(0, vec!["true".into()]).await;
        reg.record_launched(id, "i-1".into()).await.unwrap();

        let report = reg.reconcile(&["i-1".to_string()], &[]).await;
        assert_eq!(report.inconsistencies, 0);
        let rec = reg.get(id).await.unwrap();
        assert_eq!(rec.state, InstanceState::Failed);
        assert!(rec.dispatch_error.is_some());
        assert_eq!(reg.status().await.failed().count(), 1);
    }

    #[tokio::test]
    async fn terminated_instances_are_purged() {
        let reg = registry();
        let id = running(&reg, "i-1").await;
        let q = vec!["i-1".to_string()];
        reg.request_transition(id, InstanceState::Terminating).await.unwrap();
        reg.reconcile(&q, &[obs("i-1", InstanceState::Terminating, None)]).await;
        assert_eq!(reg.len().await, 1);

        let report = reg.reconcile(&q, &[obs("i-1", InstanceState::Terminated, None)]).await;
        assert_eq!(report.purged, 1);
        assert!(reg.get(id).await.is_none());
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn unqueried_instances_are_left_alone() {
        let reg = registry();
        let id = running(&reg, "i-1").await;
        reg.reconcile(&[], &[]).await;
        assert_eq!(reg.get(id).await.unwrap().state, InstanceState::Running);
    }

    #[tokio::test]
    async fn dispatch_claim_is_single_shot() {
        let reg = registry();
        let id = running(&reg, "i-1").await;

        let claim = reg.begin_dispatch(id).await.unwrap();
        assert_eq!(claim.batch, vec!["true".to_string()]);
        assert!(reg.begin_dispatch(id).await.is_none());

        reg.finish_dispatch(id, Ok(())).await;
        assert_eq!(reg.get(id).await.unwrap().dispatch_result, DispatchResult::Succeeded);
        assert!(reg.begin_dispatch(id).await.is_none());
    }

    #[tokio::test]
    async fn stop_request_raises_cancel_flag() {
        let reg = registry();
        let id = running(&reg, "i-1").await;
        assert!(!reg.should_halt(id).await);
        reg.request_transition(id, InstanceState::Stopping).await.unwrap();
        assert!(reg.should_halt(id).await);
    }

    #[tokio::test]
    async fn expired_requests_can_be_reissued() {
        let reg = Registry::new(Arc::new(ActionLog::new(10))).with_request_ttl(Duration::ZERO);
        let id = running(&reg, "i-1").await;
        let q = vec!["i-1".to_string()];
        reg.request_transition(id, InstanceState::Stopping).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = reg
            .reconcile(&q, &[obs("i-1", InstanceState::Running, Some("1.2.3.4"))])
            .await;
        assert_eq!(report.expired_requests, 1);
        assert!(reg
            .request_transition(id, InstanceState::Stopping)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn refused_stop_does_not_block_dispatch() {
        let reg = registry();
        let id = running(&reg, "i-1").await;
        reg.request_transition(id, InstanceState::Stopping).await.unwrap();
        assert!(reg.should_halt(id).await);

        reg.clear_request(id, InstanceState::Stopping).await.unwrap();
        assert!(!reg.should_halt(id).await);
        assert_eq!(reg.get(id).await.unwrap().requested, None);
        assert!(reg.begin_dispatch(id).await.is_some());
    }

    #[tokio::test]
    async fn refused_stop_keeps_an_earlier_kill() {
        let reg = registry();
        let id = running(&reg, "i-1").await;
        reg.begin_dispatch(id).await.unwrap();
        assert!(reg.request_cancel(id).await.unwrap());

        reg.request_transition(id, InstanceState::Stopping).await.unwrap();
        reg.clear_request(id, InstanceState::Stopping).await.unwrap();
        assert!(reg.should_halt(id).await);
    }

    #[tokio::test]
    async fn failed_launch_releases_its_batch() {
        let reg = registry();
        let lost = reg.register(0, vec!["a".into()]).await;
        let kept = reg.register(1, vec!["b".into()]).await;
        reg.record_launch_failed(lost, "quota").await.unwrap();
        reg.record_launched(kept, "i-2".into()).await.unwrap();

        let assigned = reg.assigned_batches().await;
        assert!(!assigned.contains(&0));
        assert!(assigned.contains(&1));
    }
}
