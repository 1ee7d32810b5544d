use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_common::{ClusterSpec, ClusterStatus, DispatchResult, FleetError, InstanceState};
use fleet_providers::CloudProvider;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{sh_escape_single, ExecutionChannel};
use crate::dispatcher::Dispatcher;
use crate::logger::{ActionLog, ActionLogEntry};
use crate::provider_manager::ProviderManager;
use crate::reconciliation;
use crate::registry::{ReconcileReport, Registry};
use crate::retry::{with_provider_retry, Backoff};
use crate::settings::FleetSettings;
use crate::sync_engine::{SyncEngine, SyncReport, SyncSettings, SyncSink};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub connect_backoff: Backoff,
    pub provider_backoff: Backoff,
    pub stopped_sync_timeout: Duration,
    pub action_log_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            connect_backoff: Backoff::default(),
            provider_backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(10), 5),
            stopped_sync_timeout: Duration::from_secs(600),
            action_log_capacity: 1000,
        }
    }
}

impl From<&FleetSettings> for OrchestratorSettings {
    fn from(s: &FleetSettings) -> Self {
        Self {
            poll_interval: s.poll_interval,
            connect_backoff: s.connect_backoff,
            provider_backoff: s.provider_backoff,
            stopped_sync_timeout: s.stopped_sync_timeout,
            action_log_capacity: s.action_log_capacity,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpawnReport {
    pub target: usize,
    pub launched: Vec<Uuid>,
    pub restarted: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    pub dispatched: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransitionReport {
    pub target: Option<InstanceState>,
    pub requested: Vec<Uuid>,
    pub unchanged: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KillReport {
    pub signalled: Vec<Uuid>,
    pub unreachable: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastResult {
    pub instance_id: Uuid,
    pub address: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

/// Top-level coordinator. Operator calls only record intent and send provider
/// requests; the reconcile tick is what moves recorded state.
pub struct ClusterOrchestrator {
    cluster: Arc<ClusterSpec>,
    registry: Arc<Registry>,
    provider: Arc<dyn CloudProvider>,
    channel: Arc<dyn ExecutionChannel>,
    log: Arc<ActionLog>,
    dispatcher: Arc<Dispatcher>,
    sync: Arc<SyncEngine>,
    settings: OrchestratorSettings,
    spawn_lock: Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterOrchestrator {
    pub fn new(
        cluster: ClusterSpec,
        provider: Arc<dyn CloudProvider>,
        channel: Arc<dyn ExecutionChannel>,
        settings: OrchestratorSettings,
    ) -> Self {
        let log = Arc::new(ActionLog::new(settings.action_log_capacity));
        let registry = Arc::new(Registry::new(log.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            channel.clone(),
            log.clone(),
            &cluster,
            settings.connect_backoff,
        ));
        let sink = cluster
            .sync_target
            .clone()
            .map(|t| Arc::new(t) as Arc<dyn SyncSink>);
        let sync = Arc::new(SyncEngine::new(
            registry.clone(),
            provider.clone(),
            channel.clone(),
            log.clone(),
            sink,
            SyncSettings {
                sources: cluster.sync_sources.clone(),
                interval: Duration::from_secs(cluster.sync_interval_s),
                poll_interval: settings.poll_interval,
                provider_backoff: settings.provider_backoff,
                stopped_timeout: settings.stopped_sync_timeout,
            },
        ));

        Self {
            cluster: Arc::new(cluster),
            registry,
            provider,
            channel,
            log,
            dispatcher,
            sync,
            settings,
            spawn_lock: Mutex::new(()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn cluster(&self) -> &ClusterSpec {
        &self.cluster
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn action_log(&self) -> &Arc<ActionLog> {
        &self.log
    }

    /// Start job-reconcile, and job-sync when `auto_sync` is set.
    pub fn spawn_background_jobs(&self, auto_sync: bool) -> Vec<JoinHandle<()>> {
        let mut jobs = vec![tokio::spawn(reconciliation::run(
            self.registry.clone(),
            self.provider.clone(),
            self.settings.provider_backoff,
            self.settings.poll_interval,
        ))];
        if auto_sync {
            jobs.push(tokio::spawn(self.sync.clone().run()));
        }
        jobs
    }

    /// One reconcile tick, outside the background loop.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport, FleetError> {
        Ok(reconciliation::tick(&self.registry, self.provider.as_ref(), &self.settings.provider_backoff).await?)
    }

    /// Bring the number of live instances up to `target`.
    ///
    /// Stopped instances that still owe their batch are restarted first; new
    /// launches are capped by the batches nobody has been assigned yet.
    pub async fn spawn(&self, target: usize) -> Result<SpawnReport, FleetError> {
        let _guard = self.spawn_lock.lock().await;
        let mut report = SpawnReport {
            target,
            ..SpawnReport::default()
        };
        if target == 0 {
            return Ok(report);
        }
        let status = self.registry.status().await;

        let owed: Vec<Uuid> = status
            .instances
            .iter()
            .filter(|i| i.state == InstanceState::Stopped && i.dispatch_result == DispatchResult::NotStarted)
            .map(|i| i.id)
            .collect();
        if !owed.is_empty() {
            let restarted = self.request_all(owed, InstanceState::Pending).await;
            report.restarted = restarted.requested;
        }

        let deficit = target.saturating_sub(status.non_terminal_count);
        if deficit == 0 {
            return Ok(report);
        }
        let assigned = self.registry.assigned_batches().await;
        let unassigned: Vec<usize> = (0..self.cluster.batches.len())
            .filter(|i| !assigned.contains(i))
            .take(deficit)
            .collect();
        if unassigned.is_empty() {
            tracing::info!(target, "no unassigned command batches left, nothing to launch");
            return Ok(report);
        }

        let mut ids = Vec::with_capacity(unassigned.len());
        for i in &unassigned {
            ids.push(self.registry.register(*i, self.cluster.batches[*i].clone()).await);
        }

        let started = Instant::now();
        let log_id = self.log.log_event_with_metadata(
            "PROVIDER_LAUNCH",
            "in_progress",
            None,
            None,
            Some(json!({
                "count": ids.len(),
                "image_id": self.cluster.template.image_id,
                "instance_type": self.cluster.template.instance_type,
                "provider": self.provider.name(),
            })),
        );
        let template = &self.cluster.template;
        let count = ids.len();
        // One token for every attempt of this launch.
        let client_token = format!("fleet-{}", Uuid::new_v4());
        let launched = with_provider_retry(&self.settings.provider_backoff, "launch", || {
            self.provider.launch(template, count, &client_token)
        })
        .await;
        let dur = started.elapsed().as_millis() as i64;

        match launched {
            Ok(provider_ids) => {
                self.log.log_event_complete(log_id, "success", dur, None);
                let mut provider_ids = provider_ids.into_iter();
                for id in ids {
                    match provider_ids.next() {
                        Some(pid) => {
                            self.registry.record_launched(id, pid).await?;
                            report.launched.push(id);
                        }
                        None => {
                            self.registry
                                .record_launch_failed(id, "provider launched fewer instances than requested")
                                .await?;
                            report.failed.push(id);
                        }
                    }
                }
                tracing::info!(launched = report.launched.len(), target, "🚀 spawn accepted by provider");
                Ok(report)
            }
            Err(e) => {
                let reason = e.to_string();
                self.log.log_event_complete(log_id, "failed", dur, Some(&reason));
                for id in ids {
                    self.registry.record_launch_failed(id, &reason).await?;
                }
                Err(e.into())
            }
        }
    }

    /// Begin dispatch on every RUNNING instance that has not been dispatched yet.
    pub async fn start(&self) -> StartReport {
        let mut report = StartReport::default();
        for id in self.registry.ids_in_state(InstanceState::Running).await {
            let Some(claim) = self.registry.begin_dispatch(id).await else {
                continue;
            };
            let dispatcher = self.dispatcher.clone();
            let handle = tokio::spawn(async move {
                // Outcome is recorded in the registry.
                let _ = dispatcher.dispatch(claim).await;
            });
            self.workers.lock().await.push(handle);
            report.dispatched.push(id);
        }
        if !report.dispatched.is_empty() {
            self.log.log_quick("START", None, Some(json!({ "dispatched": report.dispatched.len() })));
        }
        report
    }

    /// Wait for every dispatch worker started so far.
    pub async fn join_dispatchers(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for h in handles {
            if let Err(e) = h.await {
                tracing::error!(error = %e, "dispatch worker panicked");
            }
        }
    }

    /// Terminate running batches; instances stay up.
    pub async fn kill(&self) -> KillReport {
        let mut report = KillReport::default();
        for id in self.registry.non_terminal_ids().await {
            match self.registry.request_cancel(id).await {
                Ok(true) => {}
                _ => continue,
            }
            let Some(address) = self.registry.reachable_address(id).await else {
                report.unreachable.push(id);
                continue;
            };
            match self.channel.kill_tracked(&address).await {
                Ok(()) => report.signalled.push(id),
                Err(e) => {
                    tracing::warn!(instance_id = %id, address = %address, error = %e, "kill signal not delivered");
                    report.unreachable.push(id);
                }
            }
        }
        self.log.log_quick(
            "KILL",
            None,
            Some(json!({ "signalled": report.signalled.len(), "unreachable": report.unreachable.len() })),
        );
        report
    }

    pub async fn stop(&self) -> TransitionReport {
        let running = self.registry.ids_in_state(InstanceState::Running).await;
        self.request_all(running, InstanceState::Stopping).await
    }

    pub async fn terminate(&self) -> TransitionReport {
        let live = self.registry.non_terminal_ids().await;
        self.request_all(live, InstanceState::Terminating).await
    }

    async fn request_all(&self, ids: Vec<Uuid>, target: InstanceState) -> TransitionReport {
        let mut report = TransitionReport {
            target: Some(target),
            ..TransitionReport::default()
        };
        let mut pending = Vec::new();
        for id in ids {
            match self.registry.request_transition(id, target).await {
                Ok(Some(req)) => pending.push(req),
                Ok(None) => report.unchanged += 1,
                Err(e) => tracing::debug!(instance_id = %id, error = %e, "instance vanished before request"),
            }
        }
        if pending.is_empty() {
            return report;
        }

        let provider_ids: Vec<String> = pending.iter().map(|r| r.provider_id.clone()).collect();
        let started = Instant::now();
        let log_id = self.log.log_event_with_metadata(
            "PROVIDER_REQUEST",
            "in_progress",
            None,
            None,
            Some(json!({ "target": target.as_str(), "provider_ids": provider_ids })),
        );
        let result =
            ProviderManager::issue(self.provider.as_ref(), &self.settings.provider_backoff, target, &provider_ids)
                .await;
        let dur = started.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                self.log.log_event_complete(log_id, "success", dur, None);
                tracing::info!(target = %target, count = pending.len(), "transition requested");
                report.requested = pending.into_iter().map(|r| r.id).collect();
            }
            Err(e) => {
                self.log.log_event_complete(log_id, "failed", dur, Some(&e.to_string()));
                tracing::error!(target = %target, error = %e, "provider refused transition request");
                for r in pending {
                    if let Err(err) = self.registry.clear_request(r.id, target).await {
                        tracing::debug!(instance_id = %r.id, error = %err, "request not cleared");
                    }
                }
                report.error = Some(e.to_string());
            }
        }
        report
    }

    /// Bring stopped instances up once to copy their output, then stop them again.
    pub async fn sync_stopped(&self) -> SyncReport {
        self.sync.sync_stopped().await
    }

    /// One continuous-sync cycle, now.
    pub async fn sync_once(&self) -> SyncReport {
        self.sync.run_cycle().await
    }

    /// Run `command` on every RUNNING instance concurrently.
    pub async fn broadcast(&self, command: &str) -> Vec<BroadcastResult> {
        let running = self.registry.running_addresses().await;
        let results = join_all(running.into_iter().map(|(id, address)| async move {
            let outcome = self.channel.run(&address, command).await;
            match outcome {
                Ok(out) => BroadcastResult {
                    instance_id: id,
                    address,
                    exit_code: Some(out.exit_code),
                    stdout: out.stdout,
                    stderr: out.stderr,
                    error: None,
                },
                Err(e) => BroadcastResult {
                    instance_id: id,
                    address,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(e.to_string()),
                },
            }
        }))
        .await;
        self.log.log_quick("BROADCAST", None, Some(json!({ "command": command, "instances": results.len() })));
        results
    }

    /// Last `lines` lines of a remote file on every RUNNING instance.
    pub async fn tail_logs(&self, path: &str, lines: usize) -> Vec<BroadcastResult> {
        self.broadcast(&tail_command(path, lines)).await
    }

    pub async fn status(&self) -> ClusterStatus {
        self.registry.status().await
    }

    pub fn recent_actions(&self, limit: usize) -> Vec<ActionLogEntry> {
        self.log.recent(limit)
    }
}

fn tail_command(path: &str, lines: usize) -> String {
    let quoted = match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", sh_escape_single(rest)),
        None => sh_escape_single(path),
    };
    format!("tail -n {} {}", lines.max(1), quoted)
}
