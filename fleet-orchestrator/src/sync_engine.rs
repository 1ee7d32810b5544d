use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleet_common::{ChannelError, Endpoint, FleetError, InstanceState, InstanceSummary, SyncTarget};
use fleet_providers::CloudProvider;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::channel::ExecutionChannel;
use crate::logger::ActionLog;
use crate::reconciliation;
use crate::provider_manager::ProviderManager;
use crate::registry::Registry;
use crate::retry::Backoff;

/// Anything that can take in source paths pulled from an instance.
#[async_trait]
pub trait SyncSink: Send + Sync {
    fn label(&self) -> String;

    /// Pull every source from `host` into this sink. Returns the sources that failed;
    /// one failing source does not stop the others.
    async fn pull(
        &self,
        channel: &dyn ExecutionChannel,
        host: &str,
        sources: &[String],
    ) -> Vec<(String, ChannelError)>;
}

#[async_trait]
impl SyncSink for SyncTarget {
    fn label(&self) -> String {
        self.endpoint().to_string()
    }

    async fn pull(
        &self,
        channel: &dyn ExecutionChannel,
        host: &str,
        sources: &[String],
    ) -> Vec<(String, ChannelError)> {
        let dest = self.endpoint();
        let mut failed = Vec::new();
        for source in sources {
            let from = Endpoint::Remote {
                host: host.to_string(),
                path: source.clone(),
            };
            if let Err(e) = channel.copy(&from, &dest).await {
                tracing::warn!(host, source = %source, dest = %dest, error = %e, "sync of source failed");
                failed.push((source.clone(), e));
            }
        }
        failed
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncFailureReport {
    pub instance_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub synced: Vec<Uuid>,
    pub failed: Vec<SyncFailureReport>,
}

impl SyncReport {
    fn record(&mut self, id: Uuid, outcome: Result<(), FleetError>) {
        match outcome {
            Ok(()) => self.synced.push(id),
            Err(e) => self.failed.push(SyncFailureReport {
                instance_id: id,
                reason: e.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub sources: Vec<String>,
    pub interval: Duration,
    pub poll_interval: Duration,
    pub provider_backoff: Backoff,
    pub stopped_timeout: Duration,
}

pub struct SyncEngine {
    registry: Arc<Registry>,
    provider: Arc<dyn CloudProvider>,
    channel: Arc<dyn ExecutionChannel>,
    log: Arc<ActionLog>,
    sink: Option<Arc<dyn SyncSink>>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<Registry>,
        provider: Arc<dyn CloudProvider>,
        channel: Arc<dyn ExecutionChannel>,
        log: Arc<ActionLog>,
        sink: Option<Arc<dyn SyncSink>>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            registry,
            provider,
            channel,
            log,
            sink,
            settings,
        }
    }

    fn enabled(&self) -> Option<&Arc<dyn SyncSink>> {
        if self.settings.sources.is_empty() {
            return None;
        }
        self.sink.as_ref()
    }

    async fn sync_instance(&self, sink: &dyn SyncSink, id: Uuid, address: &str) -> Result<(), FleetError> {
        let started = Instant::now();
        let log_id = self.log.log_event_with_metadata(
            "SYNC_INSTANCE",
            "in_progress",
            Some(id),
            None,
            Some(json!({ "address": address, "target": sink.label() })),
        );

        let failed = sink.pull(self.channel.as_ref(), address, &self.settings.sources).await;
        let dur = started.elapsed().as_millis() as i64;
        if failed.is_empty() {
            self.log.log_event_complete(log_id, "success", dur, None);
            return Ok(());
        }

        let reason = failed
            .iter()
            .map(|(source, e)| format!("{}: {}", source, e))
            .collect::<Vec<_>>()
            .join("; ");
        self.log.log_event_complete(log_id, "failed", dur, Some(&reason));
        Err(FleetError::SyncFailure {
            instance_id: id,
            reason,
        })
    }

    /// One continuous-sync pass over every RUNNING instance, in parallel.
    /// Failures are isolated per instance and retried on the next cycle.
    pub async fn run_cycle(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let Some(sink) = self.enabled() else {
            return report;
        };

        let running = self.registry.running_addresses().await;
        let outcomes = join_all(running.iter().map(|(id, address)| async move {
            (*id, self.sync_instance(sink.as_ref(), *id, address).await)
        }))
        .await;

        for (id, outcome) in outcomes {
            if let Err(e) = &outcome {
                tracing::warn!(instance_id = %id, error = %e, "sync failed, will retry next cycle");
            }
            report.record(id, outcome);
        }
        report
    }

    /// job-sync: continuous mode on the cluster's sync interval.
    pub async fn run(self: Arc<Self>) {
        if self.enabled().is_none() {
            tracing::info!("job-sync disabled (no sync sources or target)");
            return;
        }
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(every_s = self.settings.interval.as_secs(), "🔄 job-sync started");

        loop {
            interval.tick().await;
            let report = self.run_cycle().await;
            if !report.synced.is_empty() || !report.failed.is_empty() {
                tracing::info!(
                    synced = report.synced.len(),
                    failed = report.failed.len(),
                    "🔄 job-sync: cycle done"
                );
            }
        }
    }

    /// Bring each STOPPED instance up, copy once, and put it back to STOPPED.
    ///
    /// Instances are handled one after another. State only advances through
    /// reconciliation ticks, bounded by the stopped-sync timeout.
    pub async fn sync_stopped(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let Some(sink) = self.enabled() else {
            return report;
        };

        let stopped = self.registry.ids_in_state(InstanceState::Stopped).await;
        tracing::info!(count = stopped.len(), "stopped-instance sync starting");

        for id in stopped {
            let started = Instant::now();
            let log_id = self.log.log_event("SYNC_STOPPED", "in_progress", Some(id), None);
            let outcome = self.sync_one_stopped(sink.as_ref(), id).await;
            let dur = started.elapsed().as_millis() as i64;
            match &outcome {
                Ok(()) => self.log.log_event_complete(log_id, "success", dur, None),
                Err(e) => self.log.log_event_complete(log_id, "failed", dur, Some(&e.to_string())),
            }
            report.record(id, outcome);
        }
        report
    }

    async fn sync_one_stopped(&self, sink: &dyn SyncSink, id: Uuid) -> Result<(), FleetError> {
        self.request(id, InstanceState::Pending).await?;

        let up = self
            .wait_until(id, |s| {
                s.map_or(true, |s| s.state == InstanceState::Running || s.state.is_terminal())
            })
            .await;
        let address = self.registry.reachable_address(id).await;

        let copied = match (up, address) {
            (true, Some(address)) => self.sync_instance(sink, id, &address).await,
            _ => Err(FleetError::SyncFailure {
                instance_id: id,
                reason: "instance did not come back up in time".to_string(),
            }),
        };

        // Put it back whether or not the copy worked.
        if self.registry.get(id).await.is_some_and(|s| s.state == InstanceState::Running) {
            self.request(id, InstanceState::Stopping).await?;
            let down = self
                .wait_until(id, |s| {
                    s.map_or(true, |s| s.state == InstanceState::Stopped || s.state.is_terminal())
                })
                .await;
            if !down {
                tracing::warn!(instance_id = %id, "instance still stopping after timeout");
            }
        }
        copied
    }

    async fn request(&self, id: Uuid, target: InstanceState) -> Result<(), FleetError> {
        let Some(req) = self.registry.request_transition(id, target).await? else {
            return Ok(());
        };
        let ids = [req.provider_id.clone()];
        let result = ProviderManager::issue(
            self.provider.as_ref(),
            &self.settings.provider_backoff,
            target,
            &ids,
        )
        .await;
        if let Err(e) = result {
            self.registry.clear_request(id, target).await?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Reconcile on the poll tick until `done` holds or the timeout passes.
    async fn wait_until<F>(&self, id: Uuid, done: F) -> bool
    where
        F: Fn(Option<&InstanceSummary>) -> bool,
    {
        let started = Instant::now();
        loop {
            if done(self.registry.get(id).await.as_ref()) {
                return true;
            }
            if started.elapsed() >= self.settings.stopped_timeout {
                return false;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
            if let Err(e) = reconciliation::tick(
                &self.registry,
                self.provider.as_ref(),
                &self.settings.provider_backoff,
            )
            .await
            {
                tracing::warn!(instance_id = %id, error = %e, "reconcile during stopped sync failed");
            }
        }
    }
}
