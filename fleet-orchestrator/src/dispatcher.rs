use std::sync::Arc;
use std::time::Instant;

use fleet_common::{ChannelError, ClusterSpec, FleetError};
use serde_json::json;
use uuid::Uuid;

use crate::channel::{CommandOutput, ExecutionChannel};
use crate::logger::ActionLog;
use crate::monitor::MonitorPlan;
use crate::registry::{DispatchClaim, Registry};
use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Setup,
    Batch,
    Monitor,
}

impl Step {
    fn as_str(&self) -> &'static str {
        match self {
            Step::Setup => "setup",
            Step::Batch => "batch",
            Step::Monitor => "monitor",
        }
    }
}

/// Runs setup commands, then the assigned batch, then schedules the idle
/// monitor, strictly in that order, on one instance at a time.
pub struct Dispatcher {
    registry: Arc<Registry>,
    channel: Arc<dyn ExecutionChannel>,
    log: Arc<ActionLog>,
    connect_backoff: Backoff,
    setup_commands: Vec<String>,
    monitor: Option<MonitorPlan>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        channel: Arc<dyn ExecutionChannel>,
        log: Arc<ActionLog>,
        cluster: &ClusterSpec,
        connect_backoff: Backoff,
    ) -> Self {
        Self {
            registry,
            channel,
            log,
            connect_backoff,
            setup_commands: cluster.setup_commands.clone(),
            monitor: MonitorPlan::from_cluster(cluster),
        }
    }

    /// Drive one claimed instance to a terminal dispatch result.
    pub async fn dispatch(&self, claim: DispatchClaim) -> Result<(), FleetError> {
        let id = claim.id;
        let started = Instant::now();
        let log_id = self.log.log_event_with_metadata(
            "DISPATCH",
            "in_progress",
            Some(id),
            None,
            Some(json!({
                "setup_commands": self.setup_commands.len(),
                "batch_commands": claim.batch.len(),
            })),
        );
        tracing::info!(instance_id = %id, commands = claim.batch.len(), "🚀 dispatch started");

        let outcome = self.run_commands(&claim).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match &outcome {
            Ok(()) => {
                self.registry.finish_dispatch(id, Ok(())).await;
                self.log.log_event_complete(log_id, "success", duration_ms, None);
                tracing::info!(instance_id = %id, duration_ms, "✅ dispatch succeeded");
                self.schedule_monitor(id).await;
            }
            Err(e) => {
                let reason = match e {
                    FleetError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                self.registry.finish_dispatch(id, Err(reason.clone())).await;
                self.log.log_event_complete(log_id, "failed", duration_ms, Some(&reason));
                self.log.log_event("DISPATCH_FAILED", "failed", Some(id), Some(&reason));
                tracing::warn!(instance_id = %id, error = %reason, "dispatch failed, instance left up for inspection");
            }
        }
        outcome
    }

    async fn run_commands(&self, claim: &DispatchClaim) -> Result<(), FleetError> {
        let steps = self
            .setup_commands
            .iter()
            .map(|c| (Step::Setup, c))
            .chain(claim.batch.iter().map(|c| (Step::Batch, c)));

        for (step, command) in steps {
            if self.registry.should_halt(claim.id).await {
                return Err(FleetError::Cancelled);
            }
            let started = Instant::now();
            let log_id = self.log.log_event_with_metadata(
                "DISPATCH_COMMAND",
                "in_progress",
                Some(claim.id),
                None,
                Some(json!({ "step": step.as_str(), "command": command })),
            );

            let out = match self.run_step(claim.id, step, command).await {
                Ok(out) => out,
                Err(e) => {
                    let dur = started.elapsed().as_millis() as i64;
                    self.log.log_event_complete(log_id, "failed", dur, Some(&e.to_string()));
                    return Err(e);
                }
            };

            let dur = started.elapsed().as_millis() as i64;
            let meta = json!({ "step": step.as_str(), "command": command, "exit_code": out.exit_code });
            if out.success() {
                self.log.log_event_complete_with_metadata(log_id, "success", dur, None, Some(meta));
                continue;
            }

            let stderr = out.stderr.trim().to_string();
            self.log.log_event_complete_with_metadata(log_id, "failed", dur, Some(&stderr), Some(meta));
            if self.registry.should_halt(claim.id).await {
                // Killed underneath us; the non-zero exit is the signal.
                return Err(FleetError::Cancelled);
            }
            return Err(FleetError::CommandFailure {
                command: command.clone(),
                exit_code: out.exit_code,
                stderr,
            });
        }
        Ok(())
    }

    /// Run one command, retrying the same command while the host is unreachable.
    async fn run_step(&self, id: Uuid, step: Step, command: &str) -> Result<CommandOutput, FleetError> {
        let mut attempt = 0;
        loop {
            let result = match self.registry.reachable_address(id).await {
                Some(address) => {
                    tracing::debug!(instance_id = %id, address = %address, step = step.as_str(), command, "running command");
                    if step == Step::Batch {
                        self.channel.run_tracked(&address, command).await
                    } else {
                        self.channel.run(&address, command).await
                    }
                }
                None => Err(ChannelError::ConnectionUnavailable(
                    "instance has no reachable address".to_string(),
                )),
            };

            let reason = match result {
                Ok(out) => return Ok(out),
                Err(ChannelError::ConnectionUnavailable(reason)) => reason,
                Err(other) => {
                    return Err(FleetError::ConnectionUnavailable {
                        instance_id: id,
                        reason: other.to_string(),
                    })
                }
            };

            if attempt >= self.connect_backoff.max_attempts {
                return Err(FleetError::ConnectionUnavailable {
                    instance_id: id,
                    reason: format!("gave up after {} attempts: {}", attempt + 1, reason),
                });
            }
            let delay = self.connect_backoff.delay(attempt);
            tracing::debug!(instance_id = %id, attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "not reachable yet, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;

            if self.registry.should_halt(id).await {
                return Err(FleetError::Cancelled);
            }
        }
    }

    async fn schedule_monitor(&self, id: Uuid) {
        let Some(plan) = &self.monitor else {
            return;
        };
        if self.registry.should_halt(id).await {
            tracing::info!(instance_id = %id, "halt requested, idle monitor not scheduled");
            return;
        }
        match self.run_step(id, Step::Monitor, &plan.command()).await {
            Ok(out) if out.success() => plan.record_scheduled(&self.registry, &self.log, id).await,
            Ok(out) => {
                self.log.log_event("MONITOR_SCHEDULED", "failed", Some(id), Some(out.stderr.trim()));
            }
            Err(e) => {
                self.log.log_event("MONITOR_SCHEDULED", "failed", Some(id), Some(&e.to_string()));
            }
        }
    }
}
