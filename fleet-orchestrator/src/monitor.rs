use fleet_common::{ClusterSpec, MonitorSpec};
use serde_json::json;
use uuid::Uuid;

use crate::logger::ActionLog;
use crate::registry::Registry;

/// The watcher each instance gets once its batch succeeded.
///
/// Scheduling is fire-and-forget: after the detached process is started the
/// only observable effect is a later STOPPING/STOPPED seen by reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorPlan {
    pub spec: MonitorSpec,
    pub delay_s: u64,
}

impl MonitorPlan {
    pub fn from_cluster(cluster: &ClusterSpec) -> Option<Self> {
        cluster.monitor.clone().map(|spec| Self {
            spec,
            delay_s: cluster.monitor_delay_s,
        })
    }

    /// Shell command that starts the watcher detached from the ssh session.
    pub fn command(&self) -> String {
        self.spec.detached_command(self.delay_s)
    }

    pub async fn record_scheduled(&self, registry: &Registry, log: &ActionLog, instance_id: Uuid) {
        registry.mark_monitor_scheduled(instance_id).await;
        log.log_quick(
            "MONITOR_SCHEDULED",
            Some(instance_id),
            Some(json!({
                "kind": self.spec.kind.subcommand(),
                "duration_s": self.spec.duration_s,
                "delay_s": self.spec.effective_delay(self.delay_s),
            })),
        );
        tracing::info!(%instance_id, kind = self.spec.kind.subcommand(), duration_s = self.spec.duration_s, "idle monitor scheduled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::MonitorKind;

    #[test]
    fn cluster_delay_only_applies_to_gpu_idle() {
        let cluster = ClusterSpec::from_json_str(
            r#"{"template": {"image_id": "ami", "instance_type": "t",
                             "key_name": "k", "security_group": "sg"},
                "batches": [["x"]],
                "monitor": {"kind": "timed", "duration_s": 30},
                "monitor_delay_s": 5}"#,
        )
        .unwrap();
        let plan = MonitorPlan::from_cluster(&cluster).unwrap();
        assert_eq!(plan.spec.kind, MonitorKind::Timed);
        let cmd = plan.command();
        // Timed counts from scheduling; the delay is for gpu-idle warm-up.
        assert!(cmd.contains("fleet-monitor timed --duration 30 --delay 0"));
        assert!(cmd.starts_with("mkdir -p ~/.fleet && nohup setsid"));

        let gpu = MonitorPlan {
            spec: MonitorSpec {
                kind: MonitorKind::GpuIdle,
                ..plan.spec.clone()
            },
            delay_s: 5,
        };
        assert!(gpu.command().contains("fleet-monitor gpu-idle --duration 30 --delay 5"));
    }

    #[test]
    fn no_monitor_no_plan() {
        let cluster = ClusterSpec::from_json_str(
            r#"{"template": {"image_id": "ami", "instance_type": "t",
                             "key_name": "k", "security_group": "sg"},
                "batches": [["x"]]}"#,
        )
        .unwrap();
        assert!(MonitorPlan::from_cluster(&cluster).is_none());
    }

    #[test]
    fn record_scheduled_marks_and_logs() {
        let log = std::sync::Arc::new(ActionLog::new(10));
        let registry = Registry::new(log.clone());
        let plan = MonitorPlan {
            spec: MonitorSpec {
                kind: MonitorKind::GpuIdle,
                duration_s: 120,
                interval_s: None,
                binary: "fleet-monitor".to_string(),
            },
            delay_s: 0,
        };
        tokio_test::block_on(async {
            let id = registry.register(0, vec!["x".into()]).await;
            plan.record_scheduled(&registry, &log, id).await;
        });
        let entries = log.recent(10);
        let scheduled = entries
            .iter()
            .find(|e| e.action_type == "MONITOR_SCHEDULED")
            .unwrap();
        assert_eq!(scheduled.metadata.as_ref().unwrap()["kind"], "gpu-idle");
    }
}
