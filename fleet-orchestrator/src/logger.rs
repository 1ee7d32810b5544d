use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub action_type: String,
    pub component: &'static str,
    pub status: String,
    pub instance_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Bounded in-memory audit trail of orchestration actions.
///
/// Oldest entries are dropped once `capacity` is reached.
pub struct ActionLog {
    capacity: usize,
    entries: Mutex<VecDeque<ActionLogEntry>>,
}

impl ActionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ActionLogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log_event(
        &self,
        action_type: &str,
        status: &str,
        instance_id: Option<Uuid>,
        error_message: Option<&str>,
    ) -> Uuid {
        self.log_event_with_metadata(action_type, status, instance_id, error_message, None)
    }

    /// Log event with metadata (context info)
    pub fn log_event_with_metadata(
        &self,
        action_type: &str,
        status: &str,
        instance_id: Option<Uuid>,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Uuid {
        let log_id = Uuid::new_v4();
        match error_message {
            Some(err) => tracing::warn!(%log_id, action_type, status, ?instance_id, error = err, "action logged"),
            None => tracing::debug!(%log_id, action_type, status, ?instance_id, "action logged"),
        }

        let entry = ActionLogEntry {
            id: log_id,
            action_type: action_type.to_string(),
            component: "orchestrator",
            status: status.to_string(),
            instance_id,
            error_message: error_message.map(str::to_string),
            metadata,
            created_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };

        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        log_id
    }

    pub fn log_event_complete(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: i64,
        error_message: Option<&str>,
    ) {
        self.log_event_complete_with_metadata(log_id, status, duration_ms, error_message, None)
    }

    pub fn log_event_complete_with_metadata(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: i64,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().rev().find(|e| e.id == log_id) else {
            // Already rotated out.
            return;
        };
        entry.status = status.to_string();
        entry.duration_ms = Some(duration_ms);
        entry.completed_at = Some(Utc::now());
        if error_message.is_some() {
            entry.error_message = error_message.map(str::to_string);
        }
        if metadata.is_some() {
            entry.metadata = metadata;
        }
        if let Some(err) = error_message {
            tracing::warn!(%log_id, action_type = %entry.action_type, status, error = err, "action completed");
        }
    }

    /// Quick log for one-off events (like state transitions)
    pub fn log_quick(&self, action_type: &str, instance_id: Option<Uuid>, details: Option<serde_json::Value>) {
        self.log_event_with_metadata(action_type, "success", instance_id, None, details);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ActionLogEntry> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
