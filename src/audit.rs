//! Audit Repository boundary.
//!
//! Remote-delegated executions leave a durable trace: exactly one
//! `ExecutionTask` per attempt, created with its terminal status and never
//! mutated afterwards. In-process executions are not audited here — their
//! trace is the structured log.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
}

/// One remote execution attempt, recorded whatever the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTask {
    pub id: String,
    pub event_id: String,
    pub action_name: String,
    pub action_args: Value,
    pub action_server_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ExecutionTask {
    pub fn new(
        event_id: &str,
        action_name: &str,
        action_args: Value,
        action_server_id: &str,
        started_at: DateTime<Utc>,
        status: TaskStatus,
        failure_reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: event_id.to_string(),
            action_name: action_name.to_string(),
            action_args,
            action_server_id: action_server_id.to_string(),
            started_at,
            ended_at: Utc::now(),
            status,
            failure_reason,
        }
    }
}

/// Durable store for execution task records. Fire-and-forget: a failure
/// to record is logged by the caller and never blocks execution.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn create_task(&self, task: ExecutionTask) -> anyhow::Result<()>;
}

/// Appends one JSON object per line to an audit log file.
pub struct JsonlAuditStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl AuditRepository for JsonlAuditStore {
    async fn create_task(&self, task: ExecutionTask) -> anyhow::Result<()> {
        let line = serde_json::to_string(&task)?;
        let _guard = self.write_lock.lock().expect("audit lock");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Keeps tasks in memory; embeddable and convenient for assertions.
#[derive(Default)]
pub struct MemoryAuditStore {
    tasks: Mutex<Vec<ExecutionTask>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<ExecutionTask> {
        self.tasks.lock().expect("audit lock").clone()
    }
}

#[async_trait]
impl AuditRepository for MemoryAuditStore {
    async fn create_task(&self, task: ExecutionTask) -> anyhow::Result<()> {
        self.tasks.lock().expect("audit lock").push(task);
        Ok(())
    }
}
