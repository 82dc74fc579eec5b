use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Background task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,   // Task created, waiting for a worker
    Running,   // A worker has dequeued the task and is executing it
    Completed, // The job returned normally; result stored
    Failed,    // The job returned an error or panicked; error stored
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Record of one background task tracked by the task queue.
///
/// Status transitions are monotonic: `pending -> running -> completed|failed`.
/// A record is never reused once it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl TaskRecord {
    pub fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            progress: None,
            result: None,
        }
    }

    /// Mark the task as picked up by a worker.
    pub fn set_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as completed with its result payload.
    pub fn set_completed(&mut self, result: Option<Value>) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = result;
    }

    /// Mark the task as failed with the error message.
    pub fn set_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }
}

/// Notification pushed to a client over the live channel and kept in history.
///
/// Immutable after creation except for the `read` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub read: bool,
}

/// Status of a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Processing => "Processing",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Configuration structures
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_num_workers() -> usize {
    3
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.num_workers == 0 || self.num_workers > 50 {
            return Err(ValidationError::InvalidWorkerCount(self.num_workers));
        }

        if self.port <= 1024 {
            return Err(ValidationError::InvalidPort(self.port));
        }

        Ok(())
    }
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid worker count: {0}, must be between 1 and 50")]
    InvalidWorkerCount(usize),

    #[error("Invalid port: {0}, must be between 1024 and 65535")]
    InvalidPort(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Unsupported file type: {0}, only JSON files are currently supported")]
    UnsupportedFile(String),

    #[error("File content is not valid UTF-8: {0}")]
    Decode(#[from] std::str::Utf8Error),

    #[error("Invalid JSON payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ValidationError),

    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
