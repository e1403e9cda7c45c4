//! Core types for sandbox execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for one accepted execution request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity channel of a captured console call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Log,
    Info,
    Warn,
    Error,
}

impl LogKind {
    /// Parse the channel name used on the wire; unknown names fall back to `Log`.
    pub fn from_channel(name: &str) -> Self {
        match name {
            "info" => LogKind::Info,
            "warn" => LogKind::Warn,
            "error" => LogKind::Error,
            _ => LogKind::Log,
        }
    }
}

/// One captured console emission, immutable once created.
///
/// `values` holds the positionally serialized arguments; anything the isolate
/// could not represent structurally arrives here already degraded to a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Collision-resistant per run
    pub id: uuid::Uuid,

    pub timestamp: DateTime<Utc>,

    #[serde(rename = "type")]
    pub kind: LogKind,

    /// Arguments in call order
    #[serde(rename = "args")]
    pub values: Vec<Value>,

    /// Stack trace, when one was available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl LogEntry {
    pub fn new(kind: LogKind, values: Vec<Value>, stack: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            values,
            stack,
        }
    }

    /// Error-kind entry with a single text value
    pub fn error_text(message: impl Into<String>, stack: Option<String>) -> Self {
        Self::new(LogKind::Error, vec![Value::String(message.into())], stack)
    }
}

/// How a run reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    Completed,
    TimedOut,
    StoppedByCaller,
    RuntimeError,
}

/// Terminal result of one run, created exactly once per accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,

    pub terminated_by: Termination,
}

impl ExecutionOutcome {
    pub fn completed(&self) -> bool {
        self.terminated_by == Termination::Completed
    }
}
