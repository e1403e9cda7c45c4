//! Message protocol across the isolation boundary
//!
//! Every payload that crosses the boundary is an owned, serializable value;
//! nothing here carries references into either side. Wire shape is
//! `{ "type": ..., "data": ... }` with kebab-case tags.

use crate::types::LogEntry;
use serde::{Deserialize, Serialize};

/// Host -> isolate commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum HostCommand {
    Execute { code: String },
    Stop,
    Ping,
}

/// Isolate -> host messages, delivered in send order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum IsolateMessage {
    /// Sent once after cold initialization
    Ready,
    Log(LogEntry),
    Clear,
    ExecutionStart,
    ExecutionEnd(ExecutionEnd),
    Pong,
}

/// Terminal payload of one run as reported by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEnd {
    /// Wall-clock duration in milliseconds
    #[serde(rename = "duration")]
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stopped: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl ExecutionEnd {
    pub fn completed(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            timed_out: false,
            stopped: false,
            error: false,
        }
    }

    pub fn timed_out(duration_ms: u64) -> Self {
        Self {
            timed_out: true,
            ..Self::completed(duration_ms)
        }
    }

    pub fn stopped(duration_ms: u64) -> Self {
        Self {
            stopped: true,
            ..Self::completed(duration_ms)
        }
    }

    pub fn failed(duration_ms: u64) -> Self {
        Self {
            error: true,
            ..Self::completed(duration_ms)
        }
    }
}
