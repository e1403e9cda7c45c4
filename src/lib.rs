//! jsbox - Supervised JavaScript execution sandbox
//!
//! Runs untrusted script text inside a V8 isolate with a restricted global
//! surface, a hard wall-clock budget, and full console capture. The isolate
//! lives on its own thread and talks to the supervising host exclusively
//! through an ordered message channel; the host can always terminate it.

mod allowlist;
mod controller;
mod host;
mod interceptor;
mod limits;
mod protocol;
mod supervisor;
mod types;

pub use controller::{Sandbox, SandboxEvent};
pub use host::{HostError, IsolateHost, IsolatePhase, IsolateState};
pub use limits::ExecutionLimits;
pub use protocol::{ExecutionEnd, HostCommand, IsolateMessage};
pub use types::{ExecutionId, ExecutionOutcome, LogEntry, LogKind, Termination};

/// Re-export common error types
pub type Result<T> = anyhow::Result<T>;
