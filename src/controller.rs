//! Embedder-facing adapter
//!
//! [`Sandbox`] wraps the host behind the handful of calls an application
//! needs, and [`SandboxEvent`] is the ordered stream it observes in return.
//! The adapter adds no behavior of its own; everything it promises is
//! enforced by the host underneath.

use crate::host::{IsolateHost, IsolateState};
use crate::limits::ExecutionLimits;
use crate::types::{ExecutionId, ExecutionOutcome, LogEntry};
use crate::Result;
use std::time::Duration;
use tokio::sync::mpsc;

/// Application-level events for a sandbox session, delivered in order
#[derive(Debug, Clone)]
pub enum SandboxEvent {
    /// A run began evaluating
    Started,
    Log(LogEntry),
    /// User code asked for the output surface to be cleared
    Cleared,
    /// Terminal outcome; exactly one per accepted submission
    Finished(ExecutionOutcome),
}

/// One sandbox session. The isolate behind it is created lazily and can be
/// destroyed and recreated any number of times over the session's life.
pub struct Sandbox {
    host: IsolateHost,
}

impl Sandbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SandboxEvent>) {
        Self::with_limits(ExecutionLimits::default())
    }

    pub fn with_limits(limits: ExecutionLimits) -> (Self, mpsc::UnboundedReceiver<SandboxEvent>) {
        let (host, events) = IsolateHost::new(limits);
        (Self { host }, events)
    }

    /// Eagerly create the isolate so the first [`run`](Self::run) skips the
    /// cold start. Optional; `run` starts one on demand.
    pub async fn start(&self) -> Result<()> {
        self.host.start().await
    }

    /// Submit code for execution. Returns the run's id, or `None` when a run
    /// is already active (the request is dropped, not queued).
    pub async fn run(&self, code: impl Into<String>) -> Result<Option<ExecutionId>> {
        self.host.submit(code).await
    }

    /// Ask the active run to stop. No-op while idle.
    pub async fn stop(&self) {
        self.host.cancel().await;
    }

    /// Probe the isolate's event loop for liveness.
    pub async fn is_alive(&self, within: Duration) -> bool {
        self.host.ping(within).await
    }

    pub async fn state(&self) -> IsolateState {
        self.host.state().await
    }

    /// Destroy the isolate. An in-flight run is closed with a stopped
    /// outcome; the next `run` builds a fresh context.
    pub async fn dispose(&self) {
        self.host.dispose().await;
    }
}
