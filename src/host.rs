//! Isolate host - owns the isolated context's lifecycle and channel
//!
//! The host is the only component that mutates [`IsolateState`], and the only
//! one allowed to destroy the isolate. Cooperative stop messages are a
//! latency optimization; `IsolateHandle::terminate_execution()` plus worker
//! recreation is the authoritative cancellation mechanism. "Deadline elapsed
//! but isolate unresponsive" therefore produces the same outcome as "isolate
//! terminated".

use crate::controller::SandboxEvent;
use crate::limits::ExecutionLimits;
use crate::protocol::{ExecutionEnd, HostCommand, IsolateMessage};
use crate::supervisor;
use crate::types::{ExecutionId, ExecutionOutcome, LogEntry, Termination};
use crate::Result;
use deno_core::v8;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// Upper bound on V8 isolate + bootstrap startup
const INIT_GRACE: Duration = Duration::from_secs(5);
/// Cold-start wait for the `ready` signal before sending anyway
const READY_GRACE: Duration = Duration::from_millis(100);
/// How long a cooperative stop may take before the isolate is terminated
const STOP_GRACE: Duration = Duration::from_millis(100);
/// Backstop slack on top of the deadline before the host enforces it
const DEADLINE_GRACE: Duration = Duration::from_millis(500);
/// How long a terminated isolate may take to acknowledge before it is
/// discarded outright
const TERMINATION_GRACE: Duration = Duration::from_millis(500);

/// Isolate-infrastructure faults. Fatal to the isolate instance only; the
/// host resets to `Idle` and a later `start()` recreates the context.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("sandbox isolate failed to initialize: {0}")]
    IsolateInit(String),

    #[error("sandbox isolate channel closed")]
    ChannelClosed,
}

/// Lifecycle phase of the sandbox session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolatePhase {
    Idle,
    Initializing,
    Running,
    Terminating,
}

/// Snapshot of the host's session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolateState {
    pub phase: IsolatePhase,
    pub active_request: Option<ExecutionId>,
}

/// Channel endpoints and handles for one live isolate
struct WorkerLink {
    commands: mpsc::UnboundedSender<HostCommand>,
    isolate: v8::IsolateHandle,
    stop_flag: Arc<AtomicBool>,
    ready: watch::Receiver<bool>,
    pong: watch::Receiver<u64>,
}

struct HostShared {
    phase: IsolatePhase,
    active: Option<ExecutionId>,
    run_started: Option<Instant>,
    worker: Option<WorkerLink>,
    /// Bumped whenever a worker is torn down, so a stale pump or backstop
    /// recognizes it has been superseded
    worker_gen: u64,
}

/// Boundary object owning the isolate's lifecycle and message channel
pub struct IsolateHost {
    shared: Arc<Mutex<HostShared>>,
    events: mpsc::UnboundedSender<SandboxEvent>,
    limits: ExecutionLimits,
}

impl IsolateHost {
    pub fn new(limits: ExecutionLimits) -> (Self, mpsc::UnboundedReceiver<SandboxEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let host = Self {
            shared: Arc::new(Mutex::new(HostShared {
                phase: IsolatePhase::Idle,
                active: None,
                run_started: None,
                worker: None,
                worker_gen: 0,
            })),
            events: events_tx,
            limits,
        };
        (host, events_rx)
    }

    /// Lazily create the isolate. Idempotent while one is live.
    pub async fn start(&self) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.worker.is_some() {
            return Ok(());
        }
        shared.phase = IsolatePhase::Initializing;
        tracing::info!("starting sandbox isolate");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (boot_tx, boot_rx) = oneshot::channel();

        let booted = match supervisor::spawn(
            self.limits.clone(),
            cmd_rx,
            msg_tx,
            stop_flag.clone(),
            boot_tx,
        ) {
            Ok(()) => match tokio::time::timeout(INIT_GRACE, boot_rx).await {
                Ok(Ok(Ok(handle))) => Ok(handle),
                Ok(Ok(Err(message))) => Err(HostError::IsolateInit(message)),
                Ok(Err(_)) => Err(HostError::IsolateInit(
                    "isolate thread exited during startup".into(),
                )),
                Err(_) => Err(HostError::IsolateInit(
                    "timed out waiting for isolate startup".into(),
                )),
            },
            Err(err) => Err(HostError::IsolateInit(err.to_string())),
        };
        let isolate = match booted {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(error = %err, "sandbox isolate failed to start");
                shared.phase = IsolatePhase::Idle;
                let _ = self.events.send(SandboxEvent::Log(LogEntry::error_text(
                    format!("sandbox internal fault: {err}"),
                    None,
                )));
                return Err(err.into());
            }
        };

        let (ready_tx, ready_rx) = watch::channel(false);
        let (pong_tx, pong_rx) = watch::channel(0u64);
        shared.worker = Some(WorkerLink {
            commands: cmd_tx,
            isolate,
            stop_flag,
            ready: ready_rx,
            pong: pong_rx,
        });
        shared.phase = IsolatePhase::Idle;
        let worker_gen = shared.worker_gen;
        drop(shared);

        tokio::spawn(pump(
            Arc::clone(&self.shared),
            self.events.clone(),
            msg_rx,
            ready_tx,
            pong_tx,
            worker_gen,
        ));
        Ok(())
    }

    /// Send one execute request. Returns `None` (no-op) while a run is
    /// already active; creates the isolate first if none is live.
    pub async fn submit(&self, code: impl Into<String>) -> Result<Option<ExecutionId>> {
        let code = code.into();
        {
            let shared = self.shared.lock().await;
            if shared.phase == IsolatePhase::Running {
                tracing::debug!("execute request ignored: a run is already active");
                return Ok(None);
            }
        }
        self.start().await?;

        let (commands, mut ready) = {
            let shared = self.shared.lock().await;
            let link = shared.worker.as_ref().ok_or(HostError::ChannelClosed)?;
            (link.commands.clone(), link.ready.clone())
        };

        // Cold start: give the isolate a short window to signal readiness,
        // then send anyway; queued commands survive until the context is up.
        if !*ready.borrow_and_update() {
            let _ = tokio::time::timeout(READY_GRACE, ready.changed()).await;
        }

        let id = ExecutionId::new();
        {
            let mut shared = self.shared.lock().await;
            if shared.phase == IsolatePhase::Running {
                return Ok(None);
            }
            shared.phase = IsolatePhase::Running;
            shared.active = Some(id);
            shared.run_started = Some(Instant::now());
        }
        tracing::info!(execution_id = %id, code_len = code.len(), "submitting code");
        if commands.send(HostCommand::Execute { code }).is_err() {
            let mut shared = self.shared.lock().await;
            shared.phase = IsolatePhase::Idle;
            shared.active = None;
            shared.run_started = None;
            return Err(HostError::ChannelClosed.into());
        }
        self.arm_backstop(id, self.limits.deadline + DEADLINE_GRACE, Termination::TimedOut);
        Ok(Some(id))
    }

    /// Request that the active run stop. No-op while idle. The stop message
    /// is advisory; the backstop terminates the isolate if it does not yield.
    pub async fn cancel(&self) {
        let (id, commands, stop_flag) = {
            let shared = self.shared.lock().await;
            match (shared.active, &shared.worker) {
                (Some(id), Some(link)) if shared.phase == IsolatePhase::Running => {
                    (id, link.commands.clone(), link.stop_flag.clone())
                }
                _ => {
                    tracing::debug!("stop ignored: no active run");
                    return;
                }
            }
        };
        tracing::info!(execution_id = %id, "stop requested");
        stop_flag.store(true, Ordering::SeqCst);
        let _ = commands.send(HostCommand::Stop);
        self.arm_backstop(id, STOP_GRACE, Termination::StoppedByCaller);
    }

    /// Liveness probe: true iff the isolate answers `ping` within the window.
    pub async fn ping(&self, within: Duration) -> bool {
        let (commands, mut pong) = {
            let shared = self.shared.lock().await;
            match &shared.worker {
                Some(link) => (link.commands.clone(), link.pong.clone()),
                None => return false,
            }
        };
        pong.borrow_and_update();
        if commands.send(HostCommand::Ping).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(within, pong.changed()).await, Ok(Ok(())))
    }

    /// Forcibly terminate the isolate and release the channel. Safe from any
    /// phase; an in-flight run is closed with `StoppedByCaller` so it still
    /// gets its one outcome.
    pub async fn dispose(&self) {
        let mut shared = self.shared.lock().await;
        shared.phase = IsolatePhase::Terminating;
        if let Some(link) = shared.worker.take() {
            tracing::info!("disposing sandbox isolate");
            link.stop_flag.store(true, Ordering::SeqCst);
            link.isolate.terminate_execution();
            // dropping `link.commands` ends the supervisor loop
        }
        shared.worker_gen += 1;
        if let Some(id) = shared.active.take() {
            tracing::debug!(execution_id = %id, "closing in-flight run on dispose");
            let duration_ms = elapsed_ms(shared.run_started.take());
            let _ = self.events.send(SandboxEvent::Finished(ExecutionOutcome {
                duration_ms,
                terminated_by: Termination::StoppedByCaller,
            }));
        }
        shared.run_started = None;
        shared.phase = IsolatePhase::Idle;
    }

    pub async fn state(&self) -> IsolateState {
        let shared = self.shared.lock().await;
        IsolateState {
            phase: shared.phase,
            active_request: shared.active,
        }
    }

    /// Enforcement timer for one run: terminate the isolate if the run is
    /// still open when it fires, and discard the isolate entirely if it does
    /// not even acknowledge the termination.
    fn arm_backstop(&self, id: ExecutionId, fire_after: Duration, termination: Termination) {
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(fire_after).await;
            let isolate = {
                let shared = shared.lock().await;
                if shared.active != Some(id) {
                    return;
                }
                shared.worker.as_ref().map(|link| link.isolate.clone())
            };
            if let Some(handle) = isolate {
                tracing::warn!(execution_id = %id, ?termination, "backstop terminating isolate execution");
                handle.terminate_execution();
            }
            tokio::time::sleep(TERMINATION_GRACE).await;
            let mut shared = shared.lock().await;
            if shared.active != Some(id) {
                return;
            }
            // Unresponsive isolate: same outcome as a terminated one. The
            // next run recreates the worker.
            tracing::warn!(execution_id = %id, "isolate unresponsive, discarding it");
            shared.active = None;
            shared.phase = IsolatePhase::Idle;
            shared.worker = None;
            shared.worker_gen += 1;
            let duration_ms = elapsed_ms(shared.run_started.take());
            let _ = events.send(SandboxEvent::Finished(ExecutionOutcome {
                duration_ms,
                terminated_by: termination,
            }));
        });
    }
}

/// Relay isolate messages into the application-level event stream, in send
/// order, closing out runs and reporting channel breaks.
async fn pump(
    shared: Arc<Mutex<HostShared>>,
    events: mpsc::UnboundedSender<SandboxEvent>,
    mut messages: mpsc::UnboundedReceiver<IsolateMessage>,
    ready: watch::Sender<bool>,
    pong: watch::Sender<u64>,
    worker_gen: u64,
) {
    while let Some(message) = messages.recv().await {
        {
            let shared = shared.lock().await;
            if shared.worker_gen != worker_gen {
                return; // superseded by a newer worker
            }
        }
        match message {
            IsolateMessage::Ready => {
                tracing::debug!("isolate signalled ready");
                let _ = ready.send(true);
            }
            IsolateMessage::Pong => {
                pong.send_modify(|count| *count += 1);
            }
            IsolateMessage::ExecutionStart => {
                let _ = events.send(SandboxEvent::Started);
            }
            IsolateMessage::Log(entry) => {
                let deliver = shared.lock().await.active.is_some();
                if deliver {
                    let _ = events.send(SandboxEvent::Log(entry));
                }
            }
            IsolateMessage::Clear => {
                let _ = events.send(SandboxEvent::Cleared);
            }
            IsolateMessage::ExecutionEnd(end) => {
                finish_run(&shared, &events, outcome_from(end)).await;
            }
        }
    }

    // Channel broke without a dispose: infrastructure fault, fatal to this
    // isolate instance only.
    let mut shared = shared.lock().await;
    if shared.worker_gen != worker_gen {
        return;
    }
    tracing::error!("sandbox isolate channel closed unexpectedly");
    shared.worker = None;
    shared.worker_gen += 1;
    let _ = events.send(SandboxEvent::Log(LogEntry::error_text(
        "sandbox internal fault: isolate channel closed",
        None,
    )));
    if shared.active.take().is_some() {
        let duration_ms = elapsed_ms(shared.run_started.take());
        let _ = events.send(SandboxEvent::Finished(ExecutionOutcome {
            duration_ms,
            terminated_by: Termination::RuntimeError,
        }));
    }
    shared.phase = IsolatePhase::Idle;
}

/// Close the open run, exactly once; late or duplicate ends are dropped.
async fn finish_run(
    shared: &Arc<Mutex<HostShared>>,
    events: &mpsc::UnboundedSender<SandboxEvent>,
    outcome: ExecutionOutcome,
) {
    let mut shared = shared.lock().await;
    if shared.active.take().is_none() {
        tracing::debug!("dropping execution-end with no open run");
        return;
    }
    shared.phase = IsolatePhase::Idle;
    shared.run_started = None;
    let _ = events.send(SandboxEvent::Finished(outcome));
}

fn outcome_from(end: ExecutionEnd) -> ExecutionOutcome {
    let terminated_by = if end.timed_out {
        Termination::TimedOut
    } else if end.stopped {
        Termination::StoppedByCaller
    } else if end.error {
        Termination::RuntimeError
    } else {
        Termination::Completed
    };
    ExecutionOutcome {
        duration_ms: end.duration_ms,
        terminated_by,
    }
}

fn elapsed_ms(started: Option<Instant>) -> u64 {
    started.map(|s| s.elapsed().as_millis() as u64).unwrap_or(0)
}
