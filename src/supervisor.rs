//! Execution supervisor - runs on the isolate's dedicated thread
//!
//! `JsRuntime` is `!Send`, so the whole V8 side lives on one OS thread with a
//! single-threaded tokio runtime. Commands arrive over an unbounded channel
//! and are served strictly in order; at most one execution is in flight.
//!
//! The deadline is enforced by a watchdog thread holding the isolate's
//! thread-safe handle: a script in a tight synchronous loop cannot be
//! preempted from inside the isolate, so `terminate_execution()` from outside
//! is the only mechanism that actually works. The host keeps its own backstop
//! on top of this one for the case where the whole thread is wedged.

use crate::allowlist::{self, compose_run_script};
use crate::interceptor::RunContext;
use crate::limits::ExecutionLimits;
use crate::protocol::{ExecutionEnd, HostCommand, IsolateMessage};
use crate::types::{LogEntry, LogKind};
use deno_core::error::CoreError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Spawn the isolate thread. Reports the isolate's thread-safe handle (or an
/// initialization error) through `boot` once the context is usable.
pub(crate) fn spawn(
    limits: ExecutionLimits,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    messages: mpsc::UnboundedSender<IsolateMessage>,
    stop_flag: Arc<AtomicBool>,
    boot: oneshot::Sender<Result<v8::IsolateHandle, String>>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("jsbox-isolate".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = boot.send(Err(format!("isolate runtime build failed: {err}")));
                    return;
                }
            };

            let mut runtime = JsRuntime::new(RuntimeOptions {
                extensions: vec![allowlist::extension()],
                ..Default::default()
            });
            {
                let state = runtime.op_state();
                let mut state = state.borrow_mut();
                state.put(RunContext::new(messages.clone()));
                state.put(limits.clone());
            }
            if let Err(err) = runtime.execute_script("<jsbox:bootstrap>", allowlist::BOOTSTRAP_JS)
            {
                let _ = boot.send(Err(format!("bootstrap failed: {err}")));
                return;
            }

            let handle = runtime.v8_isolate().thread_safe_handle();
            if boot.send(Ok(handle)).is_err() {
                return;
            }

            let supervisor = Supervisor {
                runtime,
                messages,
                limits,
                stop_flag,
                generation: 0,
            };
            rt.block_on(supervisor.run(commands));
        })?;
    Ok(())
}

struct Supervisor {
    runtime: JsRuntime,
    messages: mpsc::UnboundedSender<IsolateMessage>,
    limits: ExecutionLimits,
    stop_flag: Arc<AtomicBool>,
    generation: u32,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HostCommand>) {
        let _ = self.messages.send(IsolateMessage::Ready);
        tracing::debug!("sandbox isolate ready");

        loop {
            // Keep pumping clamped timers left over from earlier runs while
            // waiting; their emissions are dropped by the generation gate.
            let cmd = tokio::select! {
                biased;
                cmd = commands.recv() => cmd,
                pumped = self.runtime.run_event_loop(PollEventLoopOptions::default()) => {
                    if let Err(err) = pumped {
                        tracing::debug!(error = %err, "background task fault between runs");
                    }
                    commands.recv().await
                }
            };
            let Some(cmd) = cmd else { break };
            match cmd {
                HostCommand::Execute { code } => self.execute(code).await,
                HostCommand::Stop => {
                    // Mid-run stops never reach this loop (the thread is inside
                    // execute_script then); an idle stop is a no-op.
                    tracing::debug!("stop received while idle");
                }
                HostCommand::Ping => {
                    let _ = self.messages.send(IsolateMessage::Pong);
                }
            }
        }
        tracing::debug!("sandbox isolate shutting down");
    }

    async fn execute(&mut self, code: String) {
        self.stop_flag.store(false, Ordering::SeqCst);
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        self.set_scope(generation, true);

        tracing::debug!(generation, code_len = code.len(), "executing user code");
        let _ = self.messages.send(IsolateMessage::ExecutionStart);
        let start = Instant::now();
        let guard = DeadlineGuard::arm(
            self.runtime.v8_isolate().thread_safe_handle(),
            self.limits.deadline,
        );

        let script = compose_run_script(&code, generation);
        let mut failure = None;
        match self.runtime.execute_script("<user-code>", script) {
            Ok(_) => {
                // One bounded poll so already settled promises and unhandled
                // rejections surface before the run is closed out.
                let drain = self.runtime.run_event_loop(PollEventLoopOptions::default());
                if let Ok(Err(err)) = tokio::time::timeout(Duration::ZERO, drain).await {
                    let (message, stack) = error_parts(&err);
                    let entry = LogEntry::new(
                        LogKind::Error,
                        vec![
                            Value::String("Unhandled promise rejection".into()),
                            Value::String(message),
                        ],
                        stack,
                    );
                    let _ = self.messages.send(IsolateMessage::Log(entry));
                }
            }
            Err(err) => failure = Some(error_parts(&err)),
        }

        let fired = guard.disarm();
        let duration_ms = start.elapsed().as_millis() as u64;
        self.set_scope(generation, false);

        let end = if fired {
            self.runtime.v8_isolate().cancel_terminate_execution();
            tracing::info!(duration_ms, "run exceeded the execution budget");
            ExecutionEnd::timed_out(duration_ms)
        } else if self.stop_flag.swap(false, Ordering::SeqCst) {
            self.runtime.v8_isolate().cancel_terminate_execution();
            tracing::info!(duration_ms, "run stopped by caller");
            ExecutionEnd::stopped(duration_ms)
        } else if let Some((message, stack)) = failure {
            tracing::debug!(error = %message, "user code raised");
            let _ = self
                .messages
                .send(IsolateMessage::Log(LogEntry::error_text(message, stack)));
            ExecutionEnd::failed(duration_ms)
        } else {
            ExecutionEnd::completed(duration_ms)
        };
        let _ = self.messages.send(IsolateMessage::ExecutionEnd(end));
    }

    fn set_scope(&mut self, generation: u32, active: bool) {
        let state = self.runtime.op_state();
        let mut state = state.borrow_mut();
        let ctx = state.borrow_mut::<RunContext>();
        ctx.generation = generation;
        ctx.active = active;
    }
}

/// One-shot deadline timer for a single run.
///
/// Armed on a plain watchdog thread so it fires even while the isolate thread
/// is stuck inside a synchronous script.
struct DeadlineGuard {
    disarm_tx: std::sync::mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
    watchdog: Option<std::thread::JoinHandle<()>>,
}

impl DeadlineGuard {
    fn arm(handle: v8::IsolateHandle, budget: Duration) -> Self {
        let (disarm_tx, disarm_rx) = std::sync::mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let watchdog_fired = fired.clone();
        let watchdog = std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = disarm_rx.recv_timeout(budget) {
                watchdog_fired.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });
        Self {
            disarm_tx,
            fired,
            watchdog: Some(watchdog),
        }
    }

    /// Cancel the watchdog and report whether the deadline fired. Joins the
    /// watchdog so its isolate handle never outlives the runtime.
    fn disarm(mut self) -> bool {
        let _ = self.disarm_tx.send(());
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }
        self.fired.load(Ordering::SeqCst)
    }
}

fn error_parts(err: &CoreError) -> (String, Option<String>) {
    if let CoreError::Js(js) = err {
        let message = js
            .message
            .clone()
            .unwrap_or_else(|| js.exception_message.clone());
        (message, js.stack.clone())
    } else {
        (err.to_string(), None)
    }
}
