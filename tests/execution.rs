//! End-to-end tests driving a real isolate through the public adapter

use jsbox::{
    ExecutionLimits, IsolatePhase, LogEntry, LogKind, Sandbox, SandboxEvent, Termination,
};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

/// Short budget so the termination tests stay fast
fn quick() -> (Sandbox, mpsc::UnboundedReceiver<SandboxEvent>) {
    Sandbox::with_limits(ExecutionLimits::strict())
}

/// Collect events until the run's terminal outcome arrives.
async fn drive(
    events: &mut mpsc::UnboundedReceiver<SandboxEvent>,
) -> (Vec<SandboxEvent>, jsbox::ExecutionOutcome) {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for sandbox events")
            .expect("event stream closed");
        match event {
            SandboxEvent::Finished(outcome) => return (seen, outcome),
            other => seen.push(other),
        }
    }
}

fn logs(events: &[SandboxEvent]) -> Vec<&LogEntry> {
    events
        .iter()
        .filter_map(|event| match event {
            SandboxEvent::Log(entry) => Some(entry),
            _ => None,
        })
        .collect()
}

/// Nothing may trail the terminal outcome.
async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<SandboxEvent>) {
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(
        events.try_recv().is_err(),
        "event arrived after the run's outcome"
    );
}

#[tokio::test]
async fn logs_stream_in_order_and_run_completes() {
    let (sandbox, mut events) = Sandbox::new();
    let id = sandbox
        .run("console.log('hi'); console.log(1, 2, 3);")
        .await
        .unwrap();
    assert!(id.is_some());

    let (seen, outcome) = drive(&mut events).await;
    assert!(matches!(seen.first(), Some(SandboxEvent::Started)));

    let entries = logs(&seen);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, LogKind::Log);
    assert_eq!(entries[0].values, vec![json!("hi")]);
    assert_eq!(entries[1].values, vec![json!(1), json!(2), json!(3)]);
    assert_ne!(entries[0].id, entries[1].id);

    assert_eq!(outcome.terminated_by, Termination::Completed);
    assert!(outcome.completed());
    assert_eq!(sandbox.state().await.phase, IsolatePhase::Idle);
}

#[tokio::test]
async fn infinite_loop_is_terminated_at_the_deadline() {
    let (sandbox, mut events) = quick();
    sandbox.run("while (true) {}").await.unwrap();

    let (seen, outcome) = drive(&mut events).await;
    assert!(logs(&seen).is_empty(), "timeout must not emit log entries");
    assert_eq!(outcome.terminated_by, Termination::TimedOut);
    assert!(outcome.duration_ms >= 400, "ended before the budget");
    assert!(outcome.duration_ms < 3000, "watchdog fired far too late");

    assert_quiet(&mut events).await;
    // the isolate survives termination and accepts the next run
    sandbox.run("console.log('again');").await.unwrap();
    let (seen, outcome) = drive(&mut events).await;
    assert_eq!(logs(&seen).len(), 1);
    assert_eq!(outcome.terminated_by, Termination::Completed);
}

#[tokio::test]
async fn thrown_error_becomes_one_error_entry() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox.run("throw new Error('boom');").await.unwrap();

    let (seen, outcome) = drive(&mut events).await;
    let entries = logs(&seen);
    assert_eq!(entries.len(), 1, "exactly one entry for a thrown error");
    assert_eq!(entries[0].kind, LogKind::Error);
    let text = entries[0].values[0].as_str().unwrap();
    assert!(text.contains("boom"), "got {text:?}");
    assert!(entries[0].stack.is_some(), "thrown errors carry their stack");

    // a throw is a normal, recoverable outcome
    assert_eq!(outcome.terminated_by, Termination::RuntimeError);
    assert_eq!(sandbox.state().await.phase, IsolatePhase::Idle);
}

#[tokio::test]
async fn stop_ends_the_active_run() {
    let (sandbox, mut events) = quick();
    sandbox.run("while (true) {}").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    sandbox.stop().await;

    let (seen, outcome) = drive(&mut events).await;
    assert!(logs(&seen).is_empty(), "stop must not emit log entries");
    assert_eq!(outcome.terminated_by, Termination::StoppedByCaller);
    assert!(outcome.duration_ms < 400, "stop should beat the deadline");
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn stop_while_idle_is_a_noop() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox.stop().await;
    assert_eq!(sandbox.state().await.phase, IsolatePhase::Idle);

    sandbox.run("console.log('still fine');").await.unwrap();
    let (seen, outcome) = drive(&mut events).await;
    assert_eq!(logs(&seen).len(), 1);
    assert_eq!(outcome.terminated_by, Termination::Completed);
}

#[tokio::test]
async fn second_run_while_active_is_rejected() {
    let (sandbox, mut events) = quick();
    let first = sandbox.run("while (true) {}").await.unwrap();
    assert!(first.is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = sandbox.run("console.log('queued?');").await.unwrap();
    assert!(second.is_none(), "overlapping run must be dropped");
    assert_eq!(sandbox.state().await.active_request, first);

    sandbox.stop().await;
    let (seen, _) = drive(&mut events).await;
    assert!(logs(&seen).is_empty(), "rejected run must leave no trace");
}

#[tokio::test]
async fn console_clear_is_forwarded_before_later_logs() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox
        .run("console.log('before'); console.clear(); console.log('after');")
        .await
        .unwrap();

    let (seen, outcome) = drive(&mut events).await;
    let shape: Vec<&str> = seen
        .iter()
        .map(|event| match event {
            SandboxEvent::Started => "started",
            SandboxEvent::Log(_) => "log",
            SandboxEvent::Cleared => "cleared",
            SandboxEvent::Finished(_) => "finished",
        })
        .collect();
    assert_eq!(shape, vec!["started", "log", "cleared", "log"]);
    assert_eq!(outcome.terminated_by, Termination::Completed);
}

#[tokio::test]
async fn unserializable_values_degrade_to_strings() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox
        .run(
            "const o = {}; o.self = o; \
             console.log(o, undefined, NaN, 10n, () => {});",
        )
        .await
        .unwrap();

    let (seen, outcome) = drive(&mut events).await;
    let entries = logs(&seen);
    assert_eq!(entries.len(), 1);
    let values = &entries[0].values;
    assert_eq!(values.len(), 5, "arity is preserved positionally");
    assert_eq!(values[0], json!("[object Object]"));
    assert_eq!(values[1], json!("undefined"));
    assert_eq!(values[2], json!("NaN"));
    assert_eq!(values[3], json!("10"));
    assert!(values[4].is_string());
    assert_eq!(outcome.terminated_by, Termination::Completed);
}

#[tokio::test]
async fn error_arguments_serialize_structurally() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox
        .run("console.error('failed:', new TypeError('bad input'));")
        .await
        .unwrap();

    let (seen, _) = drive(&mut events).await;
    let entries = logs(&seen);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, LogKind::Error);
    assert_eq!(entries[0].values[0], json!("failed:"));
    let err = &entries[0].values[1];
    assert_eq!(err["name"], json!("TypeError"));
    assert_eq!(err["message"], json!("bad input"));
    assert!(err.get("stack").is_some());
}

#[tokio::test]
async fn host_capabilities_are_unreachable() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox
        .run(
            "console.log(typeof fetch, typeof Deno, typeof require, \
             typeof XMLHttpRequest, typeof WebSocket);",
        )
        .await
        .unwrap();

    let (seen, outcome) = drive(&mut events).await;
    let entries = logs(&seen);
    assert_eq!(entries[0].values, vec![json!("undefined"); 5]);
    assert_eq!(outcome.terminated_by, Termination::Completed);
}

#[tokio::test]
async fn timer_callbacks_never_outlive_their_run() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox
        .run("setTimeout(() => console.log('late'), 1); console.log('sync');")
        .await
        .unwrap();

    let (seen, outcome) = drive(&mut events).await;
    let entries = logs(&seen);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].values, vec![json!("sync")]);
    assert_eq!(outcome.terminated_by, Termination::Completed);
    // the timer fires inside the isolate, but its emission is gated out
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn ping_reflects_isolate_liveness() {
    let (sandbox, _events) = Sandbox::new();
    assert!(!sandbox.is_alive(Duration::from_millis(100)).await);

    sandbox.start().await.unwrap();
    assert!(sandbox.is_alive(Duration::from_secs(2)).await);

    sandbox.dispose().await;
    assert!(!sandbox.is_alive(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn dispose_closes_the_active_run_and_allows_restart() {
    let (sandbox, mut events) = quick();
    sandbox.run("while (true) {}").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    sandbox.dispose().await;

    let (seen, outcome) = drive(&mut events).await;
    assert!(logs(&seen).is_empty());
    assert_eq!(outcome.terminated_by, Termination::StoppedByCaller);

    // a fresh isolate comes up transparently on the next run
    sandbox.run("console.log('reborn');").await.unwrap();
    let (seen, outcome) = drive(&mut events).await;
    assert_eq!(logs(&seen).len(), 1);
    assert_eq!(outcome.terminated_by, Termination::Completed);
}

#[tokio::test]
async fn unhandled_rejection_surfaces_as_one_error_entry() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox
        .run("Promise.reject(new Error('lost'));")
        .await
        .unwrap();

    let (seen, outcome) = drive(&mut events).await;
    let entries = logs(&seen);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, LogKind::Error);
    assert_eq!(entries[0].values[0], json!("Unhandled promise rejection"));
    let detail = entries[0].values[1].as_str().unwrap();
    assert!(detail.contains("lost"), "got {detail:?}");
    assert_eq!(outcome.terminated_by, Termination::Completed);

    // the rejection must not tear the isolate down
    sandbox.run("console.log('next');").await.unwrap();
    let (seen, outcome) = drive(&mut events).await;
    assert_eq!(logs(&seen)[0].values, vec![json!("next")]);
    assert_eq!(outcome.terminated_by, Termination::Completed);
}

#[tokio::test]
async fn settled_microtasks_flush_before_the_outcome() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox
        .run("Promise.resolve().then(() => console.log('micro'));")
        .await
        .unwrap();

    // drive() only returns on the terminal event, so the entry collected
    // here provably preceded the outcome
    let (seen, outcome) = drive(&mut events).await;
    let entries = logs(&seen);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].values, vec![json!("micro")]);
    assert_eq!(outcome.terminated_by, Termination::Completed);
}

#[tokio::test]
async fn throwing_timer_callback_does_not_poison_later_runs() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox
        .run("setTimeout(() => { throw new Error('late boom'); }, 1);")
        .await
        .unwrap();
    let (seen, outcome) = drive(&mut events).await;
    assert!(logs(&seen).is_empty());
    assert_eq!(outcome.terminated_by, Termination::Completed);

    // the callback fires between runs; its throw is swallowed there
    assert_quiet(&mut events).await;

    sandbox.run("console.log('clean');").await.unwrap();
    let (seen, outcome) = drive(&mut events).await;
    let entries = logs(&seen);
    assert_eq!(entries.len(), 1, "a stale callback fault leaked in");
    assert_eq!(entries[0].values, vec![json!("clean")]);
    assert_eq!(outcome.terminated_by, Termination::Completed);
}

#[tokio::test]
async fn cleared_timers_leave_no_residue_across_runs() {
    let (sandbox, mut events) = Sandbox::new();
    for _ in 0..2 {
        sandbox
            .run(
                "for (let i = 0; i < 50; i++) \
                 clearTimeout(setTimeout(() => console.log('no'), 1000));",
            )
            .await
            .unwrap();
        let (seen, outcome) = drive(&mut events).await;
        assert!(logs(&seen).is_empty());
        assert_eq!(outcome.terminated_by, Termination::Completed);
    }
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn declarations_do_not_leak_between_runs() {
    let (sandbox, mut events) = Sandbox::new();
    sandbox.run("const secret = 42;").await.unwrap();
    let (_, outcome) = drive(&mut events).await;
    assert_eq!(outcome.terminated_by, Termination::Completed);

    sandbox.run("console.log(typeof secret);").await.unwrap();
    let (seen, _) = drive(&mut events).await;
    assert_eq!(logs(&seen)[0].values, vec![json!("undefined")]);
}
