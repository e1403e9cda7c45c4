//! Restricted global namespace exposed to user code
//!
//! The bootstrap below is installed once per isolate. It captures the op
//! table, deletes `globalThis.Deno`, and leaves behind a single
//! `__sandbox.createScope(generation)` hook that builds the exact set of
//! globals a run may see. User code is evaluated as a strict-mode
//! `new Function` over those names and nothing else; there is no filesystem,
//! network, or host-introspection primitive to reach.

use crate::interceptor::{op_console_clear, op_console_emit};
use crate::limits::ExecutionLimits;
use deno_core::{op2, Extension, OpState};
use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;

/// Scheduling primitive backing `setTimeout`. The clamp is the only resource
/// shaping short of the hard deadline.
#[op2(async)]
pub(crate) async fn op_timer_sleep(state: Rc<RefCell<OpState>>, delay_ms: f64) {
    let clamped = state
        .borrow()
        .borrow::<ExecutionLimits>()
        .clamp_timer_delay(delay_ms);
    tokio::time::sleep(clamped).await;
}

/// Scheduling primitive backing `setInterval`, with a higher floor so a
/// script cannot starve the event loop with near-zero repetition.
#[op2(async)]
pub(crate) async fn op_timer_sleep_repeating(state: Rc<RefCell<OpState>>, delay_ms: f64) {
    let clamped = state
        .borrow()
        .borrow::<ExecutionLimits>()
        .clamp_interval(delay_ms);
    tokio::time::sleep(clamped).await;
}

/// Ops reachable from the bootstrap
pub(crate) fn extension() -> Extension {
    Extension {
        name: "jsbox",
        ops: Cow::Owned(vec![
            op_console_emit(),
            op_console_clear(),
            op_timer_sleep(),
            op_timer_sleep_repeating(),
        ]),
        ..Default::default()
    }
}

/// Installed once per isolate, before any command is served.
pub(crate) const BOOTSTRAP_JS: &str = r#"
((ops) => {
  "use strict";

  const emitOp = ops.op_console_emit;
  const clearOp = ops.op_console_clear;
  const sleepOp = ops.op_timer_sleep;
  const sleepRepeatingOp = ops.op_timer_sleep_repeating;

  // Positional, per-argument serialization. A value that cannot be
  // represented structurally degrades to a string; it never aborts the call.
  const serialize = (value) => {
    if (value === null) return null;
    const t = typeof value;
    if (t === "string" || t === "boolean") return value;
    if (t === "number") return Number.isFinite(value) ? value : String(value);
    if (t === "undefined") return "undefined";
    if (value instanceof Error) {
      return { name: value.name, message: value.message, stack: value.stack ?? null };
    }
    if (t === "object") {
      try {
        return JSON.parse(JSON.stringify(value));
      } catch (_) {
        return String(value);
      }
    }
    // function, symbol, bigint
    return String(value);
  };

  const makeConsole = (gen) => {
    const emit = (channel, args, stack) => {
      try {
        emitOp(gen, channel, Array.from(args).map(serialize), stack ?? null);
      } catch (_) {}
    };
    const timers = new Map();
    return {
      log(...args) { emit("log", args); },
      info(...args) { emit("info", args); },
      warn(...args) { emit("warn", args); },
      error(...args) { emit("error", args); },
      clear() {
        try { clearOp(gen); } catch (_) {}
      },
      table(data) { emit("log", [data]); },
      group(...args) {
        emit("log", ["▼ " + (args.length ? args.join(" ") : "Group")]);
      },
      groupEnd() {},
      time(label) {
        const name = label === undefined ? "default" : String(label);
        timers.set(name, Date.now());
        emit("log", ["⏱️ Timer '" + name + "' started"]);
      },
      timeEnd(label) {
        const name = label === undefined ? "default" : String(label);
        const started = timers.get(name);
        timers.delete(name);
        emit("log", [
          started === undefined
            ? "⏱️ Timer '" + name + "' does not exist"
            : "⏱️ Timer '" + name + "': " + (Date.now() - started) + " ms",
        ]);
      },
    };
  };

  let timerSeq = 1;
  const makeTimers = (gen) => {
    // Ids stay monotonic for the isolate's life; the cancellation set is
    // scoped to one run so stale clears cannot accumulate across runs.
    const cancelled = new Set();
    // A throw escaping a scheduled callback has nothing above it to catch
    // it; surface it as an error entry instead of an isolate-level fault.
    const invoke = (callback, args) => {
      try {
        callback(...args);
      } catch (err) {
        try {
          emitOp(gen, "error", ["Uncaught " + String(err)],
            err && err.stack ? String(err.stack) : null);
        } catch (_) {}
      }
    };
    const setTimeout = (callback, delay, ...args) => {
      const id = timerSeq++;
      sleepOp(Number(delay) || 0).then(() => {
        if (!cancelled.delete(id)) invoke(callback, args);
      });
      return id;
    };
    const setInterval = (callback, delay, ...args) => {
      const id = timerSeq++;
      (async () => {
        for (;;) {
          await sleepRepeatingOp(Number(delay) || 0);
          if (cancelled.delete(id)) return;
          invoke(callback, args);
        }
      })();
      return id;
    };
    const clearTimer = (id) => { cancelled.add(id); };
    return {
      setTimeout,
      clearTimeout: clearTimer,
      setInterval,
      clearInterval: clearTimer,
    };
  };

  const PASSTHROUGH = [
    "Math", "Date", "JSON",
    "parseInt", "parseFloat", "isNaN", "isFinite",
    "encodeURIComponent", "decodeURIComponent", "encodeURI", "decodeURI",
    "Array", "Object", "String", "Number", "Boolean", "RegExp", "Map", "Set",
    "Error", "TypeError", "ReferenceError", "SyntaxError", "RangeError",
    "Promise",
  ];

  globalThis.__sandbox = {
    createScope(gen) {
      const scope = Object.create(null);
      scope.console = makeConsole(gen);
      for (const name of PASSTHROUGH) {
        scope[name] = globalThis[name];
      }
      Object.assign(scope, makeTimers(gen));
      return scope;
    },
  };

  delete globalThis.Deno;
})(Deno.core.ops);
"#;

/// Build the script evaluated for one run: a strict-mode `new Function` over
/// exactly the allowlisted names, applied to the freshly built scope.
pub(crate) fn compose_run_script(code: &str, generation: u32) -> String {
    // serde_json string encoding is a valid JS string literal
    let body = serde_json::to_string(&format!("\"use strict\";\n{code}"))
        .unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{
  const scope = globalThis.__sandbox.createScope({generation});
  const names = Object.keys(scope);
  const run = new Function(...names, {body});
  run(...names.map((name) => scope[name]));
}})();"#
    )
}
