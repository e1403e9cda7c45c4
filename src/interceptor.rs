//! Console capture inside the isolate
//!
//! The scoped console built by the allowlist calls back into these ops. Each
//! call becomes one [`LogEntry`] constructed here (id + timestamp assigned on
//! the Rust side) and pushed onto the isolate's outbound message channel.
//!
//! Every scope carries the generation it was created for; emissions from a
//! retired scope (a timer callback surviving its run) are dropped, which is
//! what keeps log entries from trailing the terminal outcome.

use crate::protocol::IsolateMessage;
use crate::types::{LogEntry, LogKind};
use deno_core::{op2, OpState};
use serde_json::Value;
use tokio::sync::mpsc;

/// Per-isolate interception state, stored in the runtime's `OpState`
pub(crate) struct RunContext {
    pub generation: u32,
    pub active: bool,
    pub messages: mpsc::UnboundedSender<IsolateMessage>,
}

impl RunContext {
    pub fn new(messages: mpsc::UnboundedSender<IsolateMessage>) -> Self {
        Self {
            generation: 0,
            active: false,
            messages,
        }
    }

    fn accepts(&self, generation: u32) -> bool {
        self.active && self.generation == generation
    }
}

#[op2]
pub(crate) fn op_console_emit(
    state: &mut OpState,
    generation: u32,
    #[string] channel: String,
    #[serde] values: Vec<Value>,
    #[string] stack: Option<String>,
) {
    let ctx = state.borrow::<RunContext>();
    if !ctx.accepts(generation) {
        tracing::trace!(generation, "dropping console emission from retired scope");
        return;
    }
    let entry = LogEntry::new(LogKind::from_channel(&channel), values, stack);
    tracing::trace!(channel = %channel, entry_id = %entry.id, "captured console call");
    let _ = ctx.messages.send(IsolateMessage::Log(entry));
}

#[op2(fast)]
pub(crate) fn op_console_clear(state: &mut OpState, generation: u32) {
    let ctx = state.borrow::<RunContext>();
    if !ctx.accepts(generation) {
        return;
    }
    let _ = ctx.messages.send(IsolateMessage::Clear);
}
