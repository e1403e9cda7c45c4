//! Execution budget and scheduling clamps for sandboxed runs

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource shaping applied to every run.
///
/// The deadline is the hard wall-clock budget; the clamp bounds are the only
/// other resource control and exist so a script cannot schedule degenerate
/// near-zero-interval repetition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Hard wall-clock budget per run
    pub deadline: Duration,

    /// Lower clamp for one-shot timer delays, in milliseconds
    pub min_timer_delay_ms: u64,

    /// Upper clamp for one-shot timer delays, in milliseconds
    pub max_timer_delay_ms: u64,

    /// Lower clamp for repeating timer intervals, in milliseconds
    pub min_interval_ms: u64,

    /// Upper clamp for repeating timer intervals, in milliseconds
    pub max_interval_ms: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(3000),
            min_timer_delay_ms: 1,
            max_timer_delay_ms: 5000,
            min_interval_ms: 10,
            max_interval_ms: 5000,
        }
    }
}

impl ExecutionLimits {
    /// Tighter budget for previews or tests
    pub fn strict() -> Self {
        Self {
            deadline: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Clamp a requested one-shot delay to the permitted window.
    ///
    /// Non-finite and negative requests collapse to the lower bound.
    pub fn clamp_timer_delay(&self, requested_ms: f64) -> Duration {
        Duration::from_millis(clamp_ms(
            requested_ms,
            self.min_timer_delay_ms,
            self.max_timer_delay_ms,
        ))
    }

    /// Clamp a requested repeat interval to the permitted window.
    pub fn clamp_interval(&self, requested_ms: f64) -> Duration {
        Duration::from_millis(clamp_ms(
            requested_ms,
            self.min_interval_ms,
            self.max_interval_ms,
        ))
    }
}

fn clamp_ms(requested: f64, min: u64, max: u64) -> u64 {
    let requested = if requested.is_finite() && requested > 0.0 {
        requested as u64
    } else {
        0
    };
    requested.clamp(min, max)
}
