use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the emitter re-establishes a dropped link.
///
/// Attempt `n` (zero-based) waits `initial_delay_ms * multiplier^n`, capped
/// at `max_delay_ms`, before reconnecting. The waits block the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts per outage; 0 disables reconnection.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl ReconnectPolicy {
    /// One attempt after a fixed pause.
    pub fn single(delay: Duration) -> Self {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            max_attempts: 1,
            initial_delay_ms: ms,
            multiplier: 1.0,
            max_delay_ms: ms,
        }
    }

    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Wait before attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}
