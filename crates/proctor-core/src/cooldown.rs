use std::time::{Duration, Instant};

/// Minimum spacing between face alerts.
///
/// The no-face and looking-away rules share one clock: after either one
/// fires, neither fires again until `interval` has elapsed. A zero interval
/// disables the gate so every qualifying frame alerts.
#[derive(Debug, Clone)]
pub struct AlertCooldown {
    interval: Duration,
    last_alert: Option<Instant>,
}

impl AlertCooldown {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_alert: None,
        }
    }

    /// Return `true` if an alert raised at `now` should go through.
    pub fn ready(&self, now: Instant) -> bool {
        if self.interval.is_zero() {
            return true;
        }
        match self.last_alert {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        }
    }

    /// Record that an alert was raised at `now`.
    pub fn record_alert(&mut self, now: Instant) {
        self.last_alert = Some(now);
    }
}
