/// Message update throttling.
///
/// Slack limits `chat.update` per channel, so sampling runs at the poll
/// interval while edits go out at most once per update period.
use std::time::{Duration, Instant};

pub struct UpdateThrottle {
    period: Duration,
    last_ok: Option<Instant>,
}

impl UpdateThrottle {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_ok: None,
        }
    }

    /// Returns `true` and starts a new period if the previous one elapsed.
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    pub fn ready_at(&mut self, now: Instant) -> bool {
        match self.last_ok {
            Some(last) if now.saturating_duration_since(last) < self.period => false,
            _ => {
                self.last_ok = Some(now);
                true
            }
        }
    }
}
