use std::time::{Duration, Instant};

pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(50);

/// Gate for outbound cursor samples.
///
/// A sample goes out only when it differs from the last one sent and the
/// interval since that send has passed.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last: Option<(f64, f64, Instant)>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn should_send(&mut self, x: f64, y: f64, now: Instant) -> bool {
        if let Some((last_x, last_y, sent_at)) = self.last {
            if last_x == x && last_y == y {
                return false;
            }
            if now.saturating_duration_since(sent_at) < self.interval {
                return false;
            }
        }
        self.last = Some((x, y, now));
        true
    }

    /// Forget the last sample, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_INTERVAL)
    }
}
