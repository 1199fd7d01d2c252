//! Byte counts for humans and throttled progress reporting.

use std::time::{Duration, Instant};

use bytesize::ByteSize;

/// Format a byte count, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    ByteSize(bytes).to_string()
}

/// Lets an event through at most once per interval.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Instant,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// One report per second.
    pub fn per_second() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Whether a report is due at `now`; if so the window restarts.
    pub fn ready_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }

    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }
}
