use std::collections::VecDeque;
use tokio::time::Instant;

const WINDOW_SLOTS: usize = 2;

/// The two most recent `(when, handled_line_count)` samples.
#[derive(Debug, Default)]
pub struct ThroughputWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_SLOTS),
        }
    }

    pub fn push(&mut self, at: Instant, handled: u64) {
        if self.samples.len() == WINDOW_SLOTS {
            self.samples.pop_front();
        }
        self.samples.push_back((at, handled));
    }

    /// Lines per second between the two samples, 0.0 until both slots are
    /// filled.
    pub fn rate(&self) -> f64 {
        let (Some(&(prev_at, prev)), Some(&(last_at, last))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last_at.saturating_duration_since(prev_at).as_secs_f64();
        if self.samples.len() < WINDOW_SLOTS || elapsed <= 0.0 {
            return 0.0;
        }
        last.saturating_sub(prev) as f64 / elapsed
    }
}
