//! Shared record of the convergence loop's last tick.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Cloneable handle to the time of the most recent completed tick.
#[derive(Debug, Clone, Default)]
pub struct TickClock {
    last: Arc<Mutex<Option<Instant>>>,
}

impl TickClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick completing now.
    pub fn record(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(Instant::now());
        }
    }

    pub fn last_tick(&self) -> Option<Instant> {
        self.last.lock().ok().and_then(|last| *last)
    }

    /// Time since the last tick, `None` if the loop never ticked.
    pub fn age(&self) -> Option<Duration> {
        self.last_tick().map(|t| t.elapsed())
    }

    /// No tick within two intervals, or no tick at all.
    pub fn is_stale(&self, interval: Duration) -> bool {
        match self.age() {
            Some(age) => age > interval * 2,
            None => true,
        }
    }
}
