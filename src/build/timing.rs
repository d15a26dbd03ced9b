//! Stage timing.

use std::time::{Duration, Instant};
use tracing::info;

/// Logs the start of a phase and, on [`Timer::finish`], its duration.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    pub fn start(name: &str) -> Self {
        info!("==> {}", name);
        Self {
            name: name.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        let secs = elapsed.as_secs_f64();
        if secs >= 60.0 {
            info!("  [{:.1}m] {}", secs / 60.0, self.name);
        } else {
            info!("  [{:.1}s] {}", secs, self.name);
        }
        elapsed
    }
}
