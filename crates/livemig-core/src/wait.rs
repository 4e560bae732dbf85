use std::time::{Duration, Instant};

use crate::{Clock, MigrationError};

/// A bounded busy-wait.
///
/// The condition is checked in batches of tight spins; between batches the
/// thread yields and the wall-clock budget is checked. The total wait never
/// exceeds the budget by more than one batch plus scheduling jitter.
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    timeout: Duration,
    spin_batch: u32,
}

impl PollBudget {
    /// Default number of condition checks between two clock reads.
    pub const DEFAULT_SPIN_BATCH: u32 = 1000;

    /// Creates a budget of `timeout`.
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            spin_batch: Self::DEFAULT_SPIN_BATCH,
        }
    }

    /// Sets the number of condition checks between two clock reads.
    pub const fn with_spin_batch(self, spin_batch: u32) -> Self {
        Self {
            spin_batch: if spin_batch == 0 { 1 } else { spin_batch },
            ..self
        }
    }

    /// Returns the timeout.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Polls `condition` until it returns `true` or the budget runs out.
    ///
    /// Returns the time spent waiting.
    pub fn poll_until<F>(&self, mut condition: F) -> Result<Duration, MigrationError>
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();

        loop {
            for _ in 0..self.spin_batch {
                if condition() {
                    return Ok(start.elapsed());
                }

                std::hint::spin_loop();
            }

            if start.elapsed() >= self.timeout {
                return Err(MigrationError::Timeout);
            }

            std::thread::yield_now();
        }
    }
}

/// Sleeps until at least `window` has passed since `start_ns`.
///
/// If the window already elapsed, returns immediately. Returns the actual
/// time elapsed since `start_ns`, which is never shorter than `window`.
pub fn wait_window(clock: &dyn Clock, start_ns: u64, window: Duration) -> Duration {
    let elapsed = Duration::from_nanos(clock.now_ns().saturating_sub(start_ns));

    if elapsed < window {
        clock.sleep(window - elapsed);
    }

    Duration::from_nanos(clock.now_ns().saturating_sub(start_ns)).max(window)
}
