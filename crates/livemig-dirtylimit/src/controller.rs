use livemig_core::MIB;

use crate::{DirtyLimitConfig, VcpuDirtyLimitState};

/// The feedback loop turning a measured rate and a quota into a throttle.
///
/// The controller remembers the highest rate it has seen across all vCPUs;
/// the time a vCPU needs to fill its dirty ring at that rate is the unit
/// every throttle is expressed in.
#[derive(Debug, Clone)]
pub struct ThrottleController {
    ring_bytes: u64,
    tolerance_mbps: u64,
    linear_adjustment_pct: u64,
    throttle_pct_max: u64,
    max_dirtyrate: u64,
}

impl ThrottleController {
    /// Number of consecutive off-target periods required before acting.
    pub const UNMATCHED_THRESHOLD: u32 = 2;

    /// Creates a controller.
    pub fn new(config: &DirtyLimitConfig) -> Self {
        Self {
            ring_bytes: config.ring_size * config.page_size,
            tolerance_mbps: config.tolerance_mbps,
            linear_adjustment_pct: config.linear_adjustment_pct,
            throttle_pct_max: config.throttle_pct_max,
            max_dirtyrate: 0,
        }
    }

    /// Returns the highest rate seen so far, in MB/s.
    pub fn max_dirtyrate(&self) -> u64 {
        self.max_dirtyrate
    }

    /// Records `current` and returns the ring-full time in microseconds.
    ///
    /// Zero while no rate has been observed.
    pub fn ring_full_us(&mut self, current: u64) -> u64 {
        self.max_dirtyrate = self.max_dirtyrate.max(current);

        if self.max_dirtyrate == 0 {
            return 0;
        }

        (self.ring_bytes as u128 * 1_000_000 / (self.max_dirtyrate as u128 * MIB as u128)) as u64
    }

    /// Returns `true` if `current` is within tolerance of `quota`.
    pub fn is_converged(&self, quota: u64, current: u64) -> bool {
        quota.abs_diff(current) <= self.tolerance_mbps
    }

    /// Runs one period of the loop for one vCPU.
    ///
    /// Returns `true` if the throttle changed.
    pub fn adjust(&mut self, state: &mut VcpuDirtyLimitState, current: u64) -> bool {
        let previous = state.throttle_us_per_full;

        if current == 0 && state.unmatched_count == 0 {
            state.throttle_us_per_full = 0;
            return previous != 0;
        }

        if self.is_converged(state.quota_mbps, current) {
            state.unmatched_count = 0;
            return false;
        }

        state.unmatched_count = state.unmatched_count.saturating_add(1);
        if state.unmatched_count < Self::UNMATCHED_THRESHOLD {
            return false;
        }

        state.throttle_us_per_full =
            self.next_throttle(state.throttle_us_per_full, state.quota_mbps, current);

        state.throttle_us_per_full != previous
    }

    /// Computes the throttle following `throttle` for an off-target vCPU.
    ///
    /// Far from the target (relative error above the linear adjustment
    /// threshold) the step is proportional to the error; near it, the step
    /// is a tenth of the ring-full time. The result is clamped to
    /// `[0, throttle_pct_max% of the ring-full time]`.
    pub fn next_throttle(&mut self, throttle: u64, quota: u64, current: u64) -> u64 {
        if current == 0 {
            return 0;
        }

        let ring_full_us = self.ring_full_us(current) as i128;
        let larger = quota.max(current);
        let error_pct = (quota.abs_diff(current) * 100 / larger).min(99);

        let step = if error_pct > self.linear_adjustment_pct {
            ring_full_us * error_pct as i128 / (100 - error_pct as i128)
        } else {
            ring_full_us / 10
        };

        let throttle = if quota < current {
            throttle as i128 + step
        } else {
            throttle as i128 - step
        };

        let max = ring_full_us * self.throttle_pct_max as i128 / 100;
        throttle.clamp(0, max) as u64
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
