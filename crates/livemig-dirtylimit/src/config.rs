use std::{ops::RangeInclusive, time::Duration};

use livemig_core::MigrationError;
use serde::{Deserialize, Serialize};

/// Parameters of the dirty limit controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirtyLimitConfig {
    /// Period of the adjustment loop and of the rate measurement.
    pub period: Duration,

    /// Capacity of a vCPU's dirty ring, in entries.
    pub ring_size: u64,

    /// Guest page size in bytes.
    pub page_size: u64,

    /// Number of vCPUs the table is sized for.
    pub max_vcpus: u16,

    /// Absolute difference between rate and quota, in MB/s, under which a
    /// vCPU is considered on target.
    pub tolerance_mbps: u64,

    /// Relative error, in percent, above which the throttle is adjusted
    /// proportionally instead of by a fixed step.
    pub linear_adjustment_pct: u64,

    /// Largest throttle, in percent of the ring-full time.
    pub throttle_pct_max: u64,

    /// Pages sampled per GiB by the default rate source.
    pub sample_pages_per_gib: u64,
}

impl DirtyLimitConfig {
    /// Valid range of [`period`].
    ///
    /// [`period`]: Self::period
    pub const PERIOD_RANGE: RangeInclusive<Duration> =
        Duration::from_millis(1)..=Duration::from_millis(1000);

    /// Sets the adjustment period.
    pub fn with_period(self, period: Duration) -> Self {
        Self { period, ..self }
    }

    /// Sets the dirty ring capacity.
    pub fn with_ring_size(self, ring_size: u64) -> Self {
        Self { ring_size, ..self }
    }

    /// Sets the page size.
    pub fn with_page_size(self, page_size: u64) -> Self {
        Self { page_size, ..self }
    }

    /// Sets the number of vCPUs.
    pub fn with_max_vcpus(self, max_vcpus: u16) -> Self {
        Self { max_vcpus, ..self }
    }

    /// Checks every parameter against its valid range.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if !Self::PERIOD_RANGE.contains(&self.period) {
            return Err(MigrationError::invalid_parameter(
                "period",
                format!("{:?} is outside of 1ms..=1000ms", self.period),
            ));
        }

        if self.ring_size == 0 {
            return Err(MigrationError::invalid_parameter("ring_size", "must be nonzero"));
        }

        if !self.page_size.is_power_of_two() {
            return Err(MigrationError::invalid_parameter(
                "page_size",
                format!("{} is not a power of two", self.page_size),
            ));
        }

        if self.max_vcpus == 0 {
            return Err(MigrationError::invalid_parameter("max_vcpus", "must be nonzero"));
        }

        if self.linear_adjustment_pct >= 100 || self.throttle_pct_max >= 100 {
            return Err(MigrationError::invalid_parameter(
                "throttle_pct_max",
                "percentages must be below 100",
            ));
        }

        Ok(())
    }
}

impl Default for DirtyLimitConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1000),
            ring_size: 4096,
            page_size: 4096,
            max_vcpus: 1,
            tolerance_mbps: 25,
            linear_adjustment_pct: 50,
            throttle_pct_max: 99,
            sample_pages_per_gib: 512,
        }
    }
}
