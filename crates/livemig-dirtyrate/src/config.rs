use std::{ops::RangeInclusive, time::Duration};

use livemig_core::MigrationError;
use serde::{Deserialize, Serialize};

/// Parameters of a dirty rate measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of pages sampled per GiB of block memory.
    pub sample_pages_per_gib: u64,

    /// Length of the measurement window.
    pub calc_time: Duration,

    /// Blocks smaller than this are not sampled.
    pub min_block_size: u64,

    /// Seed for the page selection, for reproducible rounds.
    pub seed: Option<u64>,
}

impl SamplerConfig {
    /// Default number of pages sampled per GiB.
    pub const DEFAULT_SAMPLE_PAGES_PER_GIB: u64 = 512;

    /// Valid range of [`sample_pages_per_gib`].
    ///
    /// [`sample_pages_per_gib`]: Self::sample_pages_per_gib
    pub const SAMPLE_PAGES_RANGE: RangeInclusive<u64> = 128..=4096;

    /// Default measurement window.
    pub const DEFAULT_CALC_TIME: Duration = Duration::from_secs(1);

    /// Shortest accepted measurement window.
    pub const MIN_CALC_TIME: Duration = Duration::from_millis(50);

    /// Longest accepted measurement window.
    pub const MAX_CALC_TIME: Duration = Duration::from_secs(60);

    /// Default minimum block size.
    pub const DEFAULT_MIN_BLOCK_SIZE: u64 = 128 << 10;

    /// Sets the number of pages sampled per GiB.
    pub fn with_sample_pages_per_gib(self, sample_pages_per_gib: u64) -> Self {
        Self {
            sample_pages_per_gib,
            ..self
        }
    }

    /// Sets the measurement window.
    pub fn with_calc_time(self, calc_time: Duration) -> Self {
        Self { calc_time, ..self }
    }

    /// Sets the minimum block size.
    pub fn with_min_block_size(self, min_block_size: u64) -> Self {
        Self {
            min_block_size,
            ..self
        }
    }

    /// Sets the sampling seed.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..self
        }
    }

    /// Checks every parameter against its valid range.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if !Self::SAMPLE_PAGES_RANGE.contains(&self.sample_pages_per_gib) {
            return Err(MigrationError::invalid_parameter(
                "sample_pages_per_gib",
                format!(
                    "{} is outside of {:?}",
                    self.sample_pages_per_gib,
                    Self::SAMPLE_PAGES_RANGE
                ),
            ));
        }

        if self.calc_time < Self::MIN_CALC_TIME || self.calc_time > Self::MAX_CALC_TIME {
            return Err(MigrationError::invalid_parameter(
                "calc_time",
                format!("{:?} is outside of 50ms..=60s", self.calc_time),
            ));
        }

        Ok(())
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_pages_per_gib: Self::DEFAULT_SAMPLE_PAGES_PER_GIB,
            calc_time: Self::DEFAULT_CALC_TIME,
            min_block_size: Self::DEFAULT_MIN_BLOCK_SIZE,
            seed: None,
        }
    }
}
