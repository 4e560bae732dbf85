use std::time::Duration;

use livemig_core::MigrationError;
use livemig_dirtylimit::DirtyLimitConfig;
use livemig_dirtyrate::SamplerConfig;
use livemig_multifd::MultifdConfig;
use serde::{Deserialize, Serialize};

/// Configuration of a [`MigrationEngine`].
///
/// [`MigrationEngine`]: crate::MigrationEngine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Guest page size in bytes.
    pub page_size: u64,

    /// Parameters of the multifd channels.
    pub multifd: MultifdConfig,

    /// Parameters of the VM-wide dirty rate measurement.
    pub dirty_rate: SamplerConfig,

    /// Parameters of the per-vCPU dirty limit.
    pub dirty_limit: DirtyLimitConfig,

    /// Time the confidential helper has to complete one command.
    pub confidential_timeout: Duration,
}

impl MigrationConfig {
    /// Default guest page size.
    pub const DEFAULT_PAGE_SIZE: u64 = 4096;

    /// Default confidential helper timeout.
    pub const DEFAULT_CONFIDENTIAL_TIMEOUT: Duration = Duration::from_millis(100);

    /// Sets the guest page size, for the channels and the dirty limit.
    pub fn with_page_size(self, page_size: u64) -> Self {
        Self {
            page_size,
            dirty_limit: self.dirty_limit.with_page_size(page_size),
            ..self
        }
    }

    /// Sets the multifd parameters.
    pub fn with_multifd(self, multifd: MultifdConfig) -> Self {
        Self { multifd, ..self }
    }

    /// Sets the dirty rate measurement parameters.
    pub fn with_dirty_rate(self, dirty_rate: SamplerConfig) -> Self {
        Self { dirty_rate, ..self }
    }

    /// Sets the dirty limit parameters.
    pub fn with_dirty_limit(self, dirty_limit: DirtyLimitConfig) -> Self {
        Self {
            dirty_limit,
            ..self
        }
    }

    /// Sets the confidential helper timeout.
    pub fn with_confidential_timeout(self, confidential_timeout: Duration) -> Self {
        Self {
            confidential_timeout,
            ..self
        }
    }

    /// Checks every parameter against its valid range.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if !self.page_size.is_power_of_two() {
            return Err(MigrationError::invalid_parameter(
                "page_size",
                format!("{} is not a power of two", self.page_size),
            ));
        }

        self.multifd.validate(self.page_size)?;
        self.dirty_rate.validate()?;
        self.dirty_limit.validate()?;

        if self.confidential_timeout.is_zero() {
            return Err(MigrationError::invalid_parameter(
                "confidential_timeout",
                "must be nonzero",
            ));
        }

        Ok(())
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            multifd: MultifdConfig::default(),
            dirty_rate: SamplerConfig::default(),
            dirty_limit: DirtyLimitConfig::default(),
            confidential_timeout: Self::DEFAULT_CONFIDENTIAL_TIMEOUT,
        }
    }
}
