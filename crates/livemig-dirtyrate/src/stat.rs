use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The state of the measurement state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CalcState {
    /// No measurement has completed yet.
    Unstarted = 0,

    /// A measurement is running.
    Measuring = 1,

    /// The last measurement completed.
    Measured = 2,
}

impl CalcState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Measuring,
            2 => Self::Measured,
            _ => Self::Unstarted,
        }
    }
}

/// The result of one measurement round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyRateStat {
    /// Number of pages hashed in the compared blocks.
    pub total_sample_count: u64,

    /// Number of sampled pages whose hash changed.
    pub total_dirty_samples: u64,

    /// Size of the compared blocks, in MiB.
    pub total_block_mem_mb: u64,

    /// Estimated dirty rate, in MB/s.
    pub dirty_rate: u64,

    /// Start of the window, in milliseconds on the sampler's clock.
    pub start_time: u64,

    /// Actual length of the window.
    pub calc_time: Duration,
}

/// The answer to a dirty rate query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyRateInfo {
    /// The current state.
    pub status: CalcState,

    /// The result of the last completed round, if any.
    pub stat: Option<DirtyRateStat>,
}
