use livemig_core::VcpuId;
use serde::{Deserialize, Serialize};

/// Dirty limit state of one vCPU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuDirtyLimitState {
    /// The vCPU index.
    pub cpu_index: VcpuId,

    /// Whether the vCPU is limited.
    pub enabled: bool,

    /// The quota in MB/s.
    pub quota_mbps: u64,

    /// Number of consecutive periods the rate was off target.
    pub unmatched_count: u32,

    /// Time the vCPU sleeps every time its dirty ring fills, in
    /// microseconds.
    pub throttle_us_per_full: u64,
}

impl VcpuDirtyLimitState {
    /// Creates a disabled state for `cpu_index`.
    pub fn new(cpu_index: VcpuId) -> Self {
        Self {
            cpu_index,
            ..Default::default()
        }
    }
}

/// Dirty limit status of one limited vCPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyLimitInfo {
    /// The vCPU index.
    pub cpu_index: VcpuId,

    /// The quota in MB/s.
    pub limit_rate: u64,

    /// The last measured rate in MB/s.
    pub current_rate: u64,
}
