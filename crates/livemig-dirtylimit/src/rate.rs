use std::{sync::Arc, time::Duration};

use livemig_core::{Clock, RamBlock, VcpuId, wait_window};
use livemig_dirtyrate::SamplingRound;
use parking_lot::Mutex;
use rand::{SeedableRng as _, rngs::StdRng};

/// Measures the dirty rate of individual vCPUs.
pub trait VcpuRateSource: Send + Sync {
    /// Measures each of `vcpus` over one `period`, blocking for it.
    ///
    /// Returns the rate of each vCPU in MB/s. A vCPU missing from the result
    /// keeps its previous rate.
    fn measure(&self, vcpus: &[VcpuId], period: Duration) -> Vec<(VcpuId, u64)>;
}

impl<F> VcpuRateSource for F
where
    F: Fn(&[VcpuId], Duration) -> Vec<(VcpuId, u64)> + Send + Sync,
{
    fn measure(&self, vcpus: &[VcpuId], period: Duration) -> Vec<(VcpuId, u64)> {
        self(vcpus, period)
    }
}

/// Maps a vCPU to the memory it writes to.
pub trait VcpuMemory: Send + Sync {
    /// Returns the blocks the vCPU dirties.
    fn vcpu_blocks(&self, vcpu: VcpuId) -> Vec<Arc<RamBlock>>;
}

/// A [`VcpuRateSource`] that samples each vCPU's memory the same way the
/// VM-wide sampler samples all of guest memory.
pub struct SampledVcpuRate {
    memory: Arc<dyn VcpuMemory>,
    clock: Arc<dyn Clock>,
    sample_pages_per_gib: u64,
    rng: Mutex<StdRng>,
}

impl SampledVcpuRate {
    /// Creates a rate source over `memory`.
    pub fn new(
        memory: Arc<dyn VcpuMemory>,
        clock: Arc<dyn Clock>,
        sample_pages_per_gib: u64,
    ) -> Self {
        Self {
            memory,
            clock,
            sample_pages_per_gib,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Makes the page selection reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }
}

impl VcpuRateSource for SampledVcpuRate {
    fn measure(&self, vcpus: &[VcpuId], period: Duration) -> Vec<(VcpuId, u64)> {
        let start_ns = self.clock.now_ns();

        let rounds = {
            let mut rng = self.rng.lock();

            vcpus
                .iter()
                .map(|&vcpu| {
                    let round = SamplingRound::baseline(
                        self.memory.vcpu_blocks(vcpu),
                        self.sample_pages_per_gib,
                        0,
                        &mut *rng,
                        &*self.clock,
                    );

                    (vcpu, round)
                })
                .collect::<Vec<_>>()
        };

        let elapsed = wait_window(&*self.clock, start_ns, period);

        rounds
            .into_iter()
            .map(|(vcpu, round)| (vcpu, round.compare(elapsed).dirty_rate))
            .collect()
    }
}
