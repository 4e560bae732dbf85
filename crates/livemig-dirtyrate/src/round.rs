use std::{sync::Arc, time::Duration};

use livemig_core::{
    Clock, GIB, MigrationError, RamAddr, RamBlock, RamBlockGeometry, RamBlockProvider,
};
use rand::Rng;

use crate::{DirtyRateStat, SamplingError};

/// One sampled page of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampledPage {
    /// Index of the page inside its block.
    pub virtual_frame_number: u64,

    /// CRC32 of the page content at the start of the window.
    pub baseline_hash: u32,
}

/// Hashes the page `virtual_frame_number` of `block`.
///
/// `buf` must be one page long and receives a copy of the page.
pub fn page_hash(
    block: &RamBlock,
    virtual_frame_number: u64,
    buf: &mut [u8],
) -> Result<u32, MigrationError> {
    let offset = RamAddr(virtual_frame_number << block.page_shift());
    block.read_page(offset, buf)?;
    Ok(crc32fast::hash(buf))
}

struct BlockSamples {
    block: Arc<RamBlock>,
    geometry: RamBlockGeometry,
    pages: Vec<SampledPage>,
}

/// The state of one measurement between baseline and comparison.
pub struct SamplingRound {
    blocks: Vec<BlockSamples>,
    start_ns: u64,
}

impl SamplingRound {
    /// Starts a round: records the start time and hashes the baseline.
    ///
    /// Each block of at least `min_block_size` bytes gets
    /// `used_length * sample_pages_per_gib / 1 GiB` pages drawn uniformly,
    /// with replacement.
    pub fn baseline<R>(
        blocks: impl IntoIterator<Item = Arc<RamBlock>>,
        sample_pages_per_gib: u64,
        min_block_size: u64,
        rng: &mut R,
        clock: &dyn Clock,
    ) -> Self
    where
        R: Rng,
    {
        let start_ns = clock.now_ns();
        let mut sampled = Vec::new();

        for block in blocks {
            let geometry = block.geometry();

            if geometry.used_length < min_block_size {
                tracing::trace!(id = block.id(), len = geometry.used_length, "block too small to sample");
                continue;
            }

            let count = (geometry.used_length as u128 * sample_pages_per_gib as u128
                / GIB as u128) as u64;

            if geometry.page_count == 0 || count == 0 {
                tracing::trace!(id = block.id(), "no pages to sample");
                continue;
            }

            let mut buf = vec![0u8; block.page_size() as usize];
            let pages = (0..count)
                .map(|_| {
                    let virtual_frame_number = rng.gen_range(0..geometry.page_count);
                    let baseline_hash = page_hash(&block, virtual_frame_number, &mut buf)?;

                    Ok(SampledPage {
                        virtual_frame_number,
                        baseline_hash,
                    })
                })
                .collect::<Result<Vec<_>, MigrationError>>();

            match pages {
                Ok(pages) => sampled.push(BlockSamples {
                    block,
                    geometry,
                    pages,
                }),
                Err(source) => {
                    let err = SamplingError::Read {
                        block: block.id().to_owned(),
                        source,
                    };
                    tracing::debug!(%err, "block dropped from round");
                }
            }
        }

        Self {
            blocks: sampled,
            start_ns,
        }
    }

    /// Returns the start of the window, in nanoseconds.
    pub fn start_ns(&self) -> u64 {
        self.start_ns
    }

    /// Returns the number of sampled blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns every sampled page with the id of its block.
    pub fn sampled_pages(&self) -> impl Iterator<Item = (&str, &SampledPage)> {
        self.blocks
            .iter()
            .flat_map(|samples| samples.pages.iter().map(|page| (samples.block.id(), page)))
    }

    /// Drops the blocks that `provider` no longer holds.
    pub fn retain_live(&mut self, provider: &dyn RamBlockProvider) {
        self.blocks.retain(|samples| {
            let live = provider
                .block_by_id(samples.block.id())
                .is_some_and(|block| Arc::ptr_eq(&block, &samples.block));

            if !live {
                let err = SamplingError::BlockRemoved(samples.block.id().to_owned());
                tracing::debug!(%err, "block dropped from round");
            }

            live
        });
    }

    /// Re-hashes the sampled pages and computes the rate over `elapsed`.
    ///
    /// Blocks whose geometry changed since the baseline are excluded.
    pub fn compare(self, elapsed: Duration) -> DirtyRateStat {
        let mut stat = DirtyRateStat {
            start_time: self.start_ns / 1_000_000,
            calc_time: elapsed,
            ..Default::default()
        };

        for samples in self.blocks {
            match compare_block(&samples) {
                Ok(dirty) => {
                    stat.total_sample_count += samples.pages.len() as u64;
                    stat.total_dirty_samples += dirty;
                    stat.total_block_mem_mb += samples.geometry.used_length >> 20;
                }
                Err(err) => tracing::debug!(%err, "block dropped from round"),
            }
        }

        stat.dirty_rate = dirty_rate(
            stat.total_dirty_samples,
            stat.total_sample_count,
            stat.total_block_mem_mb,
            elapsed,
        );

        stat
    }
}

fn compare_block(samples: &BlockSamples) -> Result<u64, SamplingError> {
    let block = &samples.block;

    if block.geometry() != samples.geometry {
        return Err(SamplingError::GeometryChanged(block.id().to_owned()));
    }

    let mut buf = vec![0u8; block.page_size() as usize];
    let mut dirty = 0;

    for page in &samples.pages {
        let hash = page_hash(block, page.virtual_frame_number, &mut buf).map_err(|source| {
            SamplingError::Read {
                block: block.id().to_owned(),
                source,
            }
        })?;

        if hash != page.baseline_hash {
            dirty += 1;
        }
    }

    Ok(dirty)
}

/// `dirty * mem_mb / (samples * seconds)`, in MB/s.
fn dirty_rate(dirty: u64, samples: u64, mem_mb: u64, elapsed: Duration) -> u64 {
    let elapsed_ns = elapsed.as_nanos();

    if samples == 0 || elapsed_ns == 0 {
        return 0;
    }

    (dirty as u128 * mem_mb as u128 * 1_000_000_000 / (samples as u128 * elapsed_ns)) as u64
}
