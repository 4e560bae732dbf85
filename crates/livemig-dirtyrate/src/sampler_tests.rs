use std::{collections::HashSet, sync::Arc, time::Duration};

use livemig_core::{
    Clock, Gpa, ManualClock, MigrationError, RamAddr, RamBlock, RamBlockList, RamBlockProvider,
    SystemClock,
};
use parking_lot::Mutex;
use rand::{SeedableRng as _, rngs::StdRng};

use super::*;
use crate::page_hash;

const PAGE_SIZE: u64 = 4096;
const MIB: u64 = 1 << 20;

/// A manual clock that runs a guest action the first time someone sleeps,
/// i.e. in the middle of the measurement window.
#[derive(Default)]
struct GuestClock {
    clock: ManualClock,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl GuestClock {
    fn with_action(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            clock: ManualClock::new(),
            action: Mutex::new(Some(Box::new(action))),
        }
    }
}

impl Clock for GuestClock {
    fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    fn sleep(&self, duration: Duration) {
        if let Some(action) = self.action.lock().take() {
            action();
        }

        self.clock.sleep(duration);
    }
}

fn dirty_all(block: &RamBlock) -> Result<(), MigrationError> {
    for vfn in 0..block.page_count() {
        block.write_page(RamAddr(vfn * PAGE_SIZE), &[0x5a; PAGE_SIZE as usize])?;
    }
    Ok(())
}

fn config() -> SamplerConfig {
    SamplerConfig::default()
        .with_sample_pages_per_gib(4096)
        .with_seed(7)
}

////////////////////////////////////////////////////////////////////////////////
// Hashing
////////////////////////////////////////////////////////////////////////////////

#[test]
fn unmodified_page_hash_is_stable() -> Result<(), MigrationError> {
    let block = RamBlock::new("ram", Gpa(0), PAGE_SIZE, 4 * PAGE_SIZE)?;
    block.write_page(RamAddr(PAGE_SIZE), &[0x11; PAGE_SIZE as usize])?;

    let mut buf = vec![0u8; PAGE_SIZE as usize];
    let first = page_hash(&block, 1, &mut buf)?;
    let second = page_hash(&block, 1, &mut buf)?;
    assert_eq!(first, second);

    block.write_page(RamAddr(PAGE_SIZE), &[0x12; PAGE_SIZE as usize])?;
    assert_ne!(first, page_hash(&block, 1, &mut buf)?);
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Sampling round
////////////////////////////////////////////////////////////////////////////////

#[test]
fn rate_is_proportional_to_dirty_fraction() -> Result<(), MigrationError> {
    let block = Arc::new(RamBlock::new("ram", Gpa(0), PAGE_SIZE, 64 * MIB)?);
    let clock = ManualClock::new();
    let mut rng = StdRng::seed_from_u64(1);

    let round = SamplingRound::baseline([block.clone()], 4096, 0, &mut rng, &clock);
    let samples = round.sampled_pages().count() as u64;
    assert_eq!(samples, 256);

    // Dirty the first eight distinct sampled pages.
    let mutated = round
        .sampled_pages()
        .map(|(_, page)| page.virtual_frame_number)
        .collect::<HashSet<_>>()
        .into_iter()
        .take(8)
        .collect::<HashSet<_>>();

    for &vfn in &mutated {
        block.write_page(RamAddr(vfn * PAGE_SIZE), &[0xff; PAGE_SIZE as usize])?;
    }

    let expected_dirty = round
        .sampled_pages()
        .filter(|(_, page)| mutated.contains(&page.virtual_frame_number))
        .count() as u64;

    let stat = round.compare(Duration::from_millis(500));
    assert_eq!(stat.total_sample_count, samples);
    assert_eq!(stat.total_dirty_samples, expected_dirty);
    assert_eq!(stat.total_block_mem_mb, 64);
    assert_eq!(stat.dirty_rate, expected_dirty * 64 * 1000 / (samples * 500));
    assert_eq!(stat.calc_time, Duration::from_millis(500));
    Ok(())
}

#[test]
fn small_and_empty_blocks_contribute_nothing() -> Result<(), MigrationError> {
    let small = Arc::new(RamBlock::new("small", Gpa(0), PAGE_SIZE, 16 * PAGE_SIZE)?);
    let empty = Arc::new(RamBlock::resizable("empty", Gpa(0x10_0000), PAGE_SIZE, 0, 256 * PAGE_SIZE)?);
    let clock = ManualClock::new();
    let mut rng = StdRng::seed_from_u64(1);

    let round = SamplingRound::baseline(
        [small, empty],
        4096,
        SamplerConfig::DEFAULT_MIN_BLOCK_SIZE,
        &mut rng,
        &clock,
    );
    assert_eq!(round.block_count(), 0);

    let stat = round.compare(Duration::from_secs(1));
    assert_eq!(stat.total_sample_count, 0);
    assert_eq!(stat.dirty_rate, 0);
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Sampler
////////////////////////////////////////////////////////////////////////////////

#[test]
fn idle_guest_has_zero_rate() -> Result<(), MigrationError> {
    let list = Arc::new(RamBlockList::new());
    list.add(RamBlock::new("ram", Gpa(0), PAGE_SIZE, 32 * MIB)?)?;

    let sampler = Sampler::new(list, Arc::new(ManualClock::new()));
    assert_eq!(sampler.state(), CalcState::Unstarted);

    let stat = sampler.measure(&config())?;
    assert_eq!(stat.total_sample_count, 128);
    assert_eq!(stat.total_dirty_samples, 0);
    assert_eq!(stat.dirty_rate, 0);
    assert_eq!(stat.calc_time, Duration::from_secs(1));

    let info = sampler.query();
    assert_eq!(info.status, CalcState::Measured);
    assert_eq!(info.stat, Some(stat));
    Ok(())
}

#[test]
fn fully_dirty_guest() -> Result<(), MigrationError> {
    let list = Arc::new(RamBlockList::new());
    let block = list.add(RamBlock::new("ram", Gpa(0), PAGE_SIZE, 32 * MIB)?)?;

    let clock = GuestClock::with_action(move || dirty_all(&block).expect("dirty guest"));
    let sampler = Sampler::new(list, Arc::new(clock));

    let stat = sampler.measure(&config().with_calc_time(Duration::from_millis(500)))?;
    assert_eq!(stat.total_dirty_samples, stat.total_sample_count);
    assert_eq!(stat.dirty_rate, 64);
    Ok(())
}

#[test]
fn resized_block_is_excluded() -> Result<(), MigrationError> {
    let list = Arc::new(RamBlockList::new());
    let stable = list.add(RamBlock::new("stable", Gpa(0), PAGE_SIZE, 16 * MIB)?)?;
    let resized = list.add(RamBlock::resizable(
        "resized",
        Gpa(0x1000_0000),
        PAGE_SIZE,
        16 * MIB,
        32 * MIB,
    )?)?;

    let clock = GuestClock::with_action(move || {
        dirty_all(&resized).expect("dirty guest");
        resized.resize(32 * MIB).expect("resize");
    });
    let sampler = Sampler::new(list, Arc::new(clock));

    let stat = sampler.measure(&config())?;
    assert_eq!(stable.page_count(), 16 * MIB / PAGE_SIZE);
    assert_eq!(stat.total_sample_count, 64);
    assert_eq!(stat.total_block_mem_mb, 16);
    assert_eq!(stat.total_dirty_samples, 0);
    Ok(())
}

#[test]
fn removed_block_is_excluded() -> Result<(), MigrationError> {
    let list = Arc::new(RamBlockList::new());
    list.add(RamBlock::new("stable", Gpa(0), PAGE_SIZE, 16 * MIB)?)?;
    list.add(RamBlock::new("hotplug", Gpa(0x1000_0000), PAGE_SIZE, 16 * MIB)?)?;

    let clock = {
        let list = list.clone();
        GuestClock::with_action(move || {
            list.remove("hotplug");
        })
    };
    let sampler = Sampler::new(list.clone(), Arc::new(clock));

    let stat = sampler.measure(&config())?;
    assert_eq!(stat.total_block_mem_mb, 16);
    assert!(list.block_by_id("hotplug").is_none());
    Ok(())
}

#[test]
fn concurrent_request_is_rejected() -> Result<(), MigrationError> {
    let list = Arc::new(RamBlockList::new());
    list.add(RamBlock::new("ram", Gpa(0), PAGE_SIZE, 16 * MIB)?)?;

    let sampler = Sampler::new(list, Arc::new(SystemClock::new()));
    sampler.start(config().with_calc_time(Duration::from_secs(5)))?;
    assert_eq!(sampler.state(), CalcState::Measuring);

    assert!(matches!(sampler.measure(&config()), Err(MigrationError::Busy)));
    assert!(matches!(
        sampler.start(config()),
        Err(MigrationError::Busy)
    ));

    sampler.cancel();
    assert_eq!(sampler.state(), CalcState::Unstarted);
    assert_eq!(sampler.query().stat, None);

    // The sampler is usable again after a cancelled round.
    sampler.start(config().with_calc_time(Duration::from_millis(50)))?;
    sampler.join();
    assert_eq!(sampler.state(), CalcState::Measured);
    Ok(())
}

#[test]
fn rejects_out_of_range_parameters() {
    let list: Arc<dyn RamBlockProvider> = Arc::new(RamBlockList::new());
    let sampler = Sampler::new(list, Arc::new(ManualClock::new()));

    for config in [
        SamplerConfig::default().with_sample_pages_per_gib(64),
        SamplerConfig::default().with_sample_pages_per_gib(8192),
        SamplerConfig::default().with_calc_time(Duration::from_secs(61)),
        SamplerConfig::default().with_calc_time(Duration::ZERO),
    ] {
        assert!(matches!(
            sampler.measure(&config),
            Err(MigrationError::InvalidParameter { .. })
        ));
    }

    assert_eq!(sampler.state(), CalcState::Unstarted);
}
