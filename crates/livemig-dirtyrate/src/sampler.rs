use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use livemig_core::{Clock, MigrationError, RamBlockProvider};
use parking_lot::Mutex;
use rand::{SeedableRng as _, rngs::StdRng};

use crate::{CalcState, DirtyRateInfo, DirtyRateStat, SamplerConfig, SamplingRound};

/// VM-wide dirty rate sampler.
///
/// At most one measurement runs at a time; a request made while another
/// one is in progress fails with [`MigrationError::Busy`] instead of
/// waiting. Cloning yields another handle to the same sampler.
#[derive(Clone)]
pub struct Sampler {
    inner: Arc<SamplerInner>,
}

struct SamplerInner {
    provider: Arc<dyn RamBlockProvider>,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    stop: AtomicBool,
    stat: Mutex<Option<DirtyRateStat>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Sampler {
    /// Longest uninterrupted sleep of the pacing wait.
    const PACING_SLICE: Duration = Duration::from_millis(100);

    /// Creates a sampler over the blocks of `provider`.
    pub fn new(provider: Arc<dyn RamBlockProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(SamplerInner {
                provider,
                clock,
                state: AtomicU8::new(CalcState::Unstarted as u8),
                stop: AtomicBool::new(false),
                stat: Mutex::new(None),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Runs one measurement on the calling thread.
    pub fn measure(&self, config: &SamplerConfig) -> Result<DirtyRateStat, MigrationError> {
        config.validate()?;
        self.inner.begin()?;
        self.inner.run(config)
    }

    /// Runs one measurement on a background thread.
    ///
    /// The result is available through [`query`] once the state becomes
    /// [`CalcState::Measured`].
    ///
    /// [`query`]: Self::query
    pub fn start(&self, config: SamplerConfig) -> Result<(), MigrationError> {
        config.validate()?;

        let mut thread = self.inner.thread.lock();
        self.inner.begin()?;

        if let Some(previous) = thread.take() {
            let _ = previous.join();
        }

        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("dirtyrate-calc"))
            .spawn(move || {
                if let Err(err) = inner.run(&config) {
                    tracing::debug!(%err, "dirty rate measurement ended");
                }
            });

        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.inner.finish(None);
                Err(err.into())
            }
        }
    }

    /// Waits for a background measurement to end.
    pub fn join(&self) {
        if let Some(handle) = self.inner.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Stops a background measurement.
    ///
    /// The stop request is noticed at the next pacing slice; the interrupted
    /// round publishes nothing.
    pub fn cancel(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.join();
        self.inner.stop.store(false, Ordering::Release);
    }

    /// Returns the current state.
    pub fn state(&self) -> CalcState {
        CalcState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Returns the current state and the last result.
    pub fn query(&self) -> DirtyRateInfo {
        DirtyRateInfo {
            status: self.state(),
            stat: self.inner.stat.lock().clone(),
        }
    }
}

impl SamplerInner {
    fn begin(&self) -> Result<(), MigrationError> {
        for from in [CalcState::Unstarted, CalcState::Measured] {
            if self
                .state
                .compare_exchange(
                    from as u8,
                    CalcState::Measuring as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }

        Err(MigrationError::Busy)
    }

    fn finish(&self, stat: Option<DirtyRateStat>) {
        let mut last = self.stat.lock();

        if let Some(stat) = stat {
            *last = Some(stat);
        }

        let next = match *last {
            Some(_) => CalcState::Measured,
            None => CalcState::Unstarted,
        };

        self.state.store(next as u8, Ordering::Release);
    }

    fn run(&self, config: &SamplerConfig) -> Result<DirtyRateStat, MigrationError> {
        let result = self.round(config);
        self.finish(result.as_ref().ok().cloned());
        result
    }

    fn round(&self, config: &SamplerConfig) -> Result<DirtyRateStat, MigrationError> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut round = SamplingRound::baseline(
            self.provider.migratable_blocks(),
            config.sample_pages_per_gib,
            config.min_block_size,
            &mut rng,
            &*self.clock,
        );

        tracing::debug!(
            blocks = round.block_count(),
            calc_time = ?config.calc_time,
            "dirty rate baseline recorded"
        );

        let elapsed = self.pace(round.start_ns(), config.calc_time)?;
        round.retain_live(&*self.provider);

        let stat = round.compare(elapsed);
        tracing::debug!(
            dirty_rate = stat.dirty_rate,
            dirty = stat.total_dirty_samples,
            samples = stat.total_sample_count,
            calc_time = ?stat.calc_time,
            "dirty rate measured"
        );

        Ok(stat)
    }

    /// Sleeps until `window` has elapsed since `start_ns`, in slices so
    /// that a stop request is noticed.
    fn pace(&self, start_ns: u64, window: Duration) -> Result<Duration, MigrationError> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Err(MigrationError::Cancelled);
            }

            let elapsed = Duration::from_nanos(self.clock.now_ns().saturating_sub(start_ns));
            if elapsed >= window {
                return Ok(elapsed);
            }

            self.clock
                .sleep((window - elapsed).min(Sampler::PACING_SLICE));
        }
    }
}

#[cfg(test)]
#[path = "sampler_tests.rs"]
mod tests;
