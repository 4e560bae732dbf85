use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use livemig_core::{Clock, MigrationError, VcpuId};
use parking_lot::Mutex;

use crate::{
    DirtyLimitConfig, DirtyLimitInfo, ThrottleController, VcpuDirtyLimitState, VcpuRateSource,
};

/// Per-vCPU dirty limit service.
///
/// The state table exists only while at least one vCPU is limited. Enabling
/// the first vCPU allocates it and starts two threads: one measures the rate
/// of every limited vCPU, the other adjusts their throttles once per period.
/// Disabling the last vCPU frees the table and joins both threads.
#[derive(Clone)]
pub struct DirtyLimit {
    inner: Arc<DirtyLimitInner>,
}

struct DirtyLimitInner {
    config: DirtyLimitConfig,
    source: Arc<dyn VcpuRateSource>,
    clock: Arc<dyn Clock>,
    table: Mutex<Option<DirtyLimitTable>>,
    rates: Box<[AtomicU64]>,
    epoch: AtomicU64,
}

struct DirtyLimitTable {
    epoch: u64,
    states: Vec<VcpuDirtyLimitState>,
    controller: ThrottleController,
    threads: Vec<JoinHandle<()>>,
}

impl DirtyLimitTable {
    fn enabled_vcpus(&self) -> Vec<VcpuId> {
        self.states
            .iter()
            .filter(|state| state.enabled)
            .map(|state| state.cpu_index)
            .collect()
    }
}

impl DirtyLimit {
    /// Creates the service. No thread runs until a vCPU is limited.
    pub fn new(
        config: DirtyLimitConfig,
        source: Arc<dyn VcpuRateSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MigrationError> {
        config.validate()?;

        let rates = (0..config.max_vcpus).map(|_| AtomicU64::new(0)).collect();

        Ok(Self {
            inner: Arc::new(DirtyLimitInner {
                config,
                source,
                clock,
                table: Mutex::new(None),
                rates,
                epoch: AtomicU64::new(0),
            }),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DirtyLimitConfig {
        &self.inner.config
    }

    /// Sets the quota of one vCPU, or disables its limit.
    ///
    /// The quota of an already limited vCPU can be changed in place.
    pub fn set_quota(
        &self,
        vcpu: VcpuId,
        quota_mbps: u64,
        enabled: bool,
    ) -> Result<(), MigrationError> {
        self.check_vcpu(vcpu)?;
        self.check_quota(quota_mbps, enabled)?;
        self.update(|states| apply(&mut states[vcpu.index()], quota_mbps, enabled))
    }

    /// Sets the quota of every vCPU, or disables all limits.
    pub fn set_all_quotas(&self, quota_mbps: u64, enabled: bool) -> Result<(), MigrationError> {
        self.check_quota(quota_mbps, enabled)?;
        self.update(|states| {
            for state in states {
                apply(state, quota_mbps, enabled);
            }
        })
    }

    /// Disables the limit of one vCPU.
    pub fn cancel(&self, vcpu: VcpuId) -> Result<(), MigrationError> {
        self.set_quota(vcpu, 0, false)
    }

    /// Disables every limit and stops the service threads.
    pub fn cancel_all(&self) -> Result<(), MigrationError> {
        self.set_all_quotas(0, false)
    }

    /// Returns `true` while at least one vCPU is limited.
    pub fn is_in_service(&self) -> bool {
        self.inner.table.lock().is_some()
    }

    /// Returns the state of one vCPU.
    ///
    /// Returns `None` when no vCPU is limited.
    pub fn vcpu_state(&self, vcpu: VcpuId) -> Option<VcpuDirtyLimitState> {
        let table = self.inner.table.lock();
        table.as_ref()?.states.get(vcpu.index()).cloned()
    }

    /// Returns the status of every limited vCPU.
    pub fn query(&self) -> Vec<DirtyLimitInfo> {
        let table = self.inner.table.lock();
        let Some(table) = table.as_ref() else {
            return Vec::new();
        };

        table
            .states
            .iter()
            .filter(|state| state.enabled)
            .map(|state| DirtyLimitInfo {
                cpu_index: state.cpu_index,
                limit_rate: state.quota_mbps,
                current_rate: self.inner.rate(state.cpu_index),
            })
            .collect()
    }

    /// Called by a vCPU whose dirty ring is full.
    ///
    /// Sleeps for the vCPU's throttle and returns the time slept.
    pub fn vcpu_ring_full(&self, vcpu: VcpuId) -> Duration {
        let throttle = {
            let table = self.inner.table.lock();
            table
                .as_ref()
                .and_then(|table| table.states.get(vcpu.index()))
                .filter(|state| state.enabled)
                .map_or(0, |state| state.throttle_us_per_full)
        };

        let delay = Duration::from_micros(throttle);
        if !delay.is_zero() {
            self.inner.clock.sleep(delay);
        }

        delay
    }

    fn check_vcpu(&self, vcpu: VcpuId) -> Result<(), MigrationError> {
        if vcpu.0 >= self.inner.config.max_vcpus {
            return Err(MigrationError::invalid_parameter(
                "cpu_index",
                format!("vCPU {vcpu} does not exist"),
            ));
        }

        Ok(())
    }

    fn check_quota(&self, quota_mbps: u64, enabled: bool) -> Result<(), MigrationError> {
        if enabled && quota_mbps < 1 {
            return Err(MigrationError::invalid_parameter(
                "dirty_rate",
                "quota must be at least 1 MB/s",
            ));
        }

        Ok(())
    }

    fn update<F>(&self, f: F) -> Result<(), MigrationError>
    where
        F: FnOnce(&mut [VcpuDirtyLimitState]),
    {
        let inner = &self.inner;
        let mut guard = inner.table.lock();

        if guard.is_none() {
            let mut table = inner.new_table();
            f(&mut table.states);

            if table.states.iter().any(|state| state.enabled) {
                table.threads = inner.spawn_threads(table.epoch)?;
                tracing::debug!(epoch = table.epoch, "dirty limit service started");
                *guard = Some(table);
            }

            return Ok(());
        }

        let Some(table) = guard.as_mut() else {
            return Ok(());
        };

        f(&mut table.states);

        if table.states.iter().any(|state| state.enabled) {
            return Ok(());
        }

        let table = guard.take();
        drop(guard);

        if let Some(table) = table {
            for thread in table.threads {
                let _ = thread.join();
            }

            tracing::debug!(epoch = table.epoch, "dirty limit service stopped");
        }

        Ok(())
    }
}

fn apply(state: &mut VcpuDirtyLimitState, quota_mbps: u64, enabled: bool) {
    if enabled {
        if !state.enabled {
            tracing::debug!(vcpu = %state.cpu_index, quota_mbps, "dirty limit enabled");
        }

        state.enabled = true;
        state.quota_mbps = quota_mbps;
        return;
    }

    if state.enabled {
        tracing::debug!(vcpu = %state.cpu_index, "dirty limit disabled");
    }

    *state = VcpuDirtyLimitState::new(state.cpu_index);
}

impl DirtyLimitInner {
    fn new_table(&self) -> DirtyLimitTable {
        for rate in self.rates.iter() {
            rate.store(0, Ordering::Relaxed);
        }

        DirtyLimitTable {
            epoch: self.epoch.fetch_add(1, Ordering::Relaxed) + 1,
            states: (0..self.config.max_vcpus)
                .map(|index| VcpuDirtyLimitState::new(VcpuId(index)))
                .collect(),
            controller: ThrottleController::new(&self.config),
            threads: Vec::new(),
        }
    }

    fn rate(&self, vcpu: VcpuId) -> u64 {
        self.rates
            .get(vcpu.index())
            .map_or(0, |rate| rate.load(Ordering::Relaxed))
    }

    fn spawn_threads(self: &Arc<Self>, epoch: u64) -> Result<Vec<JoinHandle<()>>, MigrationError> {
        let adjust = {
            let inner = self.clone();
            std::thread::Builder::new()
                .name(String::from("dirtylimit"))
                .spawn(move || inner.adjust_loop(epoch))?
        };

        let measure = {
            let inner = self.clone();
            std::thread::Builder::new()
                .name(String::from("dirtyrate-stat"))
                .spawn(move || inner.measure_loop(epoch))?
        };

        Ok(vec![adjust, measure])
    }

    /// Runs `f` on the table if it still belongs to `epoch`.
    fn with_table<T>(&self, epoch: u64, f: impl FnOnce(&mut DirtyLimitTable) -> T) -> Option<T> {
        let mut table = self.table.lock();
        table
            .as_mut()
            .filter(|table| table.epoch == epoch)
            .map(f)
    }

    fn adjust_loop(&self, epoch: u64) {
        tracing::debug!(epoch, "dirty limit thread started");

        loop {
            self.clock.sleep(self.config.period);

            let running = self.with_table(epoch, |table| {
                for state in table.states.iter_mut().filter(|state| state.enabled) {
                    let current = self.rate(state.cpu_index);

                    if table.controller.adjust(state, current) {
                        tracing::trace!(
                            vcpu = %state.cpu_index,
                            current,
                            quota = state.quota_mbps,
                            throttle_us = state.throttle_us_per_full,
                            "throttle adjusted"
                        );
                    }
                }
            });

            if running.is_none() {
                break;
            }
        }

        tracing::debug!(epoch, "dirty limit thread stopped");
    }

    fn measure_loop(&self, epoch: u64) {
        while let Some(vcpus) = self.with_table(epoch, |table| table.enabled_vcpus()) {
            for (vcpu, rate) in self.source.measure(&vcpus, self.config.period) {
                if let Some(slot) = self.rates.get(vcpu.index()) {
                    slot.store(rate, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "limit_tests.rs"]
mod tests;
