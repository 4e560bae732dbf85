use std::{ops::Range, sync::Arc, time::Duration};

#[cfg(feature = "cgs")]
use livemig_cgs::ConfidentialRamBridge;
use livemig_core::{
    Clock, MigrationError, PageEncryption, RamAddr, RamBlock, RamBlockProvider, SystemClock,
    Transport, VcpuId,
};
use livemig_dirtylimit::{DirtyLimit, DirtyLimitInfo, VcpuRateSource};
use livemig_dirtyrate::{DirtyRateInfo, DirtyRateStat, Sampler};
use livemig_multifd::{Accelerators, ChannelOptions, ChannelStats, MultifdRecv, MultifdSend};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::MigrationConfig;

/// The state of a migration attempt.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// No transfer was started yet.
    #[default]
    Setup,

    /// Pages are being transferred.
    Active,

    /// Every page arrived.
    Completed,

    /// The attempt was aborted.
    Failed {
        /// The first fatal error.
        reason: String,
    },
}

impl MigrationStatus {
    /// Returns `true` once the attempt completed or failed.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

/// The status shared by the engine and its transfers.
#[derive(Debug, Default)]
struct StatusCell {
    status: Mutex<MigrationStatus>,
}

impl StatusCell {
    fn get(&self) -> MigrationStatus {
        self.status.lock().clone()
    }

    fn begin(&self) -> Result<(), MigrationError> {
        let mut status = self.status.lock();
        if *status == MigrationStatus::Active {
            return Err(MigrationError::Other("a migration is already in progress"));
        }

        *status = MigrationStatus::Active;
        Ok(())
    }

    fn complete(&self) {
        let mut status = self.status.lock();
        if *status == MigrationStatus::Active {
            *status = MigrationStatus::Completed;
            tracing::debug!("migration completed");
        }
    }

    /// Records the first fatal error; later ones are dropped.
    fn fail(&self, reason: String) {
        let mut status = self.status.lock();
        if status.is_finished() {
            return;
        }

        tracing::error!(%reason, "migration failed");
        *status = MigrationStatus::Failed { reason };
    }

    /// Moves the status to `Failed` if `result` holds a fatal error.
    fn check<T>(&self, result: Result<T, MigrationError>) -> Result<T, MigrationError> {
        if let Err(err) = &result
            && err.is_fatal()
        {
            self.fail(err.to_string());
        }

        result
    }

    /// Like [`check`], but any error fails the attempt.
    ///
    /// [`check`]: Self::check
    fn check_any<T>(&self, result: Result<T, MigrationError>) -> Result<T, MigrationError> {
        if let Err(err) = &result {
            self.fail(err.to_string());
        }

        result
    }
}

/// The live-migration context of one VM.
///
/// The engine owns every long-lived piece of the data plane: the dirty rate
/// sampler, the per-vCPU dirty limit, the optional confidential RAM bridge
/// and the status of the current migration attempt. Nothing is global; two
/// engines never share state.
///
/// # Examples
///
/// ```no_run
/// # use std::{sync::Arc, time::Duration};
/// # use livemig::{MigrationConfig, MigrationEngine, MigrationError, RamBlockList, VcpuId};
/// # fn main() -> Result<(), MigrationError> {
/// let blocks = Arc::new(RamBlockList::new());
/// let rates = Arc::new(|vcpus: &[VcpuId], _: Duration| -> Vec<(VcpuId, u64)> {
///     vcpus.iter().map(|vcpu| (*vcpu, 0)).collect()
/// });
///
/// let engine = MigrationEngine::new(MigrationConfig::default(), blocks, rates)?;
/// engine.set_vcpu_dirty_limit(None, 100)?;
/// # Ok(())
/// # }
/// ```
pub struct MigrationEngine {
    config: MigrationConfig,
    provider: Arc<dyn RamBlockProvider>,
    sampler: Sampler,
    dirty_limit: DirtyLimit,
    accelerators: Accelerators,
    encryption: Option<Arc<dyn PageEncryption>>,
    #[cfg(feature = "cgs")]
    bridge: Option<Arc<ConfidentialRamBridge>>,
    status: Arc<StatusCell>,
}

impl MigrationEngine {
    /// Creates an engine over the RAM blocks of `provider`, using the host
    /// clock.
    ///
    /// `rates` measures the dirty rate of individual vCPUs for the dirty
    /// limit.
    pub fn new(
        config: MigrationConfig,
        provider: Arc<dyn RamBlockProvider>,
        rates: Arc<dyn VcpuRateSource>,
    ) -> Result<Self, MigrationError> {
        Self::with_clock(config, provider, rates, Arc::new(SystemClock::new()))
    }

    /// Creates an engine that measures time with `clock`.
    pub fn with_clock(
        config: MigrationConfig,
        provider: Arc<dyn RamBlockProvider>,
        rates: Arc<dyn VcpuRateSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MigrationError> {
        config.validate()?;

        let sampler = Sampler::new(provider.clone(), clock.clone());
        let dirty_limit = DirtyLimit::new(config.dirty_limit.clone(), rates, clock)?;

        Ok(Self {
            config,
            provider,
            sampler,
            dirty_limit,
            accelerators: Accelerators::new(),
            encryption: None,
            #[cfg(feature = "cgs")]
            bridge: None,
            status: Arc::default(),
        })
    }

    /// Uses `accelerators` for the batch and job-queue backends.
    pub fn with_accelerators(mut self, accelerators: Accelerators) -> Self {
        self.accelerators = accelerators;
        self
    }

    /// Routes every page through `encryption` instead of host memory.
    pub fn with_encryption(mut self, encryption: Arc<dyn PageEncryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Treats the guest as confidential, talking to its helper through the
    /// mailbox at `offset` in `block`.
    #[cfg(feature = "cgs")]
    pub fn with_confidential_mailbox(
        mut self,
        block: Arc<RamBlock>,
        offset: RamAddr,
    ) -> Result<Self, MigrationError> {
        let bridge = Arc::new(
            ConfidentialRamBridge::new(block, offset)?
                .with_timeout(self.config.confidential_timeout),
        );

        tracing::debug!(mailbox = %bridge.mailbox_gpa(), "confidential guest");

        self.encryption = Some(bridge.clone());
        self.bridge = Some(bridge);
        Ok(self)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Returns the status of the current migration attempt.
    pub fn status(&self) -> MigrationStatus {
        self.status.get()
    }

    /// Returns the dirty limit service, for the vCPU execution loop.
    pub fn dirty_limit(&self) -> &DirtyLimit {
        &self.dirty_limit
    }

    /// Returns the confidential RAM bridge, if the guest is confidential.
    #[cfg(feature = "cgs")]
    pub fn bridge(&self) -> Option<&Arc<ConfidentialRamBridge>> {
        self.bridge.as_ref()
    }

    ////////////////////////////////////////////////////////////////////////
    // Dirty rate
    ////////////////////////////////////////////////////////////////////////

    /// Starts a background dirty rate measurement.
    ///
    /// `calc_time` overrides the configured window.
    pub fn calc_dirty_rate(&self, calc_time: Option<Duration>) -> Result<(), MigrationError> {
        let mut config = self.config.dirty_rate.clone();
        if let Some(calc_time) = calc_time {
            config = config.with_calc_time(calc_time);
        }

        self.sampler.start(config)
    }

    /// Runs a dirty rate measurement on the calling thread.
    pub fn measure_dirty_rate(&self) -> Result<DirtyRateStat, MigrationError> {
        self.sampler.measure(&self.config.dirty_rate)
    }

    /// Returns the state of the measurement and its last result.
    pub fn query_dirty_rate(&self) -> DirtyRateInfo {
        self.sampler.query()
    }

    ////////////////////////////////////////////////////////////////////////
    // Dirty limit
    ////////////////////////////////////////////////////////////////////////

    /// Limits the dirty rate of `vcpu`, or of every vCPU when `None`, to
    /// `quota_mbps`.
    pub fn set_vcpu_dirty_limit(
        &self,
        vcpu: Option<VcpuId>,
        quota_mbps: u64,
    ) -> Result<(), MigrationError> {
        match vcpu {
            Some(vcpu) => self.dirty_limit.set_quota(vcpu, quota_mbps, true),
            None => self.dirty_limit.set_all_quotas(quota_mbps, true),
        }
    }

    /// Removes the limit of `vcpu`, or of every vCPU when `None`.
    pub fn cancel_vcpu_dirty_limit(&self, vcpu: Option<VcpuId>) -> Result<(), MigrationError> {
        match vcpu {
            Some(vcpu) => self.dirty_limit.cancel(vcpu),
            None => self.dirty_limit.cancel_all(),
        }
    }

    /// Returns the quota and the current rate of every limited vCPU.
    pub fn query_vcpu_dirty_limit(&self) -> Vec<DirtyLimitInfo> {
        self.dirty_limit.query()
    }

    ////////////////////////////////////////////////////////////////////////
    // Transfer
    ////////////////////////////////////////////////////////////////////////

    /// Starts sending RAM over `transports`, one per channel.
    pub fn start_outgoing(
        &self,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<OutgoingMigration, MigrationError> {
        self.status.begin()?;

        let send = MultifdSend::new(
            self.config.multifd.clone(),
            self.config.page_size,
            transports,
            self.channel_options(),
        );

        tracing::debug!(
            channels = self.config.multifd.channels,
            compression = self.config.multifd.compression.name(),
            "outgoing migration"
        );

        Ok(OutgoingMigration {
            send: Some(self.status.check_any(send)?),
            status: self.status.clone(),
            page_size: self.config.page_size,
        })
    }

    /// Prepares to receive RAM into the blocks of the engine's provider.
    ///
    /// Channels are added with [`IncomingMigration::accept`].
    pub fn start_incoming(&self) -> Result<IncomingMigration, MigrationError> {
        self.status.begin()?;

        let recv = MultifdRecv::new(
            self.config.multifd.clone(),
            self.config.page_size,
            self.provider.clone(),
            self.channel_options(),
        );

        tracing::debug!(
            channels = self.config.multifd.channels,
            compression = self.config.multifd.compression.name(),
            "incoming migration"
        );

        Ok(IncomingMigration {
            recv: Some(self.status.check_any(recv)?),
            status: self.status.clone(),
        })
    }

    /// Stops the background threads and ends the helper session.
    ///
    /// Failures are logged; the engine is unusable for transfers
    /// afterwards only if the bridge was poisoned.
    pub fn shutdown(&self) {
        self.sampler.cancel();

        if let Err(err) = self.dirty_limit.cancel_all() {
            tracing::warn!(%err, "failed to stop the dirty limit");
        }

        #[cfg(feature = "cgs")]
        if let Some(bridge) = &self.bridge
            && let Err(err) = bridge.reset()
        {
            tracing::warn!(%err, "failed to reset the confidential helper");
        }

        tracing::debug!("migration engine shut down");
    }

    fn channel_options(&self) -> ChannelOptions {
        let options = ChannelOptions::new().with_accelerators(self.accelerators.clone());

        match &self.encryption {
            Some(encryption) => options.with_encryption(encryption.clone()),
            None => options,
        }
    }
}

impl Drop for MigrationEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The sending side of a migration attempt.
///
/// Dropping it without [`finish`] aborts the attempt.
///
/// [`finish`]: Self::finish
pub struct OutgoingMigration {
    send: Option<MultifdSend>,
    status: Arc<StatusCell>,
    page_size: u64,
}

impl OutgoingMigration {
    /// Queues every page of `range`, a byte range of `block`.
    pub fn send_range(
        &mut self,
        block: &Arc<RamBlock>,
        range: Range<u64>,
    ) -> Result<(), MigrationError> {
        if !range.start.is_multiple_of(self.page_size) || !range.end.is_multiple_of(self.page_size)
        {
            return Err(MigrationError::invalid_parameter(
                "range",
                format!("{:#x}..{:#x} is not page aligned", range.start, range.end),
            ));
        }

        let page_size = self.page_size;
        let result = self.sender().and_then(|send| {
            (range.start..range.end)
                .step_by(page_size as usize)
                .try_for_each(|offset| send.queue_page(block, RamAddr(offset)))
        });

        self.status.check(result)
    }

    /// Queues every page of `block`.
    pub fn send_block(&mut self, block: &Arc<RamBlock>) -> Result<(), MigrationError> {
        self.send_range(block, 0..block.used_length())
    }

    /// Waits until every queued page was sent.
    pub fn sync(&mut self) -> Result<(), MigrationError> {
        let result = self.sender().and_then(MultifdSend::sync_main);
        self.status.check(result)
    }

    /// Sends the remaining pages and closes the channels.
    pub fn finish(mut self) -> Result<Vec<ChannelStats>, MigrationError> {
        let send = self
            .send
            .take()
            .ok_or(MigrationError::Other("outgoing migration already finished"))?;

        let stats = self.status.check_any(send.finish())?;
        self.status.complete();
        Ok(stats)
    }

    /// Aborts the attempt, failing the peer's channels.
    pub fn cancel(mut self) {
        self.abort("migration cancelled");
    }

    fn sender(&mut self) -> Result<&mut MultifdSend, MigrationError> {
        self.send
            .as_mut()
            .ok_or(MigrationError::Other("outgoing migration already finished"))
    }

    fn abort(&mut self, reason: &str) {
        if let Some(mut send) = self.send.take() {
            send.shutdown();
            self.status.fail(send.error().unwrap_or_else(|| reason.to_owned()));
        }
    }
}

impl Drop for OutgoingMigration {
    fn drop(&mut self) {
        self.abort("outgoing migration abandoned");
    }
}

/// The receiving side of a migration attempt.
pub struct IncomingMigration {
    recv: Option<MultifdRecv>,
    status: Arc<StatusCell>,
}

impl IncomingMigration {
    /// Adds the channel connected over `transport`.
    pub fn accept(&self, transport: Arc<dyn Transport>) -> Result<u8, MigrationError> {
        let result = self.receiver().and_then(|recv| recv.accept(transport));
        self.status.check(result)
    }

    /// Returns `true` once every channel was accepted.
    pub fn all_channels_created(&self) -> bool {
        self.recv
            .as_ref()
            .is_some_and(MultifdRecv::all_channels_created)
    }

    /// Waits until the pages sent before the sender's last synchronization
    /// point are in guest memory.
    pub fn sync(&self) -> Result<u64, MigrationError> {
        let result = self.receiver().and_then(MultifdRecv::sync_main);
        self.status.check(result)
    }

    /// Waits for the sender to finish and close the channels.
    pub fn finish(mut self) -> Result<Vec<ChannelStats>, MigrationError> {
        let recv = self
            .recv
            .take()
            .ok_or(MigrationError::Other("incoming migration already finished"))?;

        let stats = self.status.check_any(recv.finish())?;
        self.status.complete();
        Ok(stats)
    }

    /// Aborts the attempt.
    pub fn cancel(mut self) {
        self.abort("migration cancelled");
    }

    fn receiver(&self) -> Result<&MultifdRecv, MigrationError> {
        self.recv
            .as_ref()
            .ok_or(MigrationError::Other("incoming migration already finished"))
    }

    fn abort(&mut self, reason: &str) {
        if let Some(recv) = self.recv.take() {
            recv.shutdown();
            self.status.fail(recv.error().unwrap_or_else(|| reason.to_owned()));
        }
    }
}

impl Drop for IncomingMigration {
    fn drop(&mut self) {
        self.abort("incoming migration abandoned");
    }
}
