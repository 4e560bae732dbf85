//! Live-migration RAM data plane.
//!
//! This crate ties together the pieces a hypervisor needs to move guest
//! RAM to another host:
//!
//! - [`dirtyrate`] estimates how fast the guest dirties its memory, by
//!   hashing random pages before and after a measurement window.
//! - [`dirtylimit`] keeps individual vCPUs under a dirty rate quota, by
//!   sleeping them whenever their dirty ring fills up.
//! - [`multifd`] transfers pages over several parallel channels, with
//!   optional compression and zero page detection.
//! - `cgs` (feature `cgs`) moves the pages of a confidential guest through
//!   an in-guest helper that encrypts and decrypts them.
//!
//! [`MigrationEngine`] owns one instance of each, per VM.
//!
//! # Examples
//!
//! ```no_run
//! # use std::{sync::Arc, time::Duration};
//! # use livemig::{Gpa, MigrationConfig, MigrationEngine, MigrationError, RamBlock, RamBlockList, VcpuId};
//! # fn main() -> Result<(), MigrationError> {
//! let source = Arc::new(RamBlockList::new());
//! source.add(RamBlock::new("pc.ram", Gpa(0), 4096, 64 << 20)?)?;
//!
//! let rates = Arc::new(|vcpus: &[VcpuId], _: Duration| -> Vec<(VcpuId, u64)> {
//!     vcpus.iter().map(|vcpu| (*vcpu, 0)).collect()
//! });
//! let engine = MigrationEngine::new(MigrationConfig::default(), source, rates)?;
//!
//! engine.calc_dirty_rate(Some(Duration::from_millis(100)))?;
//! std::thread::sleep(Duration::from_millis(200));
//!
//! if let Some(stat) = engine.query_dirty_rate().stat {
//!     println!("dirty rate: {} MB/s", stat.dirty_rate);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;

pub use livemig_core::{
    Clock, EncryptedPage, GIB, Gfn, Gpa, MIB, ManualClock, MigrationError, PageEncryption, Pipe,
    PollBudget, RamAddr, RamBlock, RamBlockList, RamBlockProvider, SystemClock, Transport, VcpuId,
    pipe, pipe_with_capacity,
};

pub use self::{
    config::MigrationConfig,
    engine::{IncomingMigration, MigrationEngine, MigrationStatus, OutgoingMigration},
};

/// Dirty rate measurement.
pub mod dirtyrate {
    pub use livemig_dirtyrate::{
        CalcState, DirtyRateInfo, DirtyRateStat, Sampler, SamplerConfig, SamplingError,
    };
}

/// Per-vCPU dirty limit.
pub mod dirtylimit {
    pub use livemig_dirtylimit::{
        DirtyLimit, DirtyLimitConfig, DirtyLimitInfo, SampledVcpuRate, ThrottleController,
        VcpuDirtyLimitState, VcpuMemory, VcpuRateSource,
    };
}

/// Multifd channels and compression backends.
pub mod multifd {
    pub use livemig_multifd::{
        Accelerators, BatchAccelerator, ChannelOptions, ChannelStats, Compression, JobQueueDevice,
        MultifdConfig, MultifdRecv, MultifdSend, ZeroPageDetection,
    };
}

/// Confidential guest support.
#[cfg(feature = "cgs")]
pub mod cgs {
    pub use livemig_cgs::{
        Command, ConfidentialRamBridge, GuestMailbox, MailboxCommand, RET_MALFORMED, RET_OK,
    };
}
