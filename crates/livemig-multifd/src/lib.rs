//! Multifd channels: parallel, optionally compressed RAM transfer.
//!
//! The sender ([`MultifdSend`]) gathers guest pages into batches and spreads
//! them over a fixed number of channels, each running on its own thread
//! over its own [`Transport`]. The receiver ([`MultifdRecv`]) validates
//! every packet and writes the pages into the matching [`RamBlock`].
//!
//! Both sides meet at synchronization points: [`MultifdSend::sync_main`]
//! puts a SYNC packet on every channel, and [`MultifdRecv::sync_main`]
//! returns once every channel has reached it. Pages sent before a
//! synchronization point are in guest memory when the receiver's
//! `sync_main` returns.
//!
//! Pages can be compressed by one of the [`Compression`] backends. Zero
//! pages are detected on the sender and carried as offsets only. For
//! confidential guests, a [`PageEncryption`] replaces host memory access on
//! both ends.
//!
//! [`Transport`]: livemig_core::Transport
//! [`RamBlock`]: livemig_core::RamBlock

mod backend;
mod config;
mod packet;
mod pages;
mod recv;
mod send;
mod stats;

use std::sync::Arc;

use livemig_core::PageEncryption;

pub use self::{
    backend::{
        Accelerators, BackendError, BackendParams, BatchAccelerator, JobOp, JobQueueDevice,
        JobStatus, Payload, RecvBackend, SendBackend, SoftwareDeflate, SoftwareJobQueue,
        SubmitError,
    },
    config::{Compression, MultifdConfig, ZeroPageDetection},
    packet::{
        ChannelFeatures, InitPacket, MULTIFD_MAGIC, MULTIFD_VERSION, PACKET_HEADER_SIZE,
        PacketFlags, PacketHeader, RAMBLOCK_ID_LEN,
    },
    pages::{PageBatch, is_zero_page},
    recv::MultifdRecv,
    send::MultifdSend,
    stats::ChannelStats,
};

/// Options shared by the sending and the receiving side.
#[derive(Clone, Default)]
pub struct ChannelOptions {
    /// Accelerators for the batch and job-queue backends.
    pub accelerators: Accelerators,

    /// Page encryption of a confidential guest.
    pub encryption: Option<Arc<dyn PageEncryption>>,
}

impl ChannelOptions {
    /// Creates options for software backends and plain RAM.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the accelerators.
    pub fn with_accelerators(self, accelerators: Accelerators) -> Self {
        Self {
            accelerators,
            ..self
        }
    }

    /// Routes every page through `encryption`.
    pub fn with_encryption(self, encryption: Arc<dyn PageEncryption>) -> Self {
        Self {
            encryption: Some(encryption),
            ..self
        }
    }
}

impl std::fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("accelerators", &self.accelerators)
            .field("encryption", &self.encryption.is_some())
            .finish()
    }
}

/// Returns the features both ends of a channel must agree on.
///
/// Encrypted pages are opaque, so zero page detection is off for them.
pub(crate) fn channel_features(config: &MultifdConfig, encrypted: bool) -> ChannelFeatures {
    if encrypted {
        ChannelFeatures::ENCRYPTED
    } else if config.detects_zero_pages() {
        ChannelFeatures::ZERO_PAGE
    } else {
        ChannelFeatures::empty()
    }
}
