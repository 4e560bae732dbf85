//! Compression backends of the multifd channels.
//!
//! A backend turns the normal pages of a packet into payload bytes on the
//! sending side and back into pages on the receiving side. The variant is
//! chosen once, when a channel is set up, from [`Compression`]. Zero pages
//! never reach a backend.

mod batch;
mod job_queue;
mod nocomp;
mod zlib;
mod zstd;

use std::{fmt, sync::Arc};

use livemig_core::MigrationError;
use smallvec::SmallVec;

pub use self::{
    batch::{BatchAccelerator, SoftwareDeflate},
    job_queue::{JobOp, JobQueueDevice, JobStatus, SoftwareJobQueue, SubmitError},
};
use self::{
    batch::{BatchRecv, BatchSend},
    job_queue::{JobQueueRecv, JobQueueSend},
    nocomp::{NoCompRecv, NoCompSend},
    zlib::{ZlibRecv, ZlibSend},
    zstd::{ZstdRecv, ZstdSend},
};
use crate::{Compression, MultifdConfig, packet::PacketFlags};

/// The payload of one packet, as a list of I/O slices.
pub type Payload<'a> = SmallVec<[&'a [u8]; 8]>;

/// An error raised by a codec or an accelerator.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// The zstd library failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The deflate compressor failed.
    #[error(transparent)]
    Compress(#[from] flate2::CompressError),

    /// The deflate decompressor failed.
    #[error(transparent)]
    Decompress(#[from] flate2::DecompressError),

    /// The stream neither consumed input nor produced output.
    #[error("stream stalled after {consumed} of {total} input bytes")]
    Stalled {
        /// Input bytes consumed so far.
        consumed: usize,

        /// Input bytes available.
        total: usize,
    },

    /// The decoded size differs from the size announced by the packet.
    #[error("decoded {actual} bytes, expected {expected}")]
    LengthMismatch {
        /// Bytes announced.
        expected: usize,

        /// Bytes decoded.
        actual: usize,
    },

    /// An accelerator job failed.
    #[error("job {slot} failed: {reason}")]
    Job {
        /// The job slot.
        slot: usize,

        /// What the device reported.
        reason: String,
    },
}

impl BackendError {
    /// Converts the error into the migration error of `channel`.
    pub fn into_migration_error(self, channel: u8, codec: &'static str) -> MigrationError {
        MigrationError::CompressionBackend {
            channel,
            codec,
            source: Box::new(self),
        }
    }
}

type BatchFactory = dyn Fn(u8) -> Box<dyn BatchAccelerator> + Send + Sync;
type JobQueueFactory = dyn Fn(u8) -> Box<dyn JobQueueDevice> + Send + Sync;

/// Hardware accelerators available to the batch and job-queue backends.
///
/// Each factory is called once per channel with the channel id. Without a
/// factory, the backend uses its software implementation.
#[derive(Clone, Default)]
pub struct Accelerators {
    batch: Option<Arc<BatchFactory>>,
    job_queue: Option<Arc<JobQueueFactory>>,
}

impl Accelerators {
    /// Creates an empty set; every backend runs in software.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the batch accelerator factory.
    pub fn with_batch<F>(self, factory: F) -> Self
    where
        F: Fn(u8) -> Box<dyn BatchAccelerator> + Send + Sync + 'static,
    {
        Self {
            batch: Some(Arc::new(factory)),
            ..self
        }
    }

    /// Sets the job-queue device factory.
    pub fn with_job_queue<F>(self, factory: F) -> Self
    where
        F: Fn(u8) -> Box<dyn JobQueueDevice> + Send + Sync + 'static,
    {
        Self {
            job_queue: Some(Arc::new(factory)),
            ..self
        }
    }

    fn batch(&self, channel: u8) -> Box<dyn BatchAccelerator> {
        match &self.batch {
            Some(factory) => factory(channel),
            None => Box::new(SoftwareDeflate::new()),
        }
    }

    fn job_queue(&self, channel: u8) -> Box<dyn JobQueueDevice> {
        match &self.job_queue {
            Some(factory) => factory(channel),
            None => Box::new(SoftwareJobQueue::new()),
        }
    }
}

impl fmt::Debug for Accelerators {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Accelerators")
            .field("batch", &self.batch.is_some())
            .field("job_queue", &self.job_queue.is_some())
            .finish()
    }
}

/// Geometry of the packets a backend processes.
#[derive(Debug, Clone, Copy)]
pub struct BackendParams {
    /// The owning channel.
    pub channel: u8,

    /// Bytes per page.
    pub page_size: usize,

    /// Pages in a full packet.
    pub page_count: usize,
}

enum SendContext {
    None(NoCompSend),
    Zlib(ZlibSend),
    Zstd(ZstdSend),
    JobQueue(JobQueueSend),
    Batch(BatchSend),
}

/// The sending half of a backend, private to one channel.
pub struct SendBackend {
    params: BackendParams,
    compression: Compression,
    context: SendContext,
}

impl SendBackend {
    /// Allocates the per-channel state of the configured codec.
    pub fn send_setup(
        config: &MultifdConfig,
        params: BackendParams,
        accelerators: &Accelerators,
    ) -> Result<Self, MigrationError> {
        let compression = config.compression;
        let context = match compression {
            Compression::None => SendContext::None(NoCompSend::new(params)),
            Compression::Zlib => SendContext::Zlib(ZlibSend::new(params, config.zlib_level)),
            Compression::Zstd => SendContext::Zstd(
                ZstdSend::new(params, config.zstd_level)
                    .map_err(|err| err.into_migration_error(params.channel, compression.name()))?,
            ),
            Compression::JobQueue => {
                SendContext::JobQueue(JobQueueSend::new(params, accelerators.job_queue(params.channel)))
            }
            Compression::Batch => {
                SendContext::Batch(BatchSend::new(params, accelerators.batch(params.channel)))
            }
        };

        tracing::debug!(channel = params.channel, codec = compression.name(), "send setup");

        Ok(Self {
            params,
            compression,
            context,
        })
    }

    /// Returns the codec.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Returns the flags announcing the codec.
    pub fn flags(&self) -> PacketFlags {
        self.compression.flags()
    }

    /// Returns the number of I/O slices the payload of `page_count` normal
    /// pages needs.
    pub fn iov_count(&self, page_count: usize) -> usize {
        match self.context {
            SendContext::None(_) => page_count,
            SendContext::Zlib(_) | SendContext::Zstd(_) | SendContext::Batch(_) => 1,
            SendContext::JobQueue(_) => page_count + 1,
        }
    }

    /// Encodes the normal pages in `normal` into `payload`.
    ///
    /// `normal` holds whole pages back to back. Returns the payload size.
    pub fn send_prepare<'a>(
        &'a mut self,
        normal: &'a [u8],
        payload: &mut Payload<'a>,
    ) -> Result<usize, MigrationError> {
        payload.clear();

        if normal.is_empty() {
            return Ok(0);
        }

        let channel = self.params.channel;
        let codec = self.compression.name();

        let result = match &mut self.context {
            SendContext::None(context) => {
                context.prepare(normal, payload);
                Ok(())
            }
            SendContext::Zlib(context) => context.prepare(normal).map(|data| payload.push(data)),
            SendContext::Zstd(context) => context.prepare(normal).map(|data| payload.push(data)),
            SendContext::JobQueue(context) => context.prepare(normal, payload),
            SendContext::Batch(context) => context.prepare(normal).map(|data| payload.push(data)),
        };

        result.map_err(|err| err.into_migration_error(channel, codec))?;
        Ok(payload.iter().map(|slice| slice.len()).sum())
    }

    /// Releases the per-channel state.
    pub fn send_cleanup(self) {
        tracing::debug!(
            channel = self.params.channel,
            codec = self.compression.name(),
            "send cleanup"
        );
    }
}

enum RecvContext {
    None(NoCompRecv),
    Zlib(ZlibRecv),
    Zstd(ZstdRecv),
    JobQueue(JobQueueRecv),
    Batch(BatchRecv),
}

/// The receiving half of a backend, private to one channel.
pub struct RecvBackend {
    params: BackendParams,
    compression: Compression,
    context: RecvContext,
}

impl RecvBackend {
    /// Allocates the per-channel state of the configured codec.
    pub fn recv_setup(
        config: &MultifdConfig,
        params: BackendParams,
        accelerators: &Accelerators,
    ) -> Result<Self, MigrationError> {
        let compression = config.compression;
        let context = match compression {
            Compression::None => RecvContext::None(NoCompRecv),
            Compression::Zlib => RecvContext::Zlib(ZlibRecv::new(params)),
            Compression::Zstd => RecvContext::Zstd(
                ZstdRecv::new(params)
                    .map_err(|err| err.into_migration_error(params.channel, compression.name()))?,
            ),
            Compression::JobQueue => {
                RecvContext::JobQueue(JobQueueRecv::new(params, accelerators.job_queue(params.channel)))
            }
            Compression::Batch => {
                RecvContext::Batch(BatchRecv::new(params, accelerators.batch(params.channel)))
            }
        };

        tracing::debug!(channel = params.channel, codec = compression.name(), "recv setup");

        Ok(Self {
            params,
            compression,
            context,
        })
    }

    /// Returns the codec.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Returns the largest payload a well-formed packet can carry.
    ///
    /// Streaming codecs may expand incompressible pages slightly, so the
    /// bound leaves room for twice the page data.
    pub fn max_payload(&self) -> usize {
        let pages = self.params.page_count * self.params.page_size;
        match self.context {
            RecvContext::None(_) => pages,
            RecvContext::JobQueue(_) => pages + self.params.page_count * size_of::<u32>(),
            _ => 2 * pages + self.params.page_size,
        }
    }

    /// Checks that a packet carrying pages was encoded with this codec.
    pub fn check_flags(&self, flags: PacketFlags) -> Result<(), MigrationError> {
        let received = flags & PacketFlags::COMPRESSION_MASK;
        let expected = self.compression.flags();
        if received != expected {
            return Err(MigrationError::protocol(
                self.params.channel,
                format!(
                    "flags received {:#x} flags expected {:#x}",
                    received.bits(),
                    expected.bits()
                ),
            ));
        }

        Ok(())
    }

    /// Decodes `payload` into the normal pages in `out`.
    ///
    /// `out` is exactly `normal_pages * page_size` bytes long. The packet
    /// flags must have passed [`check_flags`] first.
    ///
    /// [`check_flags`]: Self::check_flags
    pub fn recv(&mut self, payload: &[u8], out: &mut [u8]) -> Result<(), MigrationError> {
        let channel = self.params.channel;
        let codec = self.compression.name();

        if out.is_empty() {
            if !payload.is_empty() {
                return Err(MigrationError::protocol(
                    channel,
                    format!("{} payload bytes without normal pages", payload.len()),
                ));
            }

            return Ok(());
        }

        match &mut self.context {
            RecvContext::None(context) => context.recv(channel, payload, out),
            RecvContext::Zlib(context) => context
                .recv(payload, out)
                .map_err(|err| err.into_migration_error(channel, codec)),
            RecvContext::Zstd(context) => context
                .recv(payload, out)
                .map_err(|err| err.into_migration_error(channel, codec)),
            RecvContext::JobQueue(context) => context.recv(channel, payload, out),
            RecvContext::Batch(context) => context
                .recv(payload, out)
                .map_err(|err| err.into_migration_error(channel, codec)),
        }
    }

    /// Releases the per-channel state.
    pub fn recv_cleanup(self) {
        tracing::debug!(
            channel = self.params.channel,
            codec = self.compression.name(),
            "recv cleanup"
        );
    }
}

/// Makes sure `buf` has at least `spare` bytes after `written`.
fn reserve_zeroed(buf: &mut Vec<u8>, written: usize, spare: usize) {
    if buf.len() < written + spare {
        buf.resize(written + spare, 0);
    }
}

#[cfg(test)]
mod tests;
