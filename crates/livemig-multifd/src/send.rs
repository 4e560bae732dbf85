use std::{
    io::IoSlice,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use livemig_core::{MigrationError, PageEncryption, RamAddr, RamBlock, Semaphore, Transport};
use parking_lot::Mutex;
use zerocopy::IntoBytes as _;

use crate::{
    ChannelOptions, ChannelStats, MultifdConfig, PageBatch, channel_features,
    backend::{BackendParams, Payload, SendBackend},
    packet::{InitPacket, PacketFlags, PacketHeader, encode_aux, encode_offsets},
    stats::ChannelCounters,
};

struct SendChannel {
    id: u8,
    transport: Arc<dyn Transport>,

    /// Wakes the channel thread for a job or a sync request.
    sem: Semaphore,

    /// Posted once the channel sent its SYNC packet.
    sem_sync: Semaphore,

    /// Set by the main thread when `pages` holds a batch, cleared by the
    /// channel thread once it is sent.
    pending_job: AtomicBool,
    pending_sync: AtomicBool,
    pages: Mutex<PageBatch>,
    counters: ChannelCounters,
}

struct SendShared {
    config: MultifdConfig,
    page_size: u64,
    page_count: u32,
    channels: Vec<SendChannel>,
    channels_ready: Semaphore,
    packet_num: AtomicU64,
    exiting: AtomicBool,
    error: Mutex<Option<String>>,
    encryption: Option<Arc<dyn PageEncryption>>,
}

/// The sending side of the multifd channels.
///
/// The caller queues pages with [`queue_page`]. Pages are gathered into a
/// batch that is handed to the next idle channel once it is full or a page
/// of another RAM block arrives. Channels are picked round-robin; when all
/// of them are busy, the caller blocks.
///
/// The first channel error stops the whole transfer: every later call
/// returns [`MigrationError::Aborted`] with the reason of that error.
///
/// [`queue_page`]: Self::queue_page
pub struct MultifdSend {
    shared: Arc<SendShared>,
    pages: PageBatch,
    next_channel: usize,
    threads: Vec<JoinHandle<()>>,
}

impl MultifdSend {
    /// Starts one sender thread per transport.
    ///
    /// `page_size` is the page size of every RAM block that will be queued.
    pub fn new(
        config: MultifdConfig,
        page_size: u64,
        transports: Vec<Arc<dyn Transport>>,
        options: ChannelOptions,
    ) -> Result<Self, MigrationError> {
        config.validate(page_size)?;

        if transports.len() != usize::from(config.channels) {
            return Err(MigrationError::invalid_parameter(
                "multifd_channels",
                format!(
                    "{} transports for {} channels",
                    transports.len(),
                    config.channels
                ),
            ));
        }

        let page_count = config.page_count(page_size);
        let params = |channel| BackendParams {
            channel,
            page_size: page_size as usize,
            page_count: page_count as usize,
        };

        let mut backends = Vec::with_capacity(transports.len());
        let mut channels = Vec::with_capacity(transports.len());
        for (id, transport) in (0..=u8::MAX).zip(transports) {
            backends.push(SendBackend::send_setup(
                &config,
                params(id),
                &options.accelerators,
            )?);

            channels.push(SendChannel {
                id,
                transport,
                sem: Semaphore::new(0),
                sem_sync: Semaphore::new(0),
                pending_job: AtomicBool::new(false),
                pending_sync: AtomicBool::new(false),
                pages: Mutex::new(PageBatch::new(page_count as usize)),
                counters: ChannelCounters::default(),
            });
        }

        let shared = Arc::new(SendShared {
            config,
            page_size,
            page_count,
            channels,
            channels_ready: Semaphore::new(0),
            packet_num: AtomicU64::new(0),
            exiting: AtomicBool::new(false),
            error: Mutex::new(None),
            encryption: options.encryption,
        });

        let mut result = Self {
            shared: shared.clone(),
            pages: PageBatch::new(page_count as usize),
            next_channel: 0,
            threads: Vec::with_capacity(backends.len()),
        };

        for (index, backend) in backends.into_iter().enumerate() {
            let shared = shared.clone();
            let thread = std::thread::Builder::new()
                .name(format!("multifdsend_{index}"))
                .spawn(move || shared.send_thread(index, backend));

            match thread {
                Ok(thread) => result.threads.push(thread),
                Err(err) => {
                    result.shutdown();
                    return Err(err.into());
                }
            }
        }

        Ok(result)
    }

    /// Queues the page at `offset` of `block` for transfer.
    pub fn queue_page(
        &mut self,
        block: &Arc<RamBlock>,
        offset: RamAddr,
    ) -> Result<(), MigrationError> {
        if block.page_size() != self.shared.page_size {
            return Err(MigrationError::invalid_parameter(
                "page_size",
                format!(
                    "block `{}` has {} byte pages, the channels carry {} byte pages",
                    block.id(),
                    block.page_size(),
                    self.shared.page_size
                ),
            ));
        }

        block.check_page(offset)?;

        while !self.pages.accepts(block) {
            self.send_pages()?;
        }

        self.pages.push(block, offset);
        Ok(())
    }

    /// Flushes the queued pages and waits until every channel sent all of
    /// its pages followed by a SYNC packet.
    pub fn sync_main(&mut self) -> Result<(), MigrationError> {
        if !self.pages.is_empty() {
            self.send_pages()?;
        }

        let shared = &self.shared;

        for channel in &shared.channels {
            shared.check_exiting()?;

            tracing::trace!(channel = channel.id, "sync main signal");
            channel.pending_sync.store(true, Ordering::Release);
            channel.sem.post();
        }

        for channel in &shared.channels {
            shared.check_exiting()?;

            shared.channels_ready.wait();
            tracing::trace!(channel = channel.id, "sync main wait");
            channel.sem_sync.wait();
        }

        shared.check_exiting()?;

        tracing::trace!(
            packet_num = shared.packet_num.load(Ordering::Relaxed),
            "sync main"
        );

        Ok(())
    }

    /// Returns the totals of every channel.
    pub fn stats(&self) -> Vec<ChannelStats> {
        self.shared.stats()
    }

    /// Returns the reason of the first channel error, if any.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Sends the remaining pages, waits for them to drain, and closes the
    /// channels.
    ///
    /// The receiver sees a SYNC packet on every channel followed by the end
    /// of the stream.
    pub fn finish(mut self) -> Result<Vec<ChannelStats>, MigrationError> {
        if let Err(err) = self.sync_main() {
            self.shutdown();
            return Err(err);
        }

        self.stop_threads();

        // Other references to the transports may outlive the sender.
        let mut result = Ok(());
        for channel in &self.shared.channels {
            if let Err(err) = channel.transport.close_write() {
                tracing::warn!(channel = channel.id, %err, "failed to close channel");
                if result.is_ok() {
                    result = Err(MigrationError::Io(err));
                }
            }
        }

        result.map(|()| self.shared.stats())
    }

    /// Stops every channel, interrupting blocked I/O.
    ///
    /// The receiver sees its channels fail.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        tracing::debug!("multifd send terminate threads");

        self.shared.exiting.store(true, Ordering::SeqCst);
        for channel in &self.shared.channels {
            channel.sem.post();
            if let Err(err) = channel.transport.shutdown() {
                tracing::debug!(channel = channel.id, %err, "transport shutdown failed");
            }
        }

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

    fn stop_threads(&mut self) {
        self.shared.exiting.store(true, Ordering::SeqCst);
        for channel in &self.shared.channels {
            channel.sem.post();
        }

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

    /// Hands the main batch to the next idle channel.
    fn send_pages(&mut self) -> Result<(), MigrationError> {
        let shared = &self.shared;
        shared.check_exiting()?;

        // Wait until at least one channel is idle.
        shared.channels_ready.wait();

        let count = shared.channels.len();
        let mut index = self.next_channel % count;
        let channel = loop {
            shared.check_exiting()?;

            let channel = &shared.channels[index];
            if !channel.pending_job.load(Ordering::Acquire) {
                self.next_channel = (index + 1) % count;
                break channel;
            }

            index = (index + 1) % count;
            if index == self.next_channel % count {
                std::thread::yield_now();
            }
        };

        std::mem::swap(&mut *channel.pages.lock(), &mut self.pages);
        channel.pending_job.store(true, Ordering::Release);
        channel.sem.post();
        Ok(())
    }
}

impl Drop for MultifdSend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Buffers reused by one channel thread from packet to packet.
#[derive(Default)]
struct SendBuffers {
    stage: Vec<u8>,
    headers: Vec<Vec<u8>>,
    aux: Vec<u8>,
    header: Vec<u8>,
}

impl SendShared {
    fn should_exit(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn check_exiting(&self) -> Result<(), MigrationError> {
        if !self.should_exit() {
            return Ok(());
        }

        let reason = self.error.lock().clone();
        Err(MigrationError::Aborted(
            reason.unwrap_or_else(|| String::from("multifd channels are shut down")),
        ))
    }

    /// Records the first error and stops the transfer.
    fn set_error(&self, err: &MigrationError) {
        {
            let mut error = self.error.lock();
            if error.is_some() {
                return;
            }
            *error = Some(err.to_string());
        }

        self.exiting.store(true, Ordering::SeqCst);

        // Idle channels exit and kick the main thread.
        for channel in &self.channels {
            channel.sem.post();
        }
    }

    /// Wakes the main thread from either of its waits.
    fn kick_main(&self, channel: &SendChannel) {
        channel.sem_sync.post();
        self.channels_ready.post();
    }

    fn stats(&self) -> Vec<ChannelStats> {
        self.channels
            .iter()
            .map(|channel| channel.counters.snapshot(channel.id))
            .collect()
    }

    fn send_thread(&self, index: usize, mut backend: SendBackend) {
        let channel = &self.channels[index];
        tracing::debug!(channel = channel.id, "multifd send thread started");

        if let Err(err) = self.send_loop(channel, &mut backend) {
            tracing::error!(channel = channel.id, %err, "multifd send channel failed");
            self.set_error(&err);
        }

        // A main thread waiting on this channel must not wait forever.
        self.kick_main(channel);

        backend.send_cleanup();

        let stats = channel.counters.snapshot(channel.id);
        tracing::debug!(
            channel = channel.id,
            packets = stats.packets,
            normal_pages = stats.normal_pages,
            zero_pages = stats.zero_pages,
            "multifd send thread stopped"
        );
    }

    fn send_loop(
        &self,
        channel: &SendChannel,
        backend: &mut SendBackend,
    ) -> Result<(), MigrationError> {
        let features = channel_features(&self.config, self.encryption.is_some());
        let init = InitPacket::new(channel.id, self.config.uuid, features);
        channel
            .transport
            .write_all_vectored(&mut [IoSlice::new(init.as_bytes())])?;
        channel.counters.add_bytes(size_of::<InitPacket>());

        let mut buffers = SendBuffers::default();

        loop {
            self.channels_ready.post();
            channel.sem.wait();

            if self.should_exit() {
                break;
            }

            if channel.pending_job.load(Ordering::Acquire) {
                let mut pages = channel.pages.lock();
                self.send_batch(channel, backend, &mut pages, &mut buffers)?;
                pages.reset();
                drop(pages);

                channel.pending_job.store(false, Ordering::Release);
            } else if channel.pending_sync.load(Ordering::Acquire) {
                let packet_num = self.packet_num.fetch_add(1, Ordering::Relaxed);
                let header = PacketHeader::new(PacketFlags::SYNC, self.page_count, packet_num);
                channel
                    .transport
                    .write_all_vectored(&mut [IoSlice::new(header.as_bytes())])?;
                channel.counters.add_packet(0, 0, size_of::<PacketHeader>());

                tracing::trace!(channel = channel.id, packet_num, "sync packet sent");

                channel.pending_sync.store(false, Ordering::Release);
                channel.sem_sync.post();
            }
        }

        Ok(())
    }

    fn send_batch(
        &self,
        channel: &SendChannel,
        backend: &mut SendBackend,
        pages: &mut PageBatch,
        buffers: &mut SendBuffers,
    ) -> Result<(), MigrationError> {
        let block = pages
            .block()
            .cloned()
            .ok_or(MigrationError::Other("empty page batch"))?;

        let mut flags = backend.flags();
        buffers.aux.clear();

        match &self.encryption {
            Some(encryption) => {
                pages.encrypt(encryption.as_ref(), &mut buffers.stage, &mut buffers.headers)?;
                encode_aux(&buffers.headers, &mut buffers.aux);
                flags |= PacketFlags::ENCRYPTED;
            }
            None => pages.classify(&mut buffers.stage, self.config.detects_zero_pages())?,
        }

        let normal = pages.normal_offsets();
        let zero = pages.zero_offsets();

        let mut iov = Vec::with_capacity(2 + backend.iov_count(normal.len()));
        let mut payload = Payload::new();
        let next_packet_size = backend.send_prepare(&buffers.stage, &mut payload)?;

        let packet_num = self.packet_num.fetch_add(1, Ordering::Relaxed);
        let header = PacketHeader::new(flags, self.page_count, packet_num)
            .with_ramblock(block.id())
            .with_pages(normal.len() as u32, zero.len() as u32)
            .with_sizes(buffers.aux.len() as u32, next_packet_size as u32);

        buffers.header.clear();
        buffers.header.extend_from_slice(header.as_bytes());
        encode_offsets(normal, &mut buffers.header);
        encode_offsets(zero, &mut buffers.header);

        iov.push(IoSlice::new(&buffers.header));
        if !buffers.aux.is_empty() {
            iov.push(IoSlice::new(&buffers.aux));
        }
        iov.extend(payload.iter().map(|slice| IoSlice::new(slice)));

        channel.transport.write_all_vectored(&mut iov)?;

        let bytes = buffers.header.len() + buffers.aux.len() + next_packet_size;
        channel.counters.add_packet(normal.len(), zero.len(), bytes);

        tracing::trace!(
            channel = channel.id,
            packet_num,
            normal = normal.len(),
            zero = zero.len(),
            flags = ?flags,
            next_packet_size,
            "packet sent"
        );

        Ok(())
    }
}
