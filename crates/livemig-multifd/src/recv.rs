use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use livemig_core::{
    EncryptedPage, MigrationError, PageEncryption, RamAddr, RamBlock, RamBlockProvider, Semaphore,
    Transport,
};
use parking_lot::Mutex;
use zerocopy::{FromZeros as _, IntoBytes as _};

use crate::{
    ChannelOptions, ChannelStats, MultifdConfig, channel_features,
    backend::{Accelerators, BackendParams, RecvBackend},
    packet::{
        InitPacket, PACKET_HEADER_SIZE, PacketFlags, PacketHeader, decode_aux, decode_offsets,
    },
    stats::ChannelCounters,
};

struct RecvChannel {
    id: u8,
    transport: Arc<dyn Transport>,

    /// Posted by the main thread to release the channel after a SYNC packet.
    sem_sync: Semaphore,

    /// The sender closed the channel.
    closed: AtomicBool,
    counters: ChannelCounters,
}

struct RecvShared {
    config: MultifdConfig,
    page_size: u64,
    page_count: u32,
    provider: Arc<dyn RamBlockProvider>,
    accelerators: Accelerators,
    encryption: Option<Arc<dyn PageEncryption>>,

    /// Indexed by channel id.
    channels: Mutex<Vec<Option<Arc<RecvChannel>>>>,

    /// Posted by every channel that reached a SYNC packet or its end.
    sem_sync: Semaphore,
    packet_num: AtomicU64,
    exiting: AtomicBool,
    error: Mutex<Option<String>>,
}

/// The receiving side of the multifd channels.
///
/// Every accepted transport gets its own thread, which validates each
/// packet in full before any byte reaches guest memory. Channels stop at
/// every SYNC packet until [`sync_main`] has seen all of them there.
///
/// The first channel error stops all channels.
///
/// [`sync_main`]: Self::sync_main
pub struct MultifdRecv {
    shared: Arc<RecvShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MultifdRecv {
    /// Creates the receiving side. Channels are added with [`accept`].
    ///
    /// [`accept`]: Self::accept
    pub fn new(
        config: MultifdConfig,
        page_size: u64,
        provider: Arc<dyn RamBlockProvider>,
        options: ChannelOptions,
    ) -> Result<Self, MigrationError> {
        config.validate(page_size)?;

        let page_count = config.page_count(page_size);
        let channels = usize::from(config.channels);

        Ok(Self {
            shared: Arc::new(RecvShared {
                config,
                page_size,
                page_count,
                provider,
                accelerators: options.accelerators,
                encryption: options.encryption,
                channels: Mutex::new(vec![None; channels]),
                sem_sync: Semaphore::new(0),
                packet_num: AtomicU64::new(0),
                exiting: AtomicBool::new(false),
                error: Mutex::new(None),
            }),
            threads: Mutex::new(Vec::with_capacity(channels)),
        })
    }

    /// Reads the handshake from `transport` and starts the channel it
    /// names.
    ///
    /// Returns the channel id.
    pub fn accept(&self, transport: Arc<dyn Transport>) -> Result<u8, MigrationError> {
        let shared = &self.shared;
        shared.check_exiting()?;

        let mut buf = [0u8; size_of::<InitPacket>()];
        transport.read_all(&mut buf)?;

        let init = InitPacket::from_bytes(&buf)?;
        let features = channel_features(&shared.config, shared.encryption.is_some());
        let id = init.validate(&shared.config.uuid, shared.config.channels, features)?;

        let params = BackendParams {
            channel: id,
            page_size: shared.page_size as usize,
            page_count: shared.page_count as usize,
        };
        let backend = RecvBackend::recv_setup(&shared.config, params, &shared.accelerators)?;

        let channel = Arc::new(RecvChannel {
            id,
            transport,
            sem_sync: Semaphore::new(0),
            closed: AtomicBool::new(false),
            counters: ChannelCounters::default(),
        });
        channel.counters.add_bytes(buf.len());

        {
            let mut channels = shared.channels.lock();
            let slot = &mut channels[usize::from(id)];
            if slot.is_some() {
                return Err(MigrationError::protocol(id, "channel already received"));
            }
            *slot = Some(channel.clone());
        }

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("multifdrecv_{id}"))
                .spawn(move || shared.recv_thread(&channel, backend))?
        };
        self.threads.lock().push(thread);

        tracing::debug!(channel = id, "multifd recv channel accepted");
        Ok(id)
    }

    /// Returns `true` once every channel was accepted.
    pub fn all_channels_created(&self) -> bool {
        self.shared.channels.lock().iter().all(Option::is_some)
    }

    /// Waits until every channel reached its next SYNC packet, then
    /// releases them.
    ///
    /// Returns the highest packet number received so far.
    pub fn sync_main(&self) -> Result<u64, MigrationError> {
        let shared = &self.shared;
        let channels = shared.accepted()?;

        for _ in &channels {
            shared.check_exiting()?;
            tracing::trace!("sync main wait");
            shared.sem_sync.wait();

            shared.check_exiting()?;
            if let Some(channel) = channels.iter().find(|c| c.closed.load(Ordering::Acquire)) {
                return Err(MigrationError::protocol(
                    channel.id,
                    "channel closed before the synchronization point",
                ));
            }
        }

        for channel in &channels {
            tracing::trace!(channel = channel.id, "sync main signal");
            channel.sem_sync.post();
        }

        let packet_num = shared.packet_num.load(Ordering::Acquire);
        tracing::trace!(packet_num, "sync main");
        Ok(packet_num)
    }

    /// Returns the totals of every accepted channel.
    pub fn stats(&self) -> Vec<ChannelStats> {
        self.shared
            .channels
            .lock()
            .iter()
            .flatten()
            .map(|channel| channel.counters.snapshot(channel.id))
            .collect()
    }

    /// Returns the reason of the first channel error, if any.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Waits for the final SYNC packet and the end of every channel.
    pub fn finish(self) -> Result<Vec<ChannelStats>, MigrationError> {
        if let Err(err) = self.sync_main() {
            self.shutdown();
            return Err(err);
        }

        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }

        self.shared.check_error()?;
        Ok(self.stats())
    }

    /// Stops every channel, interrupting blocked I/O.
    pub fn shutdown(&self) {
        let mut threads = self.threads.lock();
        if threads.is_empty() {
            return;
        }

        tracing::debug!("multifd recv terminate threads");
        self.shared.terminate();

        for thread in threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for MultifdRecv {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Buffers reused by one channel thread from packet to packet.
#[derive(Default)]
struct RecvBuffers {
    offsets: Vec<u8>,
    normal: Vec<RamAddr>,
    zero: Vec<RamAddr>,
    aux: Vec<u8>,
    payload: Vec<u8>,
    pages: Vec<u8>,
}

impl RecvShared {
    fn should_exit(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn check_error(&self) -> Result<(), MigrationError> {
        match self.error.lock().clone() {
            Some(reason) => Err(MigrationError::Aborted(reason)),
            None => Ok(()),
        }
    }

    fn check_exiting(&self) -> Result<(), MigrationError> {
        if !self.should_exit() {
            return Ok(());
        }

        self.check_error()?;
        Err(MigrationError::Aborted(String::from(
            "multifd channels are shut down",
        )))
    }

    /// Returns the accepted channels, failing if any is missing.
    fn accepted(&self) -> Result<Vec<Arc<RecvChannel>>, MigrationError> {
        let channels = self.channels.lock();
        let accepted: Vec<_> = channels.iter().flatten().cloned().collect();

        if accepted.len() != channels.len() {
            return Err(MigrationError::Aborted(format!(
                "{} of {} multifd channels connected",
                accepted.len(),
                channels.len()
            )));
        }

        Ok(accepted)
    }

    /// Records the first error and stops every channel.
    fn set_error(&self, err: &MigrationError) {
        {
            let mut error = self.error.lock();
            if error.is_some() {
                return;
            }
            *error = Some(err.to_string());
        }

        self.terminate();
    }

    fn terminate(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }

        for channel in self.channels.lock().iter().flatten() {
            if let Err(err) = channel.transport.shutdown() {
                tracing::debug!(channel = channel.id, %err, "transport shutdown failed");
            }
            channel.sem_sync.post();
        }

        // Wake the main thread from `sync_main`.
        for _ in 0..self.config.channels {
            self.sem_sync.post();
        }
    }

    fn recv_thread(&self, channel: &RecvChannel, mut backend: RecvBackend) {
        tracing::debug!(channel = channel.id, "multifd recv thread started");

        match self.recv_loop(channel, &mut backend) {
            Ok(()) => {}
            Err(err) if self.should_exit() => {
                tracing::debug!(channel = channel.id, %err, "multifd recv channel stopped");
            }
            Err(err) => {
                tracing::error!(channel = channel.id, %err, "multifd recv channel failed");
                self.set_error(&err);
            }
        }

        backend.recv_cleanup();

        let stats = channel.counters.snapshot(channel.id);
        tracing::debug!(
            channel = channel.id,
            packets = stats.packets,
            normal_pages = stats.normal_pages,
            zero_pages = stats.zero_pages,
            "multifd recv thread stopped"
        );
    }

    fn recv_loop(
        &self,
        channel: &RecvChannel,
        backend: &mut RecvBackend,
    ) -> Result<(), MigrationError> {
        let mut header = PacketHeader::new_zeroed();
        let mut buffers = RecvBuffers::default();

        loop {
            if self.should_exit() {
                break;
            }

            if !channel.transport.read_all_or_eof(header.as_mut_bytes())? {
                tracing::debug!(channel = channel.id, "multifd recv channel closed");
                channel.closed.store(true, Ordering::Release);
                self.sem_sync.post();
                break;
            }

            let flags = header.flags();
            self.recv_packet(channel, backend, &header, &mut buffers)?;

            if flags.contains(PacketFlags::SYNC) {
                self.sem_sync.post();
                channel.sem_sync.wait();
            }
        }

        Ok(())
    }

    /// Reads the rest of one packet and applies it to guest memory.
    fn recv_packet(
        &self,
        channel: &RecvChannel,
        backend: &mut RecvBackend,
        header: &PacketHeader,
        buffers: &mut RecvBuffers,
    ) -> Result<(), MigrationError> {
        let id = channel.id;
        header.validate(id, self.page_count)?;

        let flags = header.flags();
        let normal_pages = header.normal_pages() as usize;
        let zero_pages = header.zero_pages() as usize;

        // SYNC packets carry no pages and no encryption flag.
        let encrypted = flags.contains(PacketFlags::ENCRYPTED);
        let expect_encrypted = self.encryption.is_some() && normal_pages + zero_pages > 0;
        if encrypted != expect_encrypted {
            return Err(MigrationError::protocol(
                id,
                format!(
                    "packet flags {:#x} do not match the channel features",
                    flags.bits()
                ),
            ));
        }

        let aux_size = header.aux_size() as usize;
        let payload_size = header.next_packet_size() as usize;

        // Zero pages are applied without decoding, so the codec is checked
        // for every packet with pages.
        if normal_pages + zero_pages > 0 {
            backend.check_flags(flags)?;
        }

        if encrypted && zero_pages != 0 {
            return Err(MigrationError::protocol(id, "zero pages in an encrypted packet"));
        }

        if !encrypted && aux_size != 0 {
            return Err(MigrationError::protocol(
                id,
                format!("{aux_size} bytes of auxiliary data without encryption"),
            ));
        }

        // One length prefix and at most one page of metadata per page.
        let max_aux = normal_pages * (size_of::<u32>() + self.page_size as usize);
        if aux_size > max_aux {
            return Err(MigrationError::protocol(
                id,
                format!("auxiliary data of {aux_size} bytes exceeds {max_aux}"),
            ));
        }

        if payload_size > backend.max_payload() {
            return Err(MigrationError::protocol(
                id,
                format!(
                    "payload of {payload_size} bytes exceeds {}",
                    backend.max_payload()
                ),
            ));
        }

        buffers.offsets.resize((normal_pages + zero_pages) * size_of::<u64>(), 0);
        buffers.aux.resize(aux_size, 0);
        buffers.payload.resize(payload_size, 0);
        channel.transport.read_all(&mut buffers.offsets)?;
        channel.transport.read_all(&mut buffers.aux)?;
        channel.transport.read_all(&mut buffers.payload)?;

        let (normal, zero) = buffers.offsets.split_at(normal_pages * size_of::<u64>());
        buffers.normal.clear();
        buffers.zero.clear();
        decode_offsets(normal, &mut buffers.normal)?;
        decode_offsets(zero, &mut buffers.zero)?;

        self.packet_num.fetch_max(header.packet_num(), Ordering::AcqRel);

        let bytes = PACKET_HEADER_SIZE + buffers.offsets.len() + aux_size + payload_size;

        if normal_pages + zero_pages == 0 {
            if payload_size != 0 {
                return Err(MigrationError::protocol(
                    id,
                    format!("{payload_size} payload bytes without pages"),
                ));
            }

            channel.counters.add_packet(0, 0, bytes);
            tracing::trace!(
                channel = id,
                packet_num = header.packet_num(),
                ?flags,
                "packet received"
            );
            return Ok(());
        }

        let block = self.resolve_block(id, header)?;
        for &offset in buffers.normal.iter().chain(&buffers.zero) {
            if block.check_page(offset).is_err() {
                return Err(MigrationError::protocol(
                    id,
                    format!(
                        "page offset {:#x} is outside of block `{}`",
                        offset.0,
                        block.id()
                    ),
                ));
            }
        }

        let aux = if encrypted {
            decode_aux(&buffers.aux, normal_pages)
                .map_err(|_| MigrationError::protocol(id, "malformed auxiliary data"))?
        } else {
            Vec::new()
        };

        let page_size = self.page_size as usize;
        buffers.pages.resize(normal_pages * page_size, 0);
        if normal_pages > 0 || payload_size > 0 {
            backend.recv(&buffers.payload, &mut buffers.pages)?;
        }

        // The packet is valid; only now does guest memory change.
        for (index, (&offset, page)) in buffers
            .normal
            .iter()
            .zip(buffers.pages.chunks(page_size))
            .enumerate()
        {
            match &self.encryption {
                Some(encryption) => {
                    let page = EncryptedPage {
                        header: aux[index].to_vec(),
                        data: page.to_vec(),
                    };
                    encryption.decrypt_page(block.gpa_of(offset), &page)?;
                }
                None => block.write_page(offset, page)?,
            }
        }

        for &offset in &buffers.zero {
            block.zero_page(offset)?;
        }

        channel.counters.add_packet(normal_pages, zero_pages, bytes);

        tracing::trace!(
            channel = id,
            packet_num = header.packet_num(),
            normal = normal_pages,
            zero = zero_pages,
            ?flags,
            "packet received"
        );

        Ok(())
    }

    fn resolve_block(
        &self,
        channel: u8,
        header: &PacketHeader,
    ) -> Result<Arc<RamBlock>, MigrationError> {
        let name = std::str::from_utf8(header.ramblock())
            .map_err(|_| MigrationError::protocol(channel, "RAM block id is not UTF-8"))?;

        let block = self
            .provider
            .block_by_id(name)
            .ok_or_else(|| MigrationError::UnknownRamBlock(name.to_owned()))?;

        if block.page_size() != self.page_size {
            return Err(MigrationError::protocol(
                channel,
                format!(
                    "block `{name}` has {} byte pages, the channel carries {} byte pages",
                    block.page_size(),
                    self.page_size
                ),
            ));
        }

        Ok(block)
    }
}
