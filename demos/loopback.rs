//! Migrates a running guest to a second VM in the same process, over TCP.

use std::{
    error::Error,
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use livemig::{
    Gpa, MIB, MigrationConfig, MigrationEngine, RamAddr, RamBlock, RamBlockList, SystemClock,
    Transport, VcpuId,
    dirtylimit::{DirtyLimit, DirtyLimitConfig, SampledVcpuRate, VcpuMemory},
    dirtyrate::{CalcState, SamplerConfig},
    multifd::{ChannelStats, Compression, MultifdConfig},
};

const PAGE_SIZE: u64 = 4096;
const RAM_SIZE: u64 = 64 * MIB;
const CHANNELS: u8 = 4;
const PASSES: usize = 3;

/// A guest with a single vCPU that writes to all of its RAM.
struct SingleVcpu(Arc<RamBlock>);

impl VcpuMemory for SingleVcpu {
    fn vcpu_blocks(&self, _vcpu: VcpuId) -> Vec<Arc<RamBlock>> {
        vec![self.0.clone()]
    }
}

/// Dirties random pages until `running` is cleared, stopping whenever the
/// dirty ring fills up.
fn run_vcpu(ram: Arc<RamBlock>, limit: DirtyLimit, running: Arc<AtomicBool>) -> u64 {
    let ring_size = limit.config().ring_size;
    let mut seed = 0x853c_49e6_748f_ea9b_u64;
    let mut writes = 0;

    while running.load(Ordering::Relaxed) {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;

        let offset = RamAddr((seed % ram.page_count()) * PAGE_SIZE);
        if ram.write_page(offset, &[seed as u8; PAGE_SIZE as usize]).is_err() {
            break;
        }

        writes += 1;
        if writes % ring_size == 0 {
            limit.vcpu_ring_full(VcpuId(0));
        }
    }

    writes
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let config = MigrationConfig::default()
        .with_multifd(
            MultifdConfig::default()
                .with_channels(CHANNELS)
                .with_compression(Compression::Zstd),
        )
        .with_dirty_rate(SamplerConfig::default().with_calc_time(Duration::from_millis(200)))
        .with_dirty_limit(DirtyLimitConfig::default().with_period(Duration::from_millis(100)));

    // Setup the source VM.
    let clock = Arc::new(SystemClock::new());
    let source_blocks = Arc::new(RamBlockList::new());
    let source_ram = source_blocks.add(RamBlock::new("pc.ram", Gpa(0), PAGE_SIZE, RAM_SIZE)?)?;
    let vcpu_rate = SampledVcpuRate::new(
        Arc::new(SingleVcpu(source_ram.clone())),
        clock.clone(),
        config.dirty_rate.sample_pages_per_gib,
    );
    let source =
        MigrationEngine::with_clock(config.clone(), source_blocks, Arc::new(vcpu_rate), clock)?;

    // Setup the destination VM.
    let destination_blocks = Arc::new(RamBlockList::new());
    let destination_ram =
        destination_blocks.add(RamBlock::new("pc.ram", Gpa(0), PAGE_SIZE, RAM_SIZE)?)?;
    let destination = MigrationEngine::new(
        config,
        destination_blocks,
        Arc::new(|vcpus: &[VcpuId], _: Duration| -> Vec<(VcpuId, u64)> {
            vcpus.iter().map(|vcpu| (*vcpu, 0)).collect()
        }),
    )?;

    let running = Arc::new(AtomicBool::new(true));
    let vcpu = thread::spawn({
        let ram = source_ram.clone();
        let limit = source.dirty_limit().clone();
        let running = running.clone();
        move || run_vcpu(ram, limit, running)
    });

    // Measure how fast the guest dirties its memory.
    source.calc_dirty_rate(None)?;
    let stat = loop {
        let info = source.query_dirty_rate();
        if info.status == CalcState::Measured
            && let Some(stat) = info.stat
        {
            break stat;
        }

        thread::sleep(Duration::from_millis(50));
    };
    println!(
        "dirty rate: {} MB/s ({} of {} samples dirty)",
        stat.dirty_rate, stat.total_dirty_samples, stat.total_sample_count
    );

    // Slow the vCPU down so that the passes converge.
    source.set_vcpu_dirty_limit(None, 100)?;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let address = listener.local_addr()?;

    let started = Instant::now();
    let received = thread::scope(|scope| -> Result<Vec<ChannelStats>, Box<dyn Error>> {
        let incoming = scope.spawn(|| -> Result<_, livemig::MigrationError> {
            let incoming = destination.start_incoming()?;
            for stream in listener.incoming().take(CHANNELS as usize) {
                incoming.accept(Arc::new(stream?))?;
            }

            for _ in 1..PASSES {
                let packet_num = incoming.sync()?;
                tracing::debug!(packet_num, "destination reached sync point");
            }

            incoming.finish()
        });

        let transports = (0..CHANNELS)
            .map(|_| Ok(Arc::new(TcpStream::connect(address)?) as Arc<dyn Transport>))
            .collect::<Result<Vec<_>, std::io::Error>>()?;

        let mut outgoing = source.start_outgoing(transports)?;
        for _ in 1..PASSES {
            outgoing.send_block(&source_ram)?;
            outgoing.sync()?;
        }

        // Stop the guest for the final pass.
        running.store(false, Ordering::Relaxed);
        let writes = vcpu.join().map_err(|_| "vCPU thread panicked")?;
        println!("vCPU wrote {writes} pages");

        outgoing.send_block(&source_ram)?;
        let sent = outgoing.finish()?;

        for stats in &sent {
            println!(
                "channel {}: {} packets, {} normal pages, {} zero pages, {} bytes",
                stats.id, stats.packets, stats.normal_pages, stats.zero_pages, stats.bytes
            );
        }

        Ok(incoming
            .join()
            .map_err(|_| "destination thread panicked")??)
    })?;

    println!(
        "migrated {} MiB in {:?} ({} packets received)",
        RAM_SIZE / MIB,
        started.elapsed(),
        received.iter().map(|stats| stats.packets).sum::<u64>()
    );

    // Compare both copies of the guest.
    let mut expected = vec![0; PAGE_SIZE as usize];
    let mut actual = vec![0; PAGE_SIZE as usize];
    for index in 0..source_ram.page_count() {
        let offset = RamAddr(index * PAGE_SIZE);
        source_ram.read_page(offset, &mut expected)?;
        destination_ram.read_page(offset, &mut actual)?;

        if expected != actual {
            return Err(format!("page {index} differs").into());
        }
    }

    println!("source: {:?}", source.status());
    println!("destination: {:?}", destination.status());
    Ok(())
}
