//! Migrates a confidential guest whose pages only its in-guest helpers can
//! read and write.
//!
//! Both helpers run on host threads here and "encrypt" with a fixed XOR key.

use std::{sync::Arc, thread, time::Duration};

use livemig::{
    Gpa, MIB, MigrationConfig, MigrationEngine, MigrationError, PollBudget, RamAddr, RamBlock,
    RamBlockList, Transport, VcpuId,
    cgs::{Command, GuestMailbox, RET_MALFORMED, RET_OK},
    multifd::{Compression, MultifdConfig},
    pipe,
};

const PAGE_SIZE: u64 = 4096;
const RAM_GPA: Gpa = Gpa(0x1_0000_0000);
const RAM_SIZE: u64 = 4 * MIB;
const MAILBOX_GPA: Gpa = Gpa(0xfee0_0000);
const CHANNELS: u8 = 2;
const KEY: u8 = 0xa5;

struct Vm {
    ram: Arc<RamBlock>,
    mailbox: Arc<RamBlock>,
    engine: MigrationEngine,
}

impl Vm {
    fn new(config: MigrationConfig) -> Result<Self, MigrationError> {
        let blocks = Arc::new(RamBlockList::new());
        let ram = blocks.add(RamBlock::new("pc.ram", RAM_GPA, PAGE_SIZE, RAM_SIZE)?)?;
        let mailbox = Arc::new(RamBlock::new(
            "cgs-mailbox",
            MAILBOX_GPA,
            PAGE_SIZE,
            2 * PAGE_SIZE,
        )?);

        let idle = |vcpus: &[VcpuId], _: Duration| -> Vec<(VcpuId, u64)> {
            vcpus.iter().map(|vcpu| (*vcpu, 0)).collect()
        };
        let engine = MigrationEngine::new(config, blocks, Arc::new(idle))?
            .with_confidential_mailbox(mailbox.clone(), RamAddr(0))?;

        Ok(Self {
            ram,
            mailbox,
            engine,
        })
    }

    /// Starts the in-guest helper, which serves commands until `RESET`.
    fn spawn_helper(&self) -> thread::JoinHandle<Result<u64, MigrationError>> {
        let ram = self.ram.clone();
        let mailbox = self.mailbox.clone();

        thread::spawn(move || {
            let guest = GuestMailbox::new(mailbox, RamAddr(0))?;
            let mut pages = 0;

            loop {
                let command = guest.poll_command(PollBudget::new(Duration::from_secs(10)))?;
                let offset = || RamAddr(command.gpa - RAM_GPA);

                let (ret, header, data) = match command.command {
                    Ok(Command::Init | Command::Reset) => (RET_OK, Vec::new(), Vec::new()),
                    Ok(Command::SavePage) => {
                        let mut data = vec![0; PAGE_SIZE as usize];
                        ram.read_page(offset(), &mut data)?;
                        data.iter_mut().for_each(|byte| *byte ^= KEY);

                        pages += 1;
                        (RET_OK, command.gpa.0.to_le_bytes().to_vec(), data)
                    }
                    Ok(Command::LoadPage) => {
                        let mut page = guest.request()?;
                        if page.header != command.gpa.0.to_le_bytes() {
                            (RET_MALFORMED, Vec::new(), Vec::new())
                        } else {
                            page.data.iter_mut().for_each(|byte| *byte ^= KEY);
                            ram.write_page(offset(), &page.data)?;

                            pages += 1;
                            (RET_OK, Vec::new(), Vec::new())
                        }
                    }
                    Err(_) => (RET_MALFORMED, Vec::new(), Vec::new()),
                };

                guest.complete(ret, &header, &data)?;

                if command.command == Ok(Command::Reset) {
                    return Ok(pages);
                }
            }
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let config = MigrationConfig::default()
        .with_multifd(
            MultifdConfig::default()
                .with_channels(CHANNELS)
                .with_compression(Compression::Zlib),
        )
        .with_confidential_timeout(Duration::from_secs(1));

    let source = Vm::new(config.clone())?;
    let destination = Vm::new(config)?;

    for index in 0..source.ram.page_count() {
        let page = [(index % 251) as u8; PAGE_SIZE as usize];
        source.ram.write_page(RamAddr(index * PAGE_SIZE), &page)?;
    }

    let source_helper = source.spawn_helper();
    let destination_helper = destination.spawn_helper();

    let mut send_ends = Vec::new();
    let mut recv_ends = Vec::new();
    for _ in 0..CHANNELS {
        let (a, b) = pipe();
        send_ends.push(Arc::new(a) as Arc<dyn Transport>);
        recv_ends.push(Arc::new(b) as Arc<dyn Transport>);
    }

    let mut outgoing = source.engine.start_outgoing(send_ends)?;
    let incoming = destination.engine.start_incoming()?;
    for end in recv_ends {
        incoming.accept(end)?;
    }

    outgoing.send_block(&source.ram)?;
    let sent = outgoing.finish()?;
    let received = incoming.finish()?;

    // End both helper sessions.
    source.engine.shutdown();
    destination.engine.shutdown();

    let saved = source_helper
        .join()
        .map_err(|_| "source helper panicked")??;
    let loaded = destination_helper
        .join()
        .map_err(|_| "destination helper panicked")??;

    println!("source helper encrypted {saved} pages");
    println!("destination helper decrypted {loaded} pages");
    println!("sent: {sent:#?}");
    println!("received: {received:#?}");

    let mut expected = vec![0; PAGE_SIZE as usize];
    let mut actual = vec![0; PAGE_SIZE as usize];
    for index in 0..source.ram.page_count() {
        let offset = RamAddr(index * PAGE_SIZE);
        source.ram.read_page(offset, &mut expected)?;
        destination.ram.read_page(offset, &mut actual)?;

        if expected != actual {
            return Err(format!("page {index} differs").into());
        }
    }

    println!("destination: {:?}", destination.engine.status());
    Ok(())
}
