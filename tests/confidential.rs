#![cfg(feature = "cgs")]

mod common;

use std::{sync::Arc, thread::JoinHandle, time::Duration};

use livemig::{
    Gpa, MigrationConfig, MigrationEngine, MigrationError, MigrationStatus, PollBudget, RamAddr,
    RamBlock, RamBlockList,
    cgs::{Command, GuestMailbox, MailboxCommand, RET_MALFORMED, RET_OK},
    multifd::{Compression, MultifdConfig},
};

use self::common::{PAGE_SIZE, RAM_GPA, Vm, assert_same, channels, fill, idle_vcpus};

const MAILBOX_GPA: Gpa = Gpa(0xf000_0000);
const KEY: u8 = 0x5a;

/// A confidential VM with its in-guest helper.
struct ConfidentialVm {
    vm: Vm,
    mailbox: Arc<RamBlock>,
}

impl ConfidentialVm {
    fn new(config: MigrationConfig, pages: u64) -> Result<Self, MigrationError> {
        let config = config.with_confidential_timeout(Duration::from_secs(5));

        let blocks = Arc::new(RamBlockList::new());
        let ram = blocks.add(RamBlock::new("pc.ram", RAM_GPA, PAGE_SIZE, pages * PAGE_SIZE)?)?;

        // The mailbox is not part of the migrated RAM.
        let mailbox = Arc::new(RamBlock::new(
            "cgs-mailbox",
            MAILBOX_GPA,
            PAGE_SIZE,
            2 * PAGE_SIZE,
        )?);

        let engine = MigrationEngine::new(config, blocks.clone(), idle_vcpus())?
            .with_confidential_mailbox(mailbox.clone(), RamAddr(0))?;

        Ok(Self {
            vm: Vm {
                ram,
                blocks,
                engine,
            },
            mailbox,
        })
    }

    /// Runs the guest helper until `RESET` or until it idles for `idle`.
    ///
    /// Returns the number of pages the helper handled.
    fn spawn_helper<F>(&self, idle: Duration, mut handle: F) -> JoinHandle<usize>
    where
        F: FnMut(&GuestMailbox, &RamBlock, &MailboxCommand) -> (u32, Vec<u8>, Vec<u8>)
            + Send
            + 'static,
    {
        let mailbox = self.mailbox.clone();
        let ram = self.vm.ram.clone();

        std::thread::spawn(move || {
            let Ok(guest) = GuestMailbox::new(mailbox, RamAddr(0)) else {
                return 0;
            };

            let mut pages = 0;
            while let Ok(command) = guest.poll_command(PollBudget::new(idle)) {
                let (ret, header, data) = match command.command {
                    Ok(Command::Init | Command::Reset) => (RET_OK, Vec::new(), Vec::new()),
                    Ok(_) => {
                        pages += 1;
                        handle(&guest, &ram, &command)
                    }
                    Err(_) => (RET_MALFORMED, Vec::new(), Vec::new()),
                };

                if guest.complete(ret, &header, &data).is_err()
                    || command.command == Ok(Command::Reset)
                {
                    break;
                }
            }

            pages
        })
    }
}

fn xor(data: &mut [u8]) {
    data.iter_mut().for_each(|byte| *byte ^= KEY);
}

/// Encrypts the requested page of the guest.
fn save(_: &GuestMailbox, ram: &RamBlock, command: &MailboxCommand) -> (u32, Vec<u8>, Vec<u8>) {
    if command.command != Ok(Command::SavePage) {
        return (RET_MALFORMED, Vec::new(), Vec::new());
    }

    let mut data = vec![0; PAGE_SIZE as usize];
    if ram.read_page(RamAddr(command.gpa - RAM_GPA), &mut data).is_err() {
        return (RET_MALFORMED, Vec::new(), Vec::new());
    }

    xor(&mut data);
    (RET_OK, command.gpa.0.to_be_bytes().to_vec(), data)
}

/// Decrypts the page the host placed in the mailbox into the guest.
fn load(guest: &GuestMailbox, ram: &RamBlock, command: &MailboxCommand) -> (u32, Vec<u8>, Vec<u8>) {
    let Ok(mut page) = guest.request() else {
        return (RET_MALFORMED, Vec::new(), Vec::new());
    };

    if command.command != Ok(Command::LoadPage) || page.header != command.gpa.0.to_be_bytes() {
        return (RET_MALFORMED, Vec::new(), Vec::new());
    }

    xor(&mut page.data);
    match ram.write_page(RamAddr(command.gpa - RAM_GPA), &page.data) {
        Ok(()) => (RET_OK, Vec::new(), Vec::new()),
        Err(_) => (RET_MALFORMED, Vec::new(), Vec::new()),
    }
}

fn config() -> MigrationConfig {
    MigrationConfig::default().with_multifd(
        MultifdConfig::default()
            .with_channels(2)
            .with_compression(Compression::Zlib),
    )
}

////////////////////////////////////////////////////////////////////////////////
// Transfer
////////////////////////////////////////////////////////////////////////////////

#[test]
fn pages_move_through_both_helpers() -> Result<(), MigrationError> {
    common::init_tracing();

    let source = ConfidentialVm::new(config(), 64)?;
    let destination = ConfidentialVm::new(config(), 64)?;
    fill(&source.vm.ram, 0x44)?;

    let source_helper = source.spawn_helper(Duration::from_secs(5), save);
    let destination_helper = destination.spawn_helper(Duration::from_secs(5), load);

    let (send_ends, recv_ends) = channels(2);
    let mut outgoing = source.vm.engine.start_outgoing(send_ends)?;
    let incoming = destination.vm.engine.start_incoming()?;
    for end in recv_ends {
        incoming.accept(end)?;
    }

    outgoing.send_block(&source.vm.ram)?;
    let sent = outgoing.finish()?;
    incoming.finish()?;

    assert_same(&source.vm, &destination.vm)?;

    // Encrypted pages are opaque: zero pages travel like any other page.
    assert_eq!(sent.iter().map(|s| s.normal_pages).sum::<u64>(), 64);
    assert_eq!(sent.iter().map(|s| s.zero_pages).sum::<u64>(), 0);

    source.vm.engine.shutdown();
    destination.vm.engine.shutdown();

    assert_eq!(source_helper.join().ok(), Some(64));
    assert_eq!(destination_helper.join().ok(), Some(64));

    assert_eq!(source.vm.engine.status(), MigrationStatus::Completed);
    assert_eq!(destination.vm.engine.status(), MigrationStatus::Completed);
    Ok(())
}

#[test]
fn rejected_page_fails_the_destination() -> Result<(), MigrationError> {
    let source = ConfidentialVm::new(config(), 16)?;
    let destination = ConfidentialVm::new(config(), 16)?;
    fill(&source.vm.ram, 0x55)?;

    let source_helper = source.spawn_helper(Duration::from_secs(1), save);
    let destination_helper =
        destination.spawn_helper(Duration::from_secs(1), |_, _, _| (7, Vec::new(), Vec::new()));

    let (send_ends, recv_ends) = channels(2);
    let mut outgoing = source.vm.engine.start_outgoing(send_ends)?;
    let incoming = destination.vm.engine.start_incoming()?;
    for end in recv_ends {
        incoming.accept(end)?;
    }

    // The source may or may not notice before its last write.
    if outgoing.send_block(&source.vm.ram).is_ok() {
        let _ = outgoing.finish();
    }

    assert!(incoming.finish().is_err());
    match destination.vm.engine.status() {
        MigrationStatus::Failed { reason } => {
            assert!(reason.contains("confidential helper"), "{reason}")
        }
        status => panic!("unexpected status {status:?}"),
    }

    let bridge = destination.vm.engine.bridge();
    assert!(bridge.is_some_and(|bridge| bridge.is_poisoned()));

    source.vm.engine.shutdown();
    destination.vm.engine.shutdown();
    let _ = source_helper.join();
    let _ = destination_helper.join();
    Ok(())
}
