use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use livemig_core::{EncryptedPage, Gpa, MigrationError, PollBudget, RamAddr, RamBlock};

use super::*;
use crate::{Command, GuestMailbox, MailboxCommand, RET_OK};

const PAGE_SIZE: usize = 4096;
const MAILBOX_GPA: Gpa = Gpa(0xf000_0000);

/// Ciphertext the fake helper produces for `gpa`.
fn fixture_page(gpa: Gpa) -> Vec<u8> {
    let seed = (gpa.0 >> 12) as u8;
    (0..PAGE_SIZE).map(|i| seed ^ (i as u8)).collect()
}

fn fixture_header(gpa: Gpa) -> Vec<u8> {
    gpa.0.to_le_bytes().to_vec()
}

fn mailbox_block() -> Result<Arc<RamBlock>, MigrationError> {
    Ok(Arc::new(RamBlock::new(
        "cgs-mailbox",
        MAILBOX_GPA,
        PAGE_SIZE as u64,
        2 * PAGE_SIZE as u64,
    )?))
}

/// Runs a fake helper until `RESET` or until it answered `limit` commands,
/// answering with `reply`.
///
/// Returns the commands it received.
fn spawn_helper<F>(
    block: Arc<RamBlock>,
    limit: usize,
    mut reply: F,
) -> JoinHandle<Vec<MailboxCommand>>
where
    F: FnMut(&GuestMailbox, &MailboxCommand) -> (u32, Vec<u8>, Vec<u8>) + Send + 'static,
{
    std::thread::spawn(move || {
        let guest = GuestMailbox::new(block, RamAddr(0)).expect("guest mailbox");
        let mut seen = Vec::new();

        while let Ok(command) = guest.poll_command(PollBudget::new(Duration::from_secs(5))) {
            let (ret, header, data) = reply(&guest, &command);
            guest.complete(ret, &header, &data).expect("complete");

            seen.push(command);
            if command.command == Ok(Command::Reset) || seen.len() == limit {
                break;
            }
        }

        seen
    })
}

/// Encrypts by returning the fixture for the requested page.
fn echo(_: &GuestMailbox, command: &MailboxCommand) -> (u32, Vec<u8>, Vec<u8>) {
    match command.command {
        Ok(Command::SavePage) => (RET_OK, fixture_header(command.gpa), fixture_page(command.gpa)),
        _ => (RET_OK, Vec::new(), Vec::new()),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Protocol
////////////////////////////////////////////////////////////////////////////////

#[test]
fn echo_helper_matches_fixture() -> Result<(), MigrationError> {
    let block = mailbox_block()?;
    let helper = spawn_helper(block.clone(), usize::MAX, echo);

    let bridge = ConfidentialRamBridge::new(block, RamAddr(0))?
        .with_timeout(Duration::from_secs(5));
    assert_eq!(bridge.mailbox_gpa(), MAILBOX_GPA);

    for gpa in [Gpa(0x1000), Gpa(0x7_3000)] {
        let page = bridge.encrypt_page(gpa)?;
        assert_eq!(page.data, fixture_page(gpa));
        assert_eq!(page.header, fixture_header(gpa));
    }

    bridge.reset()?;

    let seen = helper.join().expect("helper thread");
    let commands = seen.iter().map(|c| c.command).collect::<Vec<_>>();
    assert_eq!(
        commands,
        [
            Ok(Command::Init),
            Ok(Command::SavePage),
            Ok(Command::SavePage),
            Ok(Command::Reset)
        ]
    );
    assert_eq!(seen[2].gpa, Gpa(0x7_3000));
    Ok(())
}

#[test]
fn silent_helper_times_out() -> Result<(), MigrationError> {
    let bridge = ConfidentialRamBridge::new(mailbox_block()?, RamAddr(0))?;

    let start = Instant::now();
    let result = bridge.encrypt_page(Gpa(0x1000));
    let elapsed = start.elapsed();

    assert!(matches!(
        result,
        Err(MigrationError::ConfidentialHelperTimeout { command: "INIT", .. })
    ));
    assert!(elapsed >= ConfidentialRamBridge::DEFAULT_TIMEOUT);
    assert!(elapsed < ConfidentialRamBridge::DEFAULT_TIMEOUT + Duration::from_millis(400));

    // Not retried.
    assert!(bridge.is_poisoned());
    assert!(matches!(
        bridge.encrypt_page(Gpa(0x1000)),
        Err(MigrationError::Aborted(_))
    ));
    Ok(())
}

#[test]
fn nonzero_status_is_fatal() -> Result<(), MigrationError> {
    let block = mailbox_block()?;
    let helper = spawn_helper(block.clone(), 2, |_, command| match command.command {
        Ok(Command::SavePage) => (7, Vec::new(), Vec::new()),
        _ => (RET_OK, Vec::new(), Vec::new()),
    });

    let bridge = ConfidentialRamBridge::new(block, RamAddr(0))?
        .with_timeout(Duration::from_secs(5));

    assert!(matches!(
        bridge.encrypt_page(Gpa(0x2000)),
        Err(MigrationError::ConfidentialHelperNack {
            command: "SAVE_PAGE",
            ret: 7,
            ..
        })
    ));
    assert!(bridge.is_poisoned());
    assert!(bridge.reset().is_err());

    assert_eq!(helper.join().expect("helper thread").len(), 2);
    Ok(())
}

#[test]
fn short_ciphertext_is_rejected() -> Result<(), MigrationError> {
    let block = mailbox_block()?;
    let helper = spawn_helper(block.clone(), 2, |_, command| match command.command {
        Ok(Command::SavePage) => (RET_OK, Vec::new(), vec![0; 100]),
        _ => (RET_OK, Vec::new(), Vec::new()),
    });

    let bridge = ConfidentialRamBridge::new(block, RamAddr(0))?
        .with_timeout(Duration::from_secs(5));

    assert!(matches!(
        bridge.encrypt_page(Gpa(0x2000)),
        Err(MigrationError::ConfidentialHelperNack {
            ret: crate::RET_MALFORMED,
            ..
        })
    ));
    assert!(bridge.is_poisoned());

    helper.join().expect("helper thread");
    Ok(())
}

#[test]
fn load_page_reaches_guest() -> Result<(), MigrationError> {
    let block = mailbox_block()?;
    let guest_ram = Arc::new(RamBlock::new("guest", Gpa(0), PAGE_SIZE as u64, 16 * PAGE_SIZE as u64)?);

    let helper = {
        let guest_ram = guest_ram.clone();
        spawn_helper(block.clone(), usize::MAX, move |guest, command| {
            if command.command == Ok(Command::LoadPage) {
                let page = guest.request().expect("request");
                let plain = page.data.iter().map(|b| b ^ 0xff).collect::<Vec<_>>();
                guest_ram
                    .write_page(RamAddr(command.gpa.0), &plain)
                    .expect("install page");
            }

            (RET_OK, Vec::new(), Vec::new())
        })
    };

    let bridge = ConfidentialRamBridge::new(block, RamAddr(0))?
        .with_timeout(Duration::from_secs(5));

    let page = EncryptedPage {
        header: vec![1, 2, 3],
        data: vec![0xff ^ 0x42; PAGE_SIZE],
    };
    bridge.decrypt_page(Gpa(0x3000), &page)?;
    bridge.reset()?;
    helper.join().expect("helper thread");

    let mut buf = vec![0u8; PAGE_SIZE];
    guest_ram.read_page(RamAddr(0x3000), &mut buf)?;
    assert!(buf.iter().all(|&b| b == 0x42));
    Ok(())
}

#[test]
fn reset_without_session_is_silent() -> Result<(), MigrationError> {
    let bridge = ConfidentialRamBridge::new(mailbox_block()?, RamAddr(0))?;
    bridge.reset()?;
    assert!(!bridge.is_poisoned());
    Ok(())
}
