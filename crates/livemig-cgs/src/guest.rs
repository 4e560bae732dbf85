use std::sync::{
    Arc,
    atomic::{Ordering, fence},
};

use livemig_core::{EncryptedPage, Gpa, MigrationError, PollBudget, RamAddr, RamBlock};

use crate::mailbox::{Command, Mailbox};

/// A command received by the in-guest helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxCommand {
    /// The command, or the raw type of an unknown command.
    pub command: Result<Command, u16>,

    /// The guest physical address the command refers to.
    pub gpa: Gpa,

    /// Number of pages the host will request next.
    pub prefetch: u16,
}

/// Guest side of the confidential RAM mailbox.
pub struct GuestMailbox {
    mailbox: Mailbox,
}

impl GuestMailbox {
    /// Attaches to the mailbox at `offset` in `block`.
    pub fn new(block: Arc<RamBlock>, offset: RamAddr) -> Result<Self, MigrationError> {
        Ok(Self {
            mailbox: Mailbox::new(block, offset)?,
        })
    }

    /// Returns the next command if the host raised `go`.
    pub fn try_command(&self) -> Option<MailboxCommand> {
        let go = self.mailbox.go();

        if go.load(Ordering::Acquire) != 1 {
            return None;
        }

        go.store(0, Ordering::Relaxed);
        let record = self.mailbox.read_request();

        Some(MailboxCommand {
            command: Command::try_from(record.cmd_type.get()),
            gpa: Gpa(record.gpa.get()),
            prefetch: record.prefetch.get(),
        })
    }

    /// Waits for the next command.
    pub fn poll_command(&self, budget: PollBudget) -> Result<MailboxCommand, MigrationError> {
        let mut command = None;
        budget.poll_until(|| {
            command = self.try_command();
            command.is_some()
        })?;

        command.ok_or(MigrationError::Timeout)
    }

    /// Returns the page the host placed in the mailbox for `LOAD_PAGE`.
    pub fn request(&self) -> Result<EncryptedPage, MigrationError> {
        self.mailbox.read_payload()
    }

    /// Completes the current command with status `ret` and a response.
    pub fn complete(&self, ret: u32, header: &[u8], data: &[u8]) -> Result<(), MigrationError> {
        self.mailbox.write_payload(header, data)?;
        self.mailbox.write_ret(ret);

        fence(Ordering::SeqCst);
        self.mailbox.done().store(1, Ordering::Release);
        Ok(())
    }
}
