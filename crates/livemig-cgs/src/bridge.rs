use std::{
    sync::{
        Arc,
        atomic::{Ordering, fence},
    },
    time::Duration,
};

use livemig_core::{
    EncryptedPage, Gpa, MigrationError, PageEncryption, PollBudget, RamAddr, RamBlock,
};
use parking_lot::Mutex;

use crate::mailbox::{Command, Mailbox, RET_OK};

#[derive(Debug, Default)]
struct BridgeState {
    initialized: bool,
    poisoned: bool,
}

/// Host side of the confidential RAM mailbox.
///
/// Commands are serialized: the mailbox holds one command at a time, so
/// concurrent callers queue on an internal lock. The first command sends an
/// implicit `INIT`. A timeout or a nonzero status poisons the bridge, and
/// every later command fails without touching the mailbox.
pub struct ConfidentialRamBridge {
    mailbox: Mailbox,
    budget: PollBudget,
    state: Mutex<BridgeState>,
}

impl ConfidentialRamBridge {
    /// Default time the helper has to complete one command.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

    /// Creates a bridge over the mailbox at `offset` in `block`.
    pub fn new(block: Arc<RamBlock>, offset: RamAddr) -> Result<Self, MigrationError> {
        Ok(Self {
            mailbox: Mailbox::new(block, offset)?,
            budget: PollBudget::new(Self::DEFAULT_TIMEOUT),
            state: Mutex::new(BridgeState::default()),
        })
    }

    /// Sets the time the helper has to complete one command.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            budget: PollBudget::new(timeout),
            ..self
        }
    }

    /// Returns the guest physical address of the mailbox.
    pub fn mailbox_gpa(&self) -> Gpa {
        self.mailbox.gpa()
    }

    /// Returns `true` after a failed command.
    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }

    /// Asks the helper for the ciphertext of the page at `gpa`.
    ///
    /// `prefetch` tells the helper how many following pages the host is
    /// about to request.
    pub fn encrypt_page_prefetch(
        &self,
        gpa: Gpa,
        prefetch: u16,
    ) -> Result<EncryptedPage, MigrationError> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state)?;
        self.execute(&mut state, Command::SavePage, gpa, prefetch)?;

        let page = match self.mailbox.read_payload() {
            Ok(page) if page.data.len() == self.mailbox.data_capacity() => page,
            _ => return Err(self.malformed(&mut state, Command::SavePage, gpa)),
        };

        Ok(page)
    }

    /// Hands a received page to the helper for installation at `gpa`.
    pub fn load_page(&self, gpa: Gpa, page: &EncryptedPage) -> Result<(), MigrationError> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state)?;

        self.mailbox.write_payload(&page.header, &page.data)?;
        self.execute(&mut state, Command::LoadPage, gpa, 0)
    }

    /// Ends the session with the helper.
    ///
    /// A bridge that never sent `INIT` sends nothing. After a reset, the
    /// next command starts a new session.
    pub fn reset(&self) -> Result<(), MigrationError> {
        let mut state = self.state.lock();

        if !state.initialized {
            return Ok(());
        }

        self.execute(&mut state, Command::Reset, Gpa(0), 0)?;
        state.initialized = false;

        tracing::debug!(mailbox = %self.mailbox.gpa(), "confidential helper reset");
        Ok(())
    }

    fn ensure_initialized(&self, state: &mut BridgeState) -> Result<(), MigrationError> {
        if state.initialized {
            return Ok(());
        }

        self.execute(state, Command::Init, Gpa(0), 0)?;
        state.initialized = true;

        tracing::debug!(mailbox = %self.mailbox.gpa(), "confidential helper initialized");
        Ok(())
    }

    fn execute(
        &self,
        state: &mut BridgeState,
        command: Command,
        gpa: Gpa,
        prefetch: u16,
    ) -> Result<(), MigrationError> {
        if state.poisoned {
            return Err(MigrationError::Aborted(format!(
                "confidential helper unavailable for {}",
                command.name()
            )));
        }

        let done = self.mailbox.done();
        done.store(0, Ordering::Relaxed);
        self.mailbox.write_request(command, gpa, prefetch);

        fence(Ordering::SeqCst);
        self.mailbox.go().store(1, Ordering::Release);

        if self
            .budget
            .poll_until(|| done.load(Ordering::Acquire) == 1)
            .is_err()
        {
            state.poisoned = true;
            tracing::error!(command = command.name(), %gpa, timeout = ?self.budget.timeout(), "confidential helper timed out");

            return Err(MigrationError::ConfidentialHelperTimeout {
                command: command.name(),
                gpa,
            });
        }

        let ret = self.mailbox.ret();
        if ret != RET_OK {
            state.poisoned = true;
            tracing::error!(command = command.name(), %gpa, ret, "confidential helper rejected command");

            return Err(MigrationError::ConfidentialHelperNack {
                command: command.name(),
                gpa,
                ret,
            });
        }

        tracing::trace!(command = command.name(), %gpa, "confidential helper command done");
        Ok(())
    }

    fn malformed(&self, state: &mut BridgeState, command: Command, gpa: Gpa) -> MigrationError {
        state.poisoned = true;
        tracing::error!(command = command.name(), %gpa, "malformed confidential helper response");

        MigrationError::ConfidentialHelperNack {
            command: command.name(),
            gpa,
            ret: crate::RET_MALFORMED,
        }
    }
}

impl PageEncryption for ConfidentialRamBridge {
    fn encrypt_page(&self, gpa: Gpa) -> Result<EncryptedPage, MigrationError> {
        self.encrypt_page_prefetch(gpa, 0)
    }

    fn decrypt_page(&self, gpa: Gpa, page: &EncryptedPage) -> Result<(), MigrationError> {
        self.load_page(gpa, page)
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
