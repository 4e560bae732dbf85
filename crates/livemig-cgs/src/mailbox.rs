use std::sync::{Arc, atomic::AtomicU8};

use livemig_core::{EncryptedPage, Gpa, MigrationError, RamAddr, RamBlock};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U16, U32, U64},
};

/// Offset of the header area inside the mailbox.
pub const HEADER_OFFSET: usize = 0x800;

/// Offset of the data area inside the mailbox.
pub const DATA_OFFSET: usize = 0x1000;

/// Largest header the header area can hold.
pub const HEADER_CAPACITY: usize = DATA_OFFSET - HEADER_OFFSET - size_of::<AreaHeader>();

/// Status of a successful command.
pub const RET_OK: u32 = 0;

/// Status reported when a response does not fit the mailbox.
pub const RET_MALFORMED: u32 = u32::MAX;

const GO_OFFSET: usize = 16;
const DONE_OFFSET: usize = 17;

/// Bytes of the command record written by the host, up to `go`.
const REQUEST_LEN: usize = GO_OFFSET;

/// A mailbox command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// Prepares the helper for a migration.
    Init = 1,

    /// Encrypts the page at `gpa` into the mailbox.
    SavePage = 2,

    /// Decrypts the page in the mailbox into `gpa`.
    LoadPage = 3,

    /// Ends the migration.
    Reset = 4,
}

impl Command {
    /// Returns the name of the command.
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::SavePage => "SAVE_PAGE",
            Self::LoadPage => "LOAD_PAGE",
            Self::Reset => "RESET",
        }
    }
}

impl TryFrom<u16> for Command {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Init),
            2 => Ok(Self::SavePage),
            3 => Ok(Self::LoadPage),
            4 => Ok(Self::Reset),
            other => Err(other),
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct CommandRecord {
    pub cmd_type: U16,
    pub prefetch: U16,
    pub gpa: U64,
    pub ret: U32,
    pub go: u8,
    pub done: u8,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct AreaHeader {
    pub hdr_len: U32,
    pub data_len: U32,
}

const _: () = assert!(size_of::<CommandRecord>() == 18);
const _: () = assert!(size_of::<AreaHeader>() == 8);

/// The mailbox pages as seen from the host.
///
/// Flags are accessed atomically, everything else with volatile copies.
pub(crate) struct Mailbox {
    block: Arc<RamBlock>,
    offset: RamAddr,
    base: *mut u8,
    data_capacity: usize,
}

// SAFETY: `base` points into the mapping of `block`, which the mailbox
// keeps alive. Concurrent access is coordinated by the go/done protocol.
unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    pub fn new(block: Arc<RamBlock>, offset: RamAddr) -> Result<Self, MigrationError> {
        if !offset.is_aligned(block.page_size()) {
            return Err(MigrationError::invalid_parameter(
                "mailbox",
                format!("offset {offset} is not page aligned"),
            ));
        }

        let data_capacity = block.page_size() as usize;
        let len = DATA_OFFSET + data_capacity;

        if offset.0 + len as u64 > block.used_length() {
            return Err(MigrationError::OutOfBounds);
        }

        let base = block.memory().ptr_at(offset.0, len)?;

        Ok(Self {
            block,
            offset,
            base,
            data_capacity,
        })
    }

    pub fn gpa(&self) -> Gpa {
        self.block.gpa_of(self.offset)
    }

    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }

    pub fn go(&self) -> &AtomicU8 {
        // SAFETY: In bounds, and `u8` has no alignment requirement.
        unsafe { AtomicU8::from_ptr(self.base.add(GO_OFFSET)) }
    }

    pub fn done(&self) -> &AtomicU8 {
        // SAFETY: In bounds, and `u8` has no alignment requirement.
        unsafe { AtomicU8::from_ptr(self.base.add(DONE_OFFSET)) }
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= DATA_OFFSET + self.data_capacity);

        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: Bounds were checked when the mailbox was created.
            *byte = unsafe { self.base.add(offset + i).read_volatile() };
        }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= DATA_OFFSET + self.data_capacity);

        for (i, byte) in data.iter().enumerate() {
            // SAFETY: Bounds were checked when the mailbox was created.
            unsafe { self.base.add(offset + i).write_volatile(*byte) };
        }
    }

    /// Writes `cmd_type`, `prefetch` and `gpa`, and clears `ret`.
    pub fn write_request(&self, command: Command, gpa: Gpa, prefetch: u16) {
        let record = CommandRecord {
            cmd_type: U16::new(command as u16),
            prefetch: U16::new(prefetch),
            gpa: U64::new(gpa.0),
            ..Default::default()
        };

        self.write(0, &record.as_bytes()[..REQUEST_LEN]);
    }

    pub fn read_request(&self) -> CommandRecord {
        let mut buf = [0u8; size_of::<CommandRecord>()];
        self.read(0, &mut buf);
        CommandRecord::read_from_bytes(&buf).unwrap_or_default()
    }

    pub fn write_ret(&self, ret: u32) {
        self.write(12, U32::new(ret).as_bytes());
    }

    pub fn ret(&self) -> u32 {
        self.read_request().ret.get()
    }

    /// Fills the header and data areas.
    pub fn write_payload(&self, header: &[u8], data: &[u8]) -> Result<(), MigrationError> {
        if header.len() > HEADER_CAPACITY || data.len() > self.data_capacity {
            return Err(MigrationError::OutOfBounds);
        }

        let area = AreaHeader {
            hdr_len: U32::new(header.len() as u32),
            data_len: U32::new(data.len() as u32),
        };

        self.write(HEADER_OFFSET, area.as_bytes());
        self.write(HEADER_OFFSET + size_of::<AreaHeader>(), header);
        self.write(DATA_OFFSET, data);
        Ok(())
    }

    /// Reads the header and data areas.
    pub fn read_payload(&self) -> Result<EncryptedPage, MigrationError> {
        let mut buf = [0u8; size_of::<AreaHeader>()];
        self.read(HEADER_OFFSET, &mut buf);

        let area = AreaHeader::read_from_bytes(&buf).unwrap_or_default();
        let hdr_len = area.hdr_len.get() as usize;
        let data_len = area.data_len.get() as usize;

        if hdr_len > HEADER_CAPACITY || data_len > self.data_capacity {
            return Err(MigrationError::OutOfBounds);
        }

        let mut page = EncryptedPage {
            header: vec![0; hdr_len],
            data: vec![0; data_len],
        };

        self.read(HEADER_OFFSET + size_of::<AreaHeader>(), &mut page.header);
        self.read(DATA_OFFSET, &mut page.data);
        Ok(page)
    }
}
