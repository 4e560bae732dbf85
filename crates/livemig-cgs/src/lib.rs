//! Confidential guest RAM bridge.
//!
//! The host cannot read the memory of a confidential guest, so pages are
//! exported and imported by a cooperating helper running inside the guest.
//! Host and helper talk through a mailbox of two reserved guest pages:
//!
//! | offset   | contents                                            |
//! |----------|-----------------------------------------------------|
//! | `0x000`  | command record `{cmd_type, prefetch, gpa, ret, go, done}` |
//! | `0x800`  | header area `{hdr_len: u32, data_len: u32, hdr[..]}` |
//! | `0x1000` | data area, one page                                 |
//!
//! All fields are packed little-endian. The host fills in the command,
//! raises `go` and polls `done`; the helper polls `go`, executes the
//! command, writes its response and raises `done`.

mod bridge;
mod guest;
mod mailbox;

pub use self::{
    bridge::ConfidentialRamBridge,
    guest::{GuestMailbox, MailboxCommand},
    mailbox::{Command, DATA_OFFSET, HEADER_CAPACITY, HEADER_OFFSET, RET_MALFORMED, RET_OK},
};
