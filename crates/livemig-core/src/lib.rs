//! Core types of the live-migration data plane.
//!
//! This crate holds everything the sampler, the dirty limit controller, the
//! multifd channels and the confidential RAM bridge have in common: address
//! newtypes, RAM blocks and their provider, the error type, the clock and
//! polling primitives, and the byte-stream transport.

mod addr;
mod clock;
mod encryption;
mod error;
pub(crate) mod macros;
mod provider;
mod ramblock;
mod sync;
mod transport;
mod wait;

pub use self::{
    addr::{Gfn, Gpa, RamAddr, VcpuId},
    clock::{Clock, ManualClock, SystemClock},
    encryption::{EncryptedPage, PageEncryption},
    error::MigrationError,
    provider::{RamBlockList, RamBlockProvider},
    ramblock::{HostMemory, RamBlock, RamBlockGeometry},
    sync::Semaphore,
    transport::{Pipe, Transport, pipe, pipe_with_capacity},
    wait::{PollBudget, wait_window},
};

/// Number of bytes in a mebibyte.
pub const MIB: u64 = 1 << 20;

/// Number of bytes in a gibibyte.
pub const GIB: u64 = 1 << 30;
