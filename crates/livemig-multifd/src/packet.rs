//! Wire format of the multifd channels.
//!
//! Every channel starts with one [`InitPacket`]. After that, the channel
//! carries a sequence of packets, each laid out as:
//!
//! | part | size |
//! |---|---|
//! | [`PacketHeader`] | 296 bytes |
//! | normal page offsets | `normal_pages * 8` |
//! | zero page offsets | `zero_pages * 8` |
//! | auxiliary data | `aux_size` |
//! | payload | `next_packet_size` |
//!
//! All integers are big-endian.

use livemig_core::{MigrationError, RamAddr};
use serde::{Deserialize, Serialize};
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U32, U64},
};

/// Magic number opening every packet.
pub const MULTIFD_MAGIC: u32 = 0x1122_3344;

/// Version of the wire format.
pub const MULTIFD_VERSION: u32 = 1;

/// Length of the RAM block id field.
pub const RAMBLOCK_ID_LEN: usize = 256;

bitflags::bitflags! {
    /// Flags of a multifd packet.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PacketFlags: u32 {
        /// The sender reached a synchronization point.
        const SYNC = 1 << 0;

        /// Bits holding the compression code.
        const COMPRESSION_MASK = 0b1_1110;

        /// The pages were encrypted by the guest.
        const ENCRYPTED = 1 << 5;
    }
}

impl PacketFlags {
    /// Position of the compression code.
    pub const COMPRESSION_SHIFT: u32 = 1;
}

bitflags::bitflags! {
    /// Features announced in the channel handshake.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ChannelFeatures: u32 {
        /// Zero pages are elided from the payload.
        const ZERO_PAGE = 1 << 0;

        /// Pages are encrypted by an in-guest helper.
        const ENCRYPTED = 1 << 1;
    }
}

/// The first message on every channel.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct InitPacket {
    magic: U32,
    version: U32,
    uuid: [u8; 16],
    id: u8,
    reserved1: [u8; 3],
    features: U32,
    reserved2: [u8; 32],
}

const _: () = assert!(size_of::<InitPacket>() == 64);

impl InitPacket {
    /// Creates the handshake of channel `id`.
    pub fn new(id: u8, uuid: [u8; 16], features: ChannelFeatures) -> Self {
        let mut packet = Self::new_zeroed();
        packet.magic = U32::new(MULTIFD_MAGIC);
        packet.version = U32::new(MULTIFD_VERSION);
        packet.uuid = uuid;
        packet.id = id;
        packet.features = U32::new(features.bits());
        packet
    }

    /// Decodes a handshake.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        Self::read_from_bytes(bytes).map_err(|_| MigrationError::OutOfBounds)
    }

    /// Returns the channel id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Returns the announced features.
    pub fn features(&self) -> ChannelFeatures {
        ChannelFeatures::from_bits_retain(self.features.get())
    }

    /// Checks the handshake against the receiver's expectations and returns
    /// the channel id.
    pub fn validate(
        &self,
        uuid: &[u8; 16],
        channels: u8,
        features: ChannelFeatures,
    ) -> Result<u8, MigrationError> {
        let magic = self.magic.get();
        if magic != MULTIFD_MAGIC {
            return Err(MigrationError::protocol(
                self.id,
                format!("received packet magic {magic:#x} expected {MULTIFD_MAGIC:#x}"),
            ));
        }

        let version = self.version.get();
        if version != MULTIFD_VERSION {
            return Err(MigrationError::protocol(
                self.id,
                format!("received packet version {version} expected {MULTIFD_VERSION}"),
            ));
        }

        if &self.uuid != uuid {
            return Err(MigrationError::protocol(
                self.id,
                format!(
                    "received uuid {} expected {}",
                    format_uuid(&self.uuid),
                    format_uuid(uuid)
                ),
            ));
        }

        if self.id >= channels {
            return Err(MigrationError::protocol(
                self.id,
                format!("channel id is not below the number of channels {channels}"),
            ));
        }

        if self.features() != features {
            return Err(MigrationError::protocol(
                self.id,
                format!(
                    "channel features {:?} do not match {:?}",
                    self.features(),
                    features
                ),
            ));
        }

        Ok(self.id)
    }
}

/// The fixed part of a packet.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PacketHeader {
    magic: U32,
    version: U32,
    flags: U32,
    next_packet_size: U32,
    pages_alloc: U32,
    normal_pages: U32,
    zero_pages: U32,
    aux_size: U32,
    packet_num: U64,
    ramblock: [u8; RAMBLOCK_ID_LEN],
}

const _: () = assert!(size_of::<PacketHeader>() == 296);

/// Size of [`PacketHeader`] on the wire.
pub const PACKET_HEADER_SIZE: usize = size_of::<PacketHeader>();

impl PacketHeader {
    /// Creates an empty header carrying `flags`.
    pub fn new(flags: PacketFlags, pages_alloc: u32, packet_num: u64) -> Self {
        let mut header = Self::new_zeroed();
        header.magic = U32::new(MULTIFD_MAGIC);
        header.version = U32::new(MULTIFD_VERSION);
        header.flags = U32::new(flags.bits());
        header.pages_alloc = U32::new(pages_alloc);
        header.packet_num = U64::new(packet_num);
        header
    }

    /// Sets the RAM block of the pages.
    ///
    /// Ids longer than the field are truncated; block ids never are.
    pub fn with_ramblock(mut self, id: &str) -> Self {
        let len = id.len().min(RAMBLOCK_ID_LEN - 1);
        self.ramblock[..len].copy_from_slice(&id.as_bytes()[..len]);
        self
    }

    /// Sets the page counts.
    pub fn with_pages(mut self, normal_pages: u32, zero_pages: u32) -> Self {
        self.normal_pages = U32::new(normal_pages);
        self.zero_pages = U32::new(zero_pages);
        self
    }

    /// Sets the auxiliary and payload sizes.
    pub fn with_sizes(mut self, aux_size: u32, next_packet_size: u32) -> Self {
        self.aux_size = U32::new(aux_size);
        self.next_packet_size = U32::new(next_packet_size);
        self
    }

    /// Decodes a header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        Self::read_from_bytes(bytes).map_err(|_| MigrationError::OutOfBounds)
    }

    /// Returns the packet flags.
    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits_retain(self.flags.get())
    }

    /// Returns the payload size.
    pub fn next_packet_size(&self) -> u32 {
        self.next_packet_size.get()
    }

    /// Returns the capacity of the sender's batch.
    pub fn pages_alloc(&self) -> u32 {
        self.pages_alloc.get()
    }

    /// Returns the number of normal pages.
    pub fn normal_pages(&self) -> u32 {
        self.normal_pages.get()
    }

    /// Returns the number of zero pages.
    pub fn zero_pages(&self) -> u32 {
        self.zero_pages.get()
    }

    /// Returns the size of the auxiliary data.
    pub fn aux_size(&self) -> u32 {
        self.aux_size.get()
    }

    /// Returns the global packet number.
    pub fn packet_num(&self) -> u64 {
        self.packet_num.get()
    }

    /// Returns the RAM block id, up to the first NUL.
    pub fn ramblock(&self) -> &[u8] {
        let field = &self.ramblock[..RAMBLOCK_ID_LEN - 1];
        let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        &field[..len]
    }

    /// Checks the header against the receiver's page count.
    pub fn validate(&self, channel: u8, page_count: u32) -> Result<(), MigrationError> {
        let magic = self.magic.get();
        if magic != MULTIFD_MAGIC {
            return Err(MigrationError::protocol(
                channel,
                format!("received packet magic {magic:#x} and expected magic {MULTIFD_MAGIC:#x}"),
            ));
        }

        let version = self.version.get();
        if version != MULTIFD_VERSION {
            return Err(MigrationError::protocol(
                channel,
                format!(
                    "received packet version {version} and expected version {MULTIFD_VERSION}"
                ),
            ));
        }

        let pages_alloc = self.pages_alloc();
        if pages_alloc > page_count {
            return Err(MigrationError::protocol(
                channel,
                format!(
                    "received packet with size {pages_alloc} and expected a size of {page_count}"
                ),
            ));
        }

        let pages = u64::from(self.normal_pages()) + u64::from(self.zero_pages());
        if pages > u64::from(pages_alloc) {
            return Err(MigrationError::protocol(
                channel,
                format!(
                    "received packet with {pages} pages and expected maximum pages are {pages_alloc}"
                ),
            ));
        }

        Ok(())
    }
}

/// Appends `offsets` to `out` in wire order.
pub fn encode_offsets(offsets: &[RamAddr], out: &mut Vec<u8>) {
    for offset in offsets {
        out.extend_from_slice(U64::new(offset.0).as_bytes());
    }
}

/// Decodes the offsets that follow a header.
pub fn decode_offsets(bytes: &[u8], out: &mut Vec<RamAddr>) -> Result<(), MigrationError> {
    let offsets = <[U64]>::ref_from_bytes(bytes).map_err(|_| MigrationError::OutOfBounds)?;
    out.extend(offsets.iter().map(|offset| RamAddr(offset.get())));
    Ok(())
}

/// Appends the per-page encryption headers to `out`, each prefixed with its
/// length.
pub fn encode_aux(headers: &[Vec<u8>], out: &mut Vec<u8>) {
    for header in headers {
        out.extend_from_slice(U32::new(header.len() as u32).as_bytes());
        out.extend_from_slice(header);
    }
}

/// Splits auxiliary data into exactly `count` per-page headers.
pub fn decode_aux(mut bytes: &[u8], count: usize) -> Result<Vec<&[u8]>, MigrationError> {
    let mut headers = Vec::with_capacity(count);

    while !bytes.is_empty() {
        let (len, rest) = U32::read_from_prefix(bytes).map_err(|_| MigrationError::OutOfBounds)?;
        let len = len.get() as usize;
        if len > rest.len() {
            return Err(MigrationError::OutOfBounds);
        }

        let (header, rest) = rest.split_at(len);
        headers.push(header);
        bytes = rest;
    }

    if headers.len() != count {
        return Err(MigrationError::OutOfBounds);
    }

    Ok(headers)
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let mut result = String::with_capacity(36);
    for (index, byte) in uuid.iter().enumerate() {
        if matches!(index, 4 | 6 | 8 | 10) {
            result.push('-');
        }
        result.push_str(&format!("{byte:02x}"));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() -> Result<(), MigrationError> {
        let header = PacketHeader::new(PacketFlags::SYNC, 128, 0x0102_0304_0506_0708)
            .with_ramblock("pc.ram")
            .with_pages(3, 2)
            .with_sizes(16, 12288);

        let bytes = header.as_bytes();
        assert_eq!(&bytes[..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);
        assert_eq!(&bytes[32..40], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[40..46], b"pc.ram");

        let decoded = PacketHeader::from_bytes(bytes)?;
        assert_eq!(decoded.flags(), PacketFlags::SYNC);
        assert_eq!(decoded.ramblock(), b"pc.ram");
        assert_eq!(decoded.normal_pages(), 3);
        assert_eq!(decoded.zero_pages(), 2);
        assert_eq!(decoded.aux_size(), 16);
        assert_eq!(decoded.next_packet_size(), 12288);
        decoded.validate(0, 128)?;
        Ok(())
    }

    #[test]
    fn header_rejects_oversized_batches() {
        let header = PacketHeader::new(PacketFlags::empty(), 256, 0);
        assert!(header.validate(1, 128).is_err());

        let header = PacketHeader::new(PacketFlags::empty(), 4, 0).with_pages(3, 2);
        assert!(header.validate(1, 128).is_err());

        let mut bytes = PacketHeader::new(PacketFlags::empty(), 4, 0)
            .as_bytes()
            .to_vec();
        bytes[7] = 2;
        let header = PacketHeader::from_bytes(&bytes);
        assert!(header.is_ok_and(|header| header.validate(1, 128).is_err()));
    }

    #[test]
    fn ramblock_id_is_nul_terminated() {
        let long = "x".repeat(300);
        let header = PacketHeader::new(PacketFlags::empty(), 1, 0).with_ramblock(&long);
        assert_eq!(header.ramblock().len(), RAMBLOCK_ID_LEN - 1);
    }

    #[test]
    fn offsets() -> Result<(), MigrationError> {
        let mut bytes = Vec::new();
        encode_offsets(&[RamAddr(0x1000), RamAddr(0x20_0000)], &mut bytes);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0x10, 0]);

        let mut offsets = Vec::new();
        decode_offsets(&bytes, &mut offsets)?;
        assert_eq!(offsets, [RamAddr(0x1000), RamAddr(0x20_0000)]);
        assert!(decode_offsets(&bytes[..12], &mut offsets).is_err());
        Ok(())
    }

    #[test]
    fn aux() -> Result<(), MigrationError> {
        let mut bytes = Vec::new();
        encode_aux(&[vec![1, 2, 3], Vec::new()], &mut bytes);
        assert_eq!(bytes, [0, 0, 0, 3, 1, 2, 3, 0, 0, 0, 0]);

        let headers = decode_aux(&bytes, 2)?;
        assert_eq!(headers, [&[1u8, 2, 3][..], &[][..]]);
        assert!(decode_aux(&bytes, 3).is_err());
        assert!(decode_aux(&bytes[..6], 2).is_err());
        Ok(())
    }

    #[test]
    fn init_packet() -> Result<(), MigrationError> {
        let uuid = [0xab; 16];
        let packet = InitPacket::new(2, uuid, ChannelFeatures::ZERO_PAGE);
        let decoded = InitPacket::from_bytes(packet.as_bytes())?;

        assert_eq!(decoded.validate(&uuid, 3, ChannelFeatures::ZERO_PAGE)?, 2);
        assert!(decoded.validate(&uuid, 2, ChannelFeatures::ZERO_PAGE).is_err());
        assert!(decoded.validate(&[0; 16], 3, ChannelFeatures::ZERO_PAGE).is_err());
        assert!(decoded.validate(&uuid, 3, ChannelFeatures::empty()).is_err());
        Ok(())
    }
}
