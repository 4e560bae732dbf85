use std::ops::RangeInclusive;

use livemig_core::MigrationError;
use serde::{Deserialize, Serialize};

use crate::packet::PacketFlags;

/// The codec applied to the normal pages of every packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    /// Pages travel verbatim.
    #[default]
    None,

    /// Streaming zlib, one context per channel.
    Zlib,

    /// Streaming zstd, one context per channel.
    Zstd,

    /// Independent per-page jobs on a job-queue accelerator.
    JobQueue,

    /// One non-streaming deflate call over every page of a packet.
    Batch,
}

impl Compression {
    /// Returns the compression code carried in the packet flags.
    pub fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Zlib => 1,
            Self::Zstd => 2,
            Self::JobQueue => 3,
            Self::Batch => 4,
        }
    }

    /// Returns the packet flags announcing this codec.
    pub fn flags(self) -> PacketFlags {
        PacketFlags::from_bits_retain(self.code() << PacketFlags::COMPRESSION_SHIFT)
    }

    /// Returns the codec announced by `flags`, if any.
    pub fn from_flags(flags: PacketFlags) -> Option<Self> {
        match (flags & PacketFlags::COMPRESSION_MASK).bits() >> PacketFlags::COMPRESSION_SHIFT {
            0 => Some(Self::None),
            1 => Some(Self::Zlib),
            2 => Some(Self::Zstd),
            3 => Some(Self::JobQueue),
            4 => Some(Self::Batch),
            _ => None,
        }
    }

    /// Returns the name of the codec.
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
            Self::JobQueue => "job-queue",
            Self::Batch => "batch",
        }
    }
}

/// Where all-zero pages are detected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZeroPageDetection {
    /// Every page is sent as a normal page.
    None,

    /// The channel threads elide zero pages from the payload.
    #[default]
    Multifd,
}

/// Parameters of the multifd channels.
///
/// Both ends of a migration must agree on every field but the codec levels.
/// The receiver synchronizes only once exactly `channels` channels were
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultifdConfig {
    /// Number of parallel channels.
    pub channels: u8,

    /// Codec for normal pages.
    pub compression: Compression,

    /// zlib compression level.
    pub zlib_level: u32,

    /// zstd compression level.
    pub zstd_level: i32,

    /// Zero page handling.
    pub zero_page_detection: ZeroPageDetection,

    /// Bytes of page data in a full packet.
    pub packet_size: u64,

    /// Identity of the migrated VM, checked in the channel handshake.
    pub uuid: [u8; 16],
}

impl MultifdConfig {
    /// Default number of channels.
    pub const DEFAULT_CHANNELS: u8 = 2;

    /// Default zlib level.
    pub const DEFAULT_ZLIB_LEVEL: u32 = 1;

    /// Highest zlib level.
    pub const MAX_ZLIB_LEVEL: u32 = 9;

    /// Default zstd level.
    pub const DEFAULT_ZSTD_LEVEL: i32 = 1;

    /// Valid zstd levels.
    pub const ZSTD_LEVEL_RANGE: RangeInclusive<i32> = 0..=20;

    /// Default packet size.
    pub const DEFAULT_PACKET_SIZE: u64 = 512 << 10;

    /// Sets the number of channels.
    pub fn with_channels(self, channels: u8) -> Self {
        Self { channels, ..self }
    }

    /// Sets the codec.
    pub fn with_compression(self, compression: Compression) -> Self {
        Self {
            compression,
            ..self
        }
    }

    /// Sets the zlib level.
    pub fn with_zlib_level(self, zlib_level: u32) -> Self {
        Self { zlib_level, ..self }
    }

    /// Sets the zstd level.
    pub fn with_zstd_level(self, zstd_level: i32) -> Self {
        Self { zstd_level, ..self }
    }

    /// Sets the zero page handling.
    pub fn with_zero_page_detection(self, zero_page_detection: ZeroPageDetection) -> Self {
        Self {
            zero_page_detection,
            ..self
        }
    }

    /// Sets the packet size.
    pub fn with_packet_size(self, packet_size: u64) -> Self {
        Self {
            packet_size,
            ..self
        }
    }

    /// Sets the VM identity.
    pub fn with_uuid(self, uuid: [u8; 16]) -> Self {
        Self { uuid, ..self }
    }

    /// Returns the number of pages of `page_size` bytes in a full packet.
    pub fn page_count(&self, page_size: u64) -> u32 {
        (self.packet_size / page_size.max(1)) as u32
    }

    /// Checks every parameter against its valid range.
    pub fn validate(&self, page_size: u64) -> Result<(), MigrationError> {
        if self.channels == 0 {
            return Err(MigrationError::invalid_parameter(
                "multifd_channels",
                "at least one channel is required",
            ));
        }

        if self.zlib_level > Self::MAX_ZLIB_LEVEL {
            return Err(MigrationError::invalid_parameter(
                "multifd_zlib_level",
                format!("{} is outside of 0..=9", self.zlib_level),
            ));
        }

        if !Self::ZSTD_LEVEL_RANGE.contains(&self.zstd_level) {
            return Err(MigrationError::invalid_parameter(
                "multifd_zstd_level",
                format!("{} is outside of 0..=20", self.zstd_level),
            ));
        }

        if page_size == 0
            || self.packet_size < page_size
            || self.packet_size % page_size != 0
        {
            return Err(MigrationError::invalid_parameter(
                "multifd_packet_size",
                format!(
                    "{} is not a nonzero multiple of the page size {page_size}",
                    self.packet_size
                ),
            ));
        }

        Ok(())
    }

    pub(crate) fn detects_zero_pages(&self) -> bool {
        self.zero_page_detection == ZeroPageDetection::Multifd
    }
}

impl Default for MultifdConfig {
    fn default() -> Self {
        Self {
            channels: Self::DEFAULT_CHANNELS,
            compression: Compression::None,
            zlib_level: Self::DEFAULT_ZLIB_LEVEL,
            zstd_level: Self::DEFAULT_ZSTD_LEVEL,
            zero_page_detection: ZeroPageDetection::Multifd,
            packet_size: Self::DEFAULT_PACKET_SIZE,
            uuid: [0; 16],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_codes() {
        for compression in [
            Compression::None,
            Compression::Zlib,
            Compression::Zstd,
            Compression::JobQueue,
            Compression::Batch,
        ] {
            let flags = compression.flags() | PacketFlags::SYNC;
            assert_eq!(Compression::from_flags(flags), Some(compression));
        }

        let bogus = PacketFlags::from_bits_retain(0xf << PacketFlags::COMPRESSION_SHIFT);
        assert_eq!(Compression::from_flags(bogus), None);
    }

    #[test]
    fn validate() {
        let config = MultifdConfig::default();
        assert!(config.validate(4096).is_ok());
        assert_eq!(config.page_count(4096), 128);

        assert!(config.clone().with_channels(0).validate(4096).is_err());
        assert!(config.clone().with_zlib_level(10).validate(4096).is_err());
        assert!(config.clone().with_zstd_level(21).validate(4096).is_err());
        assert!(config.clone().with_packet_size(6000).validate(4096).is_err());
        assert!(config.with_packet_size(2048).validate(4096).is_err());
    }
}
