use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Transfer totals of one channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// The channel id.
    pub id: u8,

    /// Packets, including synchronization packets.
    pub packets: u64,

    /// Pages carried in the payload.
    pub normal_pages: u64,

    /// Pages elided as zero pages.
    pub zero_pages: u64,

    /// Bytes on the wire, including headers.
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ChannelCounters {
    packets: AtomicU64,
    normal_pages: AtomicU64,
    zero_pages: AtomicU64,
    bytes: AtomicU64,
}

impl ChannelCounters {
    pub fn add_packet(&self, normal_pages: usize, zero_pages: usize, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.normal_pages
            .fetch_add(normal_pages as u64, Ordering::Relaxed);
        self.zero_pages.fetch_add(zero_pages as u64, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, id: u8) -> ChannelStats {
        ChannelStats {
            id,
            packets: self.packets.load(Ordering::Relaxed),
            normal_pages: self.normal_pages.load(Ordering::Relaxed),
            zero_pages: self.zero_pages.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}
