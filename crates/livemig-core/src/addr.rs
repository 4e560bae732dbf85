use serde::{Deserialize, Serialize};

use crate::macros::impl_addr;

impl_addr!(Gpa, "guest physical address");
impl_addr!(Gfn, "guest frame number");
impl_addr!(RamAddr, "byte offset inside a RAM block");

impl Gpa {
    /// Returns the frame number of the page containing this address.
    pub const fn gfn(self, page_shift: u32) -> Gfn {
        Gfn(self.0 >> page_shift)
    }
}

impl Gfn {
    /// Returns the address of the first byte of this frame.
    pub const fn gpa(self, page_shift: u32) -> Gpa {
        Gpa(self.0 << page_shift)
    }
}

impl RamAddr {
    /// Returns the index of the page containing this offset.
    pub const fn page_index(self, page_shift: u32) -> u64 {
        self.0 >> page_shift
    }
}

/// A virtual CPU index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VcpuId(pub u16);

impl VcpuId {
    /// Returns the index as a `usize`, for table lookups.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for VcpuId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for VcpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpa_gfn_conversion() {
        let gpa = Gpa(0x1234_5678);
        assert_eq!(gpa.gfn(12), Gfn(0x12345));
        assert_eq!(gpa.gfn(12).gpa(12), gpa.align_down(0x1000));
        assert!(!gpa.is_aligned(0x1000));
        assert!(Gpa(0x2000).is_aligned(0x1000));
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(Gpa(0x1000).to_string(), "0x1000");
        assert_eq!(format!("{:?}", RamAddr(0x20)), "RamAddr(0x20)");
        assert_eq!(RamAddr(0x3000).page_index(12), 3);
        assert_eq!(Gpa(0x3000) - Gpa(0x1000), 0x2000);
        assert_eq!(Gpa(u64::MAX).checked_add(1), None);
    }
}
