use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::{Gpa, MigrationError, RamAddr};

/// Host memory backing a [`RamBlock`].
///
/// The mapping is anonymous and sized for the block's maximum length, so
/// shrinking or growing the used length never remaps it. Access goes through
/// copies; there is no lock on page bytes. Callers partition pages between
/// threads.
pub struct HostMemory {
    _mmap: MmapMut,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: The mapping is owned by `HostMemory` and lives as long as it does.
// Concurrent writers are expected to touch disjoint pages.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Maps `len` bytes of zeroed anonymous memory.
    pub fn new(len: usize) -> Result<Self, MigrationError> {
        let mut mmap = MmapMut::map_anon(len)?;
        let ptr = mmap.as_mut_ptr();

        Ok(Self {
            _mmap: mmap,
            ptr,
            len,
        })
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a pointer to `len` bytes at `offset`.
    pub fn ptr_at(&self, offset: u64, len: usize) -> Result<*mut u8, MigrationError> {
        let offset = usize::try_from(offset).map_err(|_| MigrationError::OutOfBounds)?;
        let end = offset.checked_add(len).ok_or(MigrationError::OutOfBounds)?;

        if end > self.len {
            return Err(MigrationError::OutOfBounds);
        }

        // SAFETY: `offset + len` is within the mapping.
        Ok(unsafe { self.ptr.add(offset) })
    }

    /// Copies bytes at `offset` into `buf`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), MigrationError> {
        let src = self.ptr_at(offset, buf.len())?;

        // SAFETY: `src` is valid for `buf.len()` bytes and `buf` is a
        // distinct allocation.
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copies `data` into the mapping at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), MigrationError> {
        let dst = self.ptr_at(offset, data.len())?;

        // SAFETY: `dst` is valid for `data.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Fills `len` bytes at `offset` with `value`.
    pub fn fill(&self, offset: u64, len: usize, value: u8) -> Result<(), MigrationError> {
        let dst = self.ptr_at(offset, len)?;

        // SAFETY: `dst` is valid for `len` bytes.
        unsafe { std::ptr::write_bytes(dst, value, len) };
        Ok(())
    }
}

/// A snapshot of the geometry of a [`RamBlock`].
///
/// Two snapshots of the same block compare equal only if the block was not
/// resized in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamBlockGeometry {
    /// The guest physical address of the first page.
    pub gpa: Gpa,

    /// The used length in bytes.
    pub used_length: u64,

    /// The number of pages in the used length.
    pub page_count: u64,

    /// The resize generation.
    pub generation: u64,
}

/// A contiguous, host-memory-backed region of guest physical memory.
pub struct RamBlock {
    id: String,
    gpa: Gpa,
    page_size: u64,
    page_shift: u32,
    max_length: u64,
    used_length: AtomicU64,
    generation: AtomicU64,
    migratable: AtomicBool,
    memory: HostMemory,
}

impl RamBlock {
    /// Creates a fixed-size migratable block.
    pub fn new(
        id: impl Into<String>,
        gpa: Gpa,
        page_size: u64,
        length: u64,
    ) -> Result<Self, MigrationError> {
        Self::resizable(id, gpa, page_size, length, length)
    }

    /// Creates a block whose used length can later change up to
    /// `max_length`.
    pub fn resizable(
        id: impl Into<String>,
        gpa: Gpa,
        page_size: u64,
        used_length: u64,
        max_length: u64,
    ) -> Result<Self, MigrationError> {
        let id = id.into();

        if id.is_empty() || id.len() >= 256 {
            return Err(MigrationError::invalid_parameter(
                "id",
                "must be 1 to 255 bytes long",
            ));
        }

        if !page_size.is_power_of_two() {
            return Err(MigrationError::invalid_parameter(
                "page_size",
                format!("{page_size} is not a power of two"),
            ));
        }

        if max_length == 0 || max_length % page_size != 0 || used_length % page_size != 0 {
            return Err(MigrationError::invalid_parameter(
                "length",
                "must be a nonzero multiple of the page size",
            ));
        }

        if used_length > max_length {
            return Err(MigrationError::OutOfBounds);
        }

        let len = usize::try_from(max_length).map_err(|_| MigrationError::OutOfBounds)?;

        Ok(Self {
            id,
            gpa,
            page_size,
            page_shift: page_size.trailing_zeros(),
            max_length,
            used_length: AtomicU64::new(used_length),
            generation: AtomicU64::new(0),
            migratable: AtomicBool::new(true),
            memory: HostMemory::new(len)?,
        })
    }

    /// Returns the block id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the guest physical address of the first page.
    pub fn gpa(&self) -> Gpa {
        self.gpa
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Returns the page shift.
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Returns the used length in bytes.
    pub fn used_length(&self) -> u64 {
        self.used_length.load(Ordering::Acquire)
    }

    /// Returns the maximum length in bytes.
    pub fn max_length(&self) -> u64 {
        self.max_length
    }

    /// Returns the number of pages in the used length.
    pub fn page_count(&self) -> u64 {
        self.used_length() >> self.page_shift
    }

    /// Returns the resize generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the block geometry.
    pub fn geometry(&self) -> RamBlockGeometry {
        // Read the generation first so a racing resize is always observed
        // as a generation change by the next snapshot.
        let generation = self.generation();
        let used_length = self.used_length();

        RamBlockGeometry {
            gpa: self.gpa,
            used_length,
            page_count: used_length >> self.page_shift,
            generation,
        }
    }

    /// Returns `true` if the block takes part in migration.
    pub fn is_migratable(&self) -> bool {
        self.migratable.load(Ordering::Relaxed)
    }

    /// Marks the block as migratable or not.
    pub fn set_migratable(&self, migratable: bool) {
        self.migratable.store(migratable, Ordering::Relaxed);
    }

    /// Changes the used length of the block.
    pub fn resize(&self, used_length: u64) -> Result<(), MigrationError> {
        if used_length > self.max_length || used_length % self.page_size != 0 {
            return Err(MigrationError::OutOfBounds);
        }

        self.generation.fetch_add(1, Ordering::AcqRel);
        let old = self.used_length.swap(used_length, Ordering::AcqRel);

        tracing::debug!(id = %self.id, old, new = used_length, "RAM block resized");
        Ok(())
    }

    /// Returns the host memory of the block.
    pub fn memory(&self) -> &HostMemory {
        &self.memory
    }

    /// Returns the guest physical address of `offset`.
    pub fn gpa_of(&self, offset: RamAddr) -> Gpa {
        self.gpa + offset.0
    }

    /// Checks that `offset` is the start of a page inside the used length.
    pub fn check_page(&self, offset: RamAddr) -> Result<(), MigrationError> {
        if !offset.is_aligned(self.page_size) {
            return Err(MigrationError::OutOfBounds);
        }

        match offset.checked_add(self.page_size) {
            Some(end) if end.0 <= self.used_length() => Ok(()),
            _ => Err(MigrationError::OutOfBounds),
        }
    }

    /// Copies the page at `offset` into `buf`.
    ///
    /// `buf` must be exactly one page long.
    pub fn read_page(&self, offset: RamAddr, buf: &mut [u8]) -> Result<(), MigrationError> {
        self.check_page(offset)?;
        self.check_len(buf.len())?;
        self.memory.read(offset.0, buf)
    }

    /// Overwrites the page at `offset` with `data`.
    ///
    /// `data` must be exactly one page long.
    pub fn write_page(&self, offset: RamAddr, data: &[u8]) -> Result<(), MigrationError> {
        self.check_page(offset)?;
        self.check_len(data.len())?;
        self.memory.write(offset.0, data)
    }

    /// Clears the page at `offset`.
    pub fn zero_page(&self, offset: RamAddr) -> Result<(), MigrationError> {
        self.check_page(offset)?;
        self.memory.fill(offset.0, self.page_size as usize, 0)
    }

    fn check_len(&self, len: usize) -> Result<(), MigrationError> {
        if len as u64 != self.page_size {
            return Err(MigrationError::OutOfBounds);
        }

        Ok(())
    }
}

impl std::fmt::Debug for RamBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RamBlock")
            .field("id", &self.id)
            .field("gpa", &self.gpa)
            .field("page_size", &self.page_size)
            .field("used_length", &self.used_length())
            .field("max_length", &self.max_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_access() -> Result<(), MigrationError> {
        let block = RamBlock::new("pc.ram", Gpa(0x10_0000), 4096, 4 * 4096)?;
        assert_eq!(block.page_count(), 4);

        block.write_page(RamAddr(4096), &[0xaa; 4096])?;

        let mut page = [0u8; 4096];
        block.read_page(RamAddr(4096), &mut page)?;
        assert!(page.iter().all(|&b| b == 0xaa));

        block.zero_page(RamAddr(4096))?;
        block.read_page(RamAddr(4096), &mut page)?;
        assert!(page.iter().all(|&b| b == 0));

        assert_eq!(block.gpa_of(RamAddr(0x2000)), Gpa(0x10_2000));
        Ok(())
    }

    #[test]
    fn rejects_bad_offsets() -> Result<(), MigrationError> {
        let block = RamBlock::new("pc.ram", Gpa(0), 4096, 2 * 4096)?;
        let mut page = [0u8; 4096];

        assert!(matches!(
            block.read_page(RamAddr(2 * 4096), &mut page),
            Err(MigrationError::OutOfBounds)
        ));
        assert!(matches!(
            block.read_page(RamAddr(100), &mut page),
            Err(MigrationError::OutOfBounds)
        ));
        assert!(matches!(
            block.write_page(RamAddr(0), &[0; 16]),
            Err(MigrationError::OutOfBounds)
        ));
        Ok(())
    }

    #[test]
    fn resize_bumps_generation() -> Result<(), MigrationError> {
        let block = RamBlock::resizable("vga.vram", Gpa(0), 4096, 4096, 4 * 4096)?;
        let before = block.geometry();

        block.resize(3 * 4096)?;
        let after = block.geometry();

        assert_ne!(before, after);
        assert_eq!(after.page_count, 3);
        assert!(block.resize(5 * 4096).is_err());
        Ok(())
    }
}
