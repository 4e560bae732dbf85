use std::sync::Arc;

use livemig_core::{EncryptedPage, MigrationError, PageEncryption, RamAddr, RamBlock};

/// Returns `true` if every byte of `page` is zero.
pub fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// A bounded list of page offsets of one RAM block.
///
/// The main thread fills a batch with [`push`]; the batch is then handed to
/// exactly one channel, which splits it into zero and normal pages while
/// copying the normal pages out of guest memory.
///
/// [`push`]: Self::push
#[derive(Debug)]
pub struct PageBatch {
    block: Option<Arc<RamBlock>>,
    offsets: Vec<RamAddr>,
    allocated: usize,
    normal: Vec<RamAddr>,
    zero: Vec<RamAddr>,
}

impl PageBatch {
    /// Creates an empty batch holding at most `allocated` pages.
    pub fn new(allocated: usize) -> Self {
        Self {
            block: None,
            offsets: Vec::with_capacity(allocated),
            allocated,
            normal: Vec::with_capacity(allocated),
            zero: Vec::with_capacity(allocated),
        }
    }

    /// Returns the RAM block of the queued pages.
    pub fn block(&self) -> Option<&Arc<RamBlock>> {
        self.block.as_ref()
    }

    /// Returns the queued offsets.
    pub fn offsets(&self) -> &[RamAddr] {
        &self.offsets
    }

    /// Returns the capacity of the batch.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Returns the number of queued pages.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns `true` if no page is queued.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Returns `true` if no more pages fit.
    pub fn is_full(&self) -> bool {
        self.offsets.len() >= self.allocated
    }

    /// Returns `true` if a page of `block` can be appended.
    pub fn accepts(&self, block: &Arc<RamBlock>) -> bool {
        match &self.block {
            None => true,
            Some(current) => Arc::ptr_eq(current, block) && !self.is_full(),
        }
    }

    /// Appends a page. The caller checks [`accepts`] first.
    ///
    /// [`accepts`]: Self::accepts
    pub fn push(&mut self, block: &Arc<RamBlock>, offset: RamAddr) {
        debug_assert!(self.accepts(block));

        if self.block.is_none() {
            self.block = Some(block.clone());
        }
        self.offsets.push(offset);
    }

    /// Returns the offsets classified as normal pages.
    pub fn normal_offsets(&self) -> &[RamAddr] {
        &self.normal
    }

    /// Returns the offsets classified as zero pages.
    pub fn zero_offsets(&self) -> &[RamAddr] {
        &self.zero
    }

    /// Empties the batch for the next use.
    pub fn reset(&mut self) {
        self.block = None;
        self.offsets.clear();
        self.normal.clear();
        self.zero.clear();
    }

    /// Copies the queued pages into `stage` and splits them into zero and
    /// normal pages.
    ///
    /// Only normal pages remain in `stage`, in the order of
    /// [`normal_offsets`]. With `detect_zero` unset every page is normal.
    ///
    /// [`normal_offsets`]: Self::normal_offsets
    pub fn classify(
        &mut self,
        stage: &mut Vec<u8>,
        detect_zero: bool,
    ) -> Result<(), MigrationError> {
        let block = self
            .block
            .as_ref()
            .ok_or(MigrationError::Other("empty page batch"))?;
        let page_size = block.page_size() as usize;

        stage.clear();
        self.normal.clear();
        self.zero.clear();

        for &offset in &self.offsets {
            let start = stage.len();
            stage.resize(start + page_size, 0);
            block.read_page(offset, &mut stage[start..])?;

            if detect_zero && is_zero_page(&stage[start..]) {
                stage.truncate(start);
                self.zero.push(offset);
            } else {
                self.normal.push(offset);
            }
        }

        Ok(())
    }

    /// Asks `encryption` for the ciphertext of every queued page.
    ///
    /// The ciphertexts are appended to `stage` and their headers to
    /// `headers`. Every page is normal: the host cannot see which pages are
    /// zero.
    pub fn encrypt(
        &mut self,
        encryption: &dyn PageEncryption,
        stage: &mut Vec<u8>,
        headers: &mut Vec<Vec<u8>>,
    ) -> Result<(), MigrationError> {
        let block = self
            .block
            .as_ref()
            .ok_or(MigrationError::Other("empty page batch"))?;
        let page_size = block.page_size() as usize;

        stage.clear();
        headers.clear();
        self.normal.clear();
        self.zero.clear();

        for &offset in &self.offsets {
            block.check_page(offset)?;

            let EncryptedPage { header, data } = encryption.encrypt_page(block.gpa_of(offset))?;
            if data.len() != page_size {
                return Err(MigrationError::Other("encrypted page is not one page long"));
            }

            stage.extend_from_slice(&data);
            headers.push(header);
            self.normal.push(offset);
        }

        Ok(())
    }
}
