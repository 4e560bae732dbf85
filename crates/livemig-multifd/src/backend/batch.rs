use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::{BackendError, BackendParams};

/// A device compressing a whole packet in one non-streaming call.
///
/// Every call is independent: the receiver's device must be able to
/// decompress any packet without having seen the previous ones.
pub trait BatchAccelerator: Send {
    /// Returns the name of the device.
    fn name(&self) -> &'static str;

    /// Compresses `input`, replacing the contents of `output`.
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), BackendError>;

    /// Decompresses `input` into `output` and returns the decoded size.
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, BackendError>;
}

/// Software deflate, used when no batch accelerator is present.
pub struct SoftwareDeflate {
    compress: Compress,
    decompress: Decompress,
}

impl SoftwareDeflate {
    /// Creates the software implementation.
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::fast(), false),
            decompress: Decompress::new(false),
        }
    }
}

impl Default for SoftwareDeflate {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchAccelerator for SoftwareDeflate {
    fn name(&self) -> &'static str {
        "software-deflate"
    }

    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), BackendError> {
        self.compress.reset();
        output.clear();
        output.reserve(input.len() / 2 + 64);

        loop {
            let before = self.compress.total_in() as usize;
            let status = self
                .compress
                .compress_vec(&input[before..], output, FlushCompress::Finish)?;

            if status == Status::StreamEnd {
                return Ok(());
            }

            if output.len() == output.capacity() {
                output.reserve(input.len() / 2 + 64);
            }
        }
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, BackendError> {
        self.decompress.reset(false);

        let status = self
            .decompress
            .decompress(input, output, FlushDecompress::Finish)?;
        let consumed = self.decompress.total_in() as usize;

        if status != Status::StreamEnd || consumed != input.len() {
            return Err(BackendError::Stalled {
                consumed,
                total: input.len(),
            });
        }

        Ok(self.decompress.total_out() as usize)
    }
}

pub(super) struct BatchSend {
    device: Box<dyn BatchAccelerator>,
    buf: Vec<u8>,
}

impl BatchSend {
    pub fn new(params: BackendParams, device: Box<dyn BatchAccelerator>) -> Self {
        tracing::debug!(channel = params.channel, device = device.name(), "batch backend");

        Self {
            device,
            buf: Vec::with_capacity(params.page_count * params.page_size),
        }
    }

    pub fn prepare(&mut self, input: &[u8]) -> Result<&[u8], BackendError> {
        self.device.compress(input, &mut self.buf)?;
        Ok(&self.buf)
    }
}

pub(super) struct BatchRecv {
    device: Box<dyn BatchAccelerator>,
}

impl BatchRecv {
    pub fn new(params: BackendParams, device: Box<dyn BatchAccelerator>) -> Self {
        tracing::debug!(channel = params.channel, device = device.name(), "batch backend");

        Self { device }
    }

    pub fn recv(&mut self, input: &[u8], out: &mut [u8]) -> Result<(), BackendError> {
        let decoded = self.device.decompress(input, out)?;
        if decoded != out.len() {
            return Err(BackendError::LengthMismatch {
                expected: out.len(),
                actual: decoded,
            });
        }

        Ok(())
    }
}
