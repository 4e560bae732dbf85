use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::{BackendError, BackendParams, reserve_zeroed};

/// Smallest spare output space handed to the compressor.
const MIN_SPARE: usize = 64;

/// One zlib stream per channel, sync-flushed at every packet.
pub(super) struct ZlibSend {
    stream: Compress,
    buf: Vec<u8>,
}

impl ZlibSend {
    pub fn new(params: BackendParams, level: u32) -> Self {
        Self {
            stream: Compress::new(Compression::new(level), true),
            buf: Vec::with_capacity(2 * params.page_count * params.page_size),
        }
    }

    pub fn prepare(&mut self, input: &[u8]) -> Result<&[u8], BackendError> {
        self.buf.clear();
        let mut consumed = 0;

        loop {
            if self.buf.capacity() - self.buf.len() < MIN_SPARE {
                self.buf.reserve(input.len().max(MIN_SPARE));
            }

            let before = self.stream.total_in();
            self.stream
                .compress_vec(&input[consumed..], &mut self.buf, FlushCompress::Sync)?;
            consumed += (self.stream.total_in() - before) as usize;

            // The flush is complete once the compressor stops short of the
            // end of the output buffer.
            if consumed == input.len() && self.buf.len() < self.buf.capacity() {
                break;
            }
        }

        Ok(&self.buf)
    }
}

pub(super) struct ZlibRecv {
    stream: Decompress,
    scratch: Vec<u8>,
    page_size: usize,
}

impl ZlibRecv {
    pub fn new(params: BackendParams) -> Self {
        Self {
            stream: Decompress::new(true),
            scratch: vec![0; (params.page_count + 1) * params.page_size],
            page_size: params.page_size,
        }
    }

    pub fn recv(&mut self, input: &[u8], out: &mut [u8]) -> Result<(), BackendError> {
        reserve_zeroed(&mut self.scratch, 0, out.len() + self.page_size);

        let mut consumed = 0;
        let mut produced = 0;

        while consumed < input.len() {
            let (before_in, before_out) = (self.stream.total_in(), self.stream.total_out());
            let status = self.stream.decompress(
                &input[consumed..],
                &mut self.scratch[produced..],
                FlushDecompress::Sync,
            )?;

            let read = (self.stream.total_in() - before_in) as usize;
            let written = (self.stream.total_out() - before_out) as usize;
            consumed += read;
            produced += written;

            if produced > out.len() {
                break;
            }

            if status == Status::StreamEnd {
                break;
            }

            if read == 0 && written == 0 {
                return Err(BackendError::Stalled {
                    consumed,
                    total: input.len(),
                });
            }
        }

        if produced != out.len() {
            return Err(BackendError::LengthMismatch {
                expected: out.len(),
                actual: produced,
            });
        }

        out.copy_from_slice(&self.scratch[..produced]);
        Ok(())
    }
}
