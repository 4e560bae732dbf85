use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

use super::{BackendError, BackendParams, reserve_zeroed};

const MIN_SPARE: usize = 4096;

/// One zstd stream per channel, flushed at every packet.
pub(super) struct ZstdSend {
    stream: Encoder<'static>,
    buf: Vec<u8>,
}

impl ZstdSend {
    pub fn new(params: BackendParams, level: i32) -> Result<Self, BackendError> {
        Ok(Self {
            stream: Encoder::new(level)?,
            buf: vec![0; 2 * params.page_count * params.page_size],
        })
    }

    pub fn prepare(&mut self, input: &[u8]) -> Result<&[u8], BackendError> {
        let total = input.len();
        let mut input = InBuffer::around(input);
        let mut written = 0;

        while input.pos < total {
            reserve_zeroed(&mut self.buf, written, MIN_SPARE);

            let mut output = OutBuffer::around(&mut self.buf[written..]);
            self.stream.run(&mut input, &mut output)?;
            written += output.pos();
        }

        loop {
            reserve_zeroed(&mut self.buf, written, MIN_SPARE);

            let mut output = OutBuffer::around(&mut self.buf[written..]);
            let remaining = self.stream.flush(&mut output)?;
            written += output.pos();

            if remaining == 0 {
                break;
            }
        }

        Ok(&self.buf[..written])
    }
}

pub(super) struct ZstdRecv {
    stream: Decoder<'static>,
    scratch: Vec<u8>,
    page_size: usize,
}

impl ZstdRecv {
    pub fn new(params: BackendParams) -> Result<Self, BackendError> {
        Ok(Self {
            stream: Decoder::new()?,
            scratch: vec![0; (params.page_count + 1) * params.page_size],
            page_size: params.page_size,
        })
    }

    pub fn recv(&mut self, input: &[u8], out: &mut [u8]) -> Result<(), BackendError> {
        reserve_zeroed(&mut self.scratch, 0, out.len() + self.page_size);

        let total = input.len();
        let mut input = InBuffer::around(input);
        let mut produced = 0;

        while produced <= out.len() {
            let before = input.pos;

            let mut output = OutBuffer::around(&mut self.scratch[produced..]);
            self.stream.run(&mut input, &mut output)?;
            let written = output.pos();
            produced += written;

            if input.pos == before && written == 0 {
                // Drained: everything consumed and nothing left buffered.
                if input.pos == total {
                    break;
                }

                return Err(BackendError::Stalled {
                    consumed: input.pos,
                    total,
                });
            }
        }

        if produced != out.len() || input.pos != total {
            return Err(BackendError::LengthMismatch {
                expected: out.len(),
                actual: produced,
            });
        }

        out.copy_from_slice(&self.scratch[..produced]);
        Ok(())
    }
}
