use livemig_core::MigrationError;

use super::{BackendParams, Payload};

/// Pages travel verbatim, one I/O slice per page.
pub(super) struct NoCompSend {
    page_size: usize,
}

impl NoCompSend {
    pub fn new(params: BackendParams) -> Self {
        Self {
            page_size: params.page_size,
        }
    }

    pub fn prepare<'a>(&self, normal: &'a [u8], payload: &mut Payload<'a>) {
        payload.extend(normal.chunks(self.page_size));
    }
}

pub(super) struct NoCompRecv;

impl NoCompRecv {
    pub fn recv(&self, channel: u8, payload: &[u8], out: &mut [u8]) -> Result<(), MigrationError> {
        if payload.len() != out.len() {
            return Err(MigrationError::protocol(
                channel,
                format!(
                    "received {} payload bytes for {} bytes of pages",
                    payload.len(),
                    out.len()
                ),
            ));
        }

        out.copy_from_slice(payload);
        Ok(())
    }
}
