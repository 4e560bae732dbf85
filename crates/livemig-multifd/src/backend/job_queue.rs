use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use livemig_core::MigrationError;
use zerocopy::{FromBytes as _, IntoBytes as _, byteorder::big_endian::U32};

use super::{BackendError, BackendParams, Payload};

/// Direction of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOp {
    /// Compress one page.
    Compress,

    /// Decompress one page.
    Decompress,
}

/// Outcome of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The job produced this many bytes.
    Done(usize),

    /// The output did not fit the limit given at submission.
    OutputOverflow,
}

/// Why a job was not accepted.
#[derive(thiserror::Error, Debug)]
pub enum SubmitError {
    /// Every device queue is full; the job should be submitted again.
    #[error("device queues are busy")]
    Busy,

    /// The device rejected the job.
    #[error(transparent)]
    Failed(#[from] BackendError),
}

/// A device processing independent per-page jobs.
///
/// Jobs are addressed by slot, one slot per page of a packet. A slot is
/// submitted at most once before it is waited for.
pub trait JobQueueDevice: Send {
    /// Returns the name of the device.
    fn name(&self) -> &'static str;

    /// Submits a job over `input` whose output may not exceed `output_limit`
    /// bytes.
    fn submit(
        &mut self,
        slot: usize,
        op: JobOp,
        input: &[u8],
        output_limit: usize,
    ) -> Result<(), SubmitError>;

    /// Waits for the job in `slot` and copies its output into `output`.
    fn wait(&mut self, slot: usize, output: &mut [u8]) -> Result<JobStatus, BackendError>;
}

/// Software path of the job queue, used when no device is present.
///
/// Jobs run synchronously at submission.
pub struct SoftwareJobQueue {
    compress: Compress,
    decompress: Decompress,
    results: Vec<Option<Result<Option<Vec<u8>>, BackendError>>>,
}

impl SoftwareJobQueue {
    /// Creates the software path.
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::fast(), false),
            decompress: Decompress::new(false),
            results: Vec::new(),
        }
    }

    /// Runs one job. `None` means the output exceeded `limit`.
    fn run(
        &mut self,
        op: JobOp,
        input: &[u8],
        limit: usize,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        let mut output = vec![0; limit];

        let (status, produced) = match op {
            JobOp::Compress => {
                self.compress.reset();
                let status = self
                    .compress
                    .compress(input, &mut output, FlushCompress::Finish)?;
                (status, self.compress.total_out() as usize)
            }
            JobOp::Decompress => {
                self.decompress.reset(false);
                let status = self
                    .decompress
                    .decompress(input, &mut output, FlushDecompress::Finish)?;
                (status, self.decompress.total_out() as usize)
            }
        };

        if status != Status::StreamEnd {
            return Ok(None);
        }

        output.truncate(produced);
        Ok(Some(output))
    }
}

impl Default for SoftwareJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueueDevice for SoftwareJobQueue {
    fn name(&self) -> &'static str {
        "software"
    }

    fn submit(
        &mut self,
        slot: usize,
        op: JobOp,
        input: &[u8],
        output_limit: usize,
    ) -> Result<(), SubmitError> {
        if self.results.len() <= slot {
            self.results.resize_with(slot + 1, || None);
        }

        self.results[slot] = Some(self.run(op, input, output_limit));
        Ok(())
    }

    fn wait(&mut self, slot: usize, output: &mut [u8]) -> Result<JobStatus, BackendError> {
        let result = self
            .results
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| BackendError::Job {
                slot,
                reason: "no job submitted".into(),
            })?;

        match result? {
            Some(data) if data.len() <= output.len() => {
                output[..data.len()].copy_from_slice(&data);
                Ok(JobStatus::Done(data.len()))
            }
            _ => Ok(JobStatus::OutputOverflow),
        }
    }
}

/// Submits a job, retrying while the device queues are busy.
fn submit_retry(
    device: &mut dyn JobQueueDevice,
    slot: usize,
    op: JobOp,
    input: &[u8],
    output_limit: usize,
) -> Result<u64, BackendError> {
    let mut retries = 0;

    loop {
        match device.submit(slot, op, input, output_limit) {
            Ok(()) => return Ok(retries),
            Err(SubmitError::Busy) => {
                retries += 1;
                std::thread::yield_now();
            }
            Err(SubmitError::Failed(err)) => return Err(err),
        }
    }
}

/// One job per page, with a big-endian length table before the pages.
///
/// A page whose job cannot shrink it below one page travels raw; the
/// receiver recognizes it by its length being exactly one page.
pub(super) struct JobQueueSend {
    device: Box<dyn JobQueueDevice>,
    page_size: usize,
    lengths: Vec<U32>,
    raw: Vec<bool>,
    zbuf: Vec<u8>,
    busy_retries: u64,
}

impl JobQueueSend {
    pub fn new(params: BackendParams, device: Box<dyn JobQueueDevice>) -> Self {
        tracing::debug!(channel = params.channel, device = device.name(), "job queue backend");

        Self {
            device,
            page_size: params.page_size,
            lengths: Vec::with_capacity(params.page_count),
            raw: Vec::with_capacity(params.page_count),
            zbuf: vec![0; params.page_count * params.page_size],
            busy_retries: 0,
        }
    }

    pub fn prepare<'a>(
        &'a mut self,
        input: &'a [u8],
        payload: &mut Payload<'a>,
    ) -> Result<(), BackendError> {
        let page_size = self.page_size;
        let jobs = input.len() / page_size;

        if self.zbuf.len() < input.len() {
            self.zbuf.resize(input.len(), 0);
        }

        for (slot, page) in input.chunks(page_size).enumerate() {
            self.busy_retries +=
                submit_retry(&mut *self.device, slot, JobOp::Compress, page, page_size - 1)?;
        }

        self.lengths.clear();
        self.raw.clear();

        for slot in 0..jobs {
            let out = &mut self.zbuf[slot * page_size..(slot + 1) * page_size];
            let len = match self.device.wait(slot, out)? {
                JobStatus::Done(len) if len < page_size => len,
                JobStatus::Done(_) | JobStatus::OutputOverflow => page_size,
            };

            self.lengths.push(U32::new(len as u32));
            self.raw.push(len == page_size);
        }

        let this: &'a Self = self;
        payload.push(this.lengths.as_bytes());

        for (slot, page) in input.chunks(page_size).enumerate() {
            if this.raw[slot] {
                payload.push(page);
            } else {
                let start = slot * page_size;
                let len = this.lengths[slot].get() as usize;
                payload.push(&this.zbuf[start..start + len]);
            }
        }

        Ok(())
    }
}

impl Drop for JobQueueSend {
    fn drop(&mut self) {
        if self.busy_retries > 0 {
            tracing::debug!(busy_retries = self.busy_retries, "job queue backend");
        }
    }
}

pub(super) struct JobQueueRecv {
    device: Box<dyn JobQueueDevice>,
    page_size: usize,
    lengths: Vec<usize>,
}

impl JobQueueRecv {
    pub fn new(params: BackendParams, device: Box<dyn JobQueueDevice>) -> Self {
        tracing::debug!(channel = params.channel, device = device.name(), "job queue backend");

        Self {
            device,
            page_size: params.page_size,
            lengths: Vec::with_capacity(params.page_count),
        }
    }

    pub fn recv(
        &mut self,
        channel: u8,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<(), MigrationError> {
        let page_size = self.page_size;
        let jobs = out.len() / page_size;
        let hdr_len = jobs * size_of::<U32>();

        if payload.len() < hdr_len {
            return Err(MigrationError::protocol(
                channel,
                format!("payload of {} bytes has no length table", payload.len()),
            ));
        }

        let (table, data) = payload.split_at(hdr_len);
        let table = <[U32]>::ref_from_bytes(table).map_err(|_| MigrationError::OutOfBounds)?;

        self.lengths.clear();
        for len in table {
            let len = len.get() as usize;
            if len == 0 || len > page_size {
                return Err(MigrationError::protocol(
                    channel,
                    format!("compressed page length {len} is outside of 1..={page_size}"),
                ));
            }
            self.lengths.push(len);
        }

        let data_len: usize = self.lengths.iter().sum();
        if data_len != data.len() {
            return Err(MigrationError::protocol(
                channel,
                format!(
                    "length table covers {data_len} bytes but the payload carries {}",
                    data.len()
                ),
            ));
        }

        let into_error = |err: BackendError| err.into_migration_error(channel, "job-queue");

        let mut offset = 0;
        for (slot, page) in out.chunks_mut(page_size).enumerate() {
            let len = self.lengths[slot];
            let input = &data[offset..offset + len];
            offset += len;

            if len == page_size {
                page.copy_from_slice(input);
                continue;
            }

            submit_retry(&mut *self.device, slot, JobOp::Decompress, input, page_size)
                .map_err(into_error)?;
        }

        for (slot, page) in out.chunks_mut(page_size).enumerate() {
            if self.lengths[slot] == page_size {
                continue;
            }

            match self.device.wait(slot, page).map_err(into_error)? {
                JobStatus::Done(len) if len == page_size => {}
                JobStatus::Done(len) => {
                    return Err(into_error(BackendError::LengthMismatch {
                        expected: page_size,
                        actual: len,
                    }));
                }
                JobStatus::OutputOverflow => {
                    return Err(into_error(BackendError::Job {
                        slot,
                        reason: "decompressed page exceeds the page size".into(),
                    }));
                }
            }
        }

        Ok(())
    }
}
