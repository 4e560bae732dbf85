use livemig_core::MigrationError;

use super::*;

const PAGE_SIZE: usize = 4096;
const PAGE_COUNT: usize = 8;

fn params() -> BackendParams {
    BackendParams {
        channel: 3,
        page_size: PAGE_SIZE,
        page_count: PAGE_COUNT,
    }
}

/// Deterministic bytes no codec can shrink.
fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    let mut result = Vec::with_capacity(len);
    while result.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        result.extend_from_slice(&seed.to_le_bytes());
    }
    result.truncate(len);
    result
}

/// One repetitive page, one text-like page and one incompressible page.
fn pages() -> Vec<u8> {
    let mut result = vec![0xa5; PAGE_SIZE];
    result.extend(
        b"the quick brown fox jumps over the lazy dog "
            .iter()
            .cycle()
            .take(PAGE_SIZE),
    );
    result.extend(noise(PAGE_SIZE, 0x9e37_79b9_7f4a_7c15));
    result
}

fn setup(
    compression: Compression,
    accelerators: &Accelerators,
) -> Result<(SendBackend, RecvBackend), MigrationError> {
    let config = MultifdConfig::default().with_compression(compression);
    Ok((
        SendBackend::send_setup(&config, params(), accelerators)?,
        RecvBackend::recv_setup(&config, params(), accelerators)?,
    ))
}

fn transfer(
    send: &mut SendBackend,
    recv: &mut RecvBackend,
    input: &[u8],
) -> Result<Vec<u8>, MigrationError> {
    let flags = send.flags();
    let mut payload = Payload::new();
    let size = send.send_prepare(input, &mut payload)?;

    let wire = payload.concat();
    assert_eq!(wire.len(), size);
    assert!(size <= recv.max_payload());

    let mut out = vec![0xff; input.len()];
    recv.check_flags(flags)?;
    recv.recv(&wire, &mut out)?;
    Ok(out)
}

////////////////////////////////////////////////////////////////////////////////
// Round trips
////////////////////////////////////////////////////////////////////////////////

#[test]
fn every_codec_round_trips() -> Result<(), MigrationError> {
    let input = pages();

    for compression in [
        Compression::None,
        Compression::Zlib,
        Compression::Zstd,
        Compression::JobQueue,
        Compression::Batch,
    ] {
        let (mut send, mut recv) = setup(compression, &Accelerators::new())?;

        // Streaming codecs carry state from one packet to the next.
        for _ in 0..3 {
            let out = transfer(&mut send, &mut recv, &input)?;
            assert!(out == input, "{} corrupted the pages", compression.name());
        }

        send.send_cleanup();
        recv.recv_cleanup();
    }

    Ok(())
}

#[test]
fn iov_counts() -> Result<(), MigrationError> {
    let input = pages();

    for (compression, expected) in [
        (Compression::None, 3),
        (Compression::Zlib, 1),
        (Compression::Zstd, 1),
        (Compression::JobQueue, 4),
        (Compression::Batch, 1),
    ] {
        let (mut send, _) = setup(compression, &Accelerators::new())?;
        assert_eq!(send.iov_count(3), expected);

        let mut payload = Payload::new();
        send.send_prepare(&input, &mut payload)?;
        assert_eq!(payload.len(), expected, "{}", compression.name());
    }

    Ok(())
}

#[test]
fn empty_packet_has_no_payload() -> Result<(), MigrationError> {
    let (mut send, mut recv) = setup(Compression::Zstd, &Accelerators::new())?;

    let mut payload = Payload::new();
    assert_eq!(send.send_prepare(&[], &mut payload)?, 0);
    recv.recv(&[], &mut [])?;
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Job queue
////////////////////////////////////////////////////////////////////////////////

#[test]
fn job_queue_sends_incompressible_pages_raw() -> Result<(), MigrationError> {
    let input = pages();
    let (mut send, _) = setup(Compression::JobQueue, &Accelerators::new())?;

    let mut payload = Payload::new();
    send.send_prepare(&input, &mut payload)?;

    let table = payload[0];
    assert_eq!(table.len(), 3 * 4);

    let lengths: Vec<u32> = table
        .chunks(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    assert!(lengths[0] < PAGE_SIZE as u32);
    assert!(lengths[1] < PAGE_SIZE as u32);
    assert_eq!(lengths[2], PAGE_SIZE as u32);
    assert_eq!(payload[3], &input[2 * PAGE_SIZE..]);
    Ok(())
}

/// Rejects the first submissions as if every queue were full.
struct BusyDevice {
    inner: SoftwareJobQueue,
    busy: usize,
}

impl JobQueueDevice for BusyDevice {
    fn name(&self) -> &'static str {
        "busy"
    }

    fn submit(
        &mut self,
        slot: usize,
        op: JobOp,
        input: &[u8],
        output_limit: usize,
    ) -> Result<(), SubmitError> {
        if self.busy > 0 {
            self.busy -= 1;
            return Err(SubmitError::Busy);
        }

        self.inner.submit(slot, op, input, output_limit)
    }

    fn wait(&mut self, slot: usize, output: &mut [u8]) -> Result<JobStatus, BackendError> {
        self.inner.wait(slot, output)
    }
}

#[test]
fn job_queue_retries_busy_device() -> Result<(), MigrationError> {
    let accelerators = Accelerators::new().with_job_queue(|_| {
        Box::new(BusyDevice {
            inner: SoftwareJobQueue::new(),
            busy: 5,
        })
    });

    let input = pages();
    let (mut send, mut recv) = setup(Compression::JobQueue, &accelerators)?;
    assert!(transfer(&mut send, &mut recv, &input)? == input);
    Ok(())
}

#[test]
fn job_queue_rejects_inconsistent_length_table() -> Result<(), MigrationError> {
    let input = pages();
    let (mut send, mut recv) = setup(Compression::JobQueue, &Accelerators::new())?;

    let mut payload = Payload::new();
    send.send_prepare(&input, &mut payload)?;
    let mut wire = payload.concat();

    // Claim the raw page is 256 bytes shorter.
    wire[10] -= 1;

    let mut out = vec![0; input.len()];
    let result = recv.recv(&wire, &mut out);
    assert!(matches!(result, Err(MigrationError::ChannelProtocol { channel: 3, .. })));
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Receiver validation
////////////////////////////////////////////////////////////////////////////////

#[test]
fn flag_mismatch_is_a_protocol_error() -> Result<(), MigrationError> {
    let input = pages();
    let (mut send, _) = setup(Compression::Zlib, &Accelerators::new())?;
    let (_, recv) = setup(Compression::Zstd, &Accelerators::new())?;

    let mut payload = Payload::new();
    send.send_prepare(&input, &mut payload)?;
    drop(payload);

    let result = recv.check_flags(send.flags());
    assert!(matches!(result, Err(MigrationError::ChannelProtocol { channel: 3, .. })));

    // Uncompressed packets carry no codec flags at all.
    let (none, _) = setup(Compression::None, &Accelerators::new())?;
    assert!(recv.check_flags(none.flags()).is_err());
    Ok(())
}

#[test]
fn size_mismatch_is_rejected() -> Result<(), MigrationError> {
    let input = pages();

    let (mut send, mut recv) = setup(Compression::None, &Accelerators::new())?;
    let mut payload = Payload::new();
    send.send_prepare(&input, &mut payload)?;
    let wire = payload.concat();

    let mut out = vec![0; input.len()];
    let result = recv.recv(&wire[..wire.len() - 1], &mut out);
    assert!(matches!(result, Err(MigrationError::ChannelProtocol { .. })));

    let (mut send, mut recv) = setup(Compression::Zlib, &Accelerators::new())?;
    let mut payload = Payload::new();
    send.send_prepare(&input, &mut payload)?;
    let wire = payload.concat();

    // Two pages were announced, three were encoded.
    let mut out = vec![0; 2 * PAGE_SIZE];
    let result = recv.recv(&wire, &mut out);
    assert!(matches!(
        result,
        Err(MigrationError::CompressionBackend { codec: "zlib", .. })
    ));
    Ok(())
}

#[test]
fn corrupted_stream_is_a_backend_error() -> Result<(), MigrationError> {
    let input = pages();
    let (mut send, mut recv) = setup(Compression::Batch, &Accelerators::new())?;

    let mut payload = Payload::new();
    send.send_prepare(&input, &mut payload)?;
    let wire = payload.concat();

    let mut out = vec![0; input.len()];
    let result = recv.recv(&wire[..wire.len() / 2], &mut out);
    assert!(matches!(
        result,
        Err(MigrationError::CompressionBackend { channel: 3, .. })
    ));
    Ok(())
}
