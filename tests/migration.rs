mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use livemig::{
    MigrationConfig, MigrationError, MigrationStatus, RamAddr, VcpuId,
    dirtylimit::DirtyLimitConfig,
    dirtyrate::SamplerConfig,
    multifd::{Compression, MultifdConfig},
};

use self::common::{PAGE_SIZE, Vm, assert_same, channels, constant_rate, fill, init_tracing};

fn config(channels: u8, compression: Compression) -> MigrationConfig {
    MigrationConfig::default().with_multifd(
        MultifdConfig::default()
            .with_channels(channels)
            .with_compression(compression),
    )
}

////////////////////////////////////////////////////////////////////////////////
// Transfer
////////////////////////////////////////////////////////////////////////////////

#[test]
fn loopback_copies_the_guest() -> Result<(), MigrationError> {
    init_tracing();

    let config = config(3, Compression::Zstd);
    let source = Vm::new(config.clone(), 256)?;
    let destination = Vm::new(config, 256)?;
    fill(&source.ram, 0x11)?;

    let (send_ends, recv_ends) = channels(3);
    let mut outgoing = source.engine.start_outgoing(send_ends)?;
    let incoming = destination.engine.start_incoming()?;
    for end in recv_ends {
        incoming.accept(end)?;
    }
    assert!(incoming.all_channels_created());
    assert_eq!(source.engine.status(), MigrationStatus::Active);

    // First pass over the whole block.
    outgoing.send_block(&source.ram)?;
    outgoing.sync()?;
    incoming.sync()?;

    // The guest keeps running and dirties a few pages.
    let dirty = [3, 4, 100, 255];
    for index in dirty {
        source
            .ram
            .write_page(RamAddr(index * PAGE_SIZE), &[0xc3; PAGE_SIZE as usize])?;
    }

    for index in dirty {
        outgoing.send_range(&source.ram, index * PAGE_SIZE..(index + 1) * PAGE_SIZE)?;
    }

    let sent = outgoing.finish()?;
    let received = incoming.finish()?;
    assert_same(&source, &destination)?;

    let pages = |stats: &[livemig::multifd::ChannelStats]| {
        stats
            .iter()
            .map(|s| s.normal_pages + s.zero_pages)
            .sum::<u64>()
    };
    assert_eq!(pages(&sent), 256 + dirty.len() as u64);
    assert_eq!(pages(&received), pages(&sent));

    assert_eq!(source.engine.status(), MigrationStatus::Completed);
    assert_eq!(destination.engine.status(), MigrationStatus::Completed);
    Ok(())
}

#[test]
fn unaligned_range_is_not_fatal() -> Result<(), MigrationError> {
    let config = config(1, Compression::None);
    let source = Vm::new(config.clone(), 8)?;
    let destination = Vm::new(config, 8)?;

    let (send_ends, recv_ends) = channels(1);
    let mut outgoing = source.engine.start_outgoing(send_ends)?;
    let incoming = destination.engine.start_incoming()?;
    for end in recv_ends {
        incoming.accept(end)?;
    }

    assert!(matches!(
        outgoing.send_range(&source.ram, 0..PAGE_SIZE / 2),
        Err(MigrationError::InvalidParameter { name: "range", .. })
    ));
    assert_eq!(source.engine.status(), MigrationStatus::Active);

    outgoing.send_block(&source.ram)?;
    outgoing.finish()?;
    incoming.finish()?;
    assert_eq!(source.engine.status(), MigrationStatus::Completed);
    Ok(())
}

#[test]
fn broken_channel_fails_both_sides() -> Result<(), MigrationError> {
    init_tracing();

    let config = config(3, Compression::None);
    let source = Vm::new(config.clone(), 300)?;
    let destination = Vm::new(config, 300)?;
    fill(&source.ram, 0x22)?;

    let (send_ends, recv_ends) = channels(3);
    let mut outgoing = source.engine.start_outgoing(send_ends)?;
    let incoming = destination.engine.start_incoming()?;
    for end in &recv_ends {
        incoming.accept(end.clone())?;
    }

    recv_ends[2].shutdown()?;

    let result = outgoing.send_block(&source.ram).and_then(|()| outgoing.sync());
    assert!(matches!(result, Err(MigrationError::Aborted(_))));
    assert!(incoming.sync().is_err());

    assert!(matches!(
        source.engine.status(),
        MigrationStatus::Failed { .. }
    ));
    assert!(matches!(
        destination.engine.status(),
        MigrationStatus::Failed { .. }
    ));

    // Later errors do not replace the first one.
    let reason = source.engine.status();
    assert!(outgoing.sync().is_err());
    assert_eq!(source.engine.status(), reason);

    outgoing.cancel();
    incoming.cancel();

    // A failed attempt can be retried.
    let (send_ends, recv_ends) = channels(3);
    let mut outgoing = source.engine.start_outgoing(send_ends)?;
    let incoming = destination.engine.start_incoming()?;
    for end in recv_ends {
        incoming.accept(end)?;
    }

    outgoing.send_block(&source.ram)?;
    outgoing.finish()?;
    incoming.finish()?;
    assert_same(&source, &destination)?;
    assert_eq!(destination.engine.status(), MigrationStatus::Completed);
    Ok(())
}

#[test]
fn abandoned_migration_fails() -> Result<(), MigrationError> {
    let config = config(2, Compression::Zlib);
    let source = Vm::new(config.clone(), 16)?;
    let destination = Vm::new(config, 16)?;

    let (send_ends, recv_ends) = channels(2);
    let outgoing = source.engine.start_outgoing(send_ends)?;
    let incoming = destination.engine.start_incoming()?;
    for end in recv_ends {
        incoming.accept(end)?;
    }

    drop(outgoing);
    assert!(matches!(
        source.engine.status(),
        MigrationStatus::Failed { .. }
    ));

    assert!(incoming.finish().is_err());
    assert!(matches!(
        destination.engine.status(),
        MigrationStatus::Failed { .. }
    ));
    Ok(())
}

#[test]
fn second_transfer_is_rejected_while_active() -> Result<(), MigrationError> {
    let config = config(1, Compression::None);
    let source = Vm::new(config, 4)?;

    let (send_ends, _recv_ends) = channels(1);
    let outgoing = source.engine.start_outgoing(send_ends)?;

    let (send_ends, _recv_ends) = channels(1);
    assert!(source.engine.start_outgoing(send_ends).is_err());
    assert!(source.engine.start_incoming().is_err());

    outgoing.cancel();
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Dirty rate and dirty limit
////////////////////////////////////////////////////////////////////////////////

#[test]
fn dirty_rate_of_an_idle_guest_is_zero() -> Result<(), MigrationError> {
    let config = MigrationConfig::default().with_dirty_rate(
        SamplerConfig::default()
            .with_sample_pages_per_gib(4096)
            .with_calc_time(Duration::from_millis(50)),
    );
    let vm = Vm::new(config, 1024)?;
    fill(&vm.ram, 0x33)?;

    let stat = vm.engine.measure_dirty_rate()?;
    assert_eq!(stat.total_sample_count, 16);
    assert_eq!(stat.total_dirty_samples, 0);
    assert_eq!(stat.dirty_rate, 0);
    Ok(())
}

#[test]
fn dirty_limit_throttles_a_fast_vcpu() -> Result<(), MigrationError> {
    let config = MigrationConfig::default().with_dirty_limit(
        DirtyLimitConfig::default()
            .with_period(Duration::from_millis(10))
            .with_max_vcpus(2),
    );
    let vm = Vm::new(config, 16)?;
    let engine = livemig::MigrationEngine::new(
        vm.engine.config().clone(),
        vm.blocks.clone(),
        constant_rate(1000),
    )?;

    engine.set_vcpu_dirty_limit(Some(VcpuId(0)), 10)?;

    let limits = engine.query_vcpu_dirty_limit();
    assert_eq!(limits.len(), 1);
    assert_eq!(limits[0].cpu_index, VcpuId(0));
    assert_eq!(limits[0].limit_rate, 10);

    let deadline = Instant::now() + Duration::from_secs(5);
    let throttled = loop {
        let throttle = engine
            .dirty_limit()
            .vcpu_state(VcpuId(0))
            .map_or(0, |state| state.throttle_us_per_full);

        if throttle > 0 || Instant::now() >= deadline {
            break throttle > 0;
        }

        thread::sleep(Duration::from_millis(10));
    };
    assert!(throttled, "vCPU 0 was never throttled");

    // Unlimited vCPUs never sleep.
    assert_eq!(engine.dirty_limit().vcpu_ring_full(VcpuId(1)), Duration::ZERO);

    assert!(engine.set_vcpu_dirty_limit(Some(VcpuId(2)), 10).is_err());
    assert!(engine.set_vcpu_dirty_limit(None, 0).is_err());

    engine.cancel_vcpu_dirty_limit(None)?;
    assert!(engine.query_vcpu_dirty_limit().is_empty());
    assert!(!engine.dirty_limit().is_in_service());
    Ok(())
}
