#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use livemig::{
    Gpa, MigrationConfig, MigrationEngine, MigrationError, RamAddr, RamBlock, RamBlockList,
    RamBlockProvider as _, Transport, VcpuId, dirtylimit::VcpuRateSource, pipe,
};

pub const PAGE_SIZE: u64 = 4096;
pub const RAM_GPA: Gpa = Gpa(0x10_0000);

/// One VM: its RAM and the engine that migrates it.
pub struct Vm {
    pub ram: Arc<RamBlock>,
    pub blocks: Arc<RamBlockList>,
    pub engine: MigrationEngine,
}

impl Vm {
    pub fn new(config: MigrationConfig, pages: u64) -> Result<Self, MigrationError> {
        let blocks = Arc::new(RamBlockList::new());
        let ram = blocks.add(RamBlock::new("pc.ram", RAM_GPA, PAGE_SIZE, pages * PAGE_SIZE)?)?;
        let engine = MigrationEngine::new(config, blocks.clone(), idle_vcpus())?;

        Ok(Self {
            ram,
            blocks,
            engine,
        })
    }

    pub fn page(&self, index: u64) -> Result<Vec<u8>, MigrationError> {
        let mut page = vec![0; PAGE_SIZE as usize];
        self.ram.read_page(RamAddr(index * PAGE_SIZE), &mut page)?;
        Ok(page)
    }
}

/// Every vCPU reports the same fixed rate.
pub fn constant_rate(mbps: u64) -> Arc<dyn VcpuRateSource> {
    Arc::new(move |vcpus: &[VcpuId], _: Duration| -> Vec<(VcpuId, u64)> {
        vcpus.iter().map(|vcpu| (*vcpu, mbps)).collect()
    })
}

pub fn idle_vcpus() -> Arc<dyn VcpuRateSource> {
    constant_rate(0)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fills `ram` with zero, repetitive and noisy pages.
pub fn fill(ram: &RamBlock, salt: u8) -> Result<(), MigrationError> {
    let mut seed = 0x9e37_79b9_7f4a_7c15_u64 ^ u64::from(salt);

    for index in 0..ram.page_count() {
        let page: Vec<u8> = match index % 3 {
            0 => vec![0; PAGE_SIZE as usize],
            1 => vec![index as u8 ^ salt; PAGE_SIZE as usize],
            _ => (0..PAGE_SIZE)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    seed as u8
                })
                .collect(),
        };

        ram.write_page(RamAddr(index * PAGE_SIZE), &page)?;
    }

    Ok(())
}

pub fn assert_same(source: &Vm, destination: &Vm) -> Result<(), MigrationError> {
    let destination_ram = destination
        .blocks
        .block_by_id("pc.ram")
        .ok_or_else(|| MigrationError::UnknownRamBlock("pc.ram".into()))?;
    assert_eq!(source.ram.page_count(), destination_ram.page_count());

    for index in 0..source.ram.page_count() {
        assert!(
            source.page(index)? == destination.page(index)?,
            "page {index} differs"
        );
    }

    Ok(())
}

/// Returns both ends of `channels` in-memory connections.
pub fn channels(channels: u8) -> (Vec<Arc<dyn Transport>>, Vec<Arc<dyn Transport>>) {
    let mut source = Vec::new();
    let mut destination = Vec::new();

    for _ in 0..channels {
        let (a, b) = pipe();
        source.push(Arc::new(a) as Arc<dyn Transport>);
        destination.push(Arc::new(b) as Arc<dyn Transport>);
    }

    (source, destination)
}
