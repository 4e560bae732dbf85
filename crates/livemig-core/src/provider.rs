use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::{MigrationError, RamBlock};

/// A source of RAM blocks.
///
/// Consumers only read block geometry and host bytes; the provider owns the
/// blocks and may add or remove them at any time. Implementations must keep
/// their critical sections short, since the sampler and the channels call
/// into the provider while the guest keeps running.
pub trait RamBlockProvider: Send + Sync {
    /// Returns all registered blocks, in registration order.
    fn blocks(&self) -> Vec<Arc<RamBlock>>;

    /// Returns the block with the given id.
    fn block_by_id(&self, id: &str) -> Option<Arc<RamBlock>>;

    /// Returns the blocks eligible for migration.
    fn migratable_blocks(&self) -> Vec<Arc<RamBlock>> {
        self.blocks()
            .into_iter()
            .filter(|block| block.is_migratable())
            .collect()
    }
}

/// An ordered registry of RAM blocks keyed by id.
///
/// Readers take a snapshot of `Arc` handles under a read lock, so a removed
/// block stays alive until the last reader drops it.
#[derive(Default)]
pub struct RamBlockList {
    blocks: RwLock<IndexMap<String, Arc<RamBlock>>>,
}

impl RamBlockList {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a block.
    pub fn add(&self, block: RamBlock) -> Result<Arc<RamBlock>, MigrationError> {
        let mut blocks = self.blocks.write();

        if blocks.contains_key(block.id()) {
            return Err(MigrationError::DuplicateRamBlock(block.id().to_owned()));
        }

        let block = Arc::new(block);
        blocks.insert(block.id().to_owned(), block.clone());

        tracing::debug!(id = block.id(), gpa = %block.gpa(), len = block.used_length(), "RAM block added");
        Ok(block)
    }

    /// Unregisters a block.
    pub fn remove(&self, id: &str) -> Option<Arc<RamBlock>> {
        let block = self.blocks.write().shift_remove(id);

        if block.is_some() {
            tracing::debug!(id, "RAM block removed");
        }

        block
    }

    /// Returns the number of registered blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Returns `true` if no block is registered.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl RamBlockProvider for RamBlockList {
    fn blocks(&self) -> Vec<Arc<RamBlock>> {
        self.blocks.read().values().cloned().collect()
    }

    fn block_by_id(&self, id: &str) -> Option<Arc<RamBlock>> {
        self.blocks.read().get(id).cloned()
    }
}

impl<T> RamBlockProvider for Arc<T>
where
    T: RamBlockProvider + ?Sized,
{
    fn blocks(&self) -> Vec<Arc<RamBlock>> {
        (**self).blocks()
    }

    fn block_by_id(&self, id: &str) -> Option<Arc<RamBlock>> {
        (**self).block_by_id(id)
    }

    fn migratable_blocks(&self) -> Vec<Arc<RamBlock>> {
        (**self).migratable_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Gpa;

    #[test]
    fn registry() -> Result<(), MigrationError> {
        let list = RamBlockList::new();
        list.add(RamBlock::new("a", Gpa(0), 4096, 4096)?)?;
        let b = list.add(RamBlock::new("b", Gpa(0x1000), 4096, 4096)?)?;
        b.set_migratable(false);

        assert!(matches!(
            list.add(RamBlock::new("a", Gpa(0), 4096, 4096)?),
            Err(MigrationError::DuplicateRamBlock(_))
        ));

        let ids: Vec<_> = list.migratable_blocks().iter().map(|b| b.id().to_owned()).collect();
        assert_eq!(ids, ["a"]);

        let snapshot = list.blocks();
        assert!(list.remove("a").is_some());
        assert_eq!(snapshot.len(), 2);
        assert!(list.block_by_id("a").is_none());
        assert_eq!(list.len(), 1);
        Ok(())
    }
}
