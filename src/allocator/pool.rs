use crate::allocator::block_vector::BlockVector;
use crate::memory::DeviceSize;

/// Handle of a custom pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pool(pub(crate) u64);

impl Pool {
    pub fn id(&self) -> u64 {
        self.0
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PoolCreateFlags: u32 {
        const IGNORE_BUFFER_IMAGE_GRANULARITY = 0x0000_0002;
        const LINEAR_ALGORITHM = 0x0000_0004;
        const ALGORITHM_MASK = Self::LINEAR_ALGORITHM.bits();
    }
}

#[derive(Clone, Debug, Default)]
pub struct PoolCreateInfo {
    pub memory_type_index: u32,
    pub flags: PoolCreateFlags,
    /// Fixed size of every block. Zero lets the allocator choose.
    pub block_size: DeviceSize,
    pub min_block_count: usize,
    /// Zero means unlimited.
    pub max_block_count: usize,
    pub priority: f32,
    pub min_allocation_alignment: DeviceSize,
    pub name: Option<String>,
}

pub(crate) struct PoolEntry {
    pub vector: BlockVector,
    pub name: Option<String>,
}
