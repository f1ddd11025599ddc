use std::ptr::NonNull;

use crate::error::Result;
use crate::memory::{DeviceLimits, DeviceSize, MemoryHeapFlags, MemoryProperties};

/// Opaque handle of one device memory object, the unit of real allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceMemory(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedMemoryRange {
    pub memory: DeviceMemory,
    pub offset: DeviceSize,
    pub size: DeviceSize,
}

/// Usage and budget of one heap as reported by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapBudget {
    pub usage: DeviceSize,
    pub budget: DeviceSize,
}

pub trait DeviceMemoryBackend: Send + Sync {
    fn memory_properties(&self) -> &MemoryProperties;
    fn limits(&self) -> DeviceLimits;

    fn allocate_memory(&self, memory_type_index: u32, size: DeviceSize) -> Result<DeviceMemory>;
    fn free_memory(&self, memory: DeviceMemory);

    /// Maps the whole memory object and returns a pointer to its first byte. The pointer stays
    /// valid until `unmap_memory` or `free_memory` is called for the same object.
    fn map_memory(&self, memory: DeviceMemory) -> Result<NonNull<u8>>;
    fn unmap_memory(&self, memory: DeviceMemory);

    fn flush_memory_ranges(&self, ranges: &[MappedMemoryRange]) -> Result<()>;
    fn invalidate_memory_ranges(&self, ranges: &[MappedMemoryRange]) -> Result<()>;

    fn heap_budgets(&self) -> Option<Vec<HeapBudget>> {
        None
    }

    /// Devices whose every heap is device-local share memory with the host.
    fn is_integrated_gpu(&self) -> bool {
        self.memory_properties()
            .memory_heaps
            .iter()
            .all(|heap| heap.flags.contains(MemoryHeapFlags::DEVICE_LOCAL))
    }
}
