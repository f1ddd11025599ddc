use crate::error::{Error, Result};

pub mod device;
pub mod host;
pub mod wgpu_device;

pub type DeviceSize = u64;

/// Special size meaning "until the end of the allocation".
pub const WHOLE_SIZE: DeviceSize = u64::MAX;

pub const MAX_MEMORY_TYPES: usize = 32;
pub const MAX_MEMORY_HEAPS: usize = 16;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 0x0000_0001;
        const HOST_VISIBLE = 0x0000_0002;
        const HOST_COHERENT = 0x0000_0004;
        const HOST_CACHED = 0x0000_0008;
        const LAZILY_ALLOCATED = 0x0000_0010;
        const PROTECTED = 0x0000_0020;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemoryHeapFlags: u32 {
        const DEVICE_LOCAL = 0x0000_0001;
        const MULTI_INSTANCE = 0x0000_0002;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: DeviceSize,
    pub flags: MemoryHeapFlags,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

impl MemoryProperties {
    pub fn validate(&self) -> Result<()> {
        if self.memory_types.is_empty() || self.memory_types.len() > MAX_MEMORY_TYPES {
            return Err(Error::invalid_argument(format!(
                "Memory type count must be within 1..={MAX_MEMORY_TYPES}: {}",
                self.memory_types.len()
            )));
        }

        if self.memory_heaps.is_empty() || self.memory_heaps.len() > MAX_MEMORY_HEAPS {
            return Err(Error::invalid_argument(format!(
                "Memory heap count must be within 1..={MAX_MEMORY_HEAPS}: {}",
                self.memory_heaps.len()
            )));
        }

        for (index, memory_type) in self.memory_types.iter().enumerate() {
            if memory_type.heap_index as usize >= self.memory_heaps.len() {
                return Err(Error::invalid_argument(format!(
                    "Memory type {index} refers to a missing heap: {}",
                    memory_type.heap_index
                )));
            }
        }

        Ok(())
    }

    pub fn heap_index(&self, memory_type_index: u32) -> u32 {
        self.memory_types[memory_type_index as usize].heap_index
    }

    pub fn is_non_coherent(&self, memory_type_index: u32) -> bool {
        let flags = self.memory_types[memory_type_index as usize].property_flags;
        flags.contains(MemoryPropertyFlags::HOST_VISIBLE)
            && !flags.contains(MemoryPropertyFlags::HOST_COHERENT)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub buffer_image_granularity: DeviceSize,
    pub non_coherent_atom_size: DeviceSize,
    pub max_memory_allocation_count: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            buffer_image_granularity: 1,
            non_coherent_atom_size: 1,
            max_memory_allocation_count: 4096,
        }
    }
}

/// Size, alignment and acceptable memory types of a resource, as a driver reports them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    pub memory_type_bits: u32,
}

impl MemoryRequirements {
    pub fn new(size: DeviceSize, alignment: DeviceSize) -> Self {
        Self {
            size,
            alignment,
            memory_type_bits: u32::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageTiling {
    #[default]
    Optimal,
    Linear,
}

pub fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// `None` when the aligned value does not fit in a `DeviceSize`.
pub fn checked_align_up(value: DeviceSize, alignment: DeviceSize) -> Option<DeviceSize> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

pub fn align_down(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Zero means "no alignment requirement".
pub fn normalize_alignment(alignment: DeviceSize) -> Result<DeviceSize> {
    match alignment {
        0 => Ok(1),
        alignment if alignment.is_power_of_two() => Ok(alignment),
        alignment => Err(Error::invalid_argument(format!(
            "Alignment must be a power of two: {alignment}"
        ))),
    }
}
