use std::ptr::NonNull;

use crate::allocator::block::MappedPtr;
use crate::allocator::pool::Pool;
use crate::error::{Error, Result};
use crate::memory::device::DeviceMemory;
use crate::memory::{DeviceSize, MemoryProperties, MemoryPropertyFlags};
use crate::metadata::{AllocHandle, AllocationStrategy, SuballocationType};

/// Handle of one allocation made by an [`Allocator`](crate::allocator::Allocator).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Allocation(pub(crate) u64);

impl Allocation {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Intended usage of the allocated memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemoryUsage {
    #[default]
    Unknown = 0,
    GpuOnly = 1,
    CpuOnly = 2,
    CpuToGpu = 3,
    GpuToCpu = 4,
    CpuCopy = 5,
    GpuLazilyAllocated = 6,
    Auto = 7,
    AutoPreferDevice = 8,
    AutoPreferHost = 9,
}

impl MemoryUsage {
    pub fn is_auto(&self) -> bool {
        matches!(
            self,
            MemoryUsage::Auto | MemoryUsage::AutoPreferDevice | MemoryUsage::AutoPreferHost
        )
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocationCreateFlags: u32 {
        const DEDICATED_MEMORY = 0x0000_0001;
        const NEVER_ALLOCATE = 0x0000_0002;
        const MAPPED = 0x0000_0004;
        const USER_DATA_COPY_STRING = 0x0000_0020;
        const UPPER_ADDRESS = 0x0000_0040;
        const DONT_BIND = 0x0000_0080;
        const WITHIN_BUDGET = 0x0000_0100;
        const CAN_ALIAS = 0x0000_0200;
        const HOST_ACCESS_SEQUENTIAL_WRITE = 0x0000_0400;
        const HOST_ACCESS_RANDOM = 0x0000_0800;
        const HOST_ACCESS_ALLOW_TRANSFER_INSTEAD = 0x0000_1000;
        const STRATEGY_MIN_MEMORY = 0x0001_0000;
        const STRATEGY_MIN_TIME = 0x0002_0000;
        const STRATEGY_MIN_OFFSET = 0x0004_0000;
        const STRATEGY_BEST_FIT = Self::STRATEGY_MIN_MEMORY.bits();
        const STRATEGY_FIRST_FIT = Self::STRATEGY_MIN_TIME.bits();
        const STRATEGY_MASK = Self::STRATEGY_MIN_MEMORY.bits()
            | Self::STRATEGY_MIN_TIME.bits()
            | Self::STRATEGY_MIN_OFFSET.bits();
    }
}

impl AllocationCreateFlags {
    pub fn strategy(&self) -> AllocationStrategy {
        if self.contains(AllocationCreateFlags::STRATEGY_MIN_OFFSET) {
            AllocationStrategy::MinOffset
        } else if self.contains(AllocationCreateFlags::STRATEGY_MIN_TIME) {
            AllocationStrategy::MinTime
        } else {
            AllocationStrategy::MinMemory
        }
    }

    pub fn allows_host_access(&self) -> bool {
        self.intersects(
            AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
                | AllocationCreateFlags::HOST_ACCESS_RANDOM,
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct AllocationCreateInfo {
    pub flags: AllocationCreateFlags,
    pub usage: MemoryUsage,
    pub required_flags: MemoryPropertyFlags,
    pub preferred_flags: MemoryPropertyFlags,
    /// Acceptable memory types. Zero accepts all of them.
    pub memory_type_bits: u32,
    pub pool: Option<Pool>,
    pub user_data: u64,
    pub name: Option<String>,
    pub priority: f32,
}

/// Parameters of an existing allocation.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationInfo {
    pub memory_type: u32,
    pub device_memory: DeviceMemory,
    pub offset: DeviceSize,
    pub size: DeviceSize,
    /// Pointer to the first byte of the allocation while it is mapped.
    pub mapped_data: Option<NonNull<u8>>,
    pub user_data: u64,
    pub name: Option<String>,
    /// The pool's priority for block allocations, the requested one for dedicated memory.
    pub priority: f32,
}

/// Which block vector a block allocation lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum VectorId {
    Default(u32),
    Pool(u64),
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Placement {
    Block {
        vector: VectorId,
        block_id: u64,
        handle: AllocHandle,
    },
    Dedicated {
        memory: DeviceMemory,
        mapped: Option<MappedPtr>,
    },
}

#[derive(Debug)]
pub(crate) struct AllocationRecord {
    pub memory_type_index: u32,
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    pub kind: SuballocationType,
    pub placement: Placement,
    pub pool: Option<Pool>,
    pub user_data: u64,
    pub name: Option<String>,
    /// Outstanding `map_memory` calls.
    pub map_count: u32,
    pub persistent_map: bool,
    /// Priority of the device memory backing the allocation, from 0 to 1.
    pub priority: f32,
}

impl AllocationRecord {
    pub const MAX_MAP_COUNT: u32 = 0x7F;

    pub fn total_map_count(&self) -> u32 {
        self.map_count + self.persistent_map as u32
    }

    pub fn is_dedicated(&self) -> bool {
        matches!(self.placement, Placement::Dedicated { .. })
    }
}

/// Property flags an allocation must have, should have and should avoid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct MemoryPreferences {
    pub required: MemoryPropertyFlags,
    pub preferred: MemoryPropertyFlags,
    pub not_preferred: MemoryPropertyFlags,
}

pub(crate) fn find_memory_preferences(
    is_integrated_gpu: bool,
    create_info: &AllocationCreateInfo,
) -> Result<MemoryPreferences> {
    let mut preferences = MemoryPreferences {
        required: create_info.required_flags,
        preferred: create_info.preferred_flags,
        not_preferred: MemoryPropertyFlags::empty(),
    };

    let flags = create_info.flags;
    let preferred_host_visible = create_info
        .preferred_flags
        .contains(MemoryPropertyFlags::HOST_VISIBLE);

    match create_info.usage {
        MemoryUsage::Unknown => {}
        MemoryUsage::GpuOnly => {
            if !is_integrated_gpu || !preferred_host_visible {
                preferences.preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
            }
        }
        MemoryUsage::CpuOnly => {
            preferences.required |=
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        }
        MemoryUsage::CpuToGpu => {
            preferences.required |= MemoryPropertyFlags::HOST_VISIBLE;
            if !is_integrated_gpu || !preferred_host_visible {
                preferences.preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
            }
        }
        MemoryUsage::GpuToCpu => {
            preferences.required |= MemoryPropertyFlags::HOST_VISIBLE;
            preferences.preferred |= MemoryPropertyFlags::HOST_CACHED;
        }
        MemoryUsage::CpuCopy => {
            preferences.not_preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
        }
        MemoryUsage::GpuLazilyAllocated => {
            preferences.required |= MemoryPropertyFlags::LAZILY_ALLOCATED;
        }
        MemoryUsage::Auto | MemoryUsage::AutoPreferDevice | MemoryUsage::AutoPreferHost => {
            if flags.contains(AllocationCreateFlags::MAPPED) && !flags.allows_host_access() {
                return Err(Error::feature_not_present(
                    "Mapping memory with automatic usage requires a HOST_ACCESS flag",
                ));
            }

            let prefer_device = create_info.usage == MemoryUsage::AutoPreferDevice;
            let prefer_host = create_info.usage == MemoryUsage::AutoPreferHost;
            let allow_transfer_instead =
                flags.contains(AllocationCreateFlags::HOST_ACCESS_ALLOW_TRANSFER_INSTEAD);

            if flags.contains(AllocationCreateFlags::HOST_ACCESS_RANDOM) {
                if !is_integrated_gpu && allow_transfer_instead && !prefer_host {
                    preferences.preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
                } else {
                    preferences.required |=
                        MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED;
                }
            } else if flags.contains(AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE) {
                preferences.not_preferred |= MemoryPropertyFlags::HOST_CACHED;

                if !is_integrated_gpu && allow_transfer_instead && !prefer_host {
                    preferences.preferred |=
                        MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::HOST_VISIBLE;
                } else {
                    preferences.required |= MemoryPropertyFlags::HOST_VISIBLE;
                    match prefer_host {
                        true => preferences.not_preferred |= MemoryPropertyFlags::DEVICE_LOCAL,
                        false => preferences.preferred |= MemoryPropertyFlags::DEVICE_LOCAL,
                    }
                }
            } else {
                match prefer_host && !prefer_device {
                    true => preferences.not_preferred |= MemoryPropertyFlags::DEVICE_LOCAL,
                    false => preferences.preferred |= MemoryPropertyFlags::DEVICE_LOCAL,
                }
            }
        }
    }

    Ok(preferences)
}

/// Picks the acceptable memory type that misses the fewest preferred flags and carries the
/// fewest unwanted ones.
pub(crate) fn find_memory_type_index(
    properties: &MemoryProperties,
    memory_type_bits: u32,
    preferences: &MemoryPreferences,
) -> Result<u32> {
    let mut best: Option<(u32, u32)> = None;

    for (index, memory_type) in properties.memory_types.iter().enumerate() {
        if memory_type_bits & (1 << index) == 0 {
            continue;
        }

        let flags = memory_type.property_flags;
        if !flags.contains(preferences.required) {
            continue;
        }

        let cost = (preferences.preferred - flags).bits().count_ones()
            + (preferences.not_preferred & flags).bits().count_ones();

        if best.map(|(_, best_cost)| cost < best_cost).unwrap_or(true) {
            best = Some((index as u32, cost));
            if cost == 0 {
                break;
            }
        }
    }

    match best {
        Some((index, _)) => Ok(index),
        None => Err(Error::feature_not_present(
            "No memory type matches the requested properties",
        )),
    }
}
