use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::memory::device::{DeviceMemory, DeviceMemoryBackend, HeapBudget, MappedMemoryRange};
use crate::memory::{
    DeviceLimits, DeviceSize, MemoryHeap, MemoryHeapFlags, MemoryProperties, MemoryPropertyFlags,
    MemoryType,
};

const MIB: DeviceSize = 1024 * 1024;

/// Flushed and invalidated ranges kept for inspection. Older ones are dropped.
const RECORDED_RANGES_MAX: usize = 256;

/// A simulated device whose memory lives in host RAM.
///
/// Host-visible memory objects are backed by zeroed bytes so they can be mapped, written and
/// read back. Other memory types only account for their size.
pub struct HostMemoryDevice {
    properties: MemoryProperties,
    limits: DeviceLimits,
    state: Mutex<HostMemoryState>,
}

struct HostMemoryState {
    next_id: u64,
    objects: HashMap<u64, HostMemoryObject>,
    heap_usage: Vec<DeviceSize>,
    flushed_ranges: VecDeque<MappedMemoryRange>,
    invalidated_ranges: VecDeque<MappedMemoryRange>,
}

struct HostMemoryObject {
    memory_type_index: u32,
    size: DeviceSize,
    bytes: Option<Box<[u8]>>,
    is_mapped: bool,
}

impl HostMemoryDevice {
    pub fn new(properties: MemoryProperties, limits: DeviceLimits) -> Result<Self> {
        properties.validate()?;

        if !limits.buffer_image_granularity.is_power_of_two()
            || !limits.non_coherent_atom_size.is_power_of_two()
        {
            return Err(Error::invalid_argument(
                "Device granularity limits must be powers of two",
            ));
        }

        let heap_count = properties.memory_heaps.len();

        Ok(Self {
            properties,
            limits,
            state: Mutex::new(HostMemoryState {
                next_id: 1,
                objects: HashMap::new(),
                heap_usage: vec![0; heap_count],
                flushed_ranges: VecDeque::new(),
                invalidated_ranges: VecDeque::new(),
            }),
        })
    }

    /// Separate device-local VRAM and host RAM heaps, with a small host-visible VRAM window.
    pub fn discrete_gpu() -> Self {
        Self::discrete_gpu_with_heap_sizes(256 * MIB, 256 * MIB)
    }

    pub fn discrete_gpu_with_heap_sizes(device_heap: DeviceSize, host_heap: DeviceSize) -> Self {
        let properties = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT
                        | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 0,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: device_heap,
                    flags: MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: host_heap,
                    flags: MemoryHeapFlags::empty(),
                },
            ],
        };

        Self::from_trusted_properties(
            properties,
            DeviceLimits {
                buffer_image_granularity: 1024,
                non_coherent_atom_size: 64,
                max_memory_allocation_count: 4096,
            },
        )
    }

    /// One shared heap where every memory type is device-local.
    pub fn integrated_gpu() -> Self {
        Self::integrated_gpu_with_heap_size(512 * MIB)
    }

    pub fn integrated_gpu_with_heap_size(heap: DeviceSize) -> Self {
        let properties = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT
                        | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 0,
                },
            ],
            memory_heaps: vec![MemoryHeap {
                size: heap,
                flags: MemoryHeapFlags::DEVICE_LOCAL,
            }],
        };

        Self::from_trusted_properties(
            properties,
            DeviceLimits {
                buffer_image_granularity: 1,
                non_coherent_atom_size: 64,
                max_memory_allocation_count: 4096,
            },
        )
    }

    fn from_trusted_properties(properties: MemoryProperties, limits: DeviceLimits) -> Self {
        let heap_count = properties.memory_heaps.len();

        Self {
            properties,
            limits,
            state: Mutex::new(HostMemoryState {
                next_id: 1,
                objects: HashMap::new(),
                heap_usage: vec![0; heap_count],
                flushed_ranges: VecDeque::new(),
                invalidated_ranges: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn memory_object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn heap_usage(&self, heap_index: u32) -> DeviceSize {
        self.lock().heap_usage[heap_index as usize]
    }

    pub fn is_mapped(&self, memory: DeviceMemory) -> bool {
        self.lock()
            .objects
            .get(&memory.0)
            .map(|object| object.is_mapped)
            .unwrap_or(false)
    }

    /// Ranges flushed since the last call, oldest first.
    pub fn take_flushed_ranges(&self) -> Vec<MappedMemoryRange> {
        self.lock().flushed_ranges.drain(..).collect()
    }

    /// Ranges invalidated since the last call, oldest first.
    pub fn take_invalidated_ranges(&self) -> Vec<MappedMemoryRange> {
        self.lock().invalidated_ranges.drain(..).collect()
    }

    /// Copies bytes between two host-visible memory objects, the way a transfer queue would
    /// when executing a defragmentation move.
    pub fn copy(
        &self,
        src: DeviceMemory,
        src_offset: DeviceSize,
        dst: DeviceMemory,
        dst_offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<()> {
        let mut state = self.lock();

        let data = {
            let src_object = state.objects.get(&src.0).ok_or_else(|| {
                Error::invalid_handle(format!("Unknown device memory: {}", src.0))
            })?;
            let bytes = src_object
                .bytes
                .as_ref()
                .ok_or(Error::MemoryMapFailed)?;
            let range = checked_range(src_offset, size, src_object.size)?;
            bytes[range].to_vec()
        };

        let dst_object = state
            .objects
            .get_mut(&dst.0)
            .ok_or_else(|| Error::invalid_handle(format!("Unknown device memory: {}", dst.0)))?;
        let dst_size = dst_object.size;
        let bytes = dst_object.bytes.as_mut().ok_or(Error::MemoryMapFailed)?;
        let range = checked_range(dst_offset, size, dst_size)?;
        bytes[range].copy_from_slice(&data);

        Ok(())
    }
}

fn record_ranges(recorded: &mut VecDeque<MappedMemoryRange>, ranges: &[MappedMemoryRange]) {
    recorded.extend(ranges.iter().copied());

    let excess = recorded.len().saturating_sub(RECORDED_RANGES_MAX);
    recorded.drain(..excess);
}

fn checked_range(
    offset: DeviceSize,
    size: DeviceSize,
    limit: DeviceSize,
) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(offset as usize..end as usize),
        _ => Err(Error::invalid_argument(format!(
            "Range {offset}+{size} exceeds memory object of {limit} bytes"
        ))),
    }
}

impl DeviceMemoryBackend for HostMemoryDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocate_memory(&self, memory_type_index: u32, size: DeviceSize) -> Result<DeviceMemory> {
        let memory_type = match self.properties.memory_types.get(memory_type_index as usize) {
            Some(memory_type) => *memory_type,
            None => {
                return Err(Error::invalid_argument(format!(
                    "The given memory type index is invalid: {memory_type_index}"
                )))
            }
        };

        if size == 0 {
            return Err(Error::invalid_argument("Cannot allocate zero bytes"));
        }

        let mut state = self.lock();

        if state.objects.len() >= self.limits.max_memory_allocation_count as usize {
            return Err(Error::TooManyObjects);
        }

        let heap_index = memory_type.heap_index as usize;
        let heap_size = self.properties.memory_heaps[heap_index].size;
        if state.heap_usage[heap_index] + size > heap_size {
            return Err(Error::OutOfDeviceMemory);
        }

        let bytes = match memory_type
            .property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE)
        {
            true => {
                let length = usize::try_from(size).map_err(|_| Error::OutOfHostMemory)?;
                Some(vec![0u8; length].into_boxed_slice())
            }
            false => None,
        };

        let id = state.next_id;
        state.next_id += 1;
        state.heap_usage[heap_index] += size;
        state.objects.insert(
            id,
            HostMemoryObject {
                memory_type_index,
                size,
                bytes,
                is_mapped: false,
            },
        );

        Ok(DeviceMemory(id))
    }

    fn free_memory(&self, memory: DeviceMemory) {
        let mut state = self.lock();

        match state.objects.remove(&memory.0) {
            Some(object) => {
                let heap_index = self.properties.heap_index(object.memory_type_index) as usize;
                state.heap_usage[heap_index] -= object.size;
            }
            None => log::warn!("Ignoring free of unknown device memory: {}", memory.0),
        }
    }

    fn map_memory(&self, memory: DeviceMemory) -> Result<NonNull<u8>> {
        let mut state = self.lock();

        let object = state
            .objects
            .get_mut(&memory.0)
            .ok_or_else(|| Error::invalid_handle(format!("Unknown device memory: {}", memory.0)))?;

        if object.is_mapped {
            return Err(Error::MemoryMapFailed);
        }

        let bytes = object.bytes.as_mut().ok_or(Error::MemoryMapFailed)?;
        let pointer = NonNull::new(bytes.as_mut_ptr()).ok_or(Error::MemoryMapFailed)?;
        object.is_mapped = true;

        Ok(pointer)
    }

    fn unmap_memory(&self, memory: DeviceMemory) {
        if let Some(object) = self.lock().objects.get_mut(&memory.0) {
            object.is_mapped = false;
        }
    }

    fn flush_memory_ranges(&self, ranges: &[MappedMemoryRange]) -> Result<()> {
        record_ranges(&mut self.lock().flushed_ranges, ranges);
        Ok(())
    }

    fn invalidate_memory_ranges(&self, ranges: &[MappedMemoryRange]) -> Result<()> {
        record_ranges(&mut self.lock().invalidated_ranges, ranges);
        Ok(())
    }

    fn heap_budgets(&self) -> Option<Vec<HeapBudget>> {
        let state = self.lock();

        Some(
            self.properties
                .memory_heaps
                .iter()
                .zip(state.heap_usage.iter())
                .map(|(heap, usage)| HeapBudget {
                    usage: *usage,
                    budget: heap.size,
                })
                .collect(),
        )
    }
}
