use std::ptr::NonNull;

use crate::allocator::allocation::{Allocation, AllocationRecord, Placement};
use crate::allocator::block::MappedPtr;
use crate::allocator::{Allocator, AllocatorState};
use crate::error::{Error, Result};
use crate::memory::device::MappedMemoryRange;
use crate::memory::{align_down, align_up, DeviceSize, WHOLE_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheOperation {
    Flush,
    Invalidate,
}

impl Allocator {
    /// Maps the allocation and returns a pointer to its first byte.
    ///
    /// Mappings are reference counted per allocation and per memory object, so an allocation
    /// may be mapped several times and its neighbours may be mapped at the same time.
    pub fn map_memory(&self, allocation: Allocation) -> Result<NonNull<u8>> {
        let mut state = self.lock();

        let record = state.record(allocation)?;
        if !self.context.is_host_visible(record.memory_type_index) {
            return Err(Error::MemoryMapFailed);
        }
        if record.map_count >= AllocationRecord::MAX_MAP_COUNT {
            return Err(Error::invalid_argument(format!(
                "Allocation {} is mapped too many times",
                allocation.0
            )));
        }

        let placement = record.placement;
        let backend = self.context.backend.as_ref();

        let pointer = match placement {
            Placement::Block {
                vector,
                block_id,
                handle,
            } => {
                let block = state
                    .vector_and_budget(vector)
                    .and_then(|(vector, _)| vector.block_mut(block_id))
                    .ok_or_else(|| Error::invalid_handle(format!("Unknown block: {block_id}")))?;
                block.map(backend, 1)?.offset(handle.offset())
            }
            Placement::Dedicated {
                mapped: Some(mapped),
                ..
            } => mapped.0,
            Placement::Dedicated {
                memory,
                mapped: None,
            } => {
                let pointer = backend.map_memory(memory)?;
                state.record_mut(allocation)?.placement = Placement::Dedicated {
                    memory,
                    mapped: Some(MappedPtr(pointer)),
                };
                pointer
            }
        };

        state.record_mut(allocation)?.map_count += 1;

        Ok(pointer)
    }

    pub fn unmap_memory(&self, allocation: Allocation) -> Result<()> {
        let mut state = self.lock();

        let record = state.record_mut(allocation)?;
        if record.map_count == 0 {
            log::error!("Unmapping allocation {} that is not mapped", allocation.0);
            return Err(Error::invalid_argument(format!(
                "Allocation {} is not mapped",
                allocation.0
            )));
        }

        record.map_count -= 1;
        let remaining = record.total_map_count();
        let placement = record.placement;
        let backend = self.context.backend.as_ref();

        match placement {
            Placement::Block {
                vector, block_id, ..
            } => {
                let block = state
                    .vector_and_budget(vector)
                    .and_then(|(vector, _)| vector.block_mut(block_id))
                    .ok_or_else(|| Error::invalid_handle(format!("Unknown block: {block_id}")))?;
                block.unmap(backend, 1);
            }
            Placement::Dedicated { memory, .. } => {
                if remaining == 0 {
                    state.record_mut(allocation)?.placement = Placement::Dedicated {
                        memory,
                        mapped: None,
                    };
                    backend.unmap_memory(memory);
                }
            }
        }

        Ok(())
    }

    /// Copies `data` into the allocation at `offset` and flushes the written range.
    pub fn write_mapped(&self, allocation: Allocation, offset: DeviceSize, data: &[u8]) -> Result<()> {
        self.check_range(allocation, offset, data.len() as DeviceSize)?;

        let pointer = self.map_memory(allocation)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                pointer.as_ptr().add(offset as usize),
                data.len(),
            );
        }

        let flushed = self.flush_allocation(allocation, offset, data.len() as DeviceSize);
        self.unmap_memory(allocation)?;
        flushed
    }

    /// Invalidates the range and copies it out of the allocation into `data`.
    pub fn read_mapped(
        &self,
        allocation: Allocation,
        offset: DeviceSize,
        data: &mut [u8],
    ) -> Result<()> {
        self.check_range(allocation, offset, data.len() as DeviceSize)?;

        let pointer = self.map_memory(allocation)?;
        let result = self
            .invalidate_allocation(allocation, offset, data.len() as DeviceSize)
            .map(|_| unsafe {
                std::ptr::copy_nonoverlapping(
                    pointer.as_ptr().add(offset as usize),
                    data.as_mut_ptr(),
                    data.len(),
                );
            });

        self.unmap_memory(allocation)?;
        result
    }

    pub fn write_mapped_pod<T: bytemuck::Pod>(
        &self,
        allocation: Allocation,
        offset: DeviceSize,
        data: &[T],
    ) -> Result<()> {
        self.write_mapped(allocation, offset, bytemuck::cast_slice(data))
    }

    pub fn read_mapped_pod<T: bytemuck::Pod>(
        &self,
        allocation: Allocation,
        offset: DeviceSize,
        count: usize,
    ) -> Result<Vec<T>> {
        let mut data = vec![T::zeroed(); count];
        self.read_mapped(allocation, offset, bytemuck::cast_slice_mut(&mut data))?;
        Ok(data)
    }

    fn check_range(&self, allocation: Allocation, offset: DeviceSize, size: DeviceSize) -> Result<()> {
        let allocation_size = self.lock().record(allocation)?.size;

        match offset.checked_add(size) {
            Some(end) if end <= allocation_size => Ok(()),
            _ => Err(Error::invalid_argument(format!(
                "Range {offset}+{size} exceeds allocation of {allocation_size} bytes"
            ))),
        }
    }

    pub fn flush_allocation(
        &self,
        allocation: Allocation,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<()> {
        self.flush_or_invalidate(&[(allocation, offset, size)], CacheOperation::Flush)
    }

    pub fn invalidate_allocation(
        &self,
        allocation: Allocation,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<()> {
        self.flush_or_invalidate(&[(allocation, offset, size)], CacheOperation::Invalidate)
    }

    /// Flushes `(allocation, offset, size)` ranges in one backend call.
    pub fn flush_allocations(&self, ranges: &[(Allocation, DeviceSize, DeviceSize)]) -> Result<()> {
        self.flush_or_invalidate(ranges, CacheOperation::Flush)
    }

    pub fn invalidate_allocations(
        &self,
        ranges: &[(Allocation, DeviceSize, DeviceSize)],
    ) -> Result<()> {
        self.flush_or_invalidate(ranges, CacheOperation::Invalidate)
    }

    fn flush_or_invalidate(
        &self,
        ranges: &[(Allocation, DeviceSize, DeviceSize)],
        operation: CacheOperation,
    ) -> Result<()> {
        let memory_ranges = {
            let state = self.lock();
            let mut memory_ranges = vec![];
            for (allocation, offset, size) in ranges {
                if let Some(range) = self.memory_range(&state, *allocation, *offset, *size)? {
                    memory_ranges.push(range);
                }
            }
            memory_ranges
        };

        if memory_ranges.is_empty() {
            return Ok(());
        }

        let backend = self.context.backend.as_ref();
        match operation {
            CacheOperation::Flush => backend.flush_memory_ranges(&memory_ranges),
            CacheOperation::Invalidate => backend.invalidate_memory_ranges(&memory_ranges),
        }
    }

    /// Converts a range relative to the allocation into an atom-aligned range of its memory
    /// object. `None` when nothing needs to be flushed.
    fn memory_range(
        &self,
        state: &AllocatorState,
        allocation: Allocation,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<Option<MappedMemoryRange>> {
        let record = state.record(allocation)?;

        if size == 0
            || !self
                .context
                .properties
                .is_non_coherent(record.memory_type_index)
        {
            return Ok(None);
        }

        if offset > record.size {
            return Err(Error::invalid_argument(format!(
                "Offset {offset} is past the end of allocation {}",
                allocation.0
            )));
        }

        let size = match size {
            WHOLE_SIZE => record.size - offset,
            size => size,
        };
        if offset + size > record.size {
            return Err(Error::invalid_argument(format!(
                "Range {offset}+{size} exceeds allocation of {} bytes",
                record.size
            )));
        }

        let atom = self.context.limits.non_coherent_atom_size.max(1);
        let (memory, allocation_offset, _) = self.resolve(state, record)?;

        let start = align_down(offset, atom);
        let end = align_up(offset + size, atom);

        let range = match record.placement {
            Placement::Dedicated { .. } => MappedMemoryRange {
                memory,
                offset: start,
                size: end.min(record.size) - start,
            },
            Placement::Block {
                vector, block_id, ..
            } => {
                let block_size = state
                    .vector(vector)
                    .and_then(|vector| vector.block(block_id))
                    .map(|block| block.size())
                    .unwrap_or(0);
                let start = allocation_offset + start;
                let end = (allocation_offset + end).min(block_size);
                MappedMemoryRange {
                    memory,
                    offset: start,
                    size: end.saturating_sub(start),
                }
            }
        };

        Ok(Some(range))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::allocator::{AllocationCreateFlags, AllocationCreateInfo, AllocatorCreateInfo};
    use crate::memory::host::HostMemoryDevice;
    use crate::memory::MemoryRequirements;

    fn host_allocator() -> (Arc<HostMemoryDevice>, Allocator) {
        let device = Arc::new(HostMemoryDevice::discrete_gpu());
        let allocator = Allocator::new(device.clone(), AllocatorCreateInfo::default()).unwrap();
        (device, allocator)
    }

    fn in_memory_type(memory_type_index: u32) -> AllocationCreateInfo {
        AllocationCreateInfo {
            memory_type_bits: 1 << memory_type_index,
            ..Default::default()
        }
    }

    #[test]
    fn mapping_is_counted_per_allocation() {
        let (device, allocator) = host_allocator();
        let a = allocator
            .allocate_memory(&MemoryRequirements::new(256, 64), &in_memory_type(1))
            .unwrap();
        let b = allocator
            .allocate_memory(&MemoryRequirements::new(256, 64), &in_memory_type(1))
            .unwrap();
        let (memory, _) = allocator.memory_binding(a).unwrap();

        allocator.map_memory(a).unwrap();
        allocator.map_memory(b).unwrap();
        allocator.map_memory(a).unwrap();
        assert!(allocator.allocation_info(a).unwrap().mapped_data.is_some());

        allocator.unmap_memory(a).unwrap();
        allocator.unmap_memory(a).unwrap();
        assert!(device.is_mapped(memory));
        assert!(allocator.allocation_info(a).unwrap().mapped_data.is_none());

        allocator.unmap_memory(b).unwrap();
        assert!(!device.is_mapped(memory));
        assert!(matches!(
            allocator.unmap_memory(b),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn device_local_memory_does_not_map() {
        let (_, allocator) = host_allocator();
        let allocation = allocator
            .allocate_memory(&MemoryRequirements::new(256, 1), &in_memory_type(0))
            .unwrap();

        assert_eq!(allocator.map_memory(allocation), Err(Error::MemoryMapFailed));
    }

    #[test]
    fn persistently_mapped_allocation_reports_pointer() {
        let (_, allocator) = host_allocator();
        let info = AllocationCreateInfo {
            flags: AllocationCreateFlags::MAPPED,
            ..in_memory_type(1)
        };
        let allocation = allocator
            .allocate_memory(&MemoryRequirements::new(128, 16), &info)
            .unwrap();

        let mapped = allocator.allocation_info(allocation).unwrap().mapped_data;
        let pointer = allocator.map_memory(allocation).unwrap();
        assert_eq!(mapped, Some(pointer));
        allocator.unmap_memory(allocation).unwrap();
        assert_eq!(allocator.allocation_info(allocation).unwrap().mapped_data, mapped);
    }

    #[test]
    fn written_data_reads_back() {
        let (_, allocator) = host_allocator();
        let allocation = allocator
            .allocate_memory(&MemoryRequirements::new(64, 4), &in_memory_type(2))
            .unwrap();

        allocator
            .write_mapped_pod(allocation, 8, &[1u32, 2, 3, 4])
            .unwrap();
        let values: Vec<u32> = allocator.read_mapped_pod(allocation, 8, 4).unwrap();
        assert_eq!(values, vec![1, 2, 3, 4]);

        assert!(matches!(
            allocator.write_mapped(allocation, 60, &[0; 8]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn flush_ranges_are_rounded_to_atoms_inside_the_block() {
        let (device, allocator) = host_allocator();
        let first = allocator
            .allocate_memory(&MemoryRequirements::new(100, 1), &in_memory_type(3))
            .unwrap();
        let second = allocator
            .allocate_memory(&MemoryRequirements::new(100, 1), &in_memory_type(3))
            .unwrap();

        let (_, second_offset) = allocator.memory_binding(second).unwrap();
        assert_eq!(second_offset % 64, 0);

        allocator.flush_allocation(second, 10, 20).unwrap();
        allocator.flush_allocation(first, 0, 0).unwrap();
        allocator.invalidate_allocation(second, 0, WHOLE_SIZE).unwrap();

        let flushed = device.take_flushed_ranges();
        let flushed = flushed.last().unwrap();
        assert_eq!(flushed.offset, second_offset);
        assert_eq!(flushed.size, 64);

        let invalidated = device.take_invalidated_ranges();
        assert_eq!(invalidated.len(), 1);
        assert_eq!(invalidated[0].offset, second_offset);
        assert_eq!(invalidated[0].size, 128);
    }

    #[test]
    fn coherent_memory_is_never_flushed() {
        let (device, allocator) = host_allocator();
        let allocation = allocator
            .allocate_memory(&MemoryRequirements::new(100, 1), &in_memory_type(1))
            .unwrap();

        allocator.flush_allocation(allocation, 0, WHOLE_SIZE).unwrap();
        assert!(device.take_flushed_ranges().is_empty());
    }
}
