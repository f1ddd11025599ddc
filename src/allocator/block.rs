use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocator::budget::BudgetTracker;
use crate::allocator::DeviceMemoryCallbacks;
use crate::error::{Error, Result};
use crate::memory::device::{DeviceMemory, DeviceMemoryBackend, MappedMemoryRange};
use crate::memory::{
    align_down, align_up, DeviceLimits, DeviceSize, MemoryProperties, MemoryPropertyFlags,
};
use crate::metadata::BlockMetadata;

pub const CORRUPTION_DETECTION_MAGIC_VALUE: u32 = 0x7F84_E666;
pub const ALLOCATION_FILL_PATTERN_CREATED: u8 = 0xDC;
pub const ALLOCATION_FILL_PATTERN_DESTROYED: u8 = 0xEF;

/// Pointer into mapped device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MappedPtr(pub NonNull<u8>);

// The pointer is only dereferenced while the allocator lock is held or by the caller who asked
// for it.
unsafe impl Send for MappedPtr {}

impl MappedPtr {
    pub fn offset(self, offset: DeviceSize) -> NonNull<u8> {
        // The offset always stays inside the mapped memory object.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(offset as usize)) }
    }
}

/// Everything about the device that stays fixed for the allocator's lifetime.
pub(crate) struct DeviceContext {
    pub backend: Arc<dyn DeviceMemoryBackend>,
    pub properties: MemoryProperties,
    pub limits: DeviceLimits,
    pub heap_size_limits: Vec<Option<DeviceSize>>,
    pub buffer_image_granularity: DeviceSize,
    pub debug_margin: DeviceSize,
    pub detect_corruption: bool,
    pub debug_initialize_allocations: bool,
    pub callbacks: Option<DeviceMemoryCallbacks>,
    pub block_ids: AtomicU64,
}

impl DeviceContext {
    pub fn next_block_id(&self) -> u64 {
        self.block_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn memory_type_flags(&self, memory_type_index: u32) -> MemoryPropertyFlags {
        self.properties.memory_types[memory_type_index as usize].property_flags
    }

    pub fn heap_index(&self, memory_type_index: u32) -> u32 {
        self.properties.heap_index(memory_type_index)
    }

    pub fn is_host_visible(&self, memory_type_index: u32) -> bool {
        self.memory_type_flags(memory_type_index)
            .contains(MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_corruption_detection_enabled(&self, memory_type_index: u32) -> bool {
        self.detect_corruption
            && self.debug_margin > 0
            && self.memory_type_flags(memory_type_index)
                .contains(MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Alignment every allocation in the memory type needs so flushes never touch neighbours.
    pub fn memory_type_min_alignment(&self, memory_type_index: u32) -> DeviceSize {
        match self.properties.is_non_coherent(memory_type_index) {
            true => self.limits.non_coherent_atom_size.max(1),
            false => 1,
        }
    }

    pub fn allocate_device_memory(
        &self,
        budget: &mut BudgetTracker,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<DeviceMemory> {
        let heap_index = self.heap_index(memory_type_index);

        if let Some(limit) = self.heap_size_limits[heap_index as usize] {
            if budget.block_bytes(heap_index) + size > limit {
                log::debug!("Heap {heap_index} size limit of {limit} bytes reached");
                return Err(Error::OutOfDeviceMemory);
            }
        }

        let memory = self.backend.allocate_memory(memory_type_index, size)?;
        budget.add_block(heap_index, size);

        if let Some(callback) = self
            .callbacks
            .as_ref()
            .and_then(|callbacks| callbacks.allocate.as_ref())
        {
            callback(memory_type_index, memory, size);
        }

        Ok(memory)
    }

    pub fn free_device_memory(
        &self,
        budget: &mut BudgetTracker,
        memory_type_index: u32,
        memory: DeviceMemory,
        size: DeviceSize,
    ) {
        if let Some(callback) = self
            .callbacks
            .as_ref()
            .and_then(|callbacks| callbacks.free.as_ref())
        {
            callback(memory_type_index, memory, size);
        }

        self.backend.free_memory(memory);
        budget.remove_block(self.heap_index(memory_type_index), size);
    }

    /// Flushes a byte range of a memory object if its memory type is not coherent.
    pub fn flush_range(
        &self,
        memory_type_index: u32,
        memory: DeviceMemory,
        memory_size: DeviceSize,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<()> {
        if size == 0 || !self.properties.is_non_coherent(memory_type_index) {
            return Ok(());
        }

        let atom = self.limits.non_coherent_atom_size.max(1);
        let start = align_down(offset, atom);
        let end = align_up(offset + size, atom).min(memory_size);

        self.backend.flush_memory_ranges(&[MappedMemoryRange {
            memory,
            offset: start,
            size: end - start,
        }])
    }
}

/// One device memory object sub-allocated through its metadata.
pub(crate) struct DeviceMemoryBlock {
    pub id: u64,
    pub memory: DeviceMemory,
    pub memory_type_index: u32,
    pub metadata: Box<dyn BlockMetadata>,
    map_count: u32,
    mapped: Option<MappedPtr>,
}

impl DeviceMemoryBlock {
    pub fn new(
        id: u64,
        memory: DeviceMemory,
        memory_type_index: u32,
        metadata: Box<dyn BlockMetadata>,
    ) -> Self {
        Self {
            id,
            memory,
            memory_type_index,
            metadata,
            map_count: 0,
            mapped: None,
        }
    }

    pub fn size(&self) -> DeviceSize {
        self.metadata.size()
    }

    pub fn map_count(&self) -> u32 {
        self.map_count
    }

    pub fn mapped(&self) -> Option<MappedPtr> {
        self.mapped
    }

    pub fn map(&mut self, backend: &dyn DeviceMemoryBackend, count: u32) -> Result<MappedPtr> {
        if let Some(mapped) = self.mapped {
            self.map_count += count;
            return Ok(mapped);
        }

        let pointer = MappedPtr(backend.map_memory(self.memory)?);
        if count > 0 {
            self.map_count = count;
            self.mapped = Some(pointer);
        } else {
            backend.unmap_memory(self.memory);
        }

        Ok(pointer)
    }

    pub fn unmap(&mut self, backend: &dyn DeviceMemoryBackend, count: u32) {
        if count == 0 {
            return;
        }

        if self.map_count < count {
            log::error!("Unmapping block {} that was not previously mapped", self.id);
            return;
        }

        self.map_count -= count;
        if self.map_count == 0 {
            self.mapped = None;
            backend.unmap_memory(self.memory);
        }
    }

    /// Runs `f` with the block mapped, mapping it temporarily if needed.
    fn with_mapped<T>(
        &mut self,
        backend: &dyn DeviceMemoryBackend,
        f: impl FnOnce(MappedPtr) -> T,
    ) -> Result<T> {
        let mapped = self.map(backend, 1)?;
        let result = f(mapped);
        self.unmap(backend, 1);
        Ok(result)
    }

    pub fn fill(
        &mut self,
        context: &DeviceContext,
        offset: DeviceSize,
        size: DeviceSize,
        pattern: u8,
    ) -> Result<()> {
        self.with_mapped(context.backend.as_ref(), |mapped| unsafe {
            std::ptr::write_bytes(mapped.offset(offset).as_ptr(), pattern, size as usize);
        })?;

        context.flush_range(
            self.memory_type_index,
            self.memory,
            self.size(),
            offset,
            size,
        )
    }

    /// Writes the magic value into the debug margins on both sides of an allocation.
    pub fn write_magic_around(
        &mut self,
        backend: &dyn DeviceMemoryBackend,
        offset: DeviceSize,
        size: DeviceSize,
        margin: DeviceSize,
    ) -> Result<()> {
        self.with_mapped(backend, |mapped| {
            for start in [offset - margin, offset + size] {
                write_magic(mapped, start, margin);
            }
        })
    }

    pub fn validate_magic_around(
        &mut self,
        backend: &dyn DeviceMemoryBackend,
        offset: DeviceSize,
        size: DeviceSize,
        margin: DeviceSize,
    ) -> Result<bool> {
        self.with_mapped(backend, |mapped| {
            validate_magic(mapped, offset - margin, margin)
                && validate_magic(mapped, offset + size, margin)
        })
    }

    /// Checks the debug margins of every allocation in the block.
    pub fn check_corruption(
        &mut self,
        backend: &dyn DeviceMemoryBackend,
        margin: DeviceSize,
    ) -> Result<()> {
        let allocations = self.metadata.allocations();
        let id = self.id;

        let corrupted = self.with_mapped(backend, |mapped| {
            allocations.iter().find(|allocation| {
                !validate_magic(mapped, allocation.offset - margin, margin)
                    || !validate_magic(mapped, allocation.end(), margin)
            })
            .copied()
        })?;

        match corrupted {
            Some(allocation) => {
                log::error!(
                    "Memory corruption detected around allocation at offset {} in block {id}",
                    allocation.offset
                );
                Err(Error::CorruptionDetected(format!(
                    "Block {id}, offset {}",
                    allocation.offset
                )))
            }
            None => Ok(()),
        }
    }

    pub fn destroy(self, context: &DeviceContext, budget: &mut BudgetTracker) {
        if !self.metadata.is_empty() {
            log::warn!(
                "Destroying block {} with {} live allocations",
                self.id,
                self.metadata.allocation_count()
            );
        }

        if self.mapped.is_some() {
            context.backend.unmap_memory(self.memory);
        }

        log::debug!("Freeing block {} of {} bytes", self.id, self.size());
        context.free_device_memory(budget, self.memory_type_index, self.memory, self.size());
    }
}

fn write_magic(mapped: MappedPtr, offset: DeviceSize, length: DeviceSize) {
    let magic = CORRUPTION_DETECTION_MAGIC_VALUE.to_le_bytes();
    let bytes =
        unsafe { std::slice::from_raw_parts_mut(mapped.offset(offset).as_ptr(), length as usize) };

    for (index, byte) in bytes.iter_mut().enumerate() {
        *byte = magic[index % magic.len()];
    }
}

fn validate_magic(mapped: MappedPtr, offset: DeviceSize, length: DeviceSize) -> bool {
    let magic = CORRUPTION_DETECTION_MAGIC_VALUE.to_le_bytes();
    let bytes =
        unsafe { std::slice::from_raw_parts(mapped.offset(offset).as_ptr(), length as usize) };

    bytes
        .iter()
        .enumerate()
        .all(|(index, byte)| *byte == magic[index % magic.len()])
}
