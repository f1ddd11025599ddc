use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::allocator::allocation::{
    find_memory_preferences, AllocationRecord, Placement, VectorId,
};
use crate::allocator::block::{DeviceContext, MappedPtr, ALLOCATION_FILL_PATTERN_CREATED};
use crate::allocator::block_vector::{BlockRequest, BlockVector, ReleasedBlocks};
use crate::allocator::budget::BudgetTracker;
use crate::allocator::pool::PoolEntry;
use crate::error::{Error, Result};
use crate::memory::device::{DeviceMemory, DeviceMemoryBackend};
use crate::memory::{
    align_up, normalize_alignment, DeviceLimits, DeviceSize, ImageTiling, MemoryProperties,
    MemoryPropertyFlags, MemoryRequirements, WHOLE_SIZE,
};
use crate::metadata::SuballocationType;
use crate::stats::{Budget, DetailedStatistics, Statistics, TotalStatistics};

pub mod allocation;
pub(crate) mod block;
pub(crate) mod block_vector;
pub(crate) mod budget;
pub mod defragment;
pub(crate) mod json;
mod mapping;
pub mod pool;

pub use allocation::{
    Allocation, AllocationCreateFlags, AllocationCreateInfo, AllocationInfo, MemoryUsage,
};
pub use defragment::{
    DefragmentationContext, DefragmentationFlags, DefragmentationInfo, DefragmentationMove,
    DefragmentationMoveOperation, DefragmentationPass, DefragmentationStats, PassStatus,
};
pub use pool::{Pool, PoolCreateFlags, PoolCreateInfo};

const GIB: DeviceSize = 1024 * 1024 * 1024;
const DEFAULT_LARGE_HEAP_BLOCK_SIZE: DeviceSize = 256 * 1024 * 1024;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocatorCreateFlags: u32 {
        const EXTERNALLY_SYNCHRONIZED = 0x0000_0001;
        const KHR_DEDICATED_ALLOCATION = 0x0000_0002;
        const EXT_MEMORY_BUDGET = 0x0000_0008;
        const AMD_DEVICE_COHERENT_MEMORY = 0x0000_0010;
        const BUFFER_DEVICE_ADDRESS = 0x0000_0020;
        const EXT_MEMORY_PRIORITY = 0x0000_0040;
    }
}

/// Called with the memory type, the memory object and its size.
pub type DeviceMemoryCallback = Box<dyn Fn(u32, DeviceMemory, DeviceSize) + Send + Sync>;

/// Informative hooks invoked around every device memory allocation and free.
#[derive(Default)]
pub struct DeviceMemoryCallbacks {
    pub allocate: Option<DeviceMemoryCallback>,
    pub free: Option<DeviceMemoryCallback>,
}

pub struct AllocatorCreateInfo {
    pub flags: AllocatorCreateFlags,
    /// Block size for heaps larger than 1 GiB. Zero selects the default of 256 MiB.
    pub preferred_large_heap_block_size: DeviceSize,
    /// Upper bound of what the allocator may take from each heap, `WHOLE_SIZE` for no limit.
    /// Missing entries mean no limit.
    pub heap_size_limits: Vec<DeviceSize>,
    pub device_memory_callbacks: Option<DeviceMemoryCallbacks>,
    /// Bytes reserved before and after every block suballocation. Must be a multiple of 4.
    pub debug_margin: DeviceSize,
    pub detect_corruption: bool,
    pub debug_initialize_allocations: bool,
    pub debug_min_buffer_image_granularity: DeviceSize,
}

impl Default for AllocatorCreateInfo {
    fn default() -> Self {
        Self {
            flags: AllocatorCreateFlags::empty(),
            preferred_large_heap_block_size: DEFAULT_LARGE_HEAP_BLOCK_SIZE,
            heap_size_limits: vec![],
            device_memory_callbacks: None,
            debug_margin: 0,
            detect_corruption: false,
            debug_initialize_allocations: false,
            debug_min_buffer_image_granularity: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorInfo {
    pub flags: AllocatorCreateFlags,
    /// Heap sizes already reduced by the configured heap size limits.
    pub memory_properties: MemoryProperties,
    pub limits: DeviceLimits,
    pub buffer_image_granularity: DeviceSize,
}

pub(crate) struct AllocatorState {
    pub default_vectors: Vec<BlockVector>,
    pub pools: BTreeMap<u64, PoolEntry>,
    pub allocations: HashMap<u64, AllocationRecord>,
    pub budget: BudgetTracker,
    pub next_allocation_id: u64,
    pub next_pool_id: u64,
    pub frame_index: u32,
}

impl AllocatorState {
    pub fn vector(&self, id: VectorId) -> Option<&BlockVector> {
        match id {
            VectorId::Default(memory_type_index) => {
                self.default_vectors.get(memory_type_index as usize)
            }
            VectorId::Pool(pool_id) => self.pools.get(&pool_id).map(|entry| &entry.vector),
        }
    }

    pub fn vector_and_budget(
        &mut self,
        id: VectorId,
    ) -> Option<(&mut BlockVector, &mut BudgetTracker)> {
        let vector = match id {
            VectorId::Default(memory_type_index) => {
                self.default_vectors.get_mut(memory_type_index as usize)
            }
            VectorId::Pool(pool_id) => self.pools.get_mut(&pool_id).map(|entry| &mut entry.vector),
        }?;

        Some((vector, &mut self.budget))
    }

    pub fn record(&self, allocation: Allocation) -> Result<&AllocationRecord> {
        self.allocations
            .get(&allocation.0)
            .ok_or_else(|| Error::invalid_handle(format!("Unknown allocation: {}", allocation.0)))
    }

    pub fn record_mut(&mut self, allocation: Allocation) -> Result<&mut AllocationRecord> {
        self.allocations
            .get_mut(&allocation.0)
            .ok_or_else(|| Error::invalid_handle(format!("Unknown allocation: {}", allocation.0)))
    }

    /// Dedicated allocations, optionally restricted to one pool, ordered by id.
    pub fn dedicated_allocations(
        &self,
        pool: Option<Option<Pool>>,
    ) -> Vec<(u64, &AllocationRecord)> {
        let mut dedicated: Vec<_> = self
            .allocations
            .iter()
            .filter(|(_, record)| record.is_dedicated())
            .filter(|(_, record)| pool.map(|pool| record.pool == pool).unwrap_or(true))
            .map(|(id, record)| (*id, record))
            .collect();
        dedicated.sort_by_key(|(id, _)| *id);
        dedicated
    }
}

/// Sub-allocates device memory obtained from a [`DeviceMemoryBackend`].
///
/// All operations take `&self`; the bookkeeping lives behind one mutex.
pub struct Allocator {
    pub(crate) context: DeviceContext,
    flags: AllocatorCreateFlags,
    preferred_large_heap_block_size: DeviceSize,
    is_integrated_gpu: bool,
    pub(crate) state: Mutex<AllocatorState>,
}

impl Allocator {
    pub fn new(
        backend: Arc<dyn DeviceMemoryBackend>,
        create_info: AllocatorCreateInfo,
    ) -> Result<Self> {
        let mut properties = backend.memory_properties().clone();
        properties.validate()?;

        let limits = backend.limits();

        if create_info.debug_margin % 4 != 0 {
            return Err(Error::invalid_argument(format!(
                "Debug margin must be a multiple of 4: {}",
                create_info.debug_margin
            )));
        }

        let debug_granularity =
            normalize_alignment(create_info.debug_min_buffer_image_granularity)?;
        let buffer_image_granularity =
            normalize_alignment(limits.buffer_image_granularity)?.max(debug_granularity);

        let mut heap_size_limits = vec![None; properties.memory_heaps.len()];
        for (heap_index, limit) in create_info.heap_size_limits.iter().enumerate() {
            if *limit == WHOLE_SIZE {
                continue;
            }

            let heap = match properties.memory_heaps.get_mut(heap_index) {
                Some(heap) => heap,
                None => {
                    return Err(Error::invalid_argument(format!(
                        "Heap size limit given for a missing heap: {heap_index}"
                    )))
                }
            };

            heap.size = heap.size.min(*limit);
            heap_size_limits[heap_index] = Some(*limit);
        }

        let use_device_budget = create_info
            .flags
            .contains(AllocatorCreateFlags::EXT_MEMORY_BUDGET)
            && backend.heap_budgets().is_some();
        let mut budget = BudgetTracker::new(properties.memory_heaps.len(), use_device_budget);
        budget.refresh(backend.as_ref());

        let is_integrated_gpu = backend.is_integrated_gpu();

        let preferred_large_heap_block_size = match create_info.preferred_large_heap_block_size {
            0 => DEFAULT_LARGE_HEAP_BLOCK_SIZE,
            size => size,
        };

        let context = DeviceContext {
            backend,
            properties,
            limits,
            heap_size_limits,
            buffer_image_granularity,
            debug_margin: create_info.debug_margin,
            detect_corruption: create_info.detect_corruption,
            debug_initialize_allocations: create_info.debug_initialize_allocations,
            callbacks: create_info.device_memory_callbacks,
            block_ids: AtomicU64::new(1),
        };

        let default_vectors = (0..context.properties.memory_types.len() as u32)
            .map(|memory_type_index| {
                BlockVector::new(
                    memory_type_index,
                    preferred_block_size(
                        &context.properties,
                        preferred_large_heap_block_size,
                        memory_type_index,
                    ),
                    0,
                    usize::MAX,
                    false,
                    buffer_image_granularity,
                    false,
                    0.5,
                    0,
                )
            })
            .collect();

        log::info!(
            "Created allocator with {} memory types in {} heaps",
            context.properties.memory_types.len(),
            context.properties.memory_heaps.len()
        );

        Ok(Self {
            context,
            flags: create_info.flags,
            preferred_large_heap_block_size,
            is_integrated_gpu,
            state: Mutex::new(AllocatorState {
                default_vectors,
                pools: BTreeMap::new(),
                allocations: HashMap::new(),
                budget,
                next_allocation_id: 1,
                next_pool_id: 1,
                frame_index: 0,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocator_info(&self) -> AllocatorInfo {
        AllocatorInfo {
            flags: self.flags,
            memory_properties: self.context.properties.clone(),
            limits: self.context.limits,
            buffer_image_granularity: self.context.buffer_image_granularity,
        }
    }

    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.context.properties
    }

    pub fn memory_type_properties(&self, memory_type_index: u32) -> Result<MemoryPropertyFlags> {
        match self
            .context
            .properties
            .memory_types
            .get(memory_type_index as usize)
        {
            Some(memory_type) => Ok(memory_type.property_flags),
            None => Err(Error::invalid_argument(format!(
                "The given memory type index is invalid: {memory_type_index}"
            ))),
        }
    }

    pub fn current_frame_index(&self) -> u32 {
        self.lock().frame_index
    }

    pub fn set_current_frame_index(&self, frame_index: u32) {
        let mut state = self.lock();
        state.frame_index = frame_index;

        if state.budget.uses_device_budget() {
            state.budget.refresh(self.context.backend.as_ref());
        }
    }

    pub fn heap_budgets(&self) -> Vec<Budget> {
        let mut state = self.lock();

        (0..self.context.properties.memory_heaps.len() as u32)
            .map(|heap_index| {
                state.budget.budget(
                    self.context.backend.as_ref(),
                    &self.context.properties,
                    heap_index,
                )
            })
            .collect()
    }

    pub fn calculate_statistics(&self) -> TotalStatistics {
        let state = self.lock();
        self.calculate_statistics_locked(&state)
    }

    pub(crate) fn calculate_statistics_locked(&self, state: &AllocatorState) -> TotalStatistics {
        let properties = &self.context.properties;
        let mut memory_type = vec![DetailedStatistics::default(); properties.memory_types.len()];
        let mut memory_heap = vec![DetailedStatistics::default(); properties.memory_heaps.len()];
        let mut total = DetailedStatistics::default();

        let vectors = state
            .default_vectors
            .iter()
            .chain(state.pools.values().map(|entry| &entry.vector));
        for vector in vectors {
            vector.add_detailed_statistics(&mut memory_type[vector.memory_type_index as usize]);
        }

        for (_, record) in state.dedicated_allocations(None) {
            let stats = &mut memory_type[record.memory_type_index as usize];
            stats.statistics.block_count += 1;
            stats.statistics.block_bytes += record.size;
            stats.add_allocation(record.size);
        }

        for (memory_type_index, stats) in memory_type.iter().enumerate() {
            let heap_index = properties.heap_index(memory_type_index as u32);
            memory_heap[heap_index as usize].add(stats);
        }

        for stats in memory_heap.iter() {
            total.add(stats);
        }

        TotalStatistics {
            memory_type,
            memory_heap,
            total,
        }
    }

    fn preferred_block_size(&self, memory_type_index: u32) -> DeviceSize {
        preferred_block_size(
            &self.context.properties,
            self.preferred_large_heap_block_size,
            memory_type_index,
        )
    }

    /// Combines the resource's acceptable types with the ones the create info allows.
    fn allowed_memory_types(&self, memory_type_bits: u32, create_info: &AllocationCreateInfo) -> u32 {
        let mut bits = memory_type_bits;
        if create_info.memory_type_bits != 0 {
            bits &= create_info.memory_type_bits;
        }
        bits
    }

    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        create_info: &AllocationCreateInfo,
    ) -> Result<u32> {
        let preferences = find_memory_preferences(self.is_integrated_gpu, create_info)?;
        allocation::find_memory_type_index(
            &self.context.properties,
            self.allowed_memory_types(memory_type_bits, create_info),
            &preferences,
        )
    }

    pub fn find_memory_type_index_for_buffer_info(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
    ) -> Result<u32> {
        self.find_memory_type_index(requirements.memory_type_bits, create_info)
    }

    pub fn find_memory_type_index_for_image_info(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
    ) -> Result<u32> {
        self.find_memory_type_index(requirements.memory_type_bits, create_info)
    }

    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
    ) -> Result<Allocation> {
        let mut state = self.lock();
        self.allocate_locked(&mut state, requirements, create_info, SuballocationType::Unknown)
    }

    pub fn allocate_memory_for_buffer(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
    ) -> Result<Allocation> {
        let mut state = self.lock();
        self.allocate_locked(&mut state, requirements, create_info, SuballocationType::Buffer)
    }

    pub fn allocate_memory_for_image(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
        tiling: ImageTiling,
    ) -> Result<Allocation> {
        let kind = match tiling {
            ImageTiling::Optimal => SuballocationType::ImageOptimal,
            ImageTiling::Linear => SuballocationType::ImageLinear,
        };

        let mut state = self.lock();
        self.allocate_locked(&mut state, requirements, create_info, kind)
    }

    /// Makes `count` allocations with the same parameters. Either all of them succeed or none
    /// is kept.
    pub fn allocate_memory_pages(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
        count: usize,
    ) -> Result<Vec<Allocation>> {
        let mut state = self.lock();
        let mut allocations = Vec::with_capacity(count);

        for _ in 0..count {
            match self.allocate_locked(
                &mut state,
                requirements,
                create_info,
                SuballocationType::Unknown,
            ) {
                Ok(allocation) => allocations.push(allocation),
                Err(error) => {
                    for allocation in allocations.into_iter().rev() {
                        if let Err(free_error) = self.free_locked(&mut state, allocation) {
                            log::error!("Could not roll back page allocation: {free_error}");
                        }
                    }
                    return Err(error);
                }
            }
        }

        Ok(allocations)
    }

    pub(crate) fn allocate_locked(
        &self,
        state: &mut AllocatorState,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
        kind: SuballocationType,
    ) -> Result<Allocation> {
        let size = requirements.size;
        if size == 0 {
            return Err(Error::invalid_argument("Cannot allocate zero bytes"));
        }

        let alignment = normalize_alignment(requirements.alignment)?;
        let flags = create_info.flags;

        if flags.contains(AllocationCreateFlags::DEDICATED_MEMORY)
            && flags.contains(AllocationCreateFlags::NEVER_ALLOCATE)
        {
            return Err(Error::invalid_argument(
                "DEDICATED_MEMORY and NEVER_ALLOCATE cannot be combined",
            ));
        }

        if flags.contains(AllocationCreateFlags::MAPPED)
            && create_info.usage.is_auto()
            && !flags.allows_host_access()
        {
            return Err(Error::feature_not_present(
                "Mapping memory with automatic usage requires a HOST_ACCESS flag",
            ));
        }

        if let Some(pool) = create_info.pool {
            let vector = match state.pools.get(&pool.0) {
                Some(entry) => &entry.vector,
                None => return Err(Error::invalid_handle(format!("Unknown pool: {}", pool.0))),
            };

            if vector.explicit_block_size && flags.contains(AllocationCreateFlags::DEDICATED_MEMORY)
            {
                return Err(Error::feature_not_present(
                    "Pools with an explicit block size cannot make dedicated allocations",
                ));
            }

            let memory_type_index = vector.memory_type_index;
            if requirements.memory_type_bits & (1 << memory_type_index) == 0 {
                return Err(Error::feature_not_present(format!(
                    "Pool memory type {memory_type_index} is not acceptable for the resource"
                )));
            }

            return self.allocate_of_type(
                state,
                VectorId::Pool(pool.0),
                size,
                alignment,
                kind,
                create_info,
            );
        }

        let preferences = find_memory_preferences(self.is_integrated_gpu, create_info)?;
        let mut memory_type_bits =
            self.allowed_memory_types(requirements.memory_type_bits, create_info);
        let mut memory_type_index = allocation::find_memory_type_index(
            &self.context.properties,
            memory_type_bits,
            &preferences,
        )?;

        loop {
            match self.allocate_of_type(
                state,
                VectorId::Default(memory_type_index),
                size,
                alignment,
                kind,
                create_info,
            ) {
                Err(error) if error.is_out_of_memory() => {
                    log::debug!(
                        "Memory type {memory_type_index} is out of memory, trying the next best type"
                    );
                    memory_type_bits &= !(1 << memory_type_index);
                    memory_type_index = match allocation::find_memory_type_index(
                        &self.context.properties,
                        memory_type_bits,
                        &preferences,
                    ) {
                        Ok(index) => index,
                        Err(_) => return Err(error),
                    };
                }
                result => return result,
            }
        }
    }

    fn allocate_of_type(
        &self,
        state: &mut AllocatorState,
        vector_id: VectorId,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationType,
        create_info: &AllocationCreateInfo,
    ) -> Result<Allocation> {
        let (memory_type_index, explicit_block_size, preferred_block_size, priority) =
            match state.vector(vector_id) {
                Some(vector) => (
                    vector.memory_type_index,
                    vector.explicit_block_size,
                    vector.preferred_block_size,
                    vector.priority,
                ),
                None => return Err(Error::invalid_handle("Unknown block vector")),
            };

        let mut flags = create_info.flags;
        if !self.context.is_host_visible(memory_type_index) {
            flags.remove(AllocationCreateFlags::MAPPED);
        }

        let pool = match vector_id {
            VectorId::Pool(pool_id) => Some(Pool(pool_id)),
            VectorId::Default(_) => None,
        };

        if flags.contains(AllocationCreateFlags::DEDICATED_MEMORY)
            || create_info.usage == MemoryUsage::GpuLazilyAllocated
        {
            return self.allocate_dedicated(
                state,
                memory_type_index,
                size,
                kind,
                flags,
                create_info,
                pool,
            );
        }

        let can_allocate_dedicated =
            !flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) && !explicit_block_size;

        if can_allocate_dedicated {
            let max_count = self.context.limits.max_memory_allocation_count;
            let near_object_limit = state.budget.device_memory_count() > max_count / 4 * 3;

            if size > preferred_block_size / 2 && !near_object_limit {
                match self.allocate_dedicated(
                    state,
                    memory_type_index,
                    size,
                    kind,
                    flags,
                    create_info,
                    pool,
                ) {
                    Ok(allocation) => return Ok(allocation),
                    Err(error) => log::debug!("Preferred dedicated allocation failed: {error}"),
                }
            }
        }

        let allocation_id = state.next_allocation_id;
        let request = BlockRequest {
            size,
            alignment,
            kind,
            flags,
            allocation_id,
        };

        let block_result = match state.vector_and_budget(vector_id) {
            Some((vector, budget)) => vector.allocate(&self.context, budget, &request),
            None => return Err(Error::invalid_handle("Unknown block vector")),
        };

        match block_result {
            Ok(block_allocation) => {
                state.next_allocation_id += 1;
                state.allocations.insert(
                    allocation_id,
                    AllocationRecord {
                        memory_type_index,
                        size,
                        alignment,
                        kind,
                        placement: Placement::Block {
                            vector: vector_id,
                            block_id: block_allocation.block_id,
                            handle: block_allocation.handle,
                        },
                        pool,
                        user_data: create_info.user_data,
                        name: create_info.name.clone(),
                        map_count: 0,
                        persistent_map: flags.contains(AllocationCreateFlags::MAPPED),
                        priority,
                    },
                );

                log::trace!(
                    "Allocated {size} bytes at offset {} of block {} for allocation {allocation_id}",
                    block_allocation.offset,
                    block_allocation.block_id
                );

                Ok(Allocation(allocation_id))
            }
            Err(error) if can_allocate_dedicated && error.is_out_of_memory() => self
                .allocate_dedicated(
                    state,
                    memory_type_index,
                    size,
                    kind,
                    flags,
                    create_info,
                    pool,
                ),
            Err(error) => Err(error),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_dedicated(
        &self,
        state: &mut AllocatorState,
        memory_type_index: u32,
        size: DeviceSize,
        kind: SuballocationType,
        flags: AllocationCreateFlags,
        create_info: &AllocationCreateInfo,
        pool: Option<Pool>,
    ) -> Result<Allocation> {
        let backend = self.context.backend.as_ref();
        let heap_index = self.context.heap_index(memory_type_index);

        if flags.contains(AllocationCreateFlags::WITHIN_BUDGET) {
            let budget = state
                .budget
                .budget(backend, &self.context.properties, heap_index);
            if budget.usage + size > budget.budget {
                return Err(Error::OutOfDeviceMemory);
            }
        }

        let memory = self
            .context
            .allocate_device_memory(&mut state.budget, memory_type_index, size)?;

        let mapped = match flags.contains(AllocationCreateFlags::MAPPED) {
            true => match backend.map_memory(memory) {
                Ok(pointer) => Some(MappedPtr(pointer)),
                Err(error) => {
                    self.context.free_device_memory(
                        &mut state.budget,
                        memory_type_index,
                        memory,
                        size,
                    );
                    return Err(error);
                }
            },
            false => None,
        };

        if self.context.debug_initialize_allocations
            && self.context.is_host_visible(memory_type_index)
        {
            if let Err(error) = self.fill_dedicated(
                memory_type_index,
                memory,
                mapped,
                size,
                ALLOCATION_FILL_PATTERN_CREATED,
            ) {
                log::warn!("Could not initialize dedicated allocation memory: {error}");
            }
        }

        state.budget.add_allocation(heap_index, size);

        let allocation_id = state.next_allocation_id;
        state.next_allocation_id += 1;
        state.allocations.insert(
            allocation_id,
            AllocationRecord {
                memory_type_index,
                size,
                alignment: 1,
                kind,
                placement: Placement::Dedicated { memory, mapped },
                pool,
                user_data: create_info.user_data,
                name: create_info.name.clone(),
                map_count: 0,
                persistent_map: mapped.is_some(),
                priority: create_info.priority,
            },
        );

        log::debug!(
            "Created dedicated allocation {allocation_id} of {size} bytes in memory type {memory_type_index}"
        );

        Ok(Allocation(allocation_id))
    }

    /// Writes `pattern` over a whole dedicated allocation, mapping it for the duration if needed.
    fn fill_dedicated(
        &self,
        memory_type_index: u32,
        memory: DeviceMemory,
        mapped: Option<MappedPtr>,
        size: DeviceSize,
        pattern: u8,
    ) -> Result<()> {
        let backend = self.context.backend.as_ref();
        let pointer = match mapped {
            Some(mapped) => mapped,
            None => MappedPtr(backend.map_memory(memory)?),
        };

        unsafe { std::ptr::write_bytes(pointer.0.as_ptr(), pattern, size as usize) };

        if mapped.is_none() {
            backend.unmap_memory(memory);
        }

        self.context
            .flush_range(memory_type_index, memory, size, 0, size)
    }

    pub fn free_memory(&self, allocation: Allocation) -> Result<()> {
        let mut state = self.lock();
        self.free_locked(&mut state, allocation)?;
        Ok(())
    }

    /// Frees every allocation given, even if some of them fail. Returns the first error.
    pub fn free_memory_pages(&self, allocations: &[Allocation]) -> Result<()> {
        let mut state = self.lock();
        let mut result = Ok(());

        for allocation in allocations.iter().rev() {
            if let Err(error) = self.free_locked(&mut state, *allocation) {
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }

        result
    }

    /// Frees one allocation and reports the blocks that went back to the device with it.
    pub(crate) fn free_locked(
        &self,
        state: &mut AllocatorState,
        allocation: Allocation,
    ) -> Result<ReleasedBlocks> {
        let record = match state.allocations.remove(&allocation.0) {
            Some(record) => record,
            None => {
                return Err(Error::invalid_handle(format!(
                    "Unknown allocation: {}",
                    allocation.0
                )))
            }
        };

        match record.placement {
            Placement::Block {
                vector,
                block_id,
                handle,
            } => {
                let map_count = record.total_map_count();
                match state.vector_and_budget(vector) {
                    Some((vector, budget)) => {
                        vector.free(&self.context, budget, block_id, handle, map_count)
                    }
                    None => Err(Error::invalid_handle("Unknown block vector")),
                }
            }
            Placement::Dedicated { memory, mapped } => {
                let memory_type_index = record.memory_type_index;

                if self.context.debug_initialize_allocations
                    && self.context.is_host_visible(memory_type_index)
                {
                    if let Err(error) = self.fill_dedicated(
                        memory_type_index,
                        memory,
                        mapped,
                        record.size,
                        block::ALLOCATION_FILL_PATTERN_DESTROYED,
                    ) {
                        log::warn!("Could not mark freed dedicated memory: {error}");
                    }
                }

                if mapped.is_some() {
                    self.context.backend.unmap_memory(memory);
                }

                self.context.free_device_memory(
                    &mut state.budget,
                    memory_type_index,
                    memory,
                    record.size,
                );
                state
                    .budget
                    .remove_allocation(self.context.heap_index(memory_type_index), record.size);

                log::debug!("Freed dedicated allocation {}", allocation.0);

                Ok(ReleasedBlocks::default())
            }
        }
    }

    pub fn allocation_info(&self, allocation: Allocation) -> Result<AllocationInfo> {
        let state = self.lock();
        let record = state.record(allocation)?;
        let (device_memory, offset, mapped) = self.resolve(&state, record)?;

        Ok(AllocationInfo {
            memory_type: record.memory_type_index,
            device_memory,
            offset,
            size: record.size,
            mapped_data: match record.total_map_count() {
                0 => None,
                _ => mapped.map(|mapped| mapped.offset(offset)),
            },
            user_data: record.user_data,
            name: record.name.clone(),
            priority: record.priority,
        })
    }

    /// Memory object, offset inside it and the object's mapping, if any.
    pub(crate) fn resolve(
        &self,
        state: &AllocatorState,
        record: &AllocationRecord,
    ) -> Result<(DeviceMemory, DeviceSize, Option<MappedPtr>)> {
        match record.placement {
            Placement::Block {
                vector,
                block_id,
                handle,
            } => {
                let block = state
                    .vector(vector)
                    .and_then(|vector| vector.block(block_id))
                    .ok_or_else(|| Error::invalid_handle(format!("Unknown block: {block_id}")))?;
                Ok((block.memory, handle.offset(), block.mapped()))
            }
            Placement::Dedicated { memory, mapped } => Ok((memory, 0, mapped)),
        }
    }

    pub fn set_allocation_user_data(&self, allocation: Allocation, user_data: u64) -> Result<()> {
        self.lock().record_mut(allocation)?.user_data = user_data;
        Ok(())
    }

    pub fn set_allocation_name(&self, allocation: Allocation, name: Option<String>) -> Result<()> {
        self.lock().record_mut(allocation)?.name = name;
        Ok(())
    }

    pub fn allocation_memory_properties(
        &self,
        allocation: Allocation,
    ) -> Result<MemoryPropertyFlags> {
        let memory_type_index = self.lock().record(allocation)?.memory_type_index;
        Ok(self.context.memory_type_flags(memory_type_index))
    }

    /// The memory object and offset a buffer or image would be bound to.
    pub fn memory_binding(&self, allocation: Allocation) -> Result<(DeviceMemory, DeviceSize)> {
        let state = self.lock();
        let record = state.record(allocation)?;
        let (memory, offset, _) = self.resolve(&state, record)?;
        Ok((memory, offset))
    }

    /// Checks the debug margins of every allocation in the memory types selected by
    /// `memory_type_bits`.
    pub fn check_corruption(&self, memory_type_bits: u32) -> Result<()> {
        let mut state = self.lock();
        let mut checked = false;

        let state = &mut *state;
        let vectors = state
            .default_vectors
            .iter_mut()
            .chain(state.pools.values_mut().map(|entry| &mut entry.vector));

        for vector in vectors {
            let memory_type_index = vector.memory_type_index;
            if memory_type_bits & (1 << memory_type_index) == 0
                || !self
                    .context
                    .is_corruption_detection_enabled(memory_type_index)
            {
                continue;
            }

            vector.check_corruption(&self.context)?;
            checked = true;
        }

        match checked {
            true => Ok(()),
            false => Err(Error::feature_not_present(
                "Corruption detection is not enabled for any of the given memory types",
            )),
        }
    }

    pub fn create_pool(&self, create_info: &PoolCreateInfo) -> Result<Pool> {
        let memory_type_index = create_info.memory_type_index;
        if memory_type_index as usize >= self.context.properties.memory_types.len() {
            return Err(Error::invalid_argument(format!(
                "The given memory type index is invalid: {memory_type_index}"
            )));
        }

        let max_block_count = match create_info.max_block_count {
            0 => usize::MAX,
            count => count,
        };
        if create_info.min_block_count > max_block_count {
            return Err(Error::invalid_argument(format!(
                "Minimum block count {} exceeds maximum {}",
                create_info.min_block_count, max_block_count
            )));
        }

        let min_allocation_alignment = normalize_alignment(create_info.min_allocation_alignment)?;

        let explicit_block_size = create_info.block_size != 0;
        let block_size = match explicit_block_size {
            true => create_info.block_size,
            false => self.preferred_block_size(memory_type_index),
        };

        let buffer_image_granularity = match create_info
            .flags
            .contains(PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY)
        {
            true => 1,
            false => self.context.buffer_image_granularity,
        };

        let mut vector = BlockVector::new(
            memory_type_index,
            block_size,
            create_info.min_block_count,
            max_block_count,
            explicit_block_size,
            buffer_image_granularity,
            create_info
                .flags
                .contains(PoolCreateFlags::LINEAR_ALGORITHM),
            create_info.priority,
            min_allocation_alignment,
        );

        let mut state = self.lock();

        if let Err(error) = vector.create_min_blocks(&self.context, &mut state.budget) {
            vector.destroy(&self.context, &mut state.budget);
            return Err(error);
        }

        let id = state.next_pool_id;
        state.next_pool_id += 1;
        state.pools.insert(
            id,
            PoolEntry {
                vector,
                name: create_info.name.clone(),
            },
        );

        log::debug!(
            "Created pool {id} in memory type {memory_type_index} with block size {block_size}"
        );

        Ok(Pool(id))
    }

    pub fn destroy_pool(&self, pool: Pool) -> Result<()> {
        let mut state = self.lock();

        if !state.pools.contains_key(&pool.0) {
            return Err(Error::invalid_handle(format!("Unknown pool: {}", pool.0)));
        }

        let live = state
            .allocations
            .values()
            .filter(|record| record.pool == Some(pool))
            .count();
        if live > 0 {
            return Err(Error::invalid_argument(format!(
                "Pool {} still has {live} allocations",
                pool.0
            )));
        }

        if let Some(entry) = state.pools.remove(&pool.0) {
            entry.vector.destroy(&self.context, &mut state.budget);
        }

        log::debug!("Destroyed pool {}", pool.0);

        Ok(())
    }

    pub fn pool_statistics(&self, pool: Pool) -> Result<Statistics> {
        let state = self.lock();
        let entry = pool_entry(&state, pool)?;

        let mut stats = Statistics::default();
        entry.vector.add_statistics(&mut stats);

        for (_, record) in state.dedicated_allocations(Some(Some(pool))) {
            stats.block_count += 1;
            stats.block_bytes += record.size;
            stats.allocation_count += 1;
            stats.allocation_bytes += record.size;
        }

        Ok(stats)
    }

    pub fn calculate_pool_statistics(&self, pool: Pool) -> Result<DetailedStatistics> {
        let state = self.lock();
        let entry = pool_entry(&state, pool)?;

        let mut stats = DetailedStatistics::default();
        entry.vector.add_detailed_statistics(&mut stats);

        for (_, record) in state.dedicated_allocations(Some(Some(pool))) {
            stats.statistics.block_count += 1;
            stats.statistics.block_bytes += record.size;
            stats.add_allocation(record.size);
        }

        Ok(stats)
    }

    pub fn pool_name(&self, pool: Pool) -> Result<Option<String>> {
        let state = self.lock();
        Ok(pool_entry(&state, pool)?.name.clone())
    }

    pub fn set_pool_name(&self, pool: Pool, name: Option<String>) -> Result<()> {
        let mut state = self.lock();
        match state.pools.get_mut(&pool.0) {
            Some(entry) => {
                entry.name = name;
                Ok(())
            }
            None => Err(Error::invalid_handle(format!("Unknown pool: {}", pool.0))),
        }
    }

    pub fn check_pool_corruption(&self, pool: Pool) -> Result<()> {
        let mut state = self.lock();
        match state.pools.get_mut(&pool.0) {
            Some(entry) => entry.vector.check_corruption(&self.context),
            None => Err(Error::invalid_handle(format!("Unknown pool: {}", pool.0))),
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);

        if !state.allocations.is_empty() {
            log::warn!(
                "Destroying allocator with {} live allocations",
                state.allocations.len()
            );
        }

        for (_, record) in std::mem::take(&mut state.allocations) {
            if let Placement::Dedicated { memory, mapped } = record.placement {
                if mapped.is_some() {
                    self.context.backend.unmap_memory(memory);
                }
                self.context.free_device_memory(
                    &mut state.budget,
                    record.memory_type_index,
                    memory,
                    record.size,
                );
            }
        }

        for (_, entry) in std::mem::take(&mut state.pools) {
            entry.vector.destroy(&self.context, &mut state.budget);
        }

        for vector in std::mem::take(&mut state.default_vectors) {
            vector.destroy(&self.context, &mut state.budget);
        }
    }
}

fn pool_entry(state: &AllocatorState, pool: Pool) -> Result<&PoolEntry> {
    state
        .pools
        .get(&pool.0)
        .ok_or_else(|| Error::invalid_handle(format!("Unknown pool: {}", pool.0)))
}

/// Small heaps get blocks of an eighth of their size, large ones a fixed size.
fn preferred_block_size(
    properties: &MemoryProperties,
    preferred_large_heap_block_size: DeviceSize,
    memory_type_index: u32,
) -> DeviceSize {
    let heap_index = properties.heap_index(memory_type_index);
    let heap_size = properties.memory_heaps[heap_index as usize].size;

    match heap_size <= GIB {
        true => align_up(heap_size / 8, 32),
        false => align_up(preferred_large_heap_block_size, 32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::host::HostMemoryDevice;

    const MIB: DeviceSize = 1024 * 1024;

    fn allocator(device: HostMemoryDevice) -> (Arc<HostMemoryDevice>, Allocator) {
        let device = Arc::new(device);
        let allocator = Allocator::new(device.clone(), AllocatorCreateInfo::default()).unwrap();
        (device, allocator)
    }

    fn gpu_only() -> AllocationCreateInfo {
        AllocationCreateInfo {
            usage: MemoryUsage::GpuOnly,
            ..Default::default()
        }
    }

    #[test]
    fn small_heaps_use_an_eighth_as_block_size() {
        let (_, allocator) = allocator(HostMemoryDevice::discrete_gpu());
        assert_eq!(allocator.preferred_block_size(0), 32 * MIB);

        let (_, allocator) = allocator_with_large_heap();
        assert_eq!(allocator.preferred_block_size(0), 256 * MIB);
    }

    fn allocator_with_large_heap() -> (Arc<HostMemoryDevice>, Allocator) {
        allocator(HostMemoryDevice::discrete_gpu_with_heap_sizes(4 * GIB, 256 * MIB))
    }

    #[test]
    fn first_block_starts_small() {
        let (device, allocator) = allocator(HostMemoryDevice::discrete_gpu());

        let allocation = allocator
            .allocate_memory(&MemoryRequirements::new(1024, 256), &gpu_only())
            .unwrap();

        // 32 MiB preferred, halved three times.
        assert_eq!(device.heap_usage(0), 4 * MIB);
        let stats = allocator.calculate_statistics();
        assert_eq!(stats.total.statistics.block_count, 1);
        assert_eq!(stats.total.statistics.allocation_bytes, 1024);

        allocator.free_memory(allocation).unwrap();
    }

    #[test]
    fn large_requests_get_dedicated_memory() {
        let (device, allocator) = allocator(HostMemoryDevice::discrete_gpu());

        let allocation = allocator
            .allocate_memory(&MemoryRequirements::new(20 * MIB, 256), &gpu_only())
            .unwrap();

        assert_eq!(device.heap_usage(0), 20 * MIB);
        let (_, offset) = allocator.memory_binding(allocation).unwrap();
        assert_eq!(offset, 0);

        allocator.free_memory(allocation).unwrap();
        assert_eq!(device.heap_usage(0), 0);
        assert_eq!(device.memory_object_count(), 0);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (_, allocator) = allocator(HostMemoryDevice::discrete_gpu());

        let allocation = allocator
            .allocate_memory(&MemoryRequirements::new(256, 1), &gpu_only())
            .unwrap();
        allocator.free_memory(allocation).unwrap();

        assert!(matches!(
            allocator.free_memory(allocation),
            Err(Error::InvalidHandle(_))
        ));
        assert!(matches!(
            allocator.allocation_info(allocation),
            Err(Error::InvalidHandle(_))
        ));
    }

    #[test]
    fn heap_size_limit_falls_back_to_other_types() {
        let device = Arc::new(HostMemoryDevice::discrete_gpu());
        let allocator = Allocator::new(
            device.clone(),
            AllocatorCreateInfo {
                heap_size_limits: vec![MIB, WHOLE_SIZE],
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(allocator.memory_properties().memory_heaps[0].size, MIB);

        let info = AllocationCreateInfo {
            usage: MemoryUsage::CpuCopy,
            ..Default::default()
        };
        let first = allocator
            .allocate_memory(&MemoryRequirements::new(MIB, 1), &info)
            .unwrap();
        let second = allocator
            .allocate_memory(&MemoryRequirements::new(MIB, 1), &gpu_only())
            .unwrap();

        let heap_of = |allocation| {
            let memory_type = allocator.allocation_info(allocation).unwrap().memory_type;
            allocator.memory_properties().heap_index(memory_type)
        };
        assert_eq!(heap_of(first), 1);
        assert_eq!(heap_of(second), 0);

        // The device heap is now full, GPU-only memory spills over to host memory.
        let third = allocator
            .allocate_memory(&MemoryRequirements::new(MIB, 1), &gpu_only())
            .unwrap();
        assert_eq!(heap_of(third), 1);
    }

    #[test]
    fn debug_margin_must_be_a_multiple_of_four() {
        let device = Arc::new(HostMemoryDevice::discrete_gpu());
        let result = Allocator::new(
            device,
            AllocatorCreateInfo {
                debug_margin: 6,
                ..Default::default()
            },
        );

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn dropping_the_allocator_releases_device_memory() {
        let device = Arc::new(HostMemoryDevice::discrete_gpu());
        {
            let allocator =
                Allocator::new(device.clone(), AllocatorCreateInfo::default()).unwrap();
            allocator
                .allocate_memory(&MemoryRequirements::new(64, 1), &gpu_only())
                .unwrap();
            allocator
                .allocate_memory(&MemoryRequirements::new(40 * MIB, 1), &gpu_only())
                .unwrap();
            assert_eq!(device.memory_object_count(), 2);
        }

        assert_eq!(device.memory_object_count(), 0);
    }
}
