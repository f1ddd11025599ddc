use crate::allocator::allocation::AllocationCreateFlags;
use crate::allocator::block::{
    DeviceContext, DeviceMemoryBlock, ALLOCATION_FILL_PATTERN_CREATED,
    ALLOCATION_FILL_PATTERN_DESTROYED,
};
use crate::allocator::budget::BudgetTracker;
use crate::error::{Error, Result};
use crate::memory::DeviceSize;
use crate::metadata::{
    AllocHandle, AllocationRequest, AllocationStrategy, BlockMetadata, GenericMetadata,
    LinearMetadata, SuballocationType,
};
use crate::stats::{DetailedStatistics, Statistics};

const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;

/// Parameters of one allocation served from a block vector.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockRequest {
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    pub kind: SuballocationType,
    pub flags: AllocationCreateFlags,
    pub allocation_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockAllocation {
    pub block_id: u64,
    pub handle: AllocHandle,
    pub offset: DeviceSize,
}

/// Device memory blocks given back to the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ReleasedBlocks {
    pub count: u32,
    pub bytes: DeviceSize,
}

impl ReleasedBlocks {
    fn add(&mut self, block: &DeviceMemoryBlock) {
        self.count += 1;
        self.bytes += block.size();
    }
}

/// Ordered set of blocks of one memory type sharing one allocation policy.
pub(crate) struct BlockVector {
    pub memory_type_index: u32,
    pub preferred_block_size: DeviceSize,
    pub min_block_count: usize,
    pub max_block_count: usize,
    pub explicit_block_size: bool,
    pub buffer_image_granularity: DeviceSize,
    pub linear: bool,
    pub priority: f32,
    pub min_allocation_alignment: DeviceSize,
    pub blocks: Vec<DeviceMemoryBlock>,
    incremental_sort: bool,
}

impl BlockVector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory_type_index: u32,
        preferred_block_size: DeviceSize,
        min_block_count: usize,
        max_block_count: usize,
        explicit_block_size: bool,
        buffer_image_granularity: DeviceSize,
        linear: bool,
        priority: f32,
        min_allocation_alignment: DeviceSize,
    ) -> Self {
        Self {
            memory_type_index,
            preferred_block_size,
            min_block_count,
            max_block_count,
            explicit_block_size,
            buffer_image_granularity,
            linear,
            priority,
            min_allocation_alignment,
            blocks: vec![],
            incremental_sort: true,
        }
    }

    pub fn block_index(&self, block_id: u64) -> Option<usize> {
        self.blocks.iter().position(|block| block.id == block_id)
    }

    pub fn block_mut(&mut self, block_id: u64) -> Option<&mut DeviceMemoryBlock> {
        self.blocks.iter_mut().find(|block| block.id == block_id)
    }

    pub fn block(&self, block_id: u64) -> Option<&DeviceMemoryBlock> {
        self.blocks.iter().find(|block| block.id == block_id)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|block| block.metadata.is_empty())
    }

    pub fn has_empty_block(&self) -> bool {
        self.blocks.iter().any(|block| block.metadata.is_empty())
    }

    pub fn set_incremental_sort(&mut self, enabled: bool) {
        self.incremental_sort = enabled;
    }

    /// Fullest blocks first.
    pub fn sort_by_free_size(&mut self) {
        self.blocks
            .sort_by_key(|block| block.metadata.sum_free_size());
    }

    /// One bubble-sort step towards fullest-first order.
    fn incrementally_sort_blocks(&mut self) {
        if !self.incremental_sort || self.linear {
            return;
        }

        for index in 1..self.blocks.len() {
            if self.blocks[index - 1].metadata.sum_free_size()
                > self.blocks[index].metadata.sum_free_size()
            {
                self.blocks.swap(index - 1, index);
                return;
            }
        }
    }

    pub fn create_min_blocks(
        &mut self,
        context: &DeviceContext,
        budget: &mut BudgetTracker,
    ) -> Result<()> {
        while self.blocks.len() < self.min_block_count {
            self.create_block(context, budget, self.preferred_block_size)?;
        }
        Ok(())
    }

    fn create_block(
        &mut self,
        context: &DeviceContext,
        budget: &mut BudgetTracker,
        size: DeviceSize,
    ) -> Result<usize> {
        let memory = context.allocate_device_memory(budget, self.memory_type_index, size)?;

        let metadata: Box<dyn BlockMetadata> = match self.linear {
            true => Box::new(LinearMetadata::new(
                size,
                self.buffer_image_granularity,
                context.debug_margin,
            )),
            false => Box::new(GenericMetadata::new(
                size,
                self.buffer_image_granularity,
                context.debug_margin,
            )),
        };

        let id = context.next_block_id();

        log::debug!(
            "Created block {id} of {size} bytes in memory type {}",
            self.memory_type_index
        );

        self.blocks.push(DeviceMemoryBlock::new(
            id,
            memory,
            self.memory_type_index,
            metadata,
        ));

        Ok(self.blocks.len() - 1)
    }

    pub fn effective_alignment(&self, context: &DeviceContext, alignment: DeviceSize) -> DeviceSize {
        alignment
            .max(self.min_allocation_alignment)
            .max(context.memory_type_min_alignment(self.memory_type_index))
    }

    pub fn allocate(
        &mut self,
        context: &DeviceContext,
        budget: &mut BudgetTracker,
        request: &BlockRequest,
    ) -> Result<BlockAllocation> {
        let flags = request.flags;
        let size = request.size;

        if flags.contains(AllocationCreateFlags::UPPER_ADDRESS)
            && (!self.linear || self.max_block_count > 1)
        {
            return Err(Error::feature_not_present(
                "Upper address allocation needs a linear pool limited to one block",
            ));
        }

        let alignment = self.effective_alignment(context, request.alignment);

        let required_size = size + 2 * context.debug_margin;
        if required_size > self.preferred_block_size {
            return Err(Error::OutOfDeviceMemory);
        }

        let heap_index = context.heap_index(self.memory_type_index);
        let free_memory = budget.free_memory(
            context.backend.as_ref(),
            &context.properties,
            heap_index,
        );

        let never_allocate = flags.contains(AllocationCreateFlags::NEVER_ALLOCATE);
        let within_budget = flags.contains(AllocationCreateFlags::WITHIN_BUDGET);
        let can_fallback_to_dedicated = !self.explicit_block_size && !never_allocate;
        let can_exceed_budget = !can_fallback_to_dedicated && !within_budget;
        let can_create_new_block = !never_allocate
            && self.blocks.len() < self.max_block_count
            && (free_memory >= size || can_exceed_budget);

        let strategy = flags.strategy();

        if self.linear {
            if let Some(last) = self.blocks.len().checked_sub(1) {
                if let Some(allocation) =
                    self.allocate_from_block(context, budget, last, alignment, request, strategy)?
                {
                    return Ok(allocation);
                }
            }
        } else if strategy != AllocationStrategy::MinTime {
            if context.is_host_visible(self.memory_type_index) {
                // Keep mappable and non-mappable allocations in separate blocks where possible.
                let mapping_allowed =
                    flags.allows_host_access() || flags.contains(AllocationCreateFlags::MAPPED);
                for pass in 0..2 {
                    for index in 0..self.blocks.len() {
                        let is_mapped = self.blocks[index].mapped().is_some();
                        if (pass == 0) != (mapping_allowed == is_mapped) {
                            continue;
                        }
                        if let Some(allocation) = self.allocate_from_block(
                            context, budget, index, alignment, request, strategy,
                        )? {
                            return Ok(allocation);
                        }
                    }
                }
            } else {
                for index in 0..self.blocks.len() {
                    if let Some(allocation) =
                        self.allocate_from_block(context, budget, index, alignment, request, strategy)?
                    {
                        return Ok(allocation);
                    }
                }
            }
        } else {
            for index in (0..self.blocks.len()).rev() {
                if let Some(allocation) =
                    self.allocate_from_block(context, budget, index, alignment, request, strategy)?
                {
                    return Ok(allocation);
                }
            }
        }

        if !can_create_new_block {
            return Err(Error::OutOfDeviceMemory);
        }

        let mut new_block_size = self.preferred_block_size;
        let mut shift = 0;

        if !self.explicit_block_size {
            // Start with 1/8, 1/4 or 1/2 of the preferred size while no block is that large yet.
            let max_existing_block_size = self
                .blocks
                .iter()
                .map(DeviceMemoryBlock::size)
                .max()
                .unwrap_or(0);

            while shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller = new_block_size / 2;
                if smaller > max_existing_block_size && smaller >= required_size * 2 {
                    new_block_size = smaller;
                    shift += 1;
                } else {
                    break;
                }
            }
        }

        let mut created = match new_block_size <= free_memory || can_exceed_budget {
            true => self.create_block(context, budget, new_block_size),
            false => Err(Error::OutOfDeviceMemory),
        };

        if !self.explicit_block_size {
            while created.is_err() && shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller = new_block_size / 2;
                if smaller < required_size {
                    break;
                }

                new_block_size = smaller;
                shift += 1;
                created = match new_block_size <= free_memory || can_exceed_budget {
                    true => self.create_block(context, budget, new_block_size),
                    false => Err(Error::OutOfDeviceMemory),
                };
            }
        }

        let index = created?;
        match self.allocate_from_block(context, budget, index, alignment, request, strategy)? {
            Some(allocation) => {
                self.incrementally_sort_blocks();
                Ok(allocation)
            }
            None => Err(Error::OutOfDeviceMemory),
        }
    }

    fn allocate_from_block(
        &mut self,
        context: &DeviceContext,
        budget: &mut BudgetTracker,
        index: usize,
        alignment: DeviceSize,
        request: &BlockRequest,
        strategy: AllocationStrategy,
    ) -> Result<Option<BlockAllocation>> {
        let placement = self.blocks[index].metadata.create_allocation_request(
            request.size,
            alignment,
            request.flags.contains(AllocationCreateFlags::UPPER_ADDRESS),
            request.kind,
            strategy,
        );

        match placement {
            Some(placement) => self.commit(context, budget, index, &placement, request).map(Some),
            None => Ok(None),
        }
    }

    /// Reserves the place found by a metadata search and prepares its memory.
    pub fn commit(
        &mut self,
        context: &DeviceContext,
        budget: &mut BudgetTracker,
        index: usize,
        placement: &AllocationRequest,
        request: &BlockRequest,
    ) -> Result<BlockAllocation> {
        let memory_type_index = self.memory_type_index;
        let block = &mut self.blocks[index];

        if request.flags.contains(AllocationCreateFlags::MAPPED) {
            block.map(context.backend.as_ref(), 1)?;
        }

        let handle = block
            .metadata
            .alloc(placement, request.kind, request.allocation_id);

        if context.debug_initialize_allocations && context.is_host_visible(memory_type_index) {
            if let Err(error) = block.fill(
                context,
                placement.offset,
                placement.size,
                ALLOCATION_FILL_PATTERN_CREATED,
            ) {
                log::warn!("Could not initialize allocation memory: {error}");
            }
        }

        if context.is_corruption_detection_enabled(memory_type_index) {
            if let Err(error) = block.write_magic_around(
                context.backend.as_ref(),
                placement.offset,
                placement.size,
                context.debug_margin,
            ) {
                log::warn!("Could not write corruption detection values: {error}");
            }
        }

        budget.add_allocation(context.heap_index(memory_type_index), placement.size);

        Ok(BlockAllocation {
            block_id: block.id,
            handle,
            offset: placement.offset,
        })
    }

    /// Releases a suballocation and gives empty blocks back to the device, keeping at most
    /// one of them around. `map_count` is how many mappings the allocation still holds on its
    /// block.
    pub fn free(
        &mut self,
        context: &DeviceContext,
        budget: &mut BudgetTracker,
        block_id: u64,
        handle: AllocHandle,
        map_count: u32,
    ) -> Result<ReleasedBlocks> {
        let heap_index = context.heap_index(self.memory_type_index);
        let heap_budget = budget.budget(context.backend.as_ref(), &context.properties, heap_index);
        let budget_exceeded = heap_budget.usage >= heap_budget.budget;

        let had_empty_block = self.has_empty_block();
        self.free_suballocation(context, budget, block_id, handle, map_count)?;

        let index = match self.block_index(block_id) {
            Some(index) => index,
            None => return Err(Error::invalid_handle(format!("Unknown block: {block_id}"))),
        };
        let can_delete_block = self.blocks.len() > self.min_block_count;
        let mut released = ReleasedBlocks::default();

        if self.blocks[index].metadata.is_empty() {
            if (had_empty_block || budget_exceeded) && can_delete_block {
                let block = self.blocks.remove(index);
                released.add(&block);
                block.destroy(context, budget);
            }
        } else if had_empty_block && can_delete_block {
            let last_is_empty = self
                .blocks
                .last()
                .map(|block| block.metadata.is_empty())
                .unwrap_or(false);
            if last_is_empty {
                if let Some(block) = self.blocks.pop() {
                    released.add(&block);
                    block.destroy(context, budget);
                }
            }
        }

        self.incrementally_sort_blocks();

        Ok(released)
    }

    /// Releases a suballocation without touching the set of blocks.
    pub fn free_suballocation(
        &mut self,
        context: &DeviceContext,
        budget: &mut BudgetTracker,
        block_id: u64,
        handle: AllocHandle,
        map_count: u32,
    ) -> Result<()> {
        let memory_type_index = self.memory_type_index;

        let block = match self.block_mut(block_id) {
            Some(block) => block,
            None => return Err(Error::invalid_handle(format!("Unknown block: {block_id}"))),
        };

        let suballocation = match block.metadata.suballocation(handle) {
            Some(suballocation) => suballocation,
            None => {
                return Err(Error::invalid_handle(format!(
                    "No allocation at offset {} of block {block_id}",
                    handle.offset()
                )))
            }
        };

        if context.is_corruption_detection_enabled(memory_type_index) {
            let intact = block.validate_magic_around(
                context.backend.as_ref(),
                suballocation.offset,
                suballocation.size,
                context.debug_margin,
            )?;
            if !intact {
                log::error!(
                    "Memory corruption detected around freed allocation at offset {} in block {block_id}",
                    suballocation.offset
                );
            }
            debug_assert!(
                intact,
                "Memory corruption detected around freed allocation at offset {} in block {block_id}",
                suballocation.offset
            );
        }

        if context.debug_initialize_allocations && context.is_host_visible(memory_type_index) {
            if let Err(error) = block.fill(
                context,
                suballocation.offset,
                suballocation.size,
                ALLOCATION_FILL_PATTERN_DESTROYED,
            ) {
                log::warn!("Could not mark freed allocation memory: {error}");
            }
        }

        block.unmap(context.backend.as_ref(), map_count);
        block.metadata.free(handle);
        budget.remove_allocation(context.heap_index(memory_type_index), suballocation.size);

        log::trace!(
            "Freed {} bytes at offset {} of block {block_id}",
            suballocation.size,
            suballocation.offset
        );

        Ok(())
    }

    /// Destroys every empty block beyond the minimum block count.
    pub fn free_empty_blocks(
        &mut self,
        context: &DeviceContext,
        budget: &mut BudgetTracker,
    ) -> ReleasedBlocks {
        let mut released = ReleasedBlocks::default();

        let mut index = self.blocks.len();
        while index > 0 && self.blocks.len() > self.min_block_count {
            index -= 1;
            if self.blocks[index].metadata.is_empty() {
                let block = self.blocks.remove(index);
                released.add(&block);
                block.destroy(context, budget);
            }
        }

        released
    }

    pub fn check_corruption(&mut self, context: &DeviceContext) -> Result<()> {
        if !context.is_corruption_detection_enabled(self.memory_type_index) {
            return Err(Error::feature_not_present(
                "Corruption detection is not enabled for this memory type",
            ));
        }

        for block in self.blocks.iter_mut() {
            block.check_corruption(context.backend.as_ref(), context.debug_margin)?;
        }

        Ok(())
    }

    pub fn add_statistics(&self, stats: &mut Statistics) {
        for block in self.blocks.iter() {
            block.metadata.add_statistics(stats);
        }
    }

    pub fn add_detailed_statistics(&self, stats: &mut DetailedStatistics) {
        for block in self.blocks.iter() {
            block.metadata.add_detailed_statistics(stats);
        }
    }

    pub fn destroy(self, context: &DeviceContext, budget: &mut BudgetTracker) {
        for block in self.blocks {
            block.destroy(context, budget);
        }
    }
}
