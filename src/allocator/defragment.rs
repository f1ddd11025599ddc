use std::collections::HashSet;

use serde::Serialize;

use crate::allocator::allocation::{Allocation, AllocationCreateFlags, AllocationRecord, Placement, VectorId};
use crate::allocator::block_vector::{BlockRequest, ReleasedBlocks};
use crate::allocator::pool::Pool;
use crate::allocator::{Allocator, AllocatorState};
use crate::error::{code, Error, Result};
use crate::memory::DeviceSize;
use crate::metadata::{AllocationRequest, AllocationStrategy};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DefragmentationFlags: u32 {
        const ALGORITHM_FAST = 0x0000_0001;
        const ALGORITHM_BALANCED = 0x0000_0002;
        const ALGORITHM_FULL = 0x0000_0004;
        const ALGORITHM_EXTENSIVE = 0x0000_0008;
        const ALGORITHM_MASK = Self::ALGORITHM_FAST.bits()
            | Self::ALGORITHM_BALANCED.bits()
            | Self::ALGORITHM_FULL.bits()
            | Self::ALGORITHM_EXTENSIVE.bits();
    }
}

#[derive(Clone, Debug, Default)]
pub struct DefragmentationInfo {
    pub flags: DefragmentationFlags,
    /// Defragment one custom pool instead of the default pools.
    pub pool: Option<Pool>,
    /// Zero means unlimited.
    pub max_bytes_per_pass: DeviceSize,
    /// Zero means unlimited.
    pub max_allocations_per_pass: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DefragmentationMoveOperation {
    /// The caller copied the data; the source allocation takes over the new place.
    #[default]
    Copy = 0,
    /// Leave the source where it is and stop considering it.
    Ignore = 1,
    /// The caller destroyed the resource; both places are released.
    Destroy = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefragmentationMove {
    pub operation: DefragmentationMoveOperation,
    pub src_allocation: Allocation,
    /// Temporary allocation reserving the destination. Its memory and offset are where the
    /// data has to be copied.
    pub dst_tmp_allocation: Allocation,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DefragmentationPass {
    pub moves: Vec<DefragmentationMove>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassStatus {
    /// No more moves are possible.
    Success,
    /// Another pass may move more allocations.
    Incomplete,
}

impl PassStatus {
    pub fn code(&self) -> i32 {
        match self {
            PassStatus::Success => code::SUCCESS,
            PassStatus::Incomplete => code::INCOMPLETE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DefragmentationStats {
    pub bytes_moved: DeviceSize,
    pub bytes_freed: DeviceSize,
    pub allocations_moved: u32,
    pub device_memory_blocks_freed: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Algorithm {
    Fast,
    Balanced,
    Full,
}

impl Algorithm {
    fn from_flags(flags: DefragmentationFlags) -> Self {
        let algorithm = flags & DefragmentationFlags::ALGORITHM_MASK;

        if algorithm == DefragmentationFlags::ALGORITHM_FAST {
            Algorithm::Fast
        } else if algorithm == DefragmentationFlags::ALGORITHM_FULL
            || algorithm == DefragmentationFlags::ALGORITHM_EXTENSIVE
        {
            Algorithm::Full
        } else {
            Algorithm::Balanced
        }
    }

    /// Strategy used to search inside the allocation's own block. `None` means allocations
    /// only move to earlier blocks.
    fn same_block_strategy(self) -> Option<AllocationStrategy> {
        match self {
            Algorithm::Fast => None,
            Algorithm::Balanced => Some(AllocationStrategy::MinMemory),
            Algorithm::Full => Some(AllocationStrategy::MinOffset),
        }
    }

    fn other_block_strategy(self) -> AllocationStrategy {
        match self {
            Algorithm::Balanced => AllocationStrategy::MinMemory,
            Algorithm::Fast | Algorithm::Full => AllocationStrategy::MinOffset,
        }
    }
}

/// A move chosen by the planner: where in which block the allocation would go.
struct PlannedMove {
    src_id: u64,
    dst_index: usize,
    placement: AllocationRequest,
}

/// Running defragmentation of the default pools or of one custom pool.
///
/// Each pass proposes moves; the caller copies the data and hands the pass back to
/// [`end_pass`](Self::end_pass), which commits them.
pub struct DefragmentationContext<'a> {
    allocator: &'a Allocator,
    algorithm: Algorithm,
    vectors: Vec<VectorId>,
    max_bytes_per_pass: DeviceSize,
    max_allocations_per_pass: u32,
    ignored: HashSet<u64>,
    pending: Option<Vec<DefragmentationMove>>,
    stats: DefragmentationStats,
    finished: bool,
}

impl Allocator {
    pub fn begin_defragmentation(
        &self,
        info: &DefragmentationInfo,
    ) -> Result<DefragmentationContext<'_>> {
        let mut state = self.lock();

        let vectors = match info.pool {
            Some(pool) => {
                let entry = match state.pools.get(&pool.0) {
                    Some(entry) => entry,
                    None => return Err(Error::invalid_handle(format!("Unknown pool: {}", pool.0))),
                };
                if entry.vector.linear {
                    return Err(Error::feature_not_present(
                        "Pools with the linear algorithm cannot be defragmented",
                    ));
                }
                vec![VectorId::Pool(pool.0)]
            }
            None => (0..state.default_vectors.len() as u32)
                .map(VectorId::Default)
                .collect(),
        };

        for vector_id in vectors.iter() {
            if let Some((vector, _)) = state.vector_and_budget(*vector_id) {
                vector.sort_by_free_size();
                vector.set_incremental_sort(false);
            }
        }

        let algorithm = Algorithm::from_flags(info.flags);
        log::debug!(
            "Began {algorithm:?} defragmentation of {} block vectors",
            vectors.len()
        );

        Ok(DefragmentationContext {
            allocator: self,
            algorithm,
            vectors,
            max_bytes_per_pass: info.max_bytes_per_pass,
            max_allocations_per_pass: info.max_allocations_per_pass,
            ignored: HashSet::new(),
            pending: None,
            stats: DefragmentationStats::default(),
            finished: false,
        })
    }
}

impl<'a> DefragmentationContext<'a> {
    /// Plans the next pass and reserves a destination for every move. An empty pass means
    /// nothing more can be moved.
    pub fn begin_pass(&mut self) -> Result<DefragmentationPass> {
        if self.pending.is_some() {
            return Err(Error::invalid_argument(
                "The previous defragmentation pass has not ended",
            ));
        }

        let allocator = self.allocator;
        let mut state = allocator.lock();

        let mut moves = vec![];
        let mut bytes = 0;
        let mut reserved = HashSet::new();

        'vectors: for vector_id in self.vectors.clone() {
            loop {
                if self.max_allocations_per_pass != 0
                    && moves.len() as u32 >= self.max_allocations_per_pass
                {
                    break 'vectors;
                }

                let remaining_bytes = self.pass_byte_limit() - bytes;

                let planned =
                    match self.find_move(&state, vector_id, &reserved, remaining_bytes) {
                        Some(planned) => planned,
                        None => break,
                    };

                let tmp = self.reserve(&mut state, vector_id, &planned)?;
                let size = state.record(tmp)?.size;

                reserved.insert(planned.src_id);
                reserved.insert(tmp.0);
                bytes += size;
                moves.push(DefragmentationMove {
                    operation: DefragmentationMoveOperation::Copy,
                    src_allocation: Allocation(planned.src_id),
                    dst_tmp_allocation: tmp,
                });
            }
        }

        log::debug!("Defragmentation pass planned {} moves of {bytes} bytes", moves.len());

        self.pending = Some(moves.clone());
        Ok(DefragmentationPass { moves })
    }

    fn pass_byte_limit(&self) -> DeviceSize {
        match self.max_bytes_per_pass {
            0 => DeviceSize::MAX,
            max => max,
        }
    }

    fn count_released(&mut self, released: ReleasedBlocks) {
        self.stats.device_memory_blocks_freed += released.count;
        self.stats.bytes_freed += released.bytes;
    }

    /// Looks for the next allocation to move, walking sources from the last block backwards
    /// and from the highest offset down.
    fn find_move(
        &self,
        state: &AllocatorState,
        vector_id: VectorId,
        reserved: &HashSet<u64>,
        remaining_bytes: DeviceSize,
    ) -> Option<PlannedMove> {
        let vector = state.vector(vector_id)?;
        let context = &self.allocator.context;

        for src_index in (0..vector.blocks.len()).rev() {
            let src_block = &vector.blocks[src_index];

            for suballocation in src_block.metadata.allocations().into_iter().rev() {
                let src_id = suballocation.user_data;
                if self.ignored.contains(&src_id) || reserved.contains(&src_id) {
                    continue;
                }

                let record = match state.allocations.get(&src_id) {
                    Some(record) => record,
                    None => continue,
                };
                if record.size > remaining_bytes {
                    continue;
                }

                let alignment = vector.effective_alignment(context, record.alignment);

                let earlier = (0..src_index).find_map(|dst_index| {
                    vector.blocks[dst_index]
                        .metadata
                        .create_allocation_request(
                            record.size,
                            alignment,
                            false,
                            record.kind,
                            self.algorithm.other_block_strategy(),
                        )
                        .map(|placement| (dst_index, placement))
                });

                let destination = earlier.or_else(|| {
                    let strategy = self.algorithm.same_block_strategy()?;
                    src_block
                        .metadata
                        .create_allocation_request(
                            record.size,
                            alignment,
                            false,
                            record.kind,
                            strategy,
                        )
                        .filter(|placement| placement.offset < suballocation.offset)
                        .map(|placement| (src_index, placement))
                });

                if let Some((dst_index, placement)) = destination {
                    return Some(PlannedMove {
                        src_id,
                        dst_index,
                        placement,
                    });
                }
            }
        }

        None
    }

    /// Claims the planned destination with a temporary allocation.
    fn reserve(
        &self,
        state: &mut AllocatorState,
        vector_id: VectorId,
        planned: &PlannedMove,
    ) -> Result<Allocation> {
        let context = &self.allocator.context;
        let src = state.record(Allocation(planned.src_id))?;
        let (size, alignment, kind, memory_type_index, pool, priority) = (
            src.size,
            src.alignment,
            src.kind,
            src.memory_type_index,
            src.pool,
            src.priority,
        );

        let tmp_id = state.next_allocation_id;
        let request = BlockRequest {
            size,
            alignment,
            kind,
            flags: AllocationCreateFlags::empty(),
            allocation_id: tmp_id,
        };

        let block_allocation = match state.vector_and_budget(vector_id) {
            Some((vector, budget)) => {
                vector.commit(context, budget, planned.dst_index, &planned.placement, &request)?
            }
            None => return Err(Error::invalid_handle("Unknown block vector")),
        };

        state.next_allocation_id += 1;
        state.allocations.insert(
            tmp_id,
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
                user_data: 0,
                name: None,
                map_count: 0,
                persistent_map: false,
                priority,
            },
        );

        Ok(Allocation(tmp_id))
    }

    /// Commits the moves of the pass, releases blocks left empty and reports whether another
    /// pass could move more.
    pub fn end_pass(&mut self, pass: DefragmentationPass) -> Result<PassStatus> {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => {
                return Err(Error::invalid_argument(
                    "No defragmentation pass is in progress",
                ))
            }
        };

        let matches_pending = pass.moves.len() == pending.len()
            && pass.moves.iter().zip(pending.iter()).all(|(given, planned)| {
                given.src_allocation == planned.src_allocation
                    && given.dst_tmp_allocation == planned.dst_tmp_allocation
            });
        if !matches_pending {
            self.pending = Some(pending);
            return Err(Error::invalid_argument(
                "The pass does not match the one that was begun",
            ));
        }

        let allocator = self.allocator;
        let mut state = allocator.lock();
        let mut first_error = None;

        for planned in pass.moves.iter() {
            let tmp = planned.dst_tmp_allocation;

            if let Err(error) = self.end_move(&mut state, planned) {
                log::warn!(
                    "Could not finish the move of allocation {}: {error}",
                    planned.src_allocation.0
                );

                // The temporary destination never outlives its pass.
                if state.allocations.contains_key(&tmp.0) {
                    match allocator.free_locked(&mut state, tmp) {
                        Ok(released) => self.count_released(released),
                        Err(error) => {
                            log::error!("Could not release defragmentation destination: {error}")
                        }
                    }
                }

                first_error.get_or_insert(error);
            }
        }

        let context = &allocator.context;
        for vector_id in self.vectors.iter() {
            if let Some((vector, budget)) = state.vector_and_budget(*vector_id) {
                let released = vector.free_empty_blocks(context, budget);
                self.stats.device_memory_blocks_freed += released.count;
                self.stats.bytes_freed += released.bytes;
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        // A pass that planned nothing proves that nothing more can move.
        let more = !pass.moves.is_empty()
            && self.vectors.iter().any(|vector_id| {
                self.find_move(&state, *vector_id, &HashSet::new(), self.pass_byte_limit())
                    .is_some()
            });

        log::debug!(
            "Defragmentation pass ended, {} allocations moved so far",
            self.stats.allocations_moved
        );

        Ok(match more {
            true => PassStatus::Incomplete,
            false => PassStatus::Success,
        })
    }

    fn end_move(&mut self, state: &mut AllocatorState, planned: &DefragmentationMove) -> Result<()> {
        let allocator = self.allocator;
        let src = planned.src_allocation;
        let tmp = planned.dst_tmp_allocation;

        if !state.allocations.contains_key(&src.0) {
            // The source was freed while the pass was running.
            let released = allocator.free_locked(state, tmp)?;
            self.count_released(released);
            return Ok(());
        }

        match planned.operation {
            DefragmentationMoveOperation::Copy => {
                let size = self.commit_copy(state, src, tmp)?;
                self.stats.bytes_moved += size;
                self.stats.allocations_moved += 1;
            }
            DefragmentationMoveOperation::Ignore => {
                let released = allocator.free_locked(state, tmp)?;
                self.count_released(released);
                self.ignored.insert(src.0);
            }
            DefragmentationMoveOperation::Destroy => {
                let released = allocator.free_locked(state, tmp)?;
                self.count_released(released);
                let released = allocator.free_locked(state, src)?;
                self.count_released(released);
            }
        }

        Ok(())
    }

    /// Makes the source allocation refer to its temporary destination and frees the old place.
    /// Returns the bytes moved. On error the temporary allocation is left in place.
    fn commit_copy(
        &self,
        state: &mut AllocatorState,
        src: Allocation,
        tmp: Allocation,
    ) -> Result<DeviceSize> {
        let context = &self.allocator.context;
        let backend = context.backend.as_ref();

        let tmp_placement = state.record(tmp)?.placement;
        let src_record = state.record(src)?;
        let map_count = src_record.total_map_count();
        let size = src_record.size;

        let (vector_id, src_block_id, src_handle, dst_block_id, dst_handle) =
            match (src_record.placement, tmp_placement) {
                (
                    Placement::Block {
                        vector,
                        block_id: src_block_id,
                        handle: src_handle,
                    },
                    Placement::Block {
                        block_id: dst_block_id,
                        handle: dst_handle,
                        ..
                    },
                ) => (vector, src_block_id, src_handle, dst_block_id, dst_handle),
                _ => return Err(Error::invalid_argument("Only block allocations can move")),
            };

        let (vector, budget) = match state.vector_and_budget(vector_id) {
            Some(found) => found,
            None => return Err(Error::invalid_handle("Unknown block vector")),
        };

        // Mappings follow the allocation to its new block.
        match vector.block_mut(dst_block_id) {
            Some(block) => {
                if map_count > 0 {
                    block.map(backend, map_count)?;
                }
                block.metadata.set_user_data(dst_handle, src.0);
            }
            None => return Err(Error::invalid_handle(format!("Unknown block: {dst_block_id}"))),
        }

        if let Err(error) =
            vector.free_suballocation(context, budget, src_block_id, src_handle, map_count)
        {
            if let Some(block) = vector.block_mut(dst_block_id) {
                block.unmap(backend, map_count);
                block.metadata.set_user_data(dst_handle, tmp.0);
            }
            return Err(error);
        }

        state.allocations.remove(&tmp.0);
        state.record_mut(src)?.placement = Placement::Block {
            vector: vector_id,
            block_id: dst_block_id,
            handle: dst_handle,
        };

        log::trace!(
            "Moved allocation {} to offset {} of block {dst_block_id}",
            src.0,
            dst_handle.offset()
        );

        Ok(size)
    }

    pub fn stats(&self) -> DefragmentationStats {
        self.stats
    }

    /// Finishes defragmentation. A pass still in progress is dropped as if every move was
    /// ignored.
    pub fn end(mut self) -> DefragmentationStats {
        self.finish();
        self.stats
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let allocator = self.allocator;
        let mut state = allocator.lock();

        if let Some(pending) = self.pending.take() {
            for planned in pending {
                if let Err(error) = allocator.free_locked(&mut state, planned.dst_tmp_allocation) {
                    log::warn!("Could not release defragmentation destination: {error}");
                }
            }
        }

        for vector_id in self.vectors.iter() {
            if let Some((vector, _)) = state.vector_and_budget(*vector_id) {
                vector.set_incremental_sort(true);
            }
        }

        log::debug!("Ended defragmentation: {:?}", self.stats);
    }
}

impl Drop for DefragmentationContext<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::allocator::{AllocationCreateInfo, AllocatorCreateInfo, PoolCreateFlags, PoolCreateInfo};
    use crate::memory::host::HostMemoryDevice;
    use crate::memory::MemoryRequirements;

    fn allocator() -> Allocator {
        Allocator::new(
            Arc::new(HostMemoryDevice::discrete_gpu()),
            AllocatorCreateInfo::default(),
        )
        .unwrap()
    }

    fn pool(allocator: &Allocator, flags: PoolCreateFlags, block_size: DeviceSize) -> Pool {
        allocator
            .create_pool(&PoolCreateInfo {
                memory_type_index: 1,
                flags: flags | PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY,
                block_size,
                ..Default::default()
            })
            .unwrap()
    }

    fn fixed_pool(allocator: &Allocator, flags: PoolCreateFlags) -> Pool {
        pool(allocator, flags, 1024)
    }

    /// Three blocks of four 512 byte allocations, thinned out so the last two blocks keep
    /// only their first allocation and the first block has room for both.
    fn three_sparse_blocks(allocator: &Allocator) -> (Pool, Vec<Allocation>) {
        let pool = pool(allocator, PoolCreateFlags::empty(), 2048);
        let allocations: Vec<_> = (0..12).map(|_| allocate(allocator, pool, 512)).collect();
        assert_eq!(allocator.pool_statistics(pool).unwrap().block_count, 3);

        for index in [2, 3, 5, 6, 7, 9, 10, 11] {
            allocator.free_memory(allocations[index]).unwrap();
        }

        (pool, allocations)
    }

    fn allocate(allocator: &Allocator, pool: Pool, size: DeviceSize) -> Allocation {
        allocator
            .allocate_memory(
                &MemoryRequirements::new(size, 1),
                &AllocationCreateInfo {
                    pool: Some(pool),
                    ..Default::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn algorithm_selection() {
        assert_eq!(
            Algorithm::from_flags(DefragmentationFlags::ALGORITHM_FAST),
            Algorithm::Fast
        );
        assert_eq!(
            Algorithm::from_flags(DefragmentationFlags::ALGORITHM_EXTENSIVE),
            Algorithm::Full
        );
        assert_eq!(
            Algorithm::from_flags(DefragmentationFlags::empty()),
            Algorithm::Balanced
        );
        assert_eq!(
            Algorithm::from_flags(
                DefragmentationFlags::ALGORITHM_FAST | DefragmentationFlags::ALGORITHM_FULL
            ),
            Algorithm::Balanced
        );
    }

    #[test]
    fn linear_pools_cannot_be_defragmented() {
        let allocator = allocator();
        let pool = fixed_pool(&allocator, PoolCreateFlags::LINEAR_ALGORITHM);

        let result = allocator.begin_defragmentation(&DefragmentationInfo {
            pool: Some(pool),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::FeatureNotPresent(_))));
    }

    #[test]
    fn second_pass_cannot_begin_before_the_first_ends() {
        let allocator = allocator();
        let pool = fixed_pool(&allocator, PoolCreateFlags::empty());
        allocate(&allocator, pool, 512);

        let mut context = allocator
            .begin_defragmentation(&DefragmentationInfo {
                pool: Some(pool),
                ..Default::default()
            })
            .unwrap();
        let pass = context.begin_pass().unwrap();
        assert!(matches!(context.begin_pass(), Err(Error::InvalidArgument(_))));
        assert_eq!(context.end_pass(pass), Ok(PassStatus::Success));
    }

    #[test]
    fn sparse_blocks_are_merged() {
        let allocator = allocator();
        let pool = fixed_pool(&allocator, PoolCreateFlags::empty());

        let allocations: Vec<_> = (0..4).map(|_| allocate(&allocator, pool, 512)).collect();
        assert_eq!(allocator.pool_statistics(pool).unwrap().block_count, 2);

        // Leave one allocation in each block.
        allocator.free_memory(allocations[0]).unwrap();
        allocator.free_memory(allocations[3]).unwrap();

        let mut context = allocator
            .begin_defragmentation(&DefragmentationInfo {
                pool: Some(pool),
                ..Default::default()
            })
            .unwrap();

        let pass = context.begin_pass().unwrap();
        assert_eq!(pass.moves.len(), 1);
        assert_eq!(context.end_pass(pass), Ok(PassStatus::Success));

        let stats = context.end();
        assert_eq!(stats.allocations_moved, 1);
        assert_eq!(stats.bytes_moved, 512);
        assert_eq!(stats.device_memory_blocks_freed, 1);
        assert_eq!(stats.bytes_freed, 1024);
        assert_eq!(allocator.pool_statistics(pool).unwrap().block_count, 1);
    }

    #[test]
    fn ignored_moves_are_not_proposed_again() {
        let allocator = allocator();
        let pool = fixed_pool(&allocator, PoolCreateFlags::empty());

        let allocations: Vec<_> = (0..4).map(|_| allocate(&allocator, pool, 512)).collect();
        allocator.free_memory(allocations[0]).unwrap();
        allocator.free_memory(allocations[3]).unwrap();

        let before = allocator.memory_binding(allocations[1]).unwrap();

        let mut context = allocator
            .begin_defragmentation(&DefragmentationInfo {
                pool: Some(pool),
                ..Default::default()
            })
            .unwrap();
        let mut pass = context.begin_pass().unwrap();
        assert_eq!(pass.moves.len(), 1);
        assert_eq!(pass.moves[0].src_allocation, allocations[1]);
        pass.moves[0].operation = DefragmentationMoveOperation::Ignore;
        assert_eq!(context.end_pass(pass), Ok(PassStatus::Success));

        assert!(context.begin_pass().unwrap().moves.is_empty());
        let stats = context.end();
        assert_eq!(stats.allocations_moved, 0);

        assert_eq!(allocator.memory_binding(allocations[1]).unwrap(), before);
        assert_eq!(allocator.pool_statistics(pool).unwrap().block_count, 2);
    }

    #[test]
    fn blocks_released_by_destroyed_moves_are_counted() {
        let allocator = allocator();
        let (pool, allocations) = three_sparse_blocks(&allocator);

        let mut context = allocator
            .begin_defragmentation(&DefragmentationInfo {
                flags: DefragmentationFlags::ALGORITHM_FAST,
                pool: Some(pool),
                ..Default::default()
            })
            .unwrap();

        let mut pass = context.begin_pass().unwrap();
        assert_eq!(pass.moves.len(), 2);
        for planned in pass.moves.iter_mut() {
            planned.operation = DefragmentationMoveOperation::Destroy;
        }
        assert_eq!(context.end_pass(pass), Ok(PassStatus::Success));

        let stats = context.end();
        assert_eq!(stats.allocations_moved, 0);
        assert_eq!(stats.device_memory_blocks_freed, 2);
        assert_eq!(stats.bytes_freed, 4096);

        assert!(matches!(
            allocator.allocation_info(allocations[4]),
            Err(Error::InvalidHandle(_))
        ));
        let pool_stats = allocator.pool_statistics(pool).unwrap();
        assert_eq!(pool_stats.block_count, 1);
        assert_eq!(pool_stats.allocation_count, 2);
    }

    #[test]
    fn failed_move_does_not_leak_destinations() {
        let allocator = allocator();
        let (pool, _) = three_sparse_blocks(&allocator);

        let mut context = allocator
            .begin_defragmentation(&DefragmentationInfo {
                flags: DefragmentationFlags::ALGORITHM_FAST,
                pool: Some(pool),
                ..Default::default()
            })
            .unwrap();

        let pass = context.begin_pass().unwrap();
        assert_eq!(pass.moves.len(), 2);

        // Releasing a destination behind the context's back breaks the first move only.
        allocator.free_memory(pass.moves[0].dst_tmp_allocation).unwrap();
        assert!(matches!(context.end_pass(pass), Err(Error::InvalidHandle(_))));
        assert_eq!(context.stats().allocations_moved, 1);

        let stats = context.end();
        assert_eq!(stats.device_memory_blocks_freed, 1);

        let pool_stats = allocator.pool_statistics(pool).unwrap();
        assert_eq!(pool_stats.allocation_count, 4);
        assert_eq!(pool_stats.block_count, 2);
    }

    #[test]
    fn empty_pass_ends_defragmentation() {
        let allocator = allocator();
        let (pool, _) = three_sparse_blocks(&allocator);

        let mut context = allocator
            .begin_defragmentation(&DefragmentationInfo {
                pool: Some(pool),
                max_bytes_per_pass: 256,
                ..Default::default()
            })
            .unwrap();

        let pass = context.begin_pass().unwrap();
        assert!(pass.moves.is_empty());
        assert_eq!(context.end_pass(pass), Ok(PassStatus::Success));
        assert_eq!(context.end(), DefragmentationStats::default());
    }
}
