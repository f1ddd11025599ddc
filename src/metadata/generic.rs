use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::memory::{checked_align_up, DeviceSize};
use crate::metadata::{
    blocks_on_same_page, is_buffer_image_granularity_conflict, AllocHandle, AllocationRequest,
    AllocationRequestKind, AllocationStrategy, BlockMetadata, Suballocation, SuballocationType,
};

/// General-purpose free list.
///
/// The block is always fully partitioned into used and free regions keyed by offset, and no two
/// free regions are adjacent. Free regions are additionally indexed by `(size, offset)` so a
/// best-fit lookup is a range query.
pub struct GenericMetadata {
    size: DeviceSize,
    buffer_image_granularity: DeviceSize,
    debug_margin: DeviceSize,
    suballocations: BTreeMap<DeviceSize, Suballocation>,
    free_by_size: BTreeSet<(DeviceSize, DeviceSize)>,
    allocation_count: usize,
    sum_free_size: DeviceSize,
}

impl GenericMetadata {
    pub fn new(
        size: DeviceSize,
        buffer_image_granularity: DeviceSize,
        debug_margin: DeviceSize,
    ) -> Self {
        let mut metadata = Self {
            size,
            buffer_image_granularity: buffer_image_granularity.max(1),
            debug_margin,
            suballocations: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            allocation_count: 0,
            sum_free_size: 0,
        };
        metadata.clear();
        metadata
    }

    fn insert_free(&mut self, offset: DeviceSize, size: DeviceSize) {
        self.suballocations
            .insert(offset, Suballocation::free(offset, size));
        self.free_by_size.insert((size, offset));
    }

    fn remove_free(&mut self, offset: DeviceSize) -> Suballocation {
        let region = match self.suballocations.remove(&offset) {
            Some(region) => region,
            None => panic!("No free region at offset {offset}"),
        };
        debug_assert!(region.is_free());
        self.free_by_size.remove(&(region.size, offset));
        region
    }

    /// Tries to place an allocation inside `free` and returns its offset.
    fn check_allocation(
        &self,
        free: &Suballocation,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationType,
    ) -> Option<DeviceSize> {
        let granularity = self.buffer_image_granularity;

        let mut offset = checked_align_up(free.offset.checked_add(self.debug_margin)?, alignment)?;

        if granularity > 1 {
            let mut conflict = false;
            for (_, previous) in self.suballocations.range(..free.offset).rev() {
                if previous.is_free() {
                    continue;
                }
                if !blocks_on_same_page(previous.offset, previous.size, offset, granularity) {
                    break;
                }
                if is_buffer_image_granularity_conflict(previous.kind, kind) {
                    conflict = true;
                    break;
                }
            }
            if conflict {
                offset = checked_align_up(offset, granularity)?;
            }
        }

        let end = offset.checked_add(size)?.checked_add(self.debug_margin)?;
        if end > free.end() {
            return None;
        }

        if granularity > 1 {
            let range = (Bound::Excluded(free.offset), Bound::Unbounded);
            for (_, next) in self.suballocations.range(range) {
                if next.is_free() {
                    continue;
                }
                if !blocks_on_same_page(offset, size, next.offset, granularity) {
                    break;
                }
                if is_buffer_image_granularity_conflict(kind, next.kind) {
                    return None;
                }
            }
        }

        Some(offset)
    }
}

impl BlockMetadata for GenericMetadata {
    fn size(&self) -> DeviceSize {
        self.size
    }

    fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    fn free_region_count(&self) -> usize {
        self.free_by_size.len()
    }

    fn sum_free_size(&self) -> DeviceSize {
        self.sum_free_size
    }

    fn create_allocation_request(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        upper_address: bool,
        kind: SuballocationType,
        strategy: AllocationStrategy,
    ) -> Option<AllocationRequest> {
        debug_assert!(size > 0);
        debug_assert!(!upper_address, "Upper address is only supported by the linear algorithm");

        let required = size.checked_add(2 * self.debug_margin)?;
        if required > self.sum_free_size {
            return None;
        }

        let candidate = |&(_, offset): &(DeviceSize, DeviceSize)| {
            let free = &self.suballocations[&offset];
            self.check_allocation(free, size, alignment, kind)
        };

        let offset = match strategy {
            AllocationStrategy::MinMemory => self
                .free_by_size
                .range((required, 0)..)
                .find_map(candidate),
            AllocationStrategy::MinTime => self
                .free_by_size
                .iter()
                .rev()
                .take_while(|(free_size, _)| *free_size >= required)
                .find_map(candidate),
            AllocationStrategy::MinOffset => self
                .suballocations
                .values()
                .filter(|region| region.is_free() && region.size >= required)
                .find_map(|free| self.check_allocation(free, size, alignment, kind)),
        }?;

        Some(AllocationRequest {
            offset,
            size,
            kind: AllocationRequestKind::Normal,
        })
    }

    fn alloc(
        &mut self,
        request: &AllocationRequest,
        kind: SuballocationType,
        user_data: u64,
    ) -> AllocHandle {
        let free_offset = match self.suballocations.range(..=request.offset).next_back() {
            Some((&offset, region)) if region.is_free() => offset,
            _ => panic!("Allocation request at {} is not inside a free region", request.offset),
        };

        let free = self.remove_free(free_offset);
        debug_assert!(request.offset + request.size <= free.end());

        let padding_begin = request.offset - free.offset;
        let padding_end = free.end() - request.offset - request.size;

        self.suballocations.insert(
            request.offset,
            Suballocation {
                offset: request.offset,
                size: request.size,
                kind,
                user_data,
            },
        );

        if padding_begin > 0 {
            self.insert_free(free.offset, padding_begin);
        }
        if padding_end > 0 {
            self.insert_free(request.offset + request.size, padding_end);
        }

        self.allocation_count += 1;
        self.sum_free_size -= request.size;

        log::trace!(
            "Suballocated {} bytes at offset {} ({})",
            request.size,
            request.offset,
            kind.name()
        );

        AllocHandle::from_offset(request.offset)
    }

    fn free(&mut self, handle: AllocHandle) {
        let offset = handle.offset();
        let region = match self.suballocations.remove(&offset) {
            Some(region) if !region.is_free() => region,
            _ => panic!("Freeing a suballocation that does not exist at offset {offset}"),
        };

        self.allocation_count -= 1;
        self.sum_free_size += region.size;

        let mut start = region.offset;
        let mut end = region.end();

        let previous = self
            .suballocations
            .range(..start)
            .next_back()
            .filter(|(_, previous)| previous.is_free())
            .map(|(&offset, _)| offset);
        if let Some(previous) = previous {
            start = self.remove_free(previous).offset;
        }

        if self
            .suballocations
            .get(&end)
            .map(|next| next.is_free())
            .unwrap_or(false)
        {
            end = self.remove_free(end).end();
        }

        self.insert_free(start, end - start);
    }

    fn clear(&mut self) {
        self.suballocations.clear();
        self.free_by_size.clear();
        self.allocation_count = 0;
        self.sum_free_size = self.size;
        self.insert_free(0, self.size);
    }

    fn suballocation(&self, handle: AllocHandle) -> Option<Suballocation> {
        self.suballocations
            .get(&handle.offset())
            .filter(|region| !region.is_free())
            .copied()
    }

    fn set_user_data(&mut self, handle: AllocHandle, user_data: u64) {
        if let Some(region) = self.suballocations.get_mut(&handle.offset()) {
            region.user_data = user_data;
        }
    }

    fn allocations(&self) -> Vec<Suballocation> {
        self.suballocations
            .values()
            .filter(|region| !region.is_free())
            .copied()
            .collect()
    }

    fn regions(&self) -> Vec<Suballocation> {
        self.suballocations.values().copied().collect()
    }

    fn validate(&self) -> Result<(), String> {
        let mut cursor = 0;
        let mut previous_free = false;
        let mut allocation_count = 0;
        let mut sum_free_size = 0;
        let mut free_count = 0;

        for (&offset, region) in self.suballocations.iter() {
            if offset != region.offset {
                return Err(format!("Region keyed at {offset} claims offset {}", region.offset));
            }
            if offset != cursor {
                return Err(format!("Gap or overlap at offset {offset}, expected {cursor}"));
            }
            if region.size == 0 {
                return Err(format!("Empty region at offset {offset}"));
            }

            match region.is_free() {
                true => {
                    if previous_free {
                        return Err(format!("Unmerged free regions at offset {offset}"));
                    }
                    if !self.free_by_size.contains(&(region.size, offset)) {
                        return Err(format!("Free region at {offset} missing from size index"));
                    }
                    sum_free_size += region.size;
                    free_count += 1;
                }
                false => allocation_count += 1,
            }

            previous_free = region.is_free();
            cursor = region.end();
        }

        if cursor != self.size {
            return Err(format!("Regions end at {cursor}, block size is {}", self.size));
        }
        if free_count != self.free_by_size.len() {
            return Err(String::from("Size index holds stale free regions"));
        }
        if allocation_count != self.allocation_count {
            return Err(format!(
                "Allocation count {} does not match {allocation_count} regions",
                self.allocation_count
            ));
        }
        if sum_free_size != self.sum_free_size {
            return Err(format!(
                "Free size {} does not match {sum_free_size} in regions",
                self.sum_free_size
            ));
        }

        Ok(())
    }
}
