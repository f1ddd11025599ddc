use std::collections::VecDeque;

use crate::memory::{align_down, checked_align_up, DeviceSize};
use crate::metadata::{
    blocks_on_same_page, is_buffer_image_granularity_conflict, regions_with_gaps, AllocHandle,
    AllocationRequest, AllocationRequestKind, AllocationStrategy, BlockMetadata, Suballocation,
    SuballocationType,
};

/// How the second vector of a linear block is being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecondVectorMode {
    Empty,
    /// Allocations wrapped around to the start of the block, below the first vector.
    RingBuffer,
    /// Allocations grow down from the end of the block.
    DoubleStack,
}

/// Stack, ring buffer and double stack allocation inside one block.
///
/// Freed allocations that are not at either end stay in their vector as free placeholders
/// until enough of them pile up to compact the vector.
pub struct LinearMetadata {
    size: DeviceSize,
    buffer_image_granularity: DeviceSize,
    debug_margin: DeviceSize,
    first: VecDeque<Suballocation>,
    second: Vec<Suballocation>,
    second_vector_mode: SecondVectorMode,
    first_null_count: usize,
    second_null_count: usize,
    sum_free_size: DeviceSize,
}

impl LinearMetadata {
    pub fn new(
        size: DeviceSize,
        buffer_image_granularity: DeviceSize,
        debug_margin: DeviceSize,
    ) -> Self {
        Self {
            size,
            buffer_image_granularity: buffer_image_granularity.max(1),
            debug_margin,
            first: VecDeque::new(),
            second: vec![],
            second_vector_mode: SecondVectorMode::Empty,
            first_null_count: 0,
            second_null_count: 0,
            sum_free_size: size,
        }
    }

    pub fn second_vector_mode(&self) -> SecondVectorMode {
        self.second_vector_mode
    }

    fn has_granularity(&self) -> bool {
        self.buffer_image_granularity > 1
    }

    fn create_upper_address_request(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationType,
    ) -> Option<AllocationRequest> {
        let granularity = self.buffer_image_granularity;

        if size > self.size {
            return None;
        }

        let base_offset = match self.second.last() {
            Some(last) if size > last.offset => return None,
            Some(last) => last.offset - size,
            None => self.size - size,
        };

        if base_offset < self.debug_margin {
            return None;
        }
        let mut offset = align_down(base_offset - self.debug_margin, alignment);

        if self.has_granularity() {
            let mut conflict = false;
            for next in self.second.iter().rev().filter(|next| !next.is_free()) {
                if !blocks_on_same_page(offset, size, next.offset, granularity) {
                    break;
                }
                if is_buffer_image_granularity_conflict(next.kind, kind) {
                    conflict = true;
                    break;
                }
            }
            if conflict {
                offset = align_down(offset, granularity);
            }
        }

        let end_of_first = self.first.back().map(Suballocation::end).unwrap_or(0);
        if end_of_first.checked_add(self.debug_margin)? > offset {
            return None;
        }

        if self.has_granularity() {
            for previous in self.first.iter().rev().filter(|previous| !previous.is_free()) {
                if !blocks_on_same_page(previous.offset, previous.size, offset, granularity) {
                    break;
                }
                if is_buffer_image_granularity_conflict(kind, previous.kind) {
                    return None;
                }
            }
        }

        Some(AllocationRequest {
            offset,
            size,
            kind: AllocationRequestKind::UpperAddress,
        })
    }

    fn create_lower_address_request(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationType,
    ) -> Option<AllocationRequest> {
        if self.second_vector_mode != SecondVectorMode::RingBuffer {
            if let Some(request) = self.request_at_end_of_first(size, alignment, kind) {
                return Some(request);
            }
        }

        if self.second_vector_mode != SecondVectorMode::DoubleStack {
            return self.request_at_end_of_second(size, alignment, kind);
        }

        None
    }

    fn request_at_end_of_first(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationType,
    ) -> Option<AllocationRequest> {
        let granularity = self.buffer_image_granularity;

        let base_offset = self.first.back().map(Suballocation::end).unwrap_or(0);
        let mut offset = checked_align_up(base_offset.checked_add(self.debug_margin)?, alignment)?;

        if self.has_granularity() {
            let mut conflict = false;
            for previous in self.first.iter().rev().filter(|previous| !previous.is_free()) {
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

        let free_space_end = match self.second_vector_mode {
            SecondVectorMode::DoubleStack => match self.second.last() {
                Some(last) => last.offset,
                None => self.size,
            },
            _ => self.size,
        };

        if offset.checked_add(size)?.checked_add(self.debug_margin)? > free_space_end {
            return None;
        }

        if self.has_granularity() && self.second_vector_mode == SecondVectorMode::DoubleStack {
            for next in self.second.iter().rev().filter(|next| !next.is_free()) {
                if !blocks_on_same_page(offset, size, next.offset, granularity) {
                    break;
                }
                if is_buffer_image_granularity_conflict(kind, next.kind) {
                    return None;
                }
            }
        }

        Some(AllocationRequest {
            offset,
            size,
            kind: AllocationRequestKind::EndOf1st,
        })
    }

    /// Wraps around to the beginning of the block, in front of the oldest live allocation.
    fn request_at_end_of_second(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationType,
    ) -> Option<AllocationRequest> {
        let granularity = self.buffer_image_granularity;
        let first_live = self.first.front()?;

        let base_offset = self.second.last().map(Suballocation::end).unwrap_or(0);
        let mut offset = checked_align_up(base_offset.checked_add(self.debug_margin)?, alignment)?;

        if self.has_granularity() {
            let mut conflict = false;
            for previous in self.second.iter().rev().filter(|previous| !previous.is_free()) {
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

        if offset.checked_add(size)?.checked_add(self.debug_margin)? > first_live.offset {
            return None;
        }

        if self.has_granularity() {
            for next in self.first.iter().filter(|next| !next.is_free()) {
                if !blocks_on_same_page(offset, size, next.offset, granularity) {
                    break;
                }
                if is_buffer_image_granularity_conflict(kind, next.kind) {
                    return None;
                }
            }
        }

        Some(AllocationRequest {
            offset,
            size,
            kind: AllocationRequestKind::EndOf2nd,
        })
    }

    fn find_first(&self, offset: DeviceSize) -> Option<usize> {
        self.first
            .binary_search_by_key(&offset, |suballocation| suballocation.offset)
            .ok()
    }

    fn find_second(&self, offset: DeviceSize) -> Option<usize> {
        match self.second_vector_mode {
            SecondVectorMode::Empty => None,
            SecondVectorMode::RingBuffer => self
                .second
                .binary_search_by_key(&offset, |suballocation| suballocation.offset)
                .ok(),
            SecondVectorMode::DoubleStack => self
                .second
                .binary_search_by(|probe| offset.cmp(&probe.offset))
                .ok(),
        }
    }

    fn find_mut(&mut self, offset: DeviceSize) -> Option<&mut Suballocation> {
        if let Some(index) = self.find_first(offset) {
            return Some(&mut self.first[index]);
        }
        match self.find_second(offset) {
            Some(index) => Some(&mut self.second[index]),
            None => None,
        }
    }

    fn should_compact_first(&self) -> bool {
        let live = self.first.len() - self.first_null_count;
        self.first.len() > 32 && self.first_null_count * 2 >= live * 3
    }

    fn cleanup_after_free(&mut self) {
        if self.allocation_count() == 0 {
            self.clear();
            return;
        }

        while self.first.front().map(Suballocation::is_free).unwrap_or(false) {
            self.first.pop_front();
            self.first_null_count -= 1;
        }
        while self.first.back().map(Suballocation::is_free).unwrap_or(false) {
            self.first.pop_back();
            self.first_null_count -= 1;
        }

        while self.second.last().map(Suballocation::is_free).unwrap_or(false) {
            self.second.pop();
            self.second_null_count -= 1;
        }
        let leading_nulls = self
            .second
            .iter()
            .take_while(|suballocation| suballocation.is_free())
            .count();
        self.second.drain(..leading_nulls);
        self.second_null_count -= leading_nulls;

        if self.should_compact_first() {
            self.first.retain(|suballocation| !suballocation.is_free());
            self.first_null_count = 0;
        }

        if self.second.is_empty() {
            self.second_vector_mode = SecondVectorMode::Empty;
        }

        if self.first.is_empty() && self.second_vector_mode == SecondVectorMode::RingBuffer {
            // The wrapped allocations now form the only vector.
            self.first = self.second.drain(..).collect();
            self.first_null_count = self.second_null_count;
            self.second_null_count = 0;
            self.second_vector_mode = SecondVectorMode::Empty;
        }
    }
}

impl BlockMetadata for LinearMetadata {
    fn size(&self) -> DeviceSize {
        self.size
    }

    fn allocation_count(&self) -> usize {
        self.first.len() - self.first_null_count + self.second.len() - self.second_null_count
    }

    fn free_region_count(&self) -> usize {
        self.regions()
            .iter()
            .filter(|region| region.is_free())
            .count()
    }

    fn sum_free_size(&self) -> DeviceSize {
        self.sum_free_size
    }

    fn is_linear(&self) -> bool {
        true
    }

    fn create_allocation_request(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        upper_address: bool,
        kind: SuballocationType,
        _strategy: AllocationStrategy,
    ) -> Option<AllocationRequest> {
        debug_assert!(size > 0);

        match upper_address {
            true => {
                if self.second_vector_mode == SecondVectorMode::RingBuffer {
                    log::warn!("Linear block is used as a ring buffer and cannot be a double stack");
                    return None;
                }
                self.create_upper_address_request(size, alignment, kind)
            }
            false => self.create_lower_address_request(size, alignment, kind),
        }
    }

    fn alloc(
        &mut self,
        request: &AllocationRequest,
        kind: SuballocationType,
        user_data: u64,
    ) -> AllocHandle {
        let suballocation = Suballocation {
            offset: request.offset,
            size: request.size,
            kind,
            user_data,
        };

        match request.kind {
            AllocationRequestKind::UpperAddress => {
                assert_ne!(self.second_vector_mode, SecondVectorMode::RingBuffer);
                self.second.push(suballocation);
                self.second_vector_mode = SecondVectorMode::DoubleStack;
            }
            AllocationRequestKind::EndOf1st => {
                debug_assert!(self
                    .first
                    .back()
                    .map(|last| last.end() <= request.offset)
                    .unwrap_or(true));
                self.first.push_back(suballocation);
            }
            AllocationRequestKind::EndOf2nd => {
                assert!(!self.first.is_empty());
                match self.second_vector_mode {
                    SecondVectorMode::Empty => {
                        self.second_vector_mode = SecondVectorMode::RingBuffer
                    }
                    SecondVectorMode::RingBuffer => {}
                    SecondVectorMode::DoubleStack => {
                        panic!("Ring buffer allocation in a block used as a double stack")
                    }
                }
                self.second.push(suballocation);
            }
            AllocationRequestKind::Normal => {
                panic!("Linear blocks only accept linear allocation requests")
            }
        }

        self.sum_free_size -= request.size;

        log::trace!(
            "Linear suballocation of {} bytes at offset {} ({:?})",
            request.size,
            request.offset,
            request.kind
        );

        AllocHandle::from_offset(request.offset)
    }

    fn free(&mut self, handle: AllocHandle) {
        let offset = handle.offset();

        let suballocation = match self.find_first(offset) {
            Some(index) if !self.first[index].is_free() => {
                self.first_null_count += 1;
                &mut self.first[index]
            }
            _ => match self.find_second(offset) {
                Some(index) if !self.second[index].is_free() => {
                    self.second_null_count += 1;
                    &mut self.second[index]
                }
                _ => panic!("Freeing a suballocation that does not exist at offset {offset}"),
            },
        };

        let size = suballocation.size;
        suballocation.kind = SuballocationType::Free;
        suballocation.user_data = 0;

        self.sum_free_size += size;
        self.cleanup_after_free();
    }

    fn clear(&mut self) {
        self.first.clear();
        self.second.clear();
        self.second_vector_mode = SecondVectorMode::Empty;
        self.first_null_count = 0;
        self.second_null_count = 0;
        self.sum_free_size = self.size;
    }

    fn suballocation(&self, handle: AllocHandle) -> Option<Suballocation> {
        let offset = handle.offset();

        let found = match self.find_first(offset) {
            Some(index) => Some(self.first[index]),
            None => self.find_second(offset).map(|index| self.second[index]),
        };

        found.filter(|suballocation| !suballocation.is_free())
    }

    fn set_user_data(&mut self, handle: AllocHandle, user_data: u64) {
        if let Some(suballocation) = self.find_mut(handle.offset()) {
            suballocation.user_data = user_data;
        }
    }

    fn allocations(&self) -> Vec<Suballocation> {
        let first = self.first.iter().filter(|suballocation| !suballocation.is_free());
        let second = self.second.iter().filter(|suballocation| !suballocation.is_free());

        match self.second_vector_mode {
            SecondVectorMode::Empty => first.copied().collect(),
            SecondVectorMode::RingBuffer => second.chain(first).copied().collect(),
            SecondVectorMode::DoubleStack => {
                let mut upper: Vec<Suballocation> = second.copied().collect();
                upper.reverse();
                first.copied().chain(upper).collect()
            }
        }
    }

    fn regions(&self) -> Vec<Suballocation> {
        regions_with_gaps(self.size, self.allocations())
    }

    fn validate(&self) -> Result<(), String> {
        if self.second.is_empty() != (self.second_vector_mode == SecondVectorMode::Empty) {
            return Err(format!(
                "Second vector mode {:?} with {} entries",
                self.second_vector_mode,
                self.second.len()
            ));
        }

        if self.first.front().map(Suballocation::is_free).unwrap_or(false)
            || self.first.back().map(Suballocation::is_free).unwrap_or(false)
        {
            return Err(String::from("First vector starts or ends with a freed entry"));
        }

        let first_nulls = self.first.iter().filter(|s| s.is_free()).count();
        let second_nulls = self.second.iter().filter(|s| s.is_free()).count();
        if first_nulls != self.first_null_count || second_nulls != self.second_null_count {
            return Err(String::from("Freed entry counters are out of sync"));
        }

        let allocations = self.allocations();
        let mut cursor = 0;
        let mut used = 0;
        for allocation in allocations.iter() {
            if allocation.offset < cursor {
                return Err(format!("Allocation at {} overlaps its neighbour", allocation.offset));
            }
            if allocation.size == 0 {
                return Err(format!("Empty allocation at {}", allocation.offset));
            }
            cursor = allocation.end();
            used += allocation.size;
        }

        if cursor > self.size {
            return Err(format!("Allocations end at {cursor}, block size is {}", self.size));
        }
        if self.sum_free_size != self.size - used {
            return Err(format!(
                "Free size {} does not match {} used bytes",
                self.sum_free_size, used
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocate(
        metadata: &mut LinearMetadata,
        size: DeviceSize,
        upper_address: bool,
    ) -> Option<AllocHandle> {
        let request = metadata.create_allocation_request(
            size,
            1,
            upper_address,
            SuballocationType::Buffer,
            AllocationStrategy::MinMemory,
        )?;
        Some(metadata.alloc(&request, SuballocationType::Buffer, 0))
    }

    #[test]
    fn freed_middle_space_is_not_reused() {
        let mut metadata = LinearMetadata::new(1000, 1, 0);

        let a = allocate(&mut metadata, 100, false).unwrap();
        let b = allocate(&mut metadata, 100, false).unwrap();
        let c = allocate(&mut metadata, 100, false).unwrap();
        assert_eq!([a.offset(), b.offset(), c.offset()], [0, 100, 200]);

        metadata.free(b);
        assert_eq!(allocate(&mut metadata, 50, false).unwrap().offset(), 300);
        assert_eq!(metadata.allocation_count(), 3);
        metadata.validate().unwrap();
    }

    #[test]
    fn freeing_the_top_of_the_stack_reclaims_it() {
        let mut metadata = LinearMetadata::new(1000, 1, 0);

        allocate(&mut metadata, 100, false).unwrap();
        let b = allocate(&mut metadata, 100, false).unwrap();
        metadata.free(b);

        assert_eq!(allocate(&mut metadata, 100, false).unwrap().offset(), 100);
        metadata.validate().unwrap();
    }

    #[test]
    fn ring_buffer_wraps_and_swaps_vectors() {
        let mut metadata = LinearMetadata::new(1000, 1, 0);

        let handles: Vec<AllocHandle> = (0..4)
            .map(|_| allocate(&mut metadata, 250, false).unwrap())
            .collect();
        assert!(allocate(&mut metadata, 1, false).is_none());

        metadata.free(handles[0]);
        metadata.free(handles[1]);

        let wrapped = allocate(&mut metadata, 200, false).unwrap();
        assert_eq!(wrapped.offset(), 0);
        assert_eq!(metadata.second_vector_mode(), SecondVectorMode::RingBuffer);

        let wrapped_again = allocate(&mut metadata, 50, false).unwrap();
        assert_eq!(wrapped_again.offset(), 200);
        assert!(allocate(&mut metadata, 300, false).is_none());
        metadata.validate().unwrap();

        metadata.free(handles[2]);
        metadata.free(handles[3]);
        assert_eq!(metadata.second_vector_mode(), SecondVectorMode::Empty);
        assert_eq!(metadata.allocation_count(), 2);

        assert_eq!(allocate(&mut metadata, 100, false).unwrap().offset(), 250);
        metadata.validate().unwrap();
    }

    #[test]
    fn double_stack_grows_from_both_ends() {
        let mut metadata = LinearMetadata::new(1000, 1, 0);

        allocate(&mut metadata, 100, false).unwrap();
        let upper = allocate(&mut metadata, 100, true).unwrap();
        let upper_second = allocate(&mut metadata, 200, true).unwrap();
        assert_eq!(upper.offset(), 900);
        assert_eq!(upper_second.offset(), 700);
        assert_eq!(metadata.second_vector_mode(), SecondVectorMode::DoubleStack);

        assert_eq!(allocate(&mut metadata, 500, false).unwrap().offset(), 100);
        assert!(allocate(&mut metadata, 200, false).is_none());

        let upper_third = allocate(&mut metadata, 100, true).unwrap();
        assert_eq!(upper_third.offset(), 600);
        assert!(allocate(&mut metadata, 1, true).is_none());
        metadata.validate().unwrap();

        metadata.free(upper_third);
        assert_eq!(allocate(&mut metadata, 50, true).unwrap().offset(), 650);

        let regions = metadata.regions();
        assert_eq!(regions.iter().map(|r| r.size).sum::<u64>(), 1000);
        metadata.validate().unwrap();
    }

    #[test]
    fn ring_buffer_refuses_upper_address() {
        let mut metadata = LinearMetadata::new(1000, 1, 0);

        let first = allocate(&mut metadata, 600, false).unwrap();
        allocate(&mut metadata, 300, false).unwrap();
        metadata.free(first);
        allocate(&mut metadata, 500, false).unwrap();
        assert_eq!(metadata.second_vector_mode(), SecondVectorMode::RingBuffer);

        assert!(allocate(&mut metadata, 10, true).is_none());
    }

    #[test]
    fn debug_margin_separates_neighbours() {
        let mut metadata = LinearMetadata::new(1000, 1, 16);

        let a = allocate(&mut metadata, 100, false).unwrap();
        let b = allocate(&mut metadata, 100, false).unwrap();
        let upper = allocate(&mut metadata, 100, true).unwrap();

        assert_eq!(a.offset(), 16);
        assert_eq!(b.offset(), 132);
        assert_eq!(upper.offset(), 1000 - 100 - 16);
    }

    #[test]
    fn granularity_applies_to_linear_neighbours() {
        let mut metadata = LinearMetadata::new(4096, 1024, 0);

        allocate(&mut metadata, 100, false).unwrap();
        let request = metadata
            .create_allocation_request(
                100,
                1,
                false,
                SuballocationType::ImageOptimal,
                AllocationStrategy::MinMemory,
            )
            .unwrap();
        assert_eq!(request.offset, 1024);
    }

    #[test]
    fn emptying_resets_everything() {
        let mut metadata = LinearMetadata::new(1000, 1, 0);

        let a = allocate(&mut metadata, 100, false).unwrap();
        let b = allocate(&mut metadata, 100, true).unwrap();
        metadata.set_user_data(b, 7);
        assert_eq!(metadata.user_data(b), 7);

        metadata.free(a);
        metadata.free(b);
        assert!(metadata.is_empty());
        assert_eq!(metadata.second_vector_mode(), SecondVectorMode::Empty);
        assert_eq!(metadata.sum_free_size(), 1000);
        assert_eq!(metadata.free_region_count(), 1);
    }

    mod invariants {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn linear_blocks_stay_consistent(
                ops in proptest::collection::vec((1u64..400, any::<bool>(), any::<bool>(), any::<usize>()), 1..96)
            ) {
                let mut metadata = LinearMetadata::new(4096, 1, 4);
                let mut live: Vec<AllocHandle> = vec![];

                for (size, upper_address, free, index) in ops {
                    if free && !live.is_empty() {
                        let handle = live.remove(index % live.len());
                        metadata.free(handle);
                    } else if let Some(handle) = allocate(&mut metadata, size, upper_address) {
                        live.push(handle);
                    }

                    prop_assert!(metadata.validate().is_ok(), "{:?}", metadata.validate());
                    prop_assert_eq!(metadata.allocation_count(), live.len());
                }
            }
        }
    }
}
