use serde_json::json;

use crate::allocator::json::metadata_json;
use crate::error::{Error, Result};
use crate::memory::{normalize_alignment, DeviceSize};
use crate::metadata::{
    AllocHandle, AllocationStrategy, BlockMetadata, GenericMetadata, LinearMetadata,
    Suballocation, SuballocationType,
};
use crate::stats::{DetailedStatistics, Statistics};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct VirtualBlockCreateFlags: u32 {
        const LINEAR_ALGORITHM = 0x0000_0001;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct VirtualAllocationCreateFlags: u32 {
        const UPPER_ADDRESS = 0x0000_0040;
        const STRATEGY_MIN_MEMORY = 0x0001_0000;
        const STRATEGY_MIN_TIME = 0x0002_0000;
        const STRATEGY_MIN_OFFSET = 0x0004_0000;
    }
}

impl VirtualAllocationCreateFlags {
    fn strategy(self) -> AllocationStrategy {
        if self.contains(Self::STRATEGY_MIN_TIME) {
            AllocationStrategy::MinTime
        } else if self.contains(Self::STRATEGY_MIN_OFFSET) {
            AllocationStrategy::MinOffset
        } else {
            AllocationStrategy::MinMemory
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtualBlockCreateInfo {
    pub size: DeviceSize,
    pub flags: VirtualBlockCreateFlags,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtualAllocationCreateInfo {
    pub size: DeviceSize,
    /// Zero means no alignment requirement.
    pub alignment: DeviceSize,
    pub flags: VirtualAllocationCreateFlags,
    pub user_data: u64,
}

/// A range handed out by a [`VirtualBlock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualAllocation(AllocHandle);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualAllocationInfo {
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub user_data: u64,
}

/// Suballocation bookkeeping over an abstract address range with no memory behind it.
pub struct VirtualBlock {
    metadata: Box<dyn BlockMetadata>,
}

impl VirtualBlock {
    pub fn new(create_info: VirtualBlockCreateInfo) -> Result<Self> {
        if create_info.size == 0 {
            return Err(Error::invalid_argument("Virtual block size must not be zero"));
        }

        let metadata: Box<dyn BlockMetadata> =
            match create_info.flags.contains(VirtualBlockCreateFlags::LINEAR_ALGORITHM) {
                true => Box::new(LinearMetadata::new(create_info.size, 1, 0)),
                false => Box::new(GenericMetadata::new(create_info.size, 1, 0)),
            };

        Ok(Self { metadata })
    }

    pub fn size(&self) -> DeviceSize {
        self.metadata.size()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Returns the new allocation and its offset inside the block.
    pub fn allocate(
        &mut self,
        create_info: &VirtualAllocationCreateInfo,
    ) -> Result<(VirtualAllocation, DeviceSize)> {
        if create_info.size == 0 {
            return Err(Error::invalid_argument("Virtual allocation size must not be zero"));
        }

        let alignment = normalize_alignment(create_info.alignment)?;
        let upper_address = create_info
            .flags
            .contains(VirtualAllocationCreateFlags::UPPER_ADDRESS);
        if upper_address && !self.metadata.is_linear() {
            return Err(Error::invalid_argument(
                "Upper address allocations need a block with the linear algorithm",
            ));
        }

        if create_info.size > self.metadata.sum_free_size() {
            return Err(Error::OutOfDeviceMemory);
        }

        let request = match self.metadata.create_allocation_request(
            create_info.size,
            alignment,
            upper_address,
            SuballocationType::Unknown,
            create_info.flags.strategy(),
        ) {
            Some(request) => request,
            None => return Err(Error::OutOfDeviceMemory),
        };

        let handle = self
            .metadata
            .alloc(&request, SuballocationType::Unknown, create_info.user_data);
        log::trace!(
            "Virtual allocation of {} bytes at offset {}",
            create_info.size,
            request.offset
        );

        Ok((VirtualAllocation(handle), self.metadata.allocation_offset(handle)))
    }

    pub fn free(&mut self, allocation: VirtualAllocation) -> Result<()> {
        self.check(allocation)?;
        self.metadata.free(allocation.0);
        Ok(())
    }

    /// Frees every allocation at once.
    pub fn clear(&mut self) {
        self.metadata.clear();
    }

    pub fn allocation_info(&self, allocation: VirtualAllocation) -> Result<VirtualAllocationInfo> {
        let suballocation = self.check(allocation)?;
        Ok(VirtualAllocationInfo {
            offset: self.metadata.allocation_offset(allocation.0),
            size: suballocation.size,
            user_data: suballocation.user_data,
        })
    }

    pub fn set_allocation_user_data(
        &mut self,
        allocation: VirtualAllocation,
        user_data: u64,
    ) -> Result<()> {
        self.check(allocation)?;
        self.metadata.set_user_data(allocation.0, user_data);
        Ok(())
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        self.metadata.add_statistics(&mut stats);
        stats
    }

    pub fn calculate_statistics(&self) -> DetailedStatistics {
        let mut stats = DetailedStatistics::default();
        self.metadata.add_detailed_statistics(&mut stats);
        stats
    }

    pub fn build_stats_string(&self, detailed_map: bool) -> String {
        let mut document = json!({ "Stats": self.calculate_statistics() });
        if detailed_map {
            document["Details"] = metadata_json(self.metadata.as_ref(), |suballocation| {
                let mut entry = json!(suballocation);
                entry["UserData"] = json!(suballocation.user_data);
                entry
            });
        }

        format!("{document:#}")
    }

    fn check(&self, allocation: VirtualAllocation) -> Result<Suballocation> {
        match self.metadata.suballocation(allocation.0) {
            Some(suballocation) if !suballocation.is_free() => Ok(suballocation),
            _ => Err(Error::invalid_handle(format!(
                "Unknown virtual allocation at offset {}",
                allocation.0.offset()
            ))),
        }
    }
}

impl Drop for VirtualBlock {
    fn drop(&mut self) {
        if !self.metadata.is_empty() {
            log::warn!(
                "Virtual block destroyed with {} live allocations",
                self.metadata.allocation_count()
            );
        }
    }
}
