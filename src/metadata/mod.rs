use std::num::NonZeroU64;

use serde::Serialize;

use crate::memory::DeviceSize;
use crate::stats::{DetailedStatistics, Statistics};

pub mod generic;
pub mod linear;

pub use generic::GenericMetadata;
pub use linear::LinearMetadata;

/// What occupies a region of a block. The order matters for buffer/image granularity checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u32)]
pub enum SuballocationType {
    Free = 0,
    #[default]
    Unknown = 1,
    Buffer = 2,
    ImageUnknown = 3,
    ImageLinear = 4,
    ImageOptimal = 5,
}

impl SuballocationType {
    pub fn name(&self) -> &'static str {
        match self {
            SuballocationType::Free => "FREE",
            SuballocationType::Unknown => "UNKNOWN",
            SuballocationType::Buffer => "BUFFER",
            SuballocationType::ImageUnknown => "IMAGE_UNKNOWN",
            SuballocationType::ImageLinear => "IMAGE_LINEAR",
            SuballocationType::ImageOptimal => "IMAGE_OPTIMAL",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "FREE" => Some(SuballocationType::Free),
            "UNKNOWN" => Some(SuballocationType::Unknown),
            "BUFFER" => Some(SuballocationType::Buffer),
            "IMAGE_UNKNOWN" => Some(SuballocationType::ImageUnknown),
            "IMAGE_LINEAR" => Some(SuballocationType::ImageLinear),
            "IMAGE_OPTIMAL" => Some(SuballocationType::ImageOptimal),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// Smallest free region that fits.
    #[default]
    MinMemory,
    /// Largest free region first, so the search ends on the first try.
    MinTime,
    /// Lowest offset that fits.
    MinOffset,
}

/// Identifies one suballocation inside one metadata object. Never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocHandle(NonZeroU64);

impl AllocHandle {
    pub(crate) fn from_offset(offset: DeviceSize) -> Self {
        match NonZeroU64::new(offset.wrapping_add(1)) {
            Some(value) => Self(value),
            None => panic!("Suballocation offset out of range: {offset}"),
        }
    }

    pub fn offset(self) -> DeviceSize {
        self.0.get() - 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationRequestKind {
    /// Inside a free region of the general algorithm.
    Normal,
    /// Appended after the last allocation of the first vector.
    EndOf1st,
    /// Wrapped around to the beginning of the block in ring-buffer mode.
    EndOf2nd,
    /// Taken from the top of the block in double-stack mode.
    UpperAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRequest {
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub kind: AllocationRequestKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Suballocation {
    pub offset: DeviceSize,
    pub size: DeviceSize,
    #[serde(rename = "Type", serialize_with = "serialize_type_name")]
    pub kind: SuballocationType,
    #[serde(skip)]
    pub user_data: u64,
}

fn serialize_type_name<S: serde::Serializer>(
    kind: &SuballocationType,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.name())
}

impl Suballocation {
    pub fn free(offset: DeviceSize, size: DeviceSize) -> Self {
        Self {
            offset,
            size,
            kind: SuballocationType::Free,
            user_data: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.kind == SuballocationType::Free
    }

    pub fn end(&self) -> DeviceSize {
        self.offset + self.size
    }
}

/// Placement and bookkeeping of suballocations inside one block, without any memory behind it.
pub trait BlockMetadata: Send {
    fn size(&self) -> DeviceSize;
    fn allocation_count(&self) -> usize;
    fn free_region_count(&self) -> usize;
    fn sum_free_size(&self) -> DeviceSize;

    fn is_empty(&self) -> bool {
        self.allocation_count() == 0
    }

    fn is_linear(&self) -> bool {
        false
    }

    /// Finds a place for a new suballocation. `alignment` must already be a power of two.
    fn create_allocation_request(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        upper_address: bool,
        kind: SuballocationType,
        strategy: AllocationStrategy,
    ) -> Option<AllocationRequest>;

    fn alloc(
        &mut self,
        request: &AllocationRequest,
        kind: SuballocationType,
        user_data: u64,
    ) -> AllocHandle;

    fn free(&mut self, handle: AllocHandle);
    fn clear(&mut self);

    fn suballocation(&self, handle: AllocHandle) -> Option<Suballocation>;

    fn allocation_offset(&self, handle: AllocHandle) -> DeviceSize {
        handle.offset()
    }

    fn allocation_size(&self, handle: AllocHandle) -> DeviceSize {
        self.suballocation(handle)
            .map(|suballocation| suballocation.size)
            .unwrap_or(0)
    }

    fn user_data(&self, handle: AllocHandle) -> u64 {
        self.suballocation(handle)
            .map(|suballocation| suballocation.user_data)
            .unwrap_or(0)
    }

    fn set_user_data(&mut self, handle: AllocHandle, user_data: u64);

    /// Live suballocations in address order.
    fn allocations(&self) -> Vec<Suballocation>;

    /// Used and free regions covering the whole block, in address order.
    fn regions(&self) -> Vec<Suballocation>;

    fn add_statistics(&self, stats: &mut Statistics) {
        stats.block_count += 1;
        stats.block_bytes += self.size();
        stats.allocation_count += self.allocation_count() as u32;
        stats.allocation_bytes += self.size() - self.sum_free_size();
    }

    fn add_detailed_statistics(&self, stats: &mut DetailedStatistics) {
        stats.statistics.block_count += 1;
        stats.statistics.block_bytes += self.size();

        for region in self.regions() {
            match region.is_free() {
                true => stats.add_unused_range(region.size),
                false => stats.add_allocation(region.size),
            }
        }
    }

    /// Checks internal consistency and describes the first violation found.
    fn validate(&self) -> Result<(), String>;
}

/// Whether a resource of type `a` may not share a granularity page with a resource of type `b`.
pub fn is_buffer_image_granularity_conflict(a: SuballocationType, b: SuballocationType) -> bool {
    let (a, b) = if a > b { (b, a) } else { (a, b) };

    match a {
        SuballocationType::Free => false,
        SuballocationType::Unknown => true,
        SuballocationType::Buffer => {
            b == SuballocationType::ImageUnknown || b == SuballocationType::ImageOptimal
        }
        SuballocationType::ImageUnknown => {
            b == SuballocationType::ImageUnknown
                || b == SuballocationType::ImageLinear
                || b == SuballocationType::ImageOptimal
        }
        SuballocationType::ImageLinear => b == SuballocationType::ImageOptimal,
        SuballocationType::ImageOptimal => false,
    }
}

/// Whether the last byte of resource A and the first byte of resource B, which follows it,
/// fall on the same page of `page_size` bytes.
pub fn blocks_on_same_page(
    resource_a_offset: DeviceSize,
    resource_a_size: DeviceSize,
    resource_b_offset: DeviceSize,
    page_size: DeviceSize,
) -> bool {
    debug_assert!(resource_a_offset + resource_a_size <= resource_b_offset);
    debug_assert!(resource_a_size > 0 && page_size > 0);

    let resource_a_end = resource_a_offset + resource_a_size - 1;
    let resource_a_end_page = resource_a_end & !(page_size - 1);
    let resource_b_start_page = resource_b_offset & !(page_size - 1);

    resource_a_end_page == resource_b_start_page
}

/// Fills the gaps between live suballocations given in address order with free regions.
pub(crate) fn regions_with_gaps(
    block_size: DeviceSize,
    allocations: impl IntoIterator<Item = Suballocation>,
) -> Vec<Suballocation> {
    let mut regions = vec![];
    let mut cursor = 0;

    for allocation in allocations {
        if allocation.offset > cursor {
            regions.push(Suballocation::free(cursor, allocation.offset - cursor));
        }
        cursor = allocation.end();
        regions.push(allocation);
    }

    if cursor < block_size {
        regions.push(Suballocation::free(cursor, block_size - cursor));
    }

    regions
}
