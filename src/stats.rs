use serde::Serialize;

use crate::memory::{DeviceSize, WHOLE_SIZE};

/// Cheap counters kept up to date on every allocation and free.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statistics {
    pub block_count: u32,
    pub allocation_count: u32,
    pub block_bytes: DeviceSize,
    pub allocation_bytes: DeviceSize,
}

impl Statistics {
    pub fn add(&mut self, other: &Statistics) {
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.block_bytes += other.block_bytes;
        self.allocation_bytes += other.allocation_bytes;
    }
}

/// Statistics computed by walking every block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetailedStatistics {
    #[serde(flatten)]
    pub statistics: Statistics,
    pub unused_range_count: u32,
    pub allocation_size_min: DeviceSize,
    pub allocation_size_max: DeviceSize,
    pub unused_range_size_min: DeviceSize,
    pub unused_range_size_max: DeviceSize,
}

impl Default for DetailedStatistics {
    fn default() -> Self {
        Self {
            statistics: Statistics::default(),
            unused_range_count: 0,
            allocation_size_min: WHOLE_SIZE,
            allocation_size_max: 0,
            unused_range_size_min: WHOLE_SIZE,
            unused_range_size_max: 0,
        }
    }
}

impl DetailedStatistics {
    pub fn add_allocation(&mut self, size: DeviceSize) {
        self.statistics.allocation_count += 1;
        self.statistics.allocation_bytes += size;
        self.allocation_size_min = self.allocation_size_min.min(size);
        self.allocation_size_max = self.allocation_size_max.max(size);
    }

    pub fn add_unused_range(&mut self, size: DeviceSize) {
        self.unused_range_count += 1;
        self.unused_range_size_min = self.unused_range_size_min.min(size);
        self.unused_range_size_max = self.unused_range_size_max.max(size);
    }

    pub fn add(&mut self, other: &DetailedStatistics) {
        self.statistics.add(&other.statistics);
        self.unused_range_count += other.unused_range_count;
        self.allocation_size_min = self.allocation_size_min.min(other.allocation_size_min);
        self.allocation_size_max = self.allocation_size_max.max(other.allocation_size_max);
        self.unused_range_size_min = self.unused_range_size_min.min(other.unused_range_size_min);
        self.unused_range_size_max = self.unused_range_size_max.max(other.unused_range_size_max);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TotalStatistics {
    pub memory_type: Vec<DetailedStatistics>,
    pub memory_heap: Vec<DetailedStatistics>,
    pub total: DetailedStatistics,
}

/// Usage and budget of one heap together with the allocator's own share of it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Budget {
    pub statistics: Statistics,
    pub usage: DeviceSize,
    pub budget: DeviceSize,
}
