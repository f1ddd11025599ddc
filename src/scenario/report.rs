use anyhow::Result;
use serde::Serialize;

use crate::allocator::DefragmentationStats;
use crate::memory::DeviceSize;
use crate::stats::{Budget, DetailedStatistics, Statistics};

const REPORT_TEMPLATE_NAME: &str = "report.txt";
const REPORT_TEMPLATE: &str = include_str!("../../templates/report.txt");

/// What a scenario replay did, in a shape the text template can walk.
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub backend: String,
    pub steps: Vec<StepRecord>,
    pub defragmentations: Vec<DefragmentationRecord>,
    pub virtual_blocks: Vec<VirtualBlockRecord>,
    pub heaps: Vec<HeapRecord>,
    pub total: TotalRecord,
}

#[derive(Debug, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub op: &'static str,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct DefragmentationRecord {
    pub algorithm: String,
    pub passes: u32,
    pub allocations_moved: u32,
    pub bytes_moved: DeviceSize,
    pub blocks_freed: u32,
    pub bytes_freed: DeviceSize,
}

impl DefragmentationRecord {
    pub fn new(algorithm: String, passes: u32, stats: DefragmentationStats) -> Self {
        Self {
            algorithm,
            passes,
            allocations_moved: stats.allocations_moved,
            bytes_moved: stats.bytes_moved,
            blocks_freed: stats.device_memory_blocks_freed,
            bytes_freed: stats.bytes_freed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VirtualBlockRecord {
    pub name: String,
    pub size: DeviceSize,
    pub allocation_count: u32,
    pub allocation_bytes: DeviceSize,
    pub unused_range_count: u32,
}

impl VirtualBlockRecord {
    pub fn new(name: String, size: DeviceSize, stats: &DetailedStatistics) -> Self {
        Self {
            name,
            size,
            allocation_count: stats.statistics.allocation_count,
            allocation_bytes: stats.statistics.allocation_bytes,
            unused_range_count: stats.unused_range_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HeapRecord {
    pub index: usize,
    pub block_count: u32,
    pub block_bytes: DeviceSize,
    pub allocation_count: u32,
    pub allocation_bytes: DeviceSize,
    pub usage: DeviceSize,
    pub budget: DeviceSize,
}

impl HeapRecord {
    pub fn new(index: usize, budget: &Budget) -> Self {
        Self {
            index,
            block_count: budget.statistics.block_count,
            block_bytes: budget.statistics.block_bytes,
            allocation_count: budget.statistics.allocation_count,
            allocation_bytes: budget.statistics.allocation_bytes,
            usage: budget.usage,
            budget: budget.budget,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct TotalRecord {
    pub block_count: u32,
    pub block_bytes: DeviceSize,
    pub allocation_count: u32,
    pub allocation_bytes: DeviceSize,
}

impl From<&Statistics> for TotalRecord {
    fn from(value: &Statistics) -> Self {
        Self {
            block_count: value.block_count,
            block_bytes: value.block_bytes,
            allocation_count: value.allocation_count,
            allocation_bytes: value.allocation_bytes,
        }
    }
}

impl Report {
    pub fn record(&mut self, op: &'static str, detail: impl Into<String>) {
        let detail = detail.into();
        log::info!("{op}: {detail}");
        self.steps.push(StepRecord {
            index: self.steps.len() + 1,
            op,
            detail,
        });
    }

    pub fn render_text(&self) -> Result<String> {
        let mut tera = tera::Tera::default();
        tera.add_raw_template(REPORT_TEMPLATE_NAME, REPORT_TEMPLATE)?;

        let context = tera::Context::from_serialize(self)?;
        match tera.render(REPORT_TEMPLATE_NAME, &context) {
            Ok(text) => Ok(text),
            Err(error) => Err(error.into()),
        }
    }
}
