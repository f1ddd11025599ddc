use anyhow::Result;
use serde::Deserialize;

use crate::allocator::{
    AllocationCreateFlags, AllocatorCreateInfo, DefragmentationFlags, MemoryUsage,
    PoolCreateFlags, PoolCreateInfo,
};
use crate::memory::{DeviceSize, WHOLE_SIZE};
use crate::virtual_block::{
    VirtualAllocationCreateFlags, VirtualAllocationCreateInfo, VirtualBlockCreateFlags,
    VirtualBlockCreateInfo,
};

pub mod file;
pub mod report;

pub trait ScenarioLoader {
    fn load(&self) -> Result<Scenario>;
}

/// A recorded sequence of allocator calls.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub allocator: AllocatorSettings,
    #[serde(default)]
    pub pools: Vec<PoolSettings>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreset {
    #[default]
    DiscreteGpu,
    IntegratedGpu,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorSettings {
    /// Simulated device of the host backend.
    pub device: DevicePreset,
    /// Size of every heap the backend exposes.
    pub heap_size: DeviceSize,
    pub preferred_large_heap_block_size: DeviceSize,
    pub heap_size_limits: Vec<Option<DeviceSize>>,
    pub debug_margin: DeviceSize,
    pub detect_corruption: bool,
    pub debug_initialize_allocations: bool,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            device: DevicePreset::DiscreteGpu,
            heap_size: 256 * 1024 * 1024,
            preferred_large_heap_block_size: 0,
            heap_size_limits: vec![],
            debug_margin: 0,
            detect_corruption: false,
            debug_initialize_allocations: false,
        }
    }
}

impl AllocatorSettings {
    pub fn create_info(&self) -> AllocatorCreateInfo {
        let mut create_info = AllocatorCreateInfo {
            heap_size_limits: self
                .heap_size_limits
                .iter()
                .map(|limit| limit.unwrap_or(WHOLE_SIZE))
                .collect(),
            debug_margin: self.debug_margin,
            detect_corruption: self.detect_corruption,
            debug_initialize_allocations: self.debug_initialize_allocations,
            ..Default::default()
        };
        if self.preferred_large_heap_block_size != 0 {
            create_info.preferred_large_heap_block_size = self.preferred_large_heap_block_size;
        }
        create_info
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    pub name: String,
    pub memory_type_index: u32,
    #[serde(default)]
    pub linear: bool,
    #[serde(default)]
    pub block_size: DeviceSize,
    #[serde(default)]
    pub min_block_count: usize,
    #[serde(default)]
    pub max_block_count: usize,
}

impl PoolSettings {
    pub fn create_info(&self) -> PoolCreateInfo {
        PoolCreateInfo {
            memory_type_index: self.memory_type_index,
            flags: match self.linear {
                true => PoolCreateFlags::LINEAR_ALGORITHM,
                false => PoolCreateFlags::empty(),
            },
            block_size: self.block_size,
            min_block_count: self.min_block_count,
            max_block_count: self.max_block_count,
            name: Some(self.name.clone()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Usage {
    Unknown,
    GpuOnly,
    CpuOnly,
    CpuToGpu,
    GpuToCpu,
    CpuCopy,
    GpuLazilyAllocated,
    #[default]
    Auto,
    AutoPreferDevice,
    AutoPreferHost,
}

impl From<Usage> for MemoryUsage {
    fn from(value: Usage) -> Self {
        match value {
            Usage::Unknown => MemoryUsage::Unknown,
            Usage::GpuOnly => MemoryUsage::GpuOnly,
            Usage::CpuOnly => MemoryUsage::CpuOnly,
            Usage::CpuToGpu => MemoryUsage::CpuToGpu,
            Usage::GpuToCpu => MemoryUsage::GpuToCpu,
            Usage::CpuCopy => MemoryUsage::CpuCopy,
            Usage::GpuLazilyAllocated => MemoryUsage::GpuLazilyAllocated,
            Usage::Auto => MemoryUsage::Auto,
            Usage::AutoPreferDevice => MemoryUsage::AutoPreferDevice,
            Usage::AutoPreferHost => MemoryUsage::AutoPreferHost,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    MinMemory,
    MinTime,
    MinOffset,
}

impl Strategy {
    fn allocation_flags(self) -> AllocationCreateFlags {
        match self {
            Strategy::MinMemory => AllocationCreateFlags::STRATEGY_MIN_MEMORY,
            Strategy::MinTime => AllocationCreateFlags::STRATEGY_MIN_TIME,
            Strategy::MinOffset => AllocationCreateFlags::STRATEGY_MIN_OFFSET,
        }
    }

    fn virtual_flags(self) -> VirtualAllocationCreateFlags {
        match self {
            Strategy::MinMemory => VirtualAllocationCreateFlags::STRATEGY_MIN_MEMORY,
            Strategy::MinTime => VirtualAllocationCreateFlags::STRATEGY_MIN_TIME,
            Strategy::MinOffset => VirtualAllocationCreateFlags::STRATEGY_MIN_OFFSET,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefragmentationAlgorithm {
    Fast,
    #[default]
    Balanced,
    Full,
    Extensive,
}

impl From<DefragmentationAlgorithm> for DefragmentationFlags {
    fn from(value: DefragmentationAlgorithm) -> Self {
        match value {
            DefragmentationAlgorithm::Fast => DefragmentationFlags::ALGORITHM_FAST,
            DefragmentationAlgorithm::Balanced => DefragmentationFlags::ALGORITHM_BALANCED,
            DefragmentationAlgorithm::Full => DefragmentationFlags::ALGORITHM_FULL,
            DefragmentationAlgorithm::Extensive => DefragmentationFlags::ALGORITHM_EXTENSIVE,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllocateStep {
    /// Name later steps use to refer to the allocation.
    pub name: String,
    pub size: DeviceSize,
    #[serde(default)]
    pub alignment: DeviceSize,
    #[serde(default)]
    pub usage: Usage,
    /// Name of a pool declared in the scenario.
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub dedicated: bool,
    #[serde(default)]
    pub mapped: bool,
    #[serde(default)]
    pub host_access: bool,
    #[serde(default)]
    pub upper_address: bool,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub user_data: u64,
}

impl AllocateStep {
    pub fn flags(&self) -> AllocationCreateFlags {
        let mut flags = self.strategy.allocation_flags();
        flags.set(AllocationCreateFlags::DEDICATED_MEMORY, self.dedicated);
        flags.set(AllocationCreateFlags::MAPPED, self.mapped);
        flags.set(
            AllocationCreateFlags::HOST_ACCESS_RANDOM,
            self.host_access || self.mapped,
        );
        flags.set(AllocationCreateFlags::UPPER_ADDRESS, self.upper_address);
        flags
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Allocate(AllocateStep),
    Free {
        name: String,
    },
    /// Fills the allocation with one byte value.
    MapWrite {
        name: String,
        pattern: u8,
        #[serde(default)]
        offset: DeviceSize,
        /// The rest of the allocation when missing.
        #[serde(default)]
        size: Option<DeviceSize>,
    },
    Defragment {
        #[serde(default)]
        algorithm: DefragmentationAlgorithm,
        #[serde(default)]
        pool: Option<String>,
        #[serde(default)]
        max_bytes_per_pass: DeviceSize,
        #[serde(default)]
        max_allocations_per_pass: u32,
    },
    SetFrameIndex {
        frame_index: u32,
    },
    CheckCorruption {
        #[serde(default = "all_memory_types")]
        memory_type_bits: u32,
    },
    Virtual {
        name: String,
        size: DeviceSize,
        #[serde(default)]
        linear: bool,
        steps: Vec<VirtualStep>,
    },
}

fn all_memory_types() -> u32 {
    u32::MAX
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::Allocate(_) => "allocate",
            Step::Free { .. } => "free",
            Step::MapWrite { .. } => "map_write",
            Step::Defragment { .. } => "defragment",
            Step::SetFrameIndex { .. } => "set_frame_index",
            Step::CheckCorruption { .. } => "check_corruption",
            Step::Virtual { .. } => "virtual",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VirtualStep {
    Allocate {
        name: String,
        size: DeviceSize,
        #[serde(default)]
        alignment: DeviceSize,
        #[serde(default)]
        upper_address: bool,
        #[serde(default)]
        strategy: Strategy,
    },
    Free {
        name: String,
    },
    Clear,
}

pub fn virtual_block_create_info(size: DeviceSize, linear: bool) -> VirtualBlockCreateInfo {
    VirtualBlockCreateInfo {
        size,
        flags: match linear {
            true => VirtualBlockCreateFlags::LINEAR_ALGORITHM,
            false => VirtualBlockCreateFlags::empty(),
        },
    }
}

pub fn virtual_allocation_create_info(
    size: DeviceSize,
    alignment: DeviceSize,
    upper_address: bool,
    strategy: Strategy,
) -> VirtualAllocationCreateInfo {
    let mut flags = strategy.virtual_flags();
    flags.set(VirtualAllocationCreateFlags::UPPER_ADDRESS, upper_address);

    VirtualAllocationCreateInfo {
        size,
        alignment,
        flags,
        user_data: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_tagged_by_op() {
        let scenario: Scenario = serde_json::from_str(
            r#"{
                "pools": [{ "name": "staging", "memory_type_index": 1, "linear": true }],
                "steps": [
                    { "op": "allocate", "name": "a", "size": 1024, "usage": "gpu_only" },
                    { "op": "map_write", "name": "a", "pattern": 255 },
                    { "op": "defragment", "algorithm": "full" },
                    { "op": "check_corruption" },
                    { "op": "virtual", "name": "v", "size": 4096, "steps": [
                        { "op": "allocate", "name": "x", "size": 16 },
                        { "op": "clear" }
                    ] },
                    { "op": "free", "name": "a" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(scenario.pools[0].create_info().flags, PoolCreateFlags::LINEAR_ALGORITHM);
        assert_eq!(scenario.allocator.heap_size, 256 * 1024 * 1024);

        let ops: Vec<_> = scenario.steps.iter().map(Step::op).collect();
        assert_eq!(
            ops,
            ["allocate", "map_write", "defragment", "check_corruption", "virtual", "free"]
        );

        match &scenario.steps[0] {
            Step::Allocate(allocate) => {
                assert_eq!(MemoryUsage::from(allocate.usage), MemoryUsage::GpuOnly);
                assert_eq!(allocate.flags(), AllocationCreateFlags::STRATEGY_MIN_MEMORY);
            }
            step => panic!("Unexpected step: {step:?}"),
        }

        match &scenario.steps[3] {
            Step::CheckCorruption { memory_type_bits } => assert_eq!(*memory_type_bits, u32::MAX),
            step => panic!("Unexpected step: {step:?}"),
        }
    }

    #[test]
    fn unknown_ops_are_rejected() {
        let result = serde_json::from_str::<Scenario>(r#"{ "steps": [{ "op": "explode" }] }"#);
        assert!(result.is_err());
    }

    #[test]
    fn mapped_allocations_request_host_access() {
        let step = AllocateStep {
            mapped: true,
            ..Default::default()
        };

        assert!(step.flags().contains(
            AllocationCreateFlags::MAPPED | AllocationCreateFlags::HOST_ACCESS_RANDOM
        ));
    }

    #[test]
    fn missing_heap_limits_mean_no_limit() {
        let settings: AllocatorSettings =
            serde_json::from_str(r#"{ "heap_size_limits": [null, 1048576] }"#).unwrap();

        assert_eq!(settings.create_info().heap_size_limits, vec![WHOLE_SIZE, 1048576]);
        assert_eq!(
            settings.create_info().preferred_large_heap_block_size,
            AllocatorCreateInfo::default().preferred_large_heap_block_size
        );
    }
}
