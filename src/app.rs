use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::allocator::{
    Allocation, AllocationCreateInfo, Allocator, DefragmentationInfo, PassStatus, Pool,
};
use crate::args::{Args, BackendKind, OutputFormat};
use crate::error::Error;
use crate::memory::device::DeviceMemoryBackend;
use crate::memory::host::HostMemoryDevice;
use crate::memory::wgpu_device::WgpuMemoryDevice;
use crate::memory::{align_up, DeviceSize, MemoryPropertyFlags, MemoryRequirements};
use crate::scenario::file::FileSystemScenarioLoader;
use crate::scenario::report::{
    DefragmentationRecord, HeapRecord, Report, TotalRecord, VirtualBlockRecord,
};
use crate::scenario::{
    virtual_allocation_create_info, virtual_block_create_info, AllocateStep, AllocatorSettings,
    DevicePreset, PoolSettings, ScenarioLoader, Step, VirtualStep,
};
use crate::virtual_block::{VirtualAllocation, VirtualBlock};

pub struct App {
    args: Args,
}

impl App {
    pub fn new(args: Args) -> Self {
        App { args }
    }

    /// Replays the scenario and renders the requested output.
    pub fn run(&self) -> Result<String> {
        let scenario = FileSystemScenarioLoader::new(&self.args.scenario).load()?;

        let backend = Backend::create(self.args.backend, &scenario.allocator)?;
        let allocator = Allocator::new(backend.device(), scenario.allocator.create_info())
            .context("Failed to create the allocator")?;

        let mut runner = ScenarioRunner::new(&allocator, backend);
        runner.create_pools(&scenario.pools)?;

        for (index, step) in scenario.steps.iter().enumerate() {
            runner
                .execute(step)
                .with_context(|| format!("Step {} ({}) failed", index + 1, step.op()))?;
        }

        match self.args.format {
            OutputFormat::Json => Ok(allocator.build_stats_string(self.args.detailed_map)),
            OutputFormat::Text => runner.finish().render_text(),
        }
    }
}

enum Backend {
    Host(Arc<HostMemoryDevice>),
    Wgpu(Arc<WgpuMemoryDevice>),
}

impl Backend {
    fn create(kind: BackendKind, settings: &AllocatorSettings) -> Result<Self> {
        match kind {
            BackendKind::Host => {
                let device = match settings.device {
                    DevicePreset::DiscreteGpu => HostMemoryDevice::discrete_gpu_with_heap_sizes(
                        settings.heap_size,
                        settings.heap_size,
                    ),
                    DevicePreset::IntegratedGpu => {
                        HostMemoryDevice::integrated_gpu_with_heap_size(settings.heap_size)
                    }
                };
                Ok(Backend::Host(Arc::new(device)))
            }
            BackendKind::Wgpu => {
                let device = pollster::block_on(WgpuMemoryDevice::request(settings.heap_size))
                    .context("Failed to open a wgpu device")?;
                Ok(Backend::Wgpu(Arc::new(device)))
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Backend::Host(_) => "host",
            Backend::Wgpu(_) => "wgpu",
        }
    }

    fn device(&self) -> Arc<dyn DeviceMemoryBackend> {
        match self {
            Backend::Host(device) => device.clone() as Arc<dyn DeviceMemoryBackend>,
            Backend::Wgpu(device) => device.clone() as Arc<dyn DeviceMemoryBackend>,
        }
    }

    /// Buffer copies and writes in wgpu work on multiples of four bytes.
    fn requirements(&self, size: DeviceSize, alignment: DeviceSize) -> MemoryRequirements {
        match self {
            Backend::Host(_) => MemoryRequirements::new(size, alignment),
            Backend::Wgpu(_) => MemoryRequirements::new(
                align_up(size, wgpu::COPY_BUFFER_ALIGNMENT),
                alignment.max(wgpu::COPY_BUFFER_ALIGNMENT),
            ),
        }
    }

    fn fill(
        &self,
        allocator: &Allocator,
        allocation: Allocation,
        offset: DeviceSize,
        size: DeviceSize,
        pattern: u8,
    ) -> Result<()> {
        let data = vec![pattern; size as usize];

        match self {
            Backend::Host(_) => allocator.write_mapped(allocation, offset, &data)?,
            Backend::Wgpu(device) => {
                let (memory, base) = allocator.memory_binding(allocation)?;
                device.write(memory, base + offset, &data)?;
            }
        }

        Ok(())
    }

    /// Moves the contents of `src` to the place reserved by `dst`.
    fn copy(&self, allocator: &Allocator, src: Allocation, dst: Allocation) -> Result<()> {
        let size = allocator.allocation_info(src)?.size;
        let (src_memory, src_offset) = allocator.memory_binding(src)?;
        let (dst_memory, dst_offset) = allocator.memory_binding(dst)?;

        match self {
            Backend::Host(device) => {
                // Memory the host cannot see carries no contents in the simulation.
                if !allocator
                    .allocation_memory_properties(src)?
                    .contains(MemoryPropertyFlags::HOST_VISIBLE)
                {
                    return Ok(());
                }
                device.copy(src_memory, src_offset, dst_memory, dst_offset, size)?;
            }
            Backend::Wgpu(device) => {
                device.copy(src_memory, src_offset, dst_memory, dst_offset, size)?;
            }
        }

        Ok(())
    }
}

struct ScenarioRunner<'a> {
    allocator: &'a Allocator,
    backend: Backend,
    pools: HashMap<String, Pool>,
    allocations: HashMap<String, Allocation>,
    report: Report,
}

impl<'a> ScenarioRunner<'a> {
    fn new(allocator: &'a Allocator, backend: Backend) -> Self {
        let report = Report {
            backend: backend.name().to_string(),
            ..Default::default()
        };

        Self {
            allocator,
            backend,
            pools: HashMap::new(),
            allocations: HashMap::new(),
            report,
        }
    }

    fn create_pools(&mut self, pools: &[PoolSettings]) -> Result<()> {
        for settings in pools {
            if self.pools.contains_key(&settings.name) {
                return Err(anyhow!("Pool declared twice: {}", settings.name));
            }

            let pool = self
                .allocator
                .create_pool(&settings.create_info())
                .with_context(|| format!("Failed to create pool {}", settings.name))?;
            self.pools.insert(settings.name.clone(), pool);
        }

        Ok(())
    }

    fn pool(&self, name: &str) -> Result<Pool> {
        match self.pools.get(name) {
            Some(pool) => Ok(*pool),
            None => Err(anyhow!("Unknown pool: {name}")),
        }
    }

    fn allocation(&self, name: &str) -> Result<Allocation> {
        match self.allocations.get(name) {
            Some(allocation) => Ok(*allocation),
            None => Err(anyhow!("Unknown allocation: {name}")),
        }
    }

    fn execute(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Allocate(allocate) => self.allocate(allocate),
            Step::Free { name } => {
                let allocation = self.allocation(name)?;
                self.allocator.free_memory(allocation)?;
                self.allocations.remove(name);
                self.report.record(step.op(), name.clone());
                Ok(())
            }
            Step::MapWrite {
                name,
                pattern,
                offset,
                size,
            } => {
                let allocation = self.allocation(name)?;
                let allocation_size = self.allocator.allocation_info(allocation)?.size;
                let size = match size {
                    Some(size) => *size,
                    None => allocation_size.saturating_sub(*offset),
                };

                self.backend
                    .fill(self.allocator, allocation, *offset, size, *pattern)?;
                self.report.record(
                    step.op(),
                    format!("{name}: {size} bytes of {pattern:#04x} at offset {offset}"),
                );
                Ok(())
            }
            Step::Defragment {
                algorithm,
                pool,
                max_bytes_per_pass,
                max_allocations_per_pass,
            } => {
                let pool = match pool {
                    Some(name) => Some(self.pool(name)?),
                    None => None,
                };

                let info = DefragmentationInfo {
                    flags: (*algorithm).into(),
                    pool,
                    max_bytes_per_pass: *max_bytes_per_pass,
                    max_allocations_per_pass: *max_allocations_per_pass,
                };
                let record = self.defragment(&info, format!("{algorithm:?}").to_lowercase())?;

                self.report.record(
                    step.op(),
                    format!(
                        "{} allocations moved in {} passes",
                        record.allocations_moved, record.passes
                    ),
                );
                self.report.defragmentations.push(record);
                Ok(())
            }
            Step::SetFrameIndex { frame_index } => {
                self.allocator.set_current_frame_index(*frame_index);
                self.report.record(step.op(), frame_index.to_string());
                Ok(())
            }
            Step::CheckCorruption { memory_type_bits } => {
                let detail = match self.allocator.check_corruption(*memory_type_bits) {
                    Ok(()) => "no corruption found".to_string(),
                    Err(Error::FeatureNotPresent(message)) => message,
                    Err(error) => return Err(error.into()),
                };
                self.report.record(step.op(), detail);
                Ok(())
            }
            Step::Virtual {
                name,
                size,
                linear,
                steps,
            } => {
                let record = Self::replay_virtual_block(name, *size, *linear, steps)?;
                self.report.record(
                    step.op(),
                    format!(
                        "{name}: {} allocations left in {} bytes",
                        record.allocation_count, record.size
                    ),
                );
                self.report.virtual_blocks.push(record);
                Ok(())
            }
        }
    }

    fn allocate(&mut self, step: &AllocateStep) -> Result<()> {
        if self.allocations.contains_key(&step.name) {
            return Err(anyhow!("Allocation name already in use: {}", step.name));
        }

        let pool = match step.pool.as_ref() {
            Some(name) => Some(self.pool(name)?),
            None => None,
        };

        let requirements = self.backend.requirements(step.size, step.alignment);
        let allocation = self.allocator.allocate_memory(
            &requirements,
            &AllocationCreateInfo {
                flags: step.flags(),
                usage: step.usage.into(),
                pool,
                user_data: step.user_data,
                name: Some(step.name.clone()),
                ..Default::default()
            },
        )?;
        self.allocations.insert(step.name.clone(), allocation);

        let info = self.allocator.allocation_info(allocation)?;
        self.report.record(
            "allocate",
            format!(
                "{}: {} bytes at offset {} of memory {} in memory type {}",
                step.name, info.size, info.offset, info.device_memory.0, info.memory_type
            ),
        );

        Ok(())
    }

    fn defragment(
        &self,
        info: &DefragmentationInfo,
        algorithm: String,
    ) -> Result<DefragmentationRecord> {
        let mut context = self.allocator.begin_defragmentation(info)?;
        let mut passes = 0;

        loop {
            let pass = context.begin_pass()?;
            passes += 1;

            for planned in pass.moves.iter() {
                self.backend.copy(
                    self.allocator,
                    planned.src_allocation,
                    planned.dst_tmp_allocation,
                )?;
            }

            if context.end_pass(pass)? == PassStatus::Success {
                break;
            }
        }

        Ok(DefragmentationRecord::new(algorithm, passes, context.end()))
    }

    fn replay_virtual_block(
        name: &str,
        size: DeviceSize,
        linear: bool,
        steps: &[VirtualStep],
    ) -> Result<VirtualBlockRecord> {
        let mut block = VirtualBlock::new(virtual_block_create_info(size, linear))?;
        let mut allocations: HashMap<&str, VirtualAllocation> = HashMap::new();

        for step in steps {
            match step {
                VirtualStep::Allocate {
                    name,
                    size,
                    alignment,
                    upper_address,
                    strategy,
                } => {
                    let (allocation, offset) = block.allocate(&virtual_allocation_create_info(
                        *size,
                        *alignment,
                        *upper_address,
                        *strategy,
                    ))?;
                    log::debug!("Virtual allocation {name} of {size} bytes at offset {offset}");
                    allocations.insert(name.as_str(), allocation);
                }
                VirtualStep::Free { name } => {
                    let allocation = match allocations.remove(name.as_str()) {
                        Some(allocation) => allocation,
                        None => return Err(anyhow!("Unknown virtual allocation: {name}")),
                    };
                    block.free(allocation)?;
                }
                VirtualStep::Clear => {
                    block.clear();
                    allocations.clear();
                }
            }
        }

        let record = VirtualBlockRecord::new(name.to_string(), size, &block.calculate_statistics());
        block.clear();

        Ok(record)
    }

    fn finish(self) -> Report {
        let mut report = self.report;

        report.heaps = self
            .allocator
            .heap_budgets()
            .iter()
            .enumerate()
            .map(|(index, budget)| HeapRecord::new(index, budget))
            .collect();
        report.total = TotalRecord::from(&self.allocator.calculate_statistics().total.statistics);

        report
    }
}
