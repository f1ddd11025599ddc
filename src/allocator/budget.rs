use crate::memory::device::{DeviceMemoryBackend, HeapBudget};
use crate::memory::{DeviceSize, MemoryProperties};
use crate::stats::{Budget, Statistics};

/// Refetch budgets from the device after this many block allocations and frees.
const OPERATIONS_BETWEEN_BUDGET_FETCH: u32 = 30;

/// Per-heap counters of what the allocator owns, plus the last budget fetched from the device.
pub(crate) struct BudgetTracker {
    heaps: Vec<Statistics>,
    use_device_budget: bool,
    fetched: Vec<HeapBudget>,
    block_bytes_at_fetch: Vec<DeviceSize>,
    operations_since_fetch: u32,
}

impl BudgetTracker {
    pub fn new(heap_count: usize, use_device_budget: bool) -> Self {
        Self {
            heaps: vec![Statistics::default(); heap_count],
            use_device_budget,
            fetched: vec![HeapBudget::default(); heap_count],
            block_bytes_at_fetch: vec![0; heap_count],
            operations_since_fetch: 0,
        }
    }

    pub fn uses_device_budget(&self) -> bool {
        self.use_device_budget
    }

    pub fn add_block(&mut self, heap_index: u32, size: DeviceSize) {
        let heap = &mut self.heaps[heap_index as usize];
        heap.block_count += 1;
        heap.block_bytes += size;
        self.operations_since_fetch += 1;
    }

    pub fn remove_block(&mut self, heap_index: u32, size: DeviceSize) {
        let heap = &mut self.heaps[heap_index as usize];
        heap.block_count -= 1;
        heap.block_bytes -= size;
        self.operations_since_fetch += 1;
    }

    pub fn add_allocation(&mut self, heap_index: u32, size: DeviceSize) {
        let heap = &mut self.heaps[heap_index as usize];
        heap.allocation_count += 1;
        heap.allocation_bytes += size;
    }

    pub fn remove_allocation(&mut self, heap_index: u32, size: DeviceSize) {
        let heap = &mut self.heaps[heap_index as usize];
        heap.allocation_count -= 1;
        heap.allocation_bytes -= size;
    }

    /// Device memory objects currently owned, blocks and dedicated allocations alike.
    pub fn device_memory_count(&self) -> u32 {
        self.heaps.iter().map(|heap| heap.block_count).sum()
    }

    pub fn block_bytes(&self, heap_index: u32) -> DeviceSize {
        self.heaps[heap_index as usize].block_bytes
    }

    pub fn refresh(&mut self, backend: &dyn DeviceMemoryBackend) {
        if !self.use_device_budget {
            return;
        }

        match backend.heap_budgets() {
            Some(budgets) => {
                for (index, budget) in budgets.into_iter().enumerate().take(self.heaps.len()) {
                    self.fetched[index] = budget;
                    self.block_bytes_at_fetch[index] = self.heaps[index].block_bytes;
                }
                self.operations_since_fetch = 0;
                log::debug!("Fetched heap budgets: {:?}", self.fetched);
            }
            None => {
                log::warn!("Device stopped reporting heap budgets, falling back to estimates");
                self.use_device_budget = false;
            }
        }
    }

    pub fn budget(
        &mut self,
        backend: &dyn DeviceMemoryBackend,
        properties: &MemoryProperties,
        heap_index: u32,
    ) -> Budget {
        if self.use_device_budget && self.operations_since_fetch >= OPERATIONS_BETWEEN_BUDGET_FETCH
        {
            self.refresh(backend);
        }

        let index = heap_index as usize;
        let statistics = self.heaps[index];
        let heap_size = properties.memory_heaps[index].size;

        if !self.use_device_budget {
            return Budget {
                statistics,
                usage: statistics.block_bytes,
                budget: heap_size * 8 / 10,
            };
        }

        let fetched = self.fetched[index];
        let at_fetch = self.block_bytes_at_fetch[index];

        let mut usage = (fetched.usage + statistics.block_bytes).saturating_sub(at_fetch);
        if fetched.usage == 0 && statistics.block_bytes > 0 {
            usage = statistics.block_bytes;
        }

        let budget = match fetched.budget {
            0 => heap_size * 8 / 10,
            budget => budget.min(heap_size),
        };

        Budget {
            statistics,
            usage,
            budget,
        }
    }

    /// Bytes that can still be allocated from a heap before its budget is exceeded.
    pub fn free_memory(
        &mut self,
        backend: &dyn DeviceMemoryBackend,
        properties: &MemoryProperties,
        heap_index: u32,
    ) -> DeviceSize {
        let budget = self.budget(backend, properties, heap_index);
        budget.budget.saturating_sub(budget.usage)
    }
}
